//! Registry: the durable store of slot allocations and configuration.
//!
//! The registry is the single source of truth shared by every process on the
//! host. Each operation runs in its own transactional scope; nothing is held
//! open across calls.

mod schema;
mod sqlite;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::slot::{ConsumerKey, Slot};

pub use sqlite::SqliteRegistry;

#[cfg(test)]
pub(crate) use schema::LEGACY_SCHEMA;

/// One active consumer/slot binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: i64,
    pub project: String,
    pub branch: String,
    pub slot: Slot,
    pub display_name: String,
    pub allocated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl Allocation {
    pub fn consumer_key(&self) -> ConsumerKey {
        ConsumerKey::new(&self.project, &self.branch)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("failed to prepare registry directory {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// A uniqueness constraint rejected an insert, typically because another
    /// process bound the same slot first.
    #[error("allocation conflict: {0}")]
    Conflict(String),
}

/// Storage operations the allocator builds its policy on.
///
/// Writes take `&mut self`: a registry handle belongs to exactly one owner.
pub trait Registry {
    /// Create or upgrade the schema and seed configuration defaults.
    ///
    /// Idempotent and safe to call concurrently from many processes.
    fn init_schema(&mut self) -> Result<(), RegistryError>;

    /// Bind `slot` to (project, branch).
    ///
    /// If the consumer already holds an allocation it is returned unchanged and
    /// `slot` is ignored.
    fn allocate(&mut self, project: &str, branch: &str, slot: Slot)
    -> Result<Allocation, RegistryError>;

    fn find_by_consumer(&self, project: &str, branch: &str)
    -> Result<Option<Allocation>, RegistryError>;

    fn find_by_slot(&self, slot: Slot) -> Result<Option<Allocation>, RegistryError>;

    /// All allocations, most recently used first.
    fn list_all(&self) -> Result<Vec<Allocation>, RegistryError>;

    /// Set `last_seen_at` to now. Never moves the timestamp backwards.
    ///
    /// Returns `false` if no allocation has that id any more.
    fn touch(&mut self, id: i64) -> Result<bool, RegistryError>;

    /// Delete an allocation. Unknown ids are not an error.
    fn release(&mut self, id: i64) -> Result<(), RegistryError>;

    /// Allocations not seen for more than `days`, oldest first.
    fn stale_allocations(&self, days: u32) -> Result<Vec<Allocation>, RegistryError>;

    /// Atomically replace stale allocation `victim` with a binding of its
    /// `slot` to (project, branch).
    ///
    /// Fails with [`RegistryError::Conflict`] and changes nothing if `victim`
    /// no longer holds `slot` or has been touched within `days`. If the
    /// consumer already holds an allocation it is returned and `victim` is kept.
    fn reclaim(
        &mut self,
        victim: i64,
        days: u32,
        project: &str,
        branch: &str,
        slot: Slot,
    ) -> Result<Allocation, RegistryError>;

    fn used_slots(&self) -> Result<Vec<Slot>, RegistryError>;

    fn get_config(&self, key: &str) -> Result<Option<String>, RegistryError>;

    fn set_config(&mut self, key: &str, value: &str) -> Result<(), RegistryError>;
}
