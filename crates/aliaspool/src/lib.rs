//! aliaspool: hands out loopback alias slots to project/branch pairs.
//!
//! Many short-lived processes share one SQLite registry. Each process runs a
//! single [`AllocatorHandle`] whose command loop owns that process's registry
//! connection; the store's locking and uniqueness constraints arbitrate
//! between processes.

mod allocator;
mod clock;
mod config;
mod handle;
mod logging;
mod naming;
mod pool;
mod registry;
mod resolver;
mod slot;

pub use allocator::{AllocError, Allocator, ErrorKind};
pub use clock::{Clock, SystemClock};
pub use config::{
    AllocatorConfig, CONFIG_DEFAULTS, DEFAULT_RANGE, DEFAULT_STALE_AFTER_DAYS, RANGE_END_KEY,
    RANGE_START_KEY, RegistryConfig, default_registry_path,
};
pub use handle::AllocatorHandle;
pub use logging::init_tracing;
pub use naming::{MAX_LABEL_LEN, display_name, sanitize_label};
pub use pool::{PoolSource, StaticPoolSource};
pub use registry::{Allocation, Registry, RegistryError, SqliteRegistry};
pub use resolver::{ConsumerKeyResolver, FixedConsumerKey, ResolveError};
pub use slot::{ConsumerKey, Slot, SlotRange};
