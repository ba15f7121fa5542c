//! Allocation policy: get-or-allocate, release, and lazy reclamation.
//!
//! Flow for `get_or_allocate`:
//! 1. Existing binding for the consumer: touch it, return its slot
//! 2. Lowest slot in (candidate pool − used slots): bind it
//! 3. Nothing free: reclaim the globally oldest allocation if it is stale and
//!    its slot is in this process's candidate pool
//!
//! The scans and the write that follows are separate registry calls, so another
//! process can bind the chosen slot or touch the chosen victim in between. The
//! registry reports either as a conflict and the whole decision is retried a
//! bounded number of times.

use std::collections::BTreeSet;

use crate::config::{AllocatorConfig, RANGE_END_KEY, RANGE_START_KEY};
use crate::pool::PoolSource;
use crate::registry::{Allocation, Registry, RegistryError};
use crate::resolver::ResolveError;
use crate::slot::{ConsumerKey, Slot, SlotRange};

/// Flat classification of [`AllocError`] for callers that only need to branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Nothing usable to hand out at all; a configuration problem.
    NoUsableSlots,
    /// Everything is bound and nothing is stale enough to reclaim.
    PoolExhausted,
    /// Lost every attempt to another process binding the same slot.
    Conflict,
    /// The registry itself failed.
    Storage,
    /// The consumer key could not be determined.
    Resolve,
    /// The allocator task is gone.
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("no usable slots: the candidate pool is empty")]
    NoUsableSlots,
    #[error(
        "pool exhausted: all {pool_size} slots are bound and none has been idle for more than {stale_after_days} days"
    )]
    PoolExhausted {
        pool_size: usize,
        stale_after_days: u32,
    },
    #[error("allocation kept conflicting with other processes after {attempts} attempts")]
    Conflict { attempts: u32 },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("allocator is not running")]
    Closed,
}

impl AllocError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AllocError::NoUsableSlots => ErrorKind::NoUsableSlots,
            AllocError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            AllocError::Conflict { .. } => ErrorKind::Conflict,
            AllocError::Registry(RegistryError::Conflict(_)) => ErrorKind::Conflict,
            AllocError::Registry(_) => ErrorKind::Storage,
            AllocError::Resolve(_) => ErrorKind::Resolve,
            AllocError::Closed => ErrorKind::Closed,
        }
    }
}

/// Per-process allocation policy over a [`Registry`].
///
/// Holds no authoritative state besides the candidate pool snapshot taken at
/// startup. Methods take `&mut self`, so one owner drives all decisions in order.
pub struct Allocator<R> {
    registry: R,
    candidate_pool: BTreeSet<Slot>,
    stale_after_days: u32,
    max_attempts: u32,
}

impl<R: Registry> Allocator<R> {
    /// Initialize the registry schema and snapshot the candidate pool.
    pub fn start(
        mut registry: R,
        source: &dyn PoolSource,
        config: AllocatorConfig,
    ) -> Result<Self, AllocError> {
        registry.init_schema()?;

        let range = configured_range(&registry, config.fallback_range);
        let available = source.available_slots();
        let candidate_pool: BTreeSet<Slot> = available
            .iter()
            .copied()
            .filter(|slot| range.contains(*slot))
            .collect();

        tracing::info!(
            %range,
            available = available.len(),
            candidates = candidate_pool.len(),
            stale_after_days = config.stale_after_days,
            "Allocator ready"
        );
        if candidate_pool.is_empty() {
            tracing::warn!(%range, "No available slot falls inside the configured range");
        }

        Ok(Self {
            registry,
            candidate_pool,
            stale_after_days: config.stale_after_days,
            max_attempts: config.max_attempts.max(1),
        })
    }

    pub fn candidate_pool(&self) -> &BTreeSet<Slot> {
        &self.candidate_pool
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Return the consumer's slot, binding one first if it has none.
    pub fn get_or_allocate(&mut self, key: &ConsumerKey) -> Result<Slot, AllocError> {
        for attempt in 1..=self.max_attempts {
            match self.decide(key) {
                Err(AllocError::Registry(RegistryError::Conflict(detail))) => {
                    tracing::warn!(
                        consumer = %key,
                        attempt,
                        max_attempts = self.max_attempts,
                        %detail,
                        "Lost a race with another process, retrying"
                    );
                }
                result => return result,
            }
        }
        Err(AllocError::Conflict {
            attempts: self.max_attempts,
        })
    }

    fn decide(&mut self, key: &ConsumerKey) -> Result<Slot, AllocError> {
        if let Some(existing) = self.registry.find_by_consumer(&key.project, &key.branch)? {
            if self.registry.touch(existing.id)? {
                tracing::debug!(consumer = %key, slot = %existing.slot, "Reusing allocation");
                return Ok(existing.slot);
            }
            tracing::debug!(consumer = %key, slot = %existing.slot, "Allocation vanished before touch");
        }

        let used: BTreeSet<Slot> = self.registry.used_slots()?.into_iter().collect();
        if let Some(slot) = self.candidate_pool.difference(&used).next().copied() {
            let allocation = self.registry.allocate(&key.project, &key.branch, slot)?;
            return Ok(allocation.slot);
        }

        if self.candidate_pool.is_empty() {
            return Err(AllocError::NoUsableSlots);
        }

        self.reclaim_for(key)
    }

    fn reclaim_for(&mut self, key: &ConsumerKey) -> Result<Slot, AllocError> {
        let exhausted = AllocError::PoolExhausted {
            pool_size: self.candidate_pool.len(),
            stale_after_days: self.stale_after_days,
        };

        let Some(victim) = self
            .registry
            .stale_allocations(self.stale_after_days)?
            .into_iter()
            .next()
        else {
            return Err(exhausted);
        };

        if !self.candidate_pool.contains(&victim.slot) {
            tracing::debug!(
                consumer = %key,
                slot = %victim.slot,
                "Oldest stale allocation is outside the candidate pool, not reclaiming"
            );
            return Err(exhausted);
        }

        tracing::info!(
            consumer = %key,
            previous = %victim.consumer_key(),
            slot = %victim.slot,
            last_seen_at = %victim.last_seen_at,
            "Reclaiming stale allocation"
        );
        let allocation = self.registry.reclaim(
            victim.id,
            self.stale_after_days,
            &key.project,
            &key.branch,
            victim.slot,
        )?;
        Ok(allocation.slot)
    }

    /// Drop the consumer's binding. Returns the removed allocation, if there was one.
    pub fn release(&mut self, key: &ConsumerKey) -> Result<Option<Allocation>, AllocError> {
        let Some(existing) = self.registry.find_by_consumer(&key.project, &key.branch)? else {
            tracing::debug!(consumer = %key, "Nothing to release");
            return Ok(None);
        };
        self.registry.release(existing.id)?;
        Ok(Some(existing))
    }

    pub fn list(&self) -> Result<Vec<Allocation>, AllocError> {
        Ok(self.registry.list_all()?)
    }

    pub fn info(&self, key: &ConsumerKey) -> Result<Option<Allocation>, AllocError> {
        Ok(self.registry.find_by_consumer(&key.project, &key.branch)?)
    }
}

/// Read the allocation range from registry config, falling back on any problem.
fn configured_range<R: Registry>(registry: &R, fallback: SlotRange) -> SlotRange {
    let read = || -> Result<Option<SlotRange>, RegistryError> {
        let start = registry.get_config(RANGE_START_KEY)?;
        let end = registry.get_config(RANGE_END_KEY)?;
        Ok(SlotRange::parse(start.as_deref(), end.as_deref()))
    };

    match read() {
        Ok(Some(range)) => range,
        Ok(None) => {
            tracing::warn!(%fallback, "Configured slot range is missing or invalid, using default");
            fallback
        }
        Err(e) => {
            tracing::warn!(error = %e, %fallback, "Failed to read slot range, using default");
            fallback
        }
    }
}
