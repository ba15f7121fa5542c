//! Pool sources: which slots are physically usable on this host.

use std::collections::BTreeSet;

use crate::slot::{Slot, SlotRange};

/// Probe of the slots that are usable right now.
///
/// The allocator calls this once at startup and treats the answer as a
/// snapshot for the rest of the process's life.
pub trait PoolSource: Send + Sync {
    fn available_slots(&self) -> BTreeSet<Slot>;

    /// Shell commands an operator could run to make `slots` usable.
    ///
    /// Informational only; the allocator never runs or reads them.
    fn setup_commands(&self, _slots: &[Slot]) -> Vec<String> {
        Vec::new()
    }
}

/// Fixed set of slots, for hosts where every alias is known to exist and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticPoolSource {
    slots: BTreeSet<Slot>,
}

impl StaticPoolSource {
    pub fn new(slots: impl IntoIterator<Item = Slot>) -> Self {
        Self {
            slots: slots.into_iter().collect(),
        }
    }

    pub fn from_range(range: SlotRange) -> Self {
        Self::new(range.iter())
    }
}

impl PoolSource for StaticPoolSource {
    fn available_slots(&self) -> BTreeSet<Slot> {
        self.slots.clone()
    }
}
