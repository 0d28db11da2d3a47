//! In-memory allowlist store backing the kernel allow-set.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use crate::address::AllowEntry;

/// Set of permitted destinations. Shared between concurrent producers;
/// inserting an existing member is a no-op.
#[derive(Debug, Default)]
pub struct AllowlistStore {
    entries: Mutex<BTreeSet<AllowEntry>>,
}

impl AllowlistStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<AllowEntry>> {
        // A panic while holding the lock cannot leave a BTreeSet half-inserted.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns `true` if the entry was not already present.
    pub fn insert(&self, entry: AllowEntry) -> bool {
        self.lock().insert(entry)
    }

    pub fn contains(&self, entry: &AllowEntry) -> bool {
        self.lock().contains(entry)
    }

    /// Drop every member. Only bootstrap calls this.
    pub fn reset(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Members in sorted order.
    pub fn snapshot(&self) -> Vec<AllowEntry> {
        self.lock().iter().copied().collect()
    }
}
