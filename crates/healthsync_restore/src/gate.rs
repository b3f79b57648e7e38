//! Process-wide "sync in progress" gate.

use std::sync::atomic::{AtomicBool, Ordering};

/// Tells the rest of the process whether a migration or restore merge is
/// running, so conflicting API calls can be refused instead of racing it.
#[derive(Debug, Default)]
pub struct DataSyncGate {
    migration_in_progress: AtomicBool,
    restore_merging: AtomicBool,
}

impl DataSyncGate {
    /// Creates an open gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true while a migration or restore merge is running.
    pub fn is_sync_in_progress(&self) -> bool {
        self.is_migration_in_progress() || self.is_restore_merging()
    }

    /// Returns true while a data migration is running.
    pub fn is_migration_in_progress(&self) -> bool {
        self.migration_in_progress.load(Ordering::SeqCst)
    }

    /// Returns true while a restore merge is running.
    pub fn is_restore_merging(&self) -> bool {
        self.restore_merging.load(Ordering::SeqCst)
    }

    pub(crate) fn set_migration_in_progress(&self, value: bool) {
        self.migration_in_progress.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_restore_merging(&self, value: bool) {
        self.restore_merging.store(value, Ordering::SeqCst);
    }
}
