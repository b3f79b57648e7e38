//! First-grant-time state of app permissions.

use crate::error::CoreResult;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// When each app was first granted access, as epoch milliseconds.
///
/// This is the small companion blob that travels with every backup. It is
/// merged by overwrite: the restored state replaces the local one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantTimeState {
    /// Package name to first grant time for regular packages.
    pub package_grant_times: BTreeMap<String, i64>,
    /// Shared user name to first grant time for shared-uid packages.
    pub shared_user_grant_times: BTreeMap<String, i64>,
    /// Format version of the blob.
    pub version: u32,
}

impl GrantTimeState {
    /// Records a package grant time.
    #[must_use]
    pub fn with_package(mut self, package_name: impl Into<String>, granted_at_millis: i64) -> Self {
        self.package_grant_times
            .insert(package_name.into(), granted_at_millis);
        self
    }

    /// Returns true if no grant times are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.package_grant_times.is_empty() && self.shared_user_grant_times.is_empty()
    }
}

/// Owner of the live grant-time state.
pub trait GrantTimeStore: Send + Sync {
    /// Returns the current state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read.
    fn current(&self) -> CoreResult<GrantTimeState>;

    /// Replaces the current state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be stored.
    fn apply(&self, state: GrantTimeState) -> CoreResult<()>;
}

/// An in-memory [`GrantTimeStore`].
#[derive(Debug, Default)]
pub struct MemoryGrantTimeStore {
    state: RwLock<GrantTimeState>,
    applied: RwLock<u32>,
}

impl MemoryGrantTimeStore {
    /// Creates a store holding `state`.
    #[must_use]
    pub fn with_state(state: GrantTimeState) -> Self {
        Self {
            state: RwLock::new(state),
            applied: RwLock::new(0),
        }
    }

    /// Returns how many times [`GrantTimeStore::apply`] was called.
    #[must_use]
    pub fn apply_count(&self) -> u32 {
        *self.applied.read()
    }
}

impl GrantTimeStore for MemoryGrantTimeStore {
    fn current(&self) -> CoreResult<GrantTimeState> {
        Ok(self.state.read().clone())
    }

    fn apply(&self, state: GrantTimeState) -> CoreResult<()> {
        *self.state.write() = state;
        *self.applied.write() += 1;
        Ok(())
    }
}
