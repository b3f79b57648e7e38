//! Configuration for record stores.

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Configuration options for a [`crate::MemoryRecordStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Schema version of the store. Merge refuses to combine stores whose
    /// versions differ.
    pub schema_version: u32,
    /// Maximum number of change log rows kept. Older rows are purged after
    /// each commit. `None` keeps everything.
    pub max_change_logs: Option<usize>,
}

impl StoreConfig {
    /// Sets the schema version.
    #[must_use]
    pub const fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    /// Sets the change log retention.
    #[must_use]
    pub const fn with_max_change_logs(mut self, max: usize) -> Self {
        self.max_change_logs = Some(max);
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            max_change_logs: None,
        }
    }
}
