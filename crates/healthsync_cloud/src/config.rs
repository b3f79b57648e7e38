//! Configuration for cloud backup.

/// Newest backup data version this build writes and restores.
pub const BACKUP_DATA_VERSION: u32 = 1;

/// Configuration for cloud backup and restore.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// Maximum number of changes per backup response.
    pub page_size: usize,
    /// Data version stamped on backups and accepted on restore.
    pub data_version: u32,
}

impl CloudConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            page_size: 5000,
            data_version: BACKUP_DATA_VERSION,
        }
    }

    /// Sets the page size. Zero is treated as one.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Sets the data version.
    pub fn with_data_version(mut self, version: u32) -> Self {
        self.data_version = version;
        self
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self::new()
    }
}
