//! Configuration for restore and merge.

use std::time::Duration;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Timing of the restore phases.
#[derive(Debug, Clone)]
pub struct RestoreConfig {
    /// How long a download may stay started before it is marked failed.
    pub download_timeout: Duration,
    /// How long staging may take before the restore is force-completed.
    pub staging_timeout: Duration,
    /// How long a merge may take before the restore is force-completed.
    pub merging_timeout: Duration,
    /// Fixed delay before a merge blocked by a migration is tried again.
    pub merging_retry_delay: Duration,
    /// Slack added to every job's maximum delay.
    pub minimum_latency_window: Duration,
    /// Merge settings.
    pub merge: MergeConfig,
}

impl RestoreConfig {
    /// Creates a configuration with the default phase timings.
    pub fn new() -> Self {
        Self {
            download_timeout: DAY * 14,
            staging_timeout: DAY,
            merging_timeout: DAY * 5,
            merging_retry_delay: Duration::from_secs(12 * 60 * 60),
            minimum_latency_window: DAY,
            merge: MergeConfig::default(),
        }
    }

    /// Sets the download timeout.
    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    /// Sets the staging timeout.
    pub fn with_staging_timeout(mut self, timeout: Duration) -> Self {
        self.staging_timeout = timeout;
        self
    }

    /// Sets the merging timeout.
    pub fn with_merging_timeout(mut self, timeout: Duration) -> Self {
        self.merging_timeout = timeout;
        self
    }

    /// Sets the merging retry delay.
    pub fn with_merging_retry_delay(mut self, delay: Duration) -> Self {
        self.merging_retry_delay = delay;
        self
    }

    /// Sets the minimum latency window.
    pub fn with_minimum_latency_window(mut self, window: Duration) -> Self {
        self.minimum_latency_window = window;
        self
    }

    /// Sets the merge configuration.
    pub fn with_merge(mut self, merge: MergeConfig) -> Self {
        self.merge = merge;
        self
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Settings of the merge engine.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Rows read from the staged database per page.
    pub page_size: usize,
    /// Whether personal health record tables are merged.
    pub merge_phr: bool,
}

impl MergeConfig {
    /// Sets the page size. Zero is treated as one.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Enables or disables merging of personal health records.
    pub fn with_merge_phr(mut self, merge_phr: bool) -> Self {
        self.merge_phr = merge_phr;
        self
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            page_size: 5000,
            merge_phr: true,
        }
    }
}
