//! Error types for the restore state machine.

use std::io;
use thiserror::Error;

/// Result type for restore operations.
pub type RestoreResult<T> = Result<T, RestoreError>;

/// Errors that can occur while staging, merging or persisting restore state.
#[derive(Error, Debug)]
pub enum RestoreError {
    /// Record store or scheduler error.
    #[error("core error: {0}")]
    Core(#[from] healthsync_core::CoreError),

    /// Key/value state error.
    #[error("state storage error: {0}")]
    Storage(#[from] healthsync_storage::StorageError),

    /// File system error in the staging area.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The staged database was written by a different schema version.
    #[error("schema version mismatch: staged={staged}, live={live}")]
    VersionMismatch {
        /// Schema version of the staged database.
        staged: u32,
        /// Schema version of the live store.
        live: u32,
    },

    /// A persisted state field holds a value that cannot be parsed.
    #[error("corrupt restore state: {key}={value:?}")]
    CorruptState {
        /// Persisted key.
        key: &'static str,
        /// Raw value found.
        value: String,
    },

    /// A restore merge is running.
    #[error("restore merge in progress")]
    MergeInProgress,

    /// A file offered for staging is not part of a backup.
    #[error("unknown staged file: {0}")]
    UnknownStagedFile(String),

    /// Grant-time blob could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RestoreError {
    /// Creates a corrupt-state error.
    pub fn corrupt_state(key: &'static str, value: impl Into<String>) -> Self {
        Self::CorruptState {
            key,
            value: value.into(),
        }
    }

    /// Returns true if the operation may succeed when tried again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            RestoreError::Io(_) | RestoreError::MergeInProgress => true,
            RestoreError::Storage(healthsync_storage::StorageError::Locked) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(RestoreError::MergeInProgress.is_retryable());
        assert!(RestoreError::Io(io::Error::new(io::ErrorKind::Other, "disk")).is_retryable());
        assert!(!RestoreError::VersionMismatch { staged: 2, live: 1 }.is_retryable());
        assert!(!RestoreError::corrupt_state("data_restore_state_key", "x").is_retryable());
    }

    #[test]
    fn error_display() {
        let err = RestoreError::VersionMismatch { staged: 2, live: 1 };
        assert_eq!(err.to_string(), "schema version mismatch: staged=2, live=1");

        let err = RestoreError::corrupt_state("data_download_state_key", "abc");
        assert!(err.to_string().contains("data_download_state_key"));
    }
}
