//! Error types for state storage.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while reading or writing persisted state.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Another process holds the state directory lock.
    #[error("state directory locked: another process has exclusive access")]
    Locked,

    /// The state file exists but cannot be interpreted.
    #[error("state corrupted: {0}")]
    Corrupted(String),

    /// The state could not be encoded for writing.
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl StorageError {
    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }
}
