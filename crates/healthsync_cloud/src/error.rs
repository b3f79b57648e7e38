//! Error types for cloud backup and restore.

use thiserror::Error;

/// Result type for cloud operations.
pub type CloudResult<T> = Result<T, CloudError>;

/// Errors that can occur during cloud backup and restore.
#[derive(Error, Debug)]
pub enum CloudError {
    /// Record store error.
    #[error("store error: {0}")]
    Core(#[from] healthsync_core::CoreError),

    /// A change token id is unknown or malformed.
    #[error("invalid backup change token: {0}")]
    InvalidToken(String),

    /// The request cannot be served in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Backed up data is newer than this build understands.
    #[error("unsupported data version {version}, newest supported is {supported}")]
    UnsupportedVersion {
        /// Version of the offered data.
        version: u32,
        /// Newest version this build can restore.
        supported: u32,
    },
}

impl CloudError {
    /// Creates an invalid token error.
    pub fn invalid_token(token: impl Into<String>) -> Self {
        CloudError::InvalidToken(token.into())
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        CloudError::InvalidState(message.into())
    }

    /// Returns true if the caller should discard its token and start a
    /// full backup.
    pub fn requires_full_backup(&self) -> bool {
        matches!(self, CloudError::InvalidToken(_))
    }
}
