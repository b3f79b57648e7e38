//! Wire types exchanged with the cloud backup transport.

use crate::error::CloudResult;
use healthsync_core::{to_cbor, Record, RecordId};
use serde::{Deserialize, Serialize};

/// One unit of backed up data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupChange {
    /// Stable id of the changed record.
    pub record_id: RecordId,
    /// True if the record was deleted.
    pub is_deletion: bool,
    /// Encoded record, absent for deletions.
    pub data: Option<Vec<u8>>,
    /// Data version of `data`.
    pub version: u32,
}

impl BackupChange {
    /// Creates an upsert carrying the encoded `record`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be encoded.
    pub fn upsert(record: &Record, version: u32) -> CloudResult<Self> {
        Ok(Self {
            record_id: record.id,
            is_deletion: false,
            data: Some(to_cbor(record)?),
            version,
        })
    }

    /// Creates a deletion.
    pub fn deletion(record_id: RecordId, version: u32) -> Self {
        Self {
            record_id,
            is_deletion: true,
            data: None,
            version,
        }
    }
}

/// One unit of data to restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreChange {
    /// Stable id of the record.
    pub record_id: RecordId,
    /// True if the record should be removed.
    pub is_deletion: bool,
    /// Encoded record, absent for deletions.
    pub data: Option<Vec<u8>>,
    /// Data version of `data`.
    pub version: u32,
}

impl From<BackupChange> for RestoreChange {
    fn from(change: BackupChange) -> Self {
        Self {
            record_id: change.record_id,
            is_deletion: change.is_deletion,
            data: change.data,
            version: change.version,
        }
    }
}

/// Response of one backup call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetChangesForBackupResponse {
    /// Data version of every change.
    pub version: u32,
    /// Changes in referenced-before-referencing order.
    pub changes: Vec<BackupChange>,
    /// Token for the next call.
    ///
    /// An empty token means the change log was purged past the previous
    /// token, so changes may have been lost. Callers must treat it as
    /// "restart from scratch": discard what the old token promised and run
    /// a full backup, which passing the empty token back also starts.
    pub next_change_token: String,
}

/// Backed up settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSettings {
    /// Data version of `data`.
    pub version: u32,
    /// Encoded priority lists.
    pub data: Vec<u8>,
}

/// What the receiving side needs to know about an app.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetadata {
    /// Human readable name, if the sender knew one.
    pub app_name: Option<String>,
}
