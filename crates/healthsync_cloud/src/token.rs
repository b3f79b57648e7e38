//! Backup continuation tokens.
//!
//! A token is written to the store's token table for every response page
//! and handed to callers as the decimal form of its row id. Tokens are
//! never updated or deleted; a stale token is detected lazily by checking
//! its change-log cursor.

use crate::error::{CloudError, CloudResult};
use healthsync_core::{from_cbor, to_cbor, PageToken, RecordStore, RecordType};
use serde::{Deserialize, Serialize};

/// Where the next backup call resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupChangeToken {
    /// Table being walked, or `None` once every table is exhausted.
    pub record_type: Option<RecordType>,
    /// Cursor within `record_type`; [`PageToken::EMPTY`] starts the table.
    pub data_table_page_token: PageToken,
    /// Row id of the last consumed change-log row.
    pub change_log_cursor: Option<u64>,
}

impl BackupChangeToken {
    /// Creates a token that resumes a table walk.
    pub fn data_table(
        record_type: Option<RecordType>,
        data_table_page_token: PageToken,
        change_log_cursor: Option<u64>,
    ) -> Self {
        Self {
            record_type,
            data_table_page_token,
            change_log_cursor,
        }
    }

    /// Creates a token that continues reading the change log after `cursor`.
    pub fn change_log(cursor: u64) -> Self {
        Self {
            record_type: None,
            data_table_page_token: PageToken::EMPTY,
            change_log_cursor: Some(cursor),
        }
    }

    /// Returns true while record tables are still being walked.
    pub fn is_walking_tables(&self) -> bool {
        self.record_type.is_some()
    }

    /// Writes the token to the store and returns its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the token cannot be encoded or stored.
    pub fn persist(&self, store: &dyn RecordStore) -> CloudResult<String> {
        let id = store.insert_backup_token(to_cbor(self)?)?;
        Ok(id.to_string())
    }

    /// Loads the token with the given id.
    ///
    /// # Errors
    ///
    /// Returns `InvalidToken` if the id is malformed, unknown or names an
    /// undecodable row.
    pub fn load(store: &dyn RecordStore, id: &str) -> CloudResult<Self> {
        let row: u64 = id.parse().map_err(|_| CloudError::invalid_token(id))?;
        let bytes = store
            .read_backup_token(row)?
            .ok_or_else(|| CloudError::invalid_token(id))?;
        from_cbor(&bytes).map_err(|e| {
            tracing::warn!(token = id, error = %e, "undecodable backup token");
            CloudError::invalid_token(id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use healthsync_core::MemoryRecordStore;

    #[test]
    fn persisted_tokens_reload() {
        let store = MemoryRecordStore::new();
        let token =
            BackupChangeToken::data_table(Some(RecordType::Steps), PageToken::after_row(9), Some(4));
        let id = token.persist(&store).unwrap();
        assert_eq!(BackupChangeToken::load(&store, &id).unwrap(), token);

        let next = BackupChangeToken::change_log(12);
        let next_id = next.persist(&store).unwrap();
        assert_ne!(id, next_id);
        assert!(!BackupChangeToken::load(&store, &next_id)
            .unwrap()
            .is_walking_tables());
    }

    #[test]
    fn unknown_ids_are_invalid() {
        let store = MemoryRecordStore::new();
        assert!(matches!(
            BackupChangeToken::load(&store, "17"),
            Err(CloudError::InvalidToken(_))
        ));
        assert!(matches!(
            BackupChangeToken::load(&store, "not-a-number"),
            Err(CloudError::InvalidToken(_))
        ));
    }

    #[test]
    fn garbage_rows_are_invalid() {
        let store = MemoryRecordStore::new();
        let id = store.insert_backup_token(vec![0xff, 0x00]).unwrap();
        assert!(matches!(
            BackupChangeToken::load(&store, &id.to_string()),
            Err(CloudError::InvalidToken(_))
        ));
    }
}
