//! Paginated reads of the record store for cloud backup.
//!
//! A backup starts with a full walk over every record table in backup
//! order, a page at a time, and continues with incremental reads of the
//! change log. The walk seeds the change-log cursor when it starts, so
//! changes made while the walk is under way are picked up by the first
//! incremental read.

use crate::config::CloudConfig;
use crate::error::{CloudError, CloudResult};
use crate::messages::BackupChange;
use crate::token::BackupChangeToken;
use healthsync_core::{ChangeOperation, PageToken, RecordId, RecordStore, RecordType};
use std::collections::HashMap;

/// Changes of one response plus where the next call resumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPage {
    /// Changes in referenced-before-referencing order.
    pub changes: Vec<BackupChange>,
    /// Token for the next call.
    pub token: BackupChangeToken,
}

/// Reads backup pages from a record store.
pub struct CloudBackupWalker<'a> {
    store: &'a dyn RecordStore,
    config: &'a CloudConfig,
}

impl<'a> CloudBackupWalker<'a> {
    /// Creates a walker over `store`.
    pub fn new(store: &'a dyn RecordStore, config: &'a CloudConfig) -> Self {
        Self { store, config }
    }

    /// Returns the next page of a full walk over every record table.
    ///
    /// Without `resume` the walk starts at the first table in backup order
    /// and the change-log cursor is seeded with the latest change-log row.
    /// A response is filled across table boundaries until it holds
    /// `page_size` changes or every table is exhausted, in which case the
    /// returned token has no record type.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn changes_from_data_tables(
        &self,
        resume: Option<&BackupChangeToken>,
    ) -> CloudResult<BackupPage> {
        let (mut record_type, mut page_token, change_log_cursor) = match resume {
            Some(token) => (
                token.record_type,
                token.data_table_page_token,
                token.change_log_cursor,
            ),
            None => (
                RecordType::backup_order().first().copied(),
                PageToken::EMPTY,
                Some(self.store.latest_change_log_row_id()?),
            ),
        };

        let page_size = self.config.page_size.max(1);
        let mut changes = Vec::new();
        while let Some(current) = record_type {
            let remaining = page_size - changes.len();
            if remaining == 0 {
                break;
            }
            let page = self.store.read_page(current, page_token, remaining)?;
            for record in &page.records {
                changes.push(BackupChange::upsert(record, self.config.data_version)?);
            }
            if page.next_page_token.is_empty() {
                record_type = current.next_in_backup_order();
                page_token = PageToken::EMPTY;
            } else {
                page_token = page.next_page_token;
            }
        }

        let token = BackupChangeToken::data_table(record_type, page_token, change_log_cursor);
        tracing::debug!(
            changes = changes.len(),
            next_table = ?token.record_type,
            next_page = %token.data_table_page_token,
            "read backup page from data tables"
        );
        Ok(BackupPage { changes, token })
    }

    /// Returns the changes logged after `change_log_cursor`.
    ///
    /// Entries are collapsed per record so only the last operation counts.
    /// Upserts come first, then deletions, each in backup order; an upsert
    /// whose record is gone by now is dropped.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` without a cursor, or an error if the store
    /// cannot be read.
    pub fn incremental_changes(&self, change_log_cursor: Option<u64>) -> CloudResult<BackupPage> {
        let cursor = change_log_cursor
            .ok_or_else(|| CloudError::invalid_state("no proper change logs token"))?;
        let entries = self
            .store
            .read_change_logs(cursor, self.config.page_size.max(1))?;
        let next_cursor = entries.last().map_or(cursor, |entry| entry.row_id);

        let mut latest: HashMap<RecordId, (RecordType, ChangeOperation, u64)> = HashMap::new();
        for entry in &entries {
            latest.insert(
                entry.record_id,
                (entry.record_type, entry.operation, entry.row_id),
            );
        }
        let mut ordered: Vec<_> = latest.into_iter().collect();
        ordered.sort_by_key(|(_, (record_type, _, row_id))| (record_type.backup_rank(), *row_id));

        let version = self.config.data_version;
        let mut changes = Vec::with_capacity(ordered.len());
        let mut vanished = 0usize;
        for (id, (_, operation, _)) in &ordered {
            if *operation != ChangeOperation::Upsert {
                continue;
            }
            match self.store.get_record(*id)? {
                Some(record) => changes.push(BackupChange::upsert(&record, version)?),
                None => vanished += 1,
            }
        }
        for (id, (_, operation, _)) in &ordered {
            if *operation == ChangeOperation::Delete {
                changes.push(BackupChange::deletion(*id, version));
            }
        }

        tracing::debug!(
            entries = entries.len(),
            changes = changes.len(),
            vanished,
            cursor = next_cursor,
            "read incremental backup changes"
        );
        Ok(BackupPage {
            changes,
            token: BackupChangeToken::change_log(next_cursor),
        })
    }

    /// Returns true if the change log still holds everything after the
    /// token's cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn is_change_logs_token_valid(
        &self,
        token: Option<&BackupChangeToken>,
    ) -> CloudResult<bool> {
        let Some(cursor) = token.and_then(|t| t.change_log_cursor) else {
            return Ok(false);
        };
        if cursor == self.store.latest_change_log_row_id()? {
            return Ok(true);
        }
        Ok(self.store.change_log_exists(cursor.saturating_add(1))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use healthsync_core::{MemoryRecordStore, Record, RecordStoreExt};

    fn insert(store: &MemoryRecordStore, record_type: RecordType, count: usize) -> Vec<RecordId> {
        store
            .write(|txn| {
                let mut ids = Vec::new();
                for i in 0..count {
                    let record = Record::new(record_type, "com.example.app", i as i64);
                    ids.push(record.id);
                    txn.upsert_record(record)?;
                }
                Ok(ids)
            })
            .unwrap()
    }

    #[test]
    fn empty_store_finishes_in_one_call() {
        let store = MemoryRecordStore::new();
        let config = CloudConfig::default();
        let page = CloudBackupWalker::new(&store, &config)
            .changes_from_data_tables(None)
            .unwrap();
        assert!(page.changes.is_empty());
        assert_eq!(page.token.record_type, None);
        assert_eq!(page.token.data_table_page_token, PageToken::EMPTY);
        assert_eq!(page.token.change_log_cursor, Some(0));
    }

    #[test]
    fn pages_span_tables() {
        let store = MemoryRecordStore::new();
        insert(&store, RecordType::Steps, 3);
        insert(&store, RecordType::Weight, 3);
        let config = CloudConfig::default().with_page_size(4);
        let walker = CloudBackupWalker::new(&store, &config);

        let first = walker.changes_from_data_tables(None).unwrap();
        assert_eq!(first.changes.len(), 4);
        assert_eq!(first.token.record_type, Some(RecordType::Weight));
        assert!(!first.token.data_table_page_token.is_empty());

        let second = walker.changes_from_data_tables(Some(&first.token)).unwrap();
        assert_eq!(second.changes.len(), 2);
        assert_eq!(second.token.record_type, None);
        assert_eq!(second.token.change_log_cursor, Some(6));
    }

    #[test]
    fn incremental_read_requires_cursor() {
        let store = MemoryRecordStore::new();
        let config = CloudConfig::default();
        let err = CloudBackupWalker::new(&store, &config)
            .incremental_changes(None)
            .unwrap_err();
        assert!(matches!(err, CloudError::InvalidState(_)));
    }

    #[test]
    fn insert_then_delete_surfaces_as_deletion() {
        let store = MemoryRecordStore::new();
        let ids = insert(&store, RecordType::Steps, 1);
        store.write(|txn| txn.delete_record(ids[0])).unwrap();
        let config = CloudConfig::default();

        let page = CloudBackupWalker::new(&store, &config)
            .incremental_changes(Some(0))
            .unwrap();
        assert_eq!(page.changes, vec![BackupChange::deletion(ids[0], 1)]);
        assert_eq!(page.token.change_log_cursor, Some(2));
    }

    #[test]
    fn token_validity_tracks_purges() {
        let store = MemoryRecordStore::new();
        insert(&store, RecordType::Steps, 4);
        let config = CloudConfig::default();
        let walker = CloudBackupWalker::new(&store, &config);

        assert!(!walker.is_change_logs_token_valid(None).unwrap());
        let at = |cursor| BackupChangeToken::change_log(cursor);
        assert!(walker.is_change_logs_token_valid(Some(&at(0))).unwrap());
        assert!(walker.is_change_logs_token_valid(Some(&at(4))).unwrap());
        assert!(!walker.is_change_logs_token_valid(Some(&at(9))).unwrap());

        store.purge_change_logs_through(2).unwrap();
        assert!(!walker.is_change_logs_token_valid(Some(&at(0))).unwrap());
        assert!(walker.is_change_logs_token_valid(Some(&at(2))).unwrap());
    }
}
