//! Fault injection for record stores.

use healthsync_core::{
    AppInfo, ChangeLogEntry, CoreError, CoreResult, HealthDataCategory, MedicalDataSource,
    MedicalResource, MemoryRecordStore, PageToken, Record, RecordId, RecordPage, RecordStore,
    RecordType, StoreTransaction,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A [`MemoryRecordStore`] whose transactions can be made to fail.
///
/// An armed failure lets the transaction body run to completion and then
/// aborts it, so every change the body made is rolled back.
#[derive(Debug, Default)]
pub struct FailingRecordStore {
    inner: MemoryRecordStore,
    fail_after: AtomicUsize,
}

impl FailingRecordStore {
    /// Wraps `inner`.
    pub fn new(inner: MemoryRecordStore) -> Self {
        Self {
            inner,
            fail_after: AtomicUsize::new(0),
        }
    }

    /// Makes the transaction after `successes` more successful ones fail.
    pub fn fail_after(&self, successes: usize) {
        self.fail_after.store(successes + 1, Ordering::SeqCst);
    }

    /// Returns the wrapped store.
    pub fn inner(&self) -> &MemoryRecordStore {
        &self.inner
    }

    fn should_fail(&self) -> bool {
        let previous = self
            .fail_after
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        previous == 1
    }
}

impl RecordStore for FailingRecordStore {
    fn schema_version(&self) -> u32 {
        self.inner.schema_version()
    }

    fn read_page(
        &self,
        record_type: RecordType,
        page_token: PageToken,
        limit: usize,
    ) -> CoreResult<RecordPage> {
        self.inner.read_page(record_type, page_token, limit)
    }

    fn get_record(&self, id: RecordId) -> CoreResult<Option<Record>> {
        self.inner.get_record(id)
    }

    fn record_count(&self, record_type: RecordType) -> CoreResult<usize> {
        self.inner.record_count(record_type)
    }

    fn latest_change_log_row_id(&self) -> CoreResult<u64> {
        self.inner.latest_change_log_row_id()
    }

    fn change_log_exists(&self, row_id: u64) -> CoreResult<bool> {
        self.inner.change_log_exists(row_id)
    }

    fn read_change_logs(
        &self,
        after_row_id: u64,
        limit: usize,
    ) -> CoreResult<Vec<ChangeLogEntry>> {
        self.inner.read_change_logs(after_row_id, limit)
    }

    fn purge_change_logs_through(&self, row_id: u64) -> CoreResult<usize> {
        self.inner.purge_change_logs_through(row_id)
    }

    fn insert_backup_token(&self, token: Vec<u8>) -> CoreResult<u64> {
        self.inner.insert_backup_token(token)
    }

    fn read_backup_token(&self, id: u64) -> CoreResult<Option<Vec<u8>>> {
        self.inner.read_backup_token(id)
    }

    fn app_infos(&self) -> CoreResult<Vec<AppInfo>> {
        self.inner.app_infos()
    }

    fn medical_data_sources(&self) -> CoreResult<Vec<MedicalDataSource>> {
        self.inner.medical_data_sources()
    }

    fn read_medical_resources(
        &self,
        offset: usize,
        limit: usize,
    ) -> CoreResult<Vec<MedicalResource>> {
        self.inner.read_medical_resources(offset, limit)
    }

    fn medical_resource_count(&self) -> CoreResult<usize> {
        self.inner.medical_resource_count()
    }

    fn priority_lists(&self) -> CoreResult<BTreeMap<HealthDataCategory, Vec<String>>> {
        self.inner.priority_lists()
    }

    fn transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn StoreTransaction) -> CoreResult<()>,
    ) -> CoreResult<()> {
        let fail = self.should_fail();
        self.inner.transaction(&mut |txn| {
            body(txn)?;
            if fail {
                return Err(CoreError::aborted("injected failure"));
            }
            Ok(())
        })
    }

    fn export_snapshot(&self, path: &Path) -> CoreResult<()> {
        self.inner.export_snapshot(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use healthsync_core::RecordStoreExt;

    #[test]
    fn armed_failure_rolls_back_one_transaction() {
        let store = FailingRecordStore::default();
        store.fail_after(1);

        store
            .write(|txn| txn.upsert_record(Record::new(RecordType::Steps, "a", 0)))
            .unwrap();
        let failed = store.write(|txn| txn.upsert_record(Record::new(RecordType::Steps, "a", 1)));
        assert!(failed.is_err());
        store
            .write(|txn| txn.upsert_record(Record::new(RecordType::Steps, "a", 2)))
            .unwrap();

        assert_eq!(store.record_count(RecordType::Steps).unwrap(), 2);
    }
}
