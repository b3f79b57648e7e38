//! Record store interface.

use crate::error::{CoreError, CoreResult};
use crate::record::{AppInfo, ChangeLogEntry, MedicalDataSource, MedicalResource, Record};
use crate::types::{HealthDataCategory, PageToken, RecordId, RecordType};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use uuid::Uuid;

/// One page of a record table.
#[derive(Debug, Clone, Default)]
pub struct RecordPage {
    /// Rows in row id order.
    pub records: Vec<Record>,
    /// Where the next read should resume, or [`PageToken::EMPTY`] if the
    /// table is exhausted.
    pub next_page_token: PageToken,
}

/// Transactional store of health records.
///
/// Every record table is ordered by a stable row id, and every insert,
/// replace or delete made through [`RecordStore::transaction`] appends a row
/// to the change log.
///
/// # Implementors
///
/// - [`crate::MemoryRecordStore`] - In-memory store with snapshot files
pub trait RecordStore: Send + Sync {
    /// Returns the schema version.
    fn schema_version(&self) -> u32;

    /// Reads up to `limit` rows of `record_type` after `page_token`.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be read.
    fn read_page(
        &self,
        record_type: RecordType,
        page_token: PageToken,
        limit: usize,
    ) -> CoreResult<RecordPage>;

    /// Looks up a record by id in any table.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get_record(&self, id: RecordId) -> CoreResult<Option<Record>>;

    /// Returns the number of rows in a table.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn record_count(&self, record_type: RecordType) -> CoreResult<usize>;

    /// Returns the row id of the most recent change log row ever written,
    /// or 0 if none was.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn latest_change_log_row_id(&self) -> CoreResult<u64>;

    /// Returns true if change log row `row_id` still exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn change_log_exists(&self, row_id: u64) -> CoreResult<bool>;

    /// Reads up to `limit` change log rows with row id greater than
    /// `after_row_id`, in row id order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn read_change_logs(&self, after_row_id: u64, limit: usize)
        -> CoreResult<Vec<ChangeLogEntry>>;

    /// Deletes change log rows up to and including `row_id`.
    ///
    /// Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn purge_change_logs_through(&self, row_id: u64) -> CoreResult<usize>;

    /// Stores an opaque backup token row and returns its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn insert_backup_token(&self, token: Vec<u8>) -> CoreResult<u64>;

    /// Reads a backup token row.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn read_backup_token(&self, id: u64) -> CoreResult<Option<Vec<u8>>>;

    /// Returns all app info rows, ordered by package name.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn app_infos(&self) -> CoreResult<Vec<AppInfo>>;

    /// Returns all medical data sources.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn medical_data_sources(&self) -> CoreResult<Vec<MedicalDataSource>>;

    /// Reads up to `limit` medical resources starting at `offset`, in a
    /// stable order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn read_medical_resources(&self, offset: usize, limit: usize)
        -> CoreResult<Vec<MedicalResource>>;

    /// Returns the number of medical resources.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn medical_resource_count(&self) -> CoreResult<usize>;

    /// Returns the app priority list of every category.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn priority_lists(&self) -> CoreResult<BTreeMap<HealthDataCategory, Vec<String>>>;

    /// Runs `body` in a single write transaction.
    ///
    /// If `body` returns an error every change it made is rolled back and
    /// the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the error of `body`, or an error if the commit fails.
    fn transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn StoreTransaction) -> CoreResult<()>,
    ) -> CoreResult<()>;

    /// Writes a complete, versioned copy of the store to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    fn export_snapshot(&self, path: &Path) -> CoreResult<()>;
}

/// Write access inside a [`RecordStore::transaction`].
pub trait StoreTransaction {
    /// Looks up a record by id, seeing this transaction's own writes.
    fn get_record(&self, id: RecordId) -> Option<Record>;

    /// Inserts `record`, replacing any record with the same id.
    ///
    /// # Errors
    ///
    /// Returns an error if the write is rejected.
    fn upsert_record(&mut self, record: Record) -> CoreResult<()>;

    /// Inserts `record` unless a record with the same id exists.
    ///
    /// Returns true if the record was inserted.
    ///
    /// # Errors
    ///
    /// Returns an error if the write is rejected.
    fn insert_record_if_absent(&mut self, record: Record) -> CoreResult<bool>;

    /// Deletes a record by id.
    ///
    /// Returns true if a record was removed; deleting an absent id is not
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the write is rejected.
    fn delete_record(&mut self, id: RecordId) -> CoreResult<bool>;

    /// Looks up app info by package name.
    fn app_info(&self, package_name: &str) -> Option<AppInfo>;

    /// Inserts `app` unless the package is already known.
    ///
    /// Returns true if the app was inserted.
    ///
    /// # Errors
    ///
    /// Returns an error if the write is rejected.
    fn insert_app_info_if_absent(&mut self, app: AppInfo) -> CoreResult<bool>;

    /// Adds `types` to the record types used by `package_name`, creating a
    /// placeholder app entry if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the write is rejected.
    fn add_record_types_used(
        &mut self,
        package_name: &str,
        types: &BTreeSet<RecordType>,
    ) -> CoreResult<()>;

    /// Inserts a data source unless one with the same (package, display
    /// name) exists.
    ///
    /// Returns the id of the row that owns the unique key and whether it
    /// was inserted by this call.
    ///
    /// # Errors
    ///
    /// Returns an error if the write is rejected.
    fn insert_data_source_if_absent(&mut self, source: MedicalDataSource)
        -> CoreResult<(Uuid, bool)>;

    /// Inserts a medical resource unless one with the same key exists.
    ///
    /// Returns true if the resource was inserted.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the resource's data source does not exist.
    fn insert_medical_resource_if_absent(&mut self, resource: MedicalResource)
        -> CoreResult<bool>;

    /// Replaces the priority list of a category.
    ///
    /// # Errors
    ///
    /// Returns an error if the write is rejected.
    fn set_priority_list(
        &mut self,
        category: HealthDataCategory,
        packages: Vec<String>,
    ) -> CoreResult<()>;
}

/// Generic helpers over [`RecordStore`].
pub trait RecordStoreExt: RecordStore {
    /// Runs a one-shot closure in a transaction and returns its value.
    ///
    /// # Errors
    ///
    /// Returns the error of `body`; nothing is committed in that case.
    fn write<T>(
        &self,
        body: impl FnOnce(&mut dyn StoreTransaction) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let mut body = Some(body);
        let mut output = None;
        self.transaction(&mut |txn| {
            let body = body
                .take()
                .ok_or_else(|| CoreError::invalid_state("transaction body ran twice"))?;
            output = Some(body(txn)?);
            Ok(())
        })?;
        output.ok_or_else(|| CoreError::invalid_state("transaction body did not run"))
    }
}

impl<S: RecordStore + ?Sized> RecordStoreExt for S {}
