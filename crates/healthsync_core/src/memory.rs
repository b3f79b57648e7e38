//! In-memory record store with snapshot files.
//!
//! `MemoryRecordStore` keeps every table in ordered maps behind one
//! `RwLock`. A write transaction holds the write lock for its whole
//! duration and records an undo log, so a failing transaction restores the
//! tables exactly.
//!
//! A snapshot file is a versioned CBOR image of all tables. Snapshots are
//! the on-disk form of a staged database.

use crate::codec::{from_cbor, to_cbor};
use crate::config::StoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::record::{
    AppInfo, ChangeLogEntry, ChangeOperation, MedicalDataSource, MedicalResource, Record,
    ResourceKey,
};
use crate::store::{RecordPage, RecordStore, StoreTransaction};
use crate::types::{HealthDataCategory, PageToken, RecordId, RecordType};
use healthsync_storage::atomic_write;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::path::Path;
use uuid::Uuid;

const SNAPSHOT_MAGIC: &str = "HSSNAP";
const SNAPSHOT_FORMAT_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tables {
    next_row_id: u64,
    records: BTreeMap<RecordType, BTreeMap<u64, Record>>,
    #[serde(skip)]
    record_index: HashMap<RecordId, (RecordType, u64)>,
    next_change_log_row_id: u64,
    change_logs: BTreeMap<u64, ChangeLogEntry>,
    next_token_id: u64,
    backup_tokens: BTreeMap<u64, Vec<u8>>,
    app_infos: BTreeMap<String, AppInfo>,
    data_sources: BTreeMap<Uuid, MedicalDataSource>,
    #[serde(skip)]
    data_source_keys: HashMap<(String, String), Uuid>,
    resources: BTreeMap<ResourceKey, MedicalResource>,
    priority_lists: BTreeMap<HealthDataCategory, Vec<String>>,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            next_row_id: 1,
            records: BTreeMap::new(),
            record_index: HashMap::new(),
            next_change_log_row_id: 1,
            change_logs: BTreeMap::new(),
            next_token_id: 1,
            backup_tokens: BTreeMap::new(),
            app_infos: BTreeMap::new(),
            data_sources: BTreeMap::new(),
            data_source_keys: HashMap::new(),
            resources: BTreeMap::new(),
            priority_lists: BTreeMap::new(),
        }
    }
}

impl Tables {
    fn rebuild_indexes(&mut self) {
        self.record_index = self
            .records
            .iter()
            .flat_map(|(t, rows)| rows.iter().map(move |(row, r)| (r.id, (*t, *row))))
            .collect();
        self.data_source_keys = self
            .data_sources
            .values()
            .map(|s| (s.unique_key(), s.id))
            .collect();
    }

    fn take_record(&mut self, id: RecordId) -> Option<(u64, Record)> {
        let (record_type, row) = self.record_index.remove(&id)?;
        let record = self.records.get_mut(&record_type)?.remove(&row)?;
        Some((row, record))
    }

    fn put_record(&mut self, row: u64, record: Record) {
        self.record_index.insert(record.id, (record.record_type, row));
        self.records
            .entry(record.record_type)
            .or_default()
            .insert(row, record);
    }

    fn get_record(&self, id: RecordId) -> Option<&Record> {
        let (record_type, row) = self.record_index.get(&id)?;
        self.records.get(record_type)?.get(row)
    }

    fn allocate_row(&mut self) -> u64 {
        let row = self.next_row_id;
        self.next_row_id += 1;
        row
    }

    fn append_change_log(
        &mut self,
        record_type: RecordType,
        record_id: RecordId,
        op: ChangeOperation,
    ) {
        let row_id = self.next_change_log_row_id;
        self.next_change_log_row_id += 1;
        self.change_logs.insert(
            row_id,
            ChangeLogEntry {
                row_id,
                record_type,
                record_id,
                operation: op,
            },
        );
    }

    fn purge_change_logs_through(&mut self, row_id: u64) -> usize {
        let kept = self.change_logs.split_off(&(row_id.saturating_add(1)));
        let removed = self.change_logs.len();
        self.change_logs = kept;
        removed
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    magic: String,
    format_version: u16,
    schema_version: u32,
    tables: Tables,
}

/// An in-memory [`RecordStore`].
///
/// # Example
///
/// ```rust
/// use healthsync_core::{MemoryRecordStore, Record, RecordStore, RecordStoreExt, RecordType};
///
/// let store = MemoryRecordStore::new();
/// store.write(|txn| txn.upsert_record(Record::new(RecordType::Steps, "com.example", 0))).unwrap();
/// assert_eq!(store.record_count(RecordType::Steps).unwrap(), 1);
/// assert_eq!(store.latest_change_log_row_id().unwrap(), 1);
/// ```
#[derive(Debug)]
pub struct MemoryRecordStore {
    config: StoreConfig,
    tables: RwLock<Tables>,
}

impl MemoryRecordStore {
    /// Creates an empty store with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Creates an empty store.
    #[must_use]
    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            config,
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Opens a snapshot file written by [`RecordStore::export_snapshot`].
    ///
    /// The returned store carries the snapshot's schema version.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a snapshot.
    pub fn open_snapshot(path: &Path) -> CoreResult<Self> {
        let bytes = std::fs::read(path)?;
        let snapshot: Snapshot = from_cbor(&bytes)?;
        if snapshot.magic != SNAPSHOT_MAGIC {
            return Err(CoreError::codec(format!(
                "{} is not a record store snapshot",
                path.display()
            )));
        }
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(CoreError::codec(format!(
                "unsupported snapshot format version {}",
                snapshot.format_version
            )));
        }
        let mut tables = snapshot.tables;
        tables.rebuild_indexes();
        tracing::debug!(
            path = %path.display(),
            schema_version = snapshot.schema_version,
            "opened record store snapshot"
        );
        Ok(Self {
            config: StoreConfig::default().with_schema_version(snapshot.schema_version),
            tables: RwLock::new(tables),
        })
    }

    /// Returns the total number of records across all tables.
    #[must_use]
    pub fn total_records(&self) -> usize {
        self.tables.read().record_index.len()
    }

    /// Returns the number of change log rows currently kept.
    #[must_use]
    pub fn change_log_len(&self) -> usize {
        self.tables.read().change_logs.len()
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for MemoryRecordStore {
    fn schema_version(&self) -> u32 {
        self.config.schema_version
    }

    fn read_page(
        &self,
        record_type: RecordType,
        page_token: PageToken,
        limit: usize,
    ) -> CoreResult<RecordPage> {
        if limit == 0 {
            return Ok(RecordPage {
                records: Vec::new(),
                next_page_token: page_token,
            });
        }
        let tables = self.tables.read();
        let Some(rows) = tables.records.get(&record_type) else {
            return Ok(RecordPage::default());
        };
        let start = Bound::Excluded(page_token.resume_after());
        let mut iter = rows.range((start, Bound::Unbounded));
        let mut records = Vec::with_capacity(limit.min(rows.len()));
        let mut last_row = 0;
        for (row, record) in iter.by_ref().take(limit) {
            last_row = *row;
            records.push(record.clone());
        }
        let next_page_token = if records.len() == limit && iter.next().is_some() {
            PageToken::after_row(last_row)
        } else {
            PageToken::EMPTY
        };
        Ok(RecordPage {
            records,
            next_page_token,
        })
    }

    fn get_record(&self, id: RecordId) -> CoreResult<Option<Record>> {
        Ok(self.tables.read().get_record(id).cloned())
    }

    fn record_count(&self, record_type: RecordType) -> CoreResult<usize> {
        Ok(self
            .tables
            .read()
            .records
            .get(&record_type)
            .map_or(0, BTreeMap::len))
    }

    fn latest_change_log_row_id(&self) -> CoreResult<u64> {
        Ok(self.tables.read().next_change_log_row_id - 1)
    }

    fn change_log_exists(&self, row_id: u64) -> CoreResult<bool> {
        Ok(self.tables.read().change_logs.contains_key(&row_id))
    }

    fn read_change_logs(
        &self,
        after_row_id: u64,
        limit: usize,
    ) -> CoreResult<Vec<ChangeLogEntry>> {
        Ok(self
            .tables
            .read()
            .change_logs
            .range((Bound::Excluded(after_row_id), Bound::Unbounded))
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect())
    }

    fn purge_change_logs_through(&self, row_id: u64) -> CoreResult<usize> {
        let removed = self.tables.write().purge_change_logs_through(row_id);
        tracing::debug!(through = row_id, removed, "purged change logs");
        Ok(removed)
    }

    fn insert_backup_token(&self, token: Vec<u8>) -> CoreResult<u64> {
        let mut tables = self.tables.write();
        let id = tables.next_token_id;
        tables.next_token_id += 1;
        tables.backup_tokens.insert(id, token);
        Ok(id)
    }

    fn read_backup_token(&self, id: u64) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.tables.read().backup_tokens.get(&id).cloned())
    }

    fn app_infos(&self) -> CoreResult<Vec<AppInfo>> {
        Ok(self.tables.read().app_infos.values().cloned().collect())
    }

    fn medical_data_sources(&self) -> CoreResult<Vec<MedicalDataSource>> {
        Ok(self.tables.read().data_sources.values().cloned().collect())
    }

    fn read_medical_resources(
        &self,
        offset: usize,
        limit: usize,
    ) -> CoreResult<Vec<MedicalResource>> {
        Ok(self
            .tables
            .read()
            .resources
            .values()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    fn medical_resource_count(&self) -> CoreResult<usize> {
        Ok(self.tables.read().resources.len())
    }

    fn priority_lists(&self) -> CoreResult<BTreeMap<HealthDataCategory, Vec<String>>> {
        Ok(self.tables.read().priority_lists.clone())
    }

    fn transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn StoreTransaction) -> CoreResult<()>,
    ) -> CoreResult<()> {
        let mut tables = self.tables.write();
        let mut txn = MemoryTransaction::begin(&mut tables);
        match body(&mut txn) {
            Ok(()) => {
                drop(txn);
                if let Some(max) = self.config.max_change_logs {
                    let excess = tables.change_logs.len().saturating_sub(max);
                    if excess > 0 {
                        let through = tables.change_logs.keys().nth(excess - 1).copied();
                        if let Some(through) = through {
                            tables.purge_change_logs_through(through);
                        }
                    }
                }
                Ok(())
            }
            Err(e) => {
                let undone = txn.rollback();
                tracing::debug!(error = %e, undone, "rolled back transaction");
                Err(e)
            }
        }
    }

    fn export_snapshot(&self, path: &Path) -> CoreResult<()> {
        let tables = self.tables.read().clone();
        let snapshot = Snapshot {
            magic: SNAPSHOT_MAGIC.to_string(),
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version: self.config.schema_version,
            tables,
        };
        let bytes = to_cbor(&snapshot)?;
        let dir = path
            .parent()
            .ok_or_else(|| CoreError::invalid_argument("snapshot path has no parent"))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CoreError::invalid_argument("snapshot path has no file name"))?;
        std::fs::create_dir_all(dir)?;
        atomic_write(dir, file_name, &bytes)?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "exported record store snapshot");
        Ok(())
    }
}

enum Undo {
    Record {
        id: RecordId,
        before: Option<(u64, Record)>,
    },
    AppInfo {
        package_name: String,
        before: Option<AppInfo>,
    },
    DataSource {
        id: Uuid,
    },
    Resource {
        key: ResourceKey,
    },
    Priority {
        category: HealthDataCategory,
        before: Option<Vec<String>>,
    },
}

struct MemoryTransaction<'a> {
    tables: &'a mut Tables,
    undo: Vec<Undo>,
    saved_next_row_id: u64,
    saved_next_change_log_row_id: u64,
}

impl<'a> MemoryTransaction<'a> {
    fn begin(tables: &'a mut Tables) -> Self {
        let saved_next_row_id = tables.next_row_id;
        let saved_next_change_log_row_id = tables.next_change_log_row_id;
        Self {
            tables,
            undo: Vec::new(),
            saved_next_row_id,
            saved_next_change_log_row_id,
        }
    }

    fn rollback(self) -> usize {
        let count = self.undo.len();
        let tables = self.tables;
        for undo in self.undo.into_iter().rev() {
            match undo {
                Undo::Record { id, before } => {
                    tables.take_record(id);
                    if let Some((row, record)) = before {
                        tables.put_record(row, record);
                    }
                }
                Undo::AppInfo {
                    package_name,
                    before,
                } => match before {
                    Some(app) => {
                        tables.app_infos.insert(package_name, app);
                    }
                    None => {
                        tables.app_infos.remove(&package_name);
                    }
                },
                Undo::DataSource { id } => {
                    if let Some(source) = tables.data_sources.remove(&id) {
                        tables.data_source_keys.remove(&source.unique_key());
                    }
                }
                Undo::Resource { key } => {
                    tables.resources.remove(&key);
                }
                Undo::Priority { category, before } => match before {
                    Some(list) => {
                        tables.priority_lists.insert(category, list);
                    }
                    None => {
                        tables.priority_lists.remove(&category);
                    }
                },
            }
        }
        drop(
            tables
                .change_logs
                .split_off(&self.saved_next_change_log_row_id),
        );
        tables.next_change_log_row_id = self.saved_next_change_log_row_id;
        tables.next_row_id = self.saved_next_row_id;
        count
    }
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn get_record(&self, id: RecordId) -> Option<Record> {
        self.tables.get_record(id).cloned()
    }

    fn upsert_record(&mut self, record: Record) -> CoreResult<()> {
        let id = record.id;
        let record_type = record.record_type;
        let before = self.tables.take_record(id);
        let row = match &before {
            Some((row, old)) if old.record_type == record_type => *row,
            _ => self.tables.allocate_row(),
        };
        self.tables.put_record(row, record);
        self.undo.push(Undo::Record { id, before });
        self.tables
            .append_change_log(record_type, id, ChangeOperation::Upsert);
        Ok(())
    }

    fn insert_record_if_absent(&mut self, record: Record) -> CoreResult<bool> {
        if self.tables.record_index.contains_key(&record.id) {
            return Ok(false);
        }
        self.upsert_record(record)?;
        Ok(true)
    }

    fn delete_record(&mut self, id: RecordId) -> CoreResult<bool> {
        let Some((row, record)) = self.tables.take_record(id) else {
            return Ok(false);
        };
        let record_type = record.record_type;
        self.undo.push(Undo::Record {
            id,
            before: Some((row, record)),
        });
        self.tables
            .append_change_log(record_type, id, ChangeOperation::Delete);
        Ok(true)
    }

    fn app_info(&self, package_name: &str) -> Option<AppInfo> {
        self.tables.app_infos.get(package_name).cloned()
    }

    fn insert_app_info_if_absent(&mut self, app: AppInfo) -> CoreResult<bool> {
        if self.tables.app_infos.contains_key(&app.package_name) {
            return Ok(false);
        }
        self.undo.push(Undo::AppInfo {
            package_name: app.package_name.clone(),
            before: None,
        });
        self.tables.app_infos.insert(app.package_name.clone(), app);
        Ok(true)
    }

    fn add_record_types_used(
        &mut self,
        package_name: &str,
        types: &BTreeSet<RecordType>,
    ) -> CoreResult<()> {
        let before = self.tables.app_infos.get(package_name).cloned();
        let mut app = before
            .clone()
            .unwrap_or_else(|| AppInfo::placeholder(package_name));
        if before.is_some() && types.is_subset(&app.record_types_used) {
            return Ok(());
        }
        app.record_types_used.extend(types.iter().copied());
        self.undo.push(Undo::AppInfo {
            package_name: package_name.to_string(),
            before,
        });
        self.tables.app_infos.insert(package_name.to_string(), app);
        Ok(())
    }

    fn insert_data_source_if_absent(
        &mut self,
        mut source: MedicalDataSource,
    ) -> CoreResult<(Uuid, bool)> {
        let key = source.unique_key();
        if let Some(existing) = self.tables.data_source_keys.get(&key) {
            return Ok((*existing, false));
        }
        if self.tables.data_sources.contains_key(&source.id) {
            source.id = Uuid::new_v4();
        }
        let id = source.id;
        self.undo.push(Undo::DataSource { id });
        self.tables.data_source_keys.insert(key, id);
        self.tables.data_sources.insert(id, source);
        Ok((id, true))
    }

    fn insert_medical_resource_if_absent(
        &mut self,
        resource: MedicalResource,
    ) -> CoreResult<bool> {
        if !self.tables.data_sources.contains_key(&resource.data_source_id) {
            return Err(CoreError::not_found(
                "medical data source",
                resource.data_source_id,
            ));
        }
        let key = resource.key();
        if self.tables.resources.contains_key(&key) {
            return Ok(false);
        }
        self.undo.push(Undo::Resource { key });
        self.tables.resources.insert(key, resource);
        Ok(true)
    }

    fn set_priority_list(
        &mut self,
        category: HealthDataCategory,
        packages: Vec<String>,
    ) -> CoreResult<()> {
        let before = self.tables.priority_lists.insert(category, packages);
        self.undo.push(Undo::Priority { category, before });
        Ok(())
    }
}
