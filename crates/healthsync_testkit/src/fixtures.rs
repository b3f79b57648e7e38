//! Test fixtures and store helpers.
//!
//! Provides builders for the rows a record store holds and helpers that
//! fill stores and write staged snapshots.

use healthsync_core::{
    AppInfo, HealthDataCategory, MedicalDataSource, MedicalResource, MemoryRecordStore, Record,
    RecordId, RecordStore, RecordStoreExt, RecordType, StoreConfig,
};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Package name used by fixtures unless a test picks its own.
pub const TEST_PACKAGE: &str = "com.example.fitness";

/// Base timestamp of fixture records.
pub const BASE_TIME_MILLIS: i64 = 1_700_000_000_000;

/// Creates an empty in-memory store with the current schema.
pub fn memory_store() -> MemoryRecordStore {
    MemoryRecordStore::new()
}

/// Creates an empty in-memory store with `schema_version`.
pub fn memory_store_with_schema(schema_version: u32) -> MemoryRecordStore {
    MemoryRecordStore::with_config(StoreConfig::default().with_schema_version(schema_version))
}

/// Builds a record of `record_type` for [`TEST_PACKAGE`].
pub fn record(record_type: RecordType, index: usize) -> Record {
    Record::new(
        record_type,
        TEST_PACKAGE,
        BASE_TIME_MILLIS + index as i64 * 1_000,
    )
    .with_payload(format!("{record_type}-{index}").into_bytes())
}

/// Builds a steps record.
pub fn steps(index: usize) -> Record {
    record(RecordType::Steps, index)
}

/// Inserts `count` records of `record_type` and returns their ids in order.
///
/// # Panics
///
/// Panics if the store rejects the write.
pub fn populate(store: &dyn RecordStore, record_type: RecordType, count: usize) -> Vec<RecordId> {
    store
        .write(|txn| {
            let mut ids = Vec::with_capacity(count);
            for index in 0..count {
                let record = record(record_type, index);
                ids.push(record.id);
                txn.upsert_record(record)?;
            }
            Ok(ids)
        })
        .expect("populate store")
}

/// Inserts `records` in one transaction.
///
/// # Panics
///
/// Panics if the store rejects the write.
pub fn insert_all(store: &dyn RecordStore, records: &[Record]) {
    store
        .write(|txn| {
            for record in records {
                txn.upsert_record(record.clone())?;
            }
            Ok(())
        })
        .expect("insert records");
}

/// Inserts a planned session and an exercise session that completes it.
///
/// Returns `(planned, exercise)`.
///
/// # Panics
///
/// Panics if the store rejects the write.
pub fn insert_session_pair(store: &dyn RecordStore, index: usize) -> (Record, Record) {
    let planned = record(RecordType::PlannedExerciseSession, index);
    let exercise = record(RecordType::ExerciseSession, index).with_planned_session(planned.id);
    let planned = planned.with_completed_session(exercise.id);
    insert_all(store, &[planned.clone(), exercise.clone()]);
    (planned, exercise)
}

/// Builds a named app.
pub fn app(package_name: &str) -> AppInfo {
    AppInfo::new(package_name, format!("{package_name} app"))
}

/// Builds a medical data source for `package_name`.
pub fn data_source(package_name: &str, display_name: &str) -> MedicalDataSource {
    MedicalDataSource::new(
        package_name,
        display_name,
        format!("https://fhir.example.com/{display_name}"),
    )
}

/// Builds an immunization resource of `source`.
pub fn immunization(source: &MedicalDataSource, fhir_id: &str) -> MedicalResource {
    MedicalResource {
        data_source_id: source.id,
        resource_type: 1,
        fhir_resource_type: "Immunization".to_string(),
        fhir_resource_id: fhir_id.to_string(),
        payload: format!("{{\"id\":\"{fhir_id}\"}}").into_bytes(),
    }
}

/// Inserts an app and a data source holding `resources` immunizations.
///
/// Returns the data source.
///
/// # Panics
///
/// Panics if the store rejects the write.
pub fn insert_medical_fixture(
    store: &dyn RecordStore,
    package_name: &str,
    display_name: &str,
    resources: usize,
) -> MedicalDataSource {
    let source = data_source(package_name, display_name);
    store
        .write(|txn| {
            txn.insert_app_info_if_absent(app(package_name))?;
            let (id, _) = txn.insert_data_source_if_absent(source.clone())?;
            for index in 0..resources {
                let mut resource = immunization(&source, &format!("imm-{index}"));
                resource.data_source_id = id;
                txn.insert_medical_resource_if_absent(resource)?;
            }
            Ok(())
        })
        .expect("insert medical fixture");
    source
}

/// Replaces the priority list of `category`.
///
/// # Panics
///
/// Panics if the store rejects the write.
pub fn set_priority(store: &dyn RecordStore, category: HealthDataCategory, packages: &[&str]) {
    store
        .write(|txn| {
            txn.set_priority_list(category, packages.iter().map(|p| p.to_string()).collect())
        })
        .expect("set priority list");
}

/// Writes a snapshot of `store` into `dir` under `file_name`.
///
/// # Panics
///
/// Panics if the snapshot cannot be written.
pub fn write_snapshot(store: &dyn RecordStore, dir: &Path, file_name: &str) -> PathBuf {
    let path = dir.join(file_name);
    store.export_snapshot(&path).expect("export snapshot");
    path
}

/// Creates a temporary directory.
///
/// # Panics
///
/// Panics if the directory cannot be created.
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("create temp directory")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn populate_returns_ids_in_order() {
        let store = memory_store();
        let ids = populate(&store, RecordType::Weight, 4);
        assert_eq!(ids.len(), 4);
        let page = store
            .read_page(RecordType::Weight, healthsync_core::PageToken::EMPTY, 10)
            .unwrap();
        let read: Vec<_> = page.records.iter().map(|r| r.id).collect();
        assert_eq!(read, ids);
    }

    #[test]
    fn session_pair_references_each_other() {
        let store = memory_store();
        let (planned, exercise) = insert_session_pair(&store, 0);
        assert_eq!(exercise.planned_exercise_session_id, Some(planned.id));
        assert_eq!(planned.completed_exercise_session_id, Some(exercise.id));
    }

    #[test]
    fn medical_fixture_inserts_resources() {
        let store = memory_store();
        insert_medical_fixture(&store, TEST_PACKAGE, "clinic", 3);
        assert_eq!(store.medical_resource_count().unwrap(), 3);
        assert_eq!(store.medical_data_sources().unwrap().len(), 1);
    }
}
