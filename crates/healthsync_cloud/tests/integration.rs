//! Integration tests for cloud backup and restore.

use healthsync_cloud::{
    BackupChange, BackupChangeToken, CloudBackupManager, CloudConfig, CloudError, RestoreChange,
};
use healthsync_core::{
    from_cbor, MemoryRecordStore, PageToken, Record, RecordId, RecordStore, RecordStoreExt,
    RecordType,
};
use healthsync_testkit::prelude::*;
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

fn cloud(store: Arc<dyn RecordStore>, page_size: usize) -> CloudBackupManager {
    init_tracing();
    CloudBackupManager::new(store, CloudConfig::default().with_page_size(page_size))
}

fn load_token(store: &dyn RecordStore, id: &str) -> BackupChangeToken {
    BackupChangeToken::load(store, id).unwrap()
}

/// Runs a full backup to completion and returns every change plus the
/// token that continues with incremental reads.
fn full_backup(
    manager: &CloudBackupManager,
    store: &dyn RecordStore,
) -> (Vec<BackupChange>, String) {
    let mut changes = Vec::new();
    let mut token: Option<String> = None;
    for _ in 0..10_000 {
        let response = manager.get_changes_for_backup(token.as_deref()).unwrap();
        changes.extend(response.changes);
        let next = load_token(store, &response.next_change_token);
        token = Some(response.next_change_token);
        if !next.is_walking_tables() {
            break;
        }
    }
    (changes, token.unwrap())
}

fn decode(change: &BackupChange) -> Record {
    from_cbor(change.data.as_deref().unwrap()).unwrap()
}

fn restore_changes(changes: Vec<BackupChange>) -> Vec<RestoreChange> {
    changes.into_iter().map(RestoreChange::from).collect()
}

#[test]
fn ten_thousand_steps_take_two_pages() {
    let store = Arc::new(memory_store());
    populate(&*store, RecordType::Steps, 10_000);
    let manager = cloud(store.clone(), 5_000);

    let first = manager.get_changes_for_backup(None).unwrap();
    assert_eq!(first.changes.len(), 5_000);
    let token = load_token(&*store, &first.next_change_token);
    assert_eq!(token.record_type, Some(RecordType::Steps));
    assert!(!token.data_table_page_token.is_empty());
    assert_eq!(token.change_log_cursor, Some(10_000));

    let second = manager
        .get_changes_for_backup(Some(&first.next_change_token))
        .unwrap();
    assert_eq!(second.changes.len(), 5_000);
    let token = load_token(&*store, &second.next_change_token);
    assert_eq!(token.record_type, RecordType::Steps.next_in_backup_order());
    assert_eq!(token.data_table_page_token, PageToken::EMPTY);

    let third = manager
        .get_changes_for_backup(Some(&second.next_change_token))
        .unwrap();
    assert!(third.changes.is_empty());
    assert!(!load_token(&*store, &third.next_change_token).is_walking_tables());

    let ids: HashSet<RecordId> = first
        .changes
        .iter()
        .chain(&second.changes)
        .map(|c| c.record_id)
        .collect();
    assert_eq!(ids.len(), 10_000);
    assert!(first.changes.iter().all(|c| !c.is_deletion && c.version == 1));
}

#[test]
fn incremental_read_reports_upsert_and_deletion() {
    let store = Arc::new(memory_store());
    let manager = cloud(store.clone(), 5_000);
    let (changes, token) = full_backup(&manager, &*store);
    assert!(changes.is_empty());

    let step = steps(0);
    let pressure = record(RecordType::BloodPressure, 0);
    insert_all(&*store, &[step.clone()]);
    insert_all(&*store, &[pressure.clone()]);
    store.write(|txn| txn.delete_record(step.id)).unwrap();

    let response = manager.get_changes_for_backup(Some(&token)).unwrap();
    assert_eq!(response.changes.len(), 2);
    assert_eq!(response.changes[0].record_id, pressure.id);
    assert!(!response.changes[0].is_deletion);
    assert_eq!(decode(&response.changes[0]), pressure);
    assert_eq!(response.changes[1], BackupChange::deletion(step.id, 1));

    let next = load_token(&*store, &response.next_change_token);
    assert_eq!(next.change_log_cursor, Some(3));

    let idle = manager
        .get_changes_for_backup(Some(&response.next_change_token))
        .unwrap();
    assert!(idle.changes.is_empty());
    assert!(!idle.next_change_token.is_empty());
}

#[test]
fn changes_during_full_walk_arrive_incrementally() {
    let store = Arc::new(memory_store());
    populate(&*store, RecordType::Weight, 4);
    let manager = cloud(store.clone(), 3);

    let first = manager.get_changes_for_backup(None).unwrap();
    assert_eq!(first.changes.len(), 3);
    let late = record(RecordType::Steps, 99);
    insert_all(&*store, &[late.clone()]);

    let second = manager
        .get_changes_for_backup(Some(&first.next_change_token))
        .unwrap();
    assert_eq!(second.changes.len(), 1);
    let third = manager
        .get_changes_for_backup(Some(&second.next_change_token))
        .unwrap();
    assert_eq!(third.changes.len(), 1);
    assert_eq!(third.changes[0].record_id, late.id);
}

#[test]
fn purged_change_log_requires_full_backup() {
    let store = Arc::new(memory_store());
    populate(&*store, RecordType::Steps, 3);
    let manager = cloud(store.clone(), 5_000);
    let (changes, token) = full_backup(&manager, &*store);
    assert_eq!(changes.len(), 3);

    populate(&*store, RecordType::Steps, 2);
    store.purge_change_logs_through(4).unwrap();

    let response = manager.get_changes_for_backup(Some(&token)).unwrap();
    assert!(response.changes.is_empty());
    assert!(response.next_change_token.is_empty());

    let restarted = manager
        .get_changes_for_backup(Some(&response.next_change_token))
        .unwrap();
    assert_eq!(restarted.changes.len(), 5);
    assert!(!load_token(&*store, &restarted.next_change_token).is_walking_tables());

    let (again, _) = full_backup(&manager, &*store);
    assert_eq!(again.len(), 5);
}

#[test]
fn unknown_token_is_rejected() {
    let store = Arc::new(memory_store());
    let manager = cloud(store, 5_000);
    let err = manager.get_changes_for_backup(Some("999")).unwrap_err();
    assert!(matches!(err, CloudError::InvalidToken(_)));
    assert!(err.requires_full_backup());
}

#[test]
fn backup_restores_onto_another_device() {
    let sender = Arc::new(memory_store());
    sender
        .write(|txn| txn.insert_app_info_if_absent(app(TEST_PACKAGE)))
        .unwrap();
    populate(&*sender, RecordType::Steps, 5);
    let (planned, exercise) = insert_session_pair(&*sender, 0);
    let sending = cloud(sender.clone(), 4);
    let (changes, token) = full_backup(&sending, &*sender);
    let app_info = sending.app_info_for_backup().unwrap();

    let receiver = Arc::new(memory_store());
    let receiving = cloud(receiver.clone(), 4);
    let stats = receiving
        .restore_changes(&restore_changes(changes), &app_info)
        .unwrap();
    assert_eq!(stats.upserted, 7);
    assert_eq!(stats.apps_created, 1);
    assert_eq!(receiver.total_records(), 7);
    assert_eq!(
        receiver
            .get_record(exercise.id)
            .unwrap()
            .unwrap()
            .planned_exercise_session_id,
        Some(planned.id)
    );

    let doomed = populate(&*sender, RecordType::Weight, 1)[0];
    sender.write(|txn| txn.delete_record(doomed)).unwrap();
    let removed = sender
        .read_page(RecordType::Steps, PageToken::EMPTY, 1)
        .unwrap()
        .records[0]
        .id;
    sender.write(|txn| txn.delete_record(removed)).unwrap();
    let incremental = sending.get_changes_for_backup(Some(&token)).unwrap();
    let stats = receiving
        .restore_changes(&restore_changes(incremental.changes), &app_info)
        .unwrap();
    assert_eq!(stats.deleted, 1);
    assert_eq!(receiver.total_records(), 6);
    assert!(receiver.get_record(removed).unwrap().is_none());

    let app = receiver
        .app_infos()
        .unwrap()
        .into_iter()
        .find(|a| a.package_name == TEST_PACKAGE)
        .unwrap();
    assert_eq!(app.app_name.as_deref(), Some("com.example.fitness app"));
    assert!(app.record_types_used.contains(&RecordType::Steps));
}

#[test]
fn failed_restore_applies_nothing() {
    let source = memory_store();
    populate(&source, RecordType::Steps, 5);
    let changes: Vec<RestoreChange> = source
        .read_page(RecordType::Steps, PageToken::EMPTY, 10)
        .unwrap()
        .records
        .iter()
        .map(|r| BackupChange::upsert(r, 1).unwrap().into())
        .collect();

    let receiver = Arc::new(FailingRecordStore::default());
    let manager = cloud(receiver.clone(), 5_000);
    receiver.fail_after(0);
    assert!(manager.restore_changes(&changes, &[]).is_err());
    assert_eq!(receiver.inner().total_records(), 0);
    assert!(receiver.inner().app_infos().unwrap().is_empty());

    let stats = manager.restore_changes(&changes, &[]).unwrap();
    assert_eq!(stats.upserted, 5);
    assert_eq!(receiver.inner().total_records(), 5);
}

#[test]
fn undecodable_payloads_are_skipped() {
    let good = [steps(0), steps(1)];
    let mut changes: Vec<RestoreChange> = good
        .iter()
        .map(|r| BackupChange::upsert(r, 1).unwrap().into())
        .collect();
    changes.insert(
        1,
        RestoreChange {
            record_id: RecordId::new(),
            is_deletion: false,
            data: Some(vec![0xff, 0x13, 0x37]),
            version: 1,
        },
    );

    let receiver = Arc::new(memory_store());
    let manager = cloud(receiver.clone(), 5_000);
    let stats = manager.restore_changes(&changes, &[]).unwrap();

    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.upserted, 2);
    assert_eq!(receiver.record_count(RecordType::Steps).unwrap(), 2);
}

#[test]
fn undecodable_app_info_is_an_error() {
    let receiver = Arc::new(memory_store());
    let manager = cloud(receiver.clone(), 5_000);
    let changes = vec![RestoreChange::from(BackupChange::upsert(&steps(0), 1).unwrap())];

    let err = manager.restore_changes(&changes, &[0xff]).unwrap_err();
    assert!(matches!(err, CloudError::Core(_)));
    assert_eq!(receiver.total_records(), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn pages_concatenate_to_every_table(
        sizes in table_sizes_strategy(12),
        sessions in 0usize..4,
        page_size in 1usize..8,
    ) {
        let store = Arc::new(MemoryRecordStore::new());
        let mut expected = HashSet::new();
        for (record_type, count) in &sizes {
            expected.extend(populate(&*store, *record_type, *count));
        }
        for index in 0..sessions {
            let (planned, exercise) = insert_session_pair(&*store, index);
            expected.insert(planned.id);
            expected.insert(exercise.id);
        }

        let manager = cloud(store.clone(), page_size);
        let (changes, _) = full_backup(&manager, &*store);

        let positions: HashMap<RecordId, usize> = changes
            .iter()
            .enumerate()
            .map(|(i, c)| (c.record_id, i))
            .collect();
        prop_assert_eq!(positions.len(), changes.len());
        prop_assert_eq!(positions.keys().copied().collect::<HashSet<_>>(), expected);

        let mut ranks = Vec::with_capacity(changes.len());
        for (i, change) in changes.iter().enumerate() {
            let record = decode(change);
            ranks.push(record.record_type.backup_rank());
            if let Some(planned) = record.planned_exercise_session_id {
                prop_assert!(positions[&planned] < i);
            }
        }
        prop_assert!(ranks.windows(2).all(|w| w[0] <= w[1]));
    }
}
