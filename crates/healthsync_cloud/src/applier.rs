//! Applies restored changes to the live store.

use crate::error::{CloudError, CloudResult};
use crate::messages::{AppMetadata, RestoreChange};
use healthsync_core::{
    from_cbor, AppInfo, Record, RecordId, RecordStore, RecordStoreExt, RecordType,
};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Counts of what a restore call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreStats {
    /// Records inserted or replaced.
    pub upserted: usize,
    /// Records removed.
    pub deleted: usize,
    /// Changes skipped because their payload could not be decoded.
    pub skipped: usize,
    /// Apps created because a restored record referenced them.
    pub apps_created: usize,
}

enum Decoded {
    Upsert(Record),
    Delete(RecordId),
}

/// Applies batches of [`RestoreChange`]s.
pub struct CloudRestoreApplier<'a> {
    store: &'a dyn RecordStore,
}

impl<'a> CloudRestoreApplier<'a> {
    /// Creates an applier writing to `store`.
    pub fn new(store: &'a dyn RecordStore) -> Self {
        Self { store }
    }

    /// Applies `changes` in one transaction.
    ///
    /// `app_info` is the sender's package name to metadata map as produced
    /// by [`crate::CloudBackupManager::app_info_for_backup`]; an empty blob
    /// means no metadata. Every app a restored record belongs to is created
    /// if missing. Changes whose payload cannot be decoded are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if `app_info` cannot be decoded or the transaction
    /// fails, in which case nothing was applied.
    pub fn restore_changes(
        &self,
        changes: &[RestoreChange],
        app_info: &[u8],
    ) -> CloudResult<RestoreStats> {
        let metadata: BTreeMap<String, AppMetadata> = if app_info.is_empty() {
            BTreeMap::new()
        } else {
            from_cbor(app_info)?
        };

        let mut stats = RestoreStats::default();
        let mut decoded = Vec::with_capacity(changes.len());
        for change in changes {
            if change.is_deletion {
                decoded.push(Decoded::Delete(change.record_id));
                continue;
            }
            match decode(change) {
                Ok(record) => decoded.push(Decoded::Upsert(record)),
                Err(e) => {
                    tracing::warn!(record = %change.record_id, error = %e, "skipping undecodable change");
                    stats.skipped += 1;
                }
            }
        }

        let in_batch: HashSet<RecordId> = decoded
            .iter()
            .filter_map(|d| match d {
                Decoded::Upsert(record) => Some(record.id),
                Decoded::Delete(_) => None,
            })
            .collect();
        let packages: BTreeSet<String> = decoded
            .iter()
            .filter_map(|d| match d {
                Decoded::Upsert(record) => Some(record.package_name.clone()),
                Decoded::Delete(_) => None,
            })
            .collect();

        let applied = self.store.write(|txn| {
            let mut applied = RestoreStats::default();
            for package in &packages {
                let app = match metadata.get(package) {
                    Some(AppMetadata {
                        app_name: Some(name),
                    }) => AppInfo::new(package.clone(), name.clone()),
                    _ => AppInfo::placeholder(package.clone()),
                };
                if txn.insert_app_info_if_absent(app)? {
                    applied.apps_created += 1;
                }
            }

            let mut used: BTreeMap<String, BTreeSet<RecordType>> = BTreeMap::new();
            for change in decoded {
                match change {
                    Decoded::Delete(id) => {
                        if txn.delete_record(id)? {
                            applied.deleted += 1;
                        }
                    }
                    Decoded::Upsert(mut record) => {
                        if let Some(planned) = record.planned_exercise_session_id {
                            if !in_batch.contains(&planned) && txn.get_record(planned).is_none() {
                                tracing::debug!(record = %record.id, %planned, "dropping dangling planned session link");
                                record.planned_exercise_session_id = None;
                            }
                        }
                        used.entry(record.package_name.clone())
                            .or_default()
                            .insert(record.record_type);
                        txn.upsert_record(record)?;
                        applied.upserted += 1;
                    }
                }
            }
            for (package, types) in &used {
                txn.add_record_types_used(package, types)?;
            }
            Ok(applied)
        })?;

        stats.upserted = applied.upserted;
        stats.deleted = applied.deleted;
        stats.apps_created = applied.apps_created;
        tracing::info!(
            upserted = stats.upserted,
            deleted = stats.deleted,
            skipped = stats.skipped,
            "restored changes"
        );
        Ok(stats)
    }
}

fn decode(change: &RestoreChange) -> CloudResult<Record> {
    let data = change
        .data
        .as_deref()
        .ok_or_else(|| CloudError::invalid_state("upsert without payload"))?;
    let record: Record = from_cbor(data)?;
    if record.id != change.record_id {
        return Err(CloudError::invalid_state(format!(
            "payload holds record {}",
            record.id
        )));
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::BackupChange;
    use healthsync_core::MemoryRecordStore;

    fn upsert(record: &Record) -> RestoreChange {
        BackupChange::upsert(record, 1).unwrap().into()
    }

    #[test]
    fn dangling_planned_link_is_dropped() {
        let store = MemoryRecordStore::new();
        let missing = Record::new(RecordType::PlannedExerciseSession, "pkg", 0);
        let exercise =
            Record::new(RecordType::ExerciseSession, "pkg", 1).with_planned_session(missing.id);

        CloudRestoreApplier::new(&store)
            .restore_changes(&[upsert(&exercise)], &[])
            .unwrap();

        let restored = store.get_record(exercise.id).unwrap().unwrap();
        assert_eq!(restored.planned_exercise_session_id, None);
    }

    #[test]
    fn planned_link_in_same_batch_is_kept() {
        let store = MemoryRecordStore::new();
        let planned = Record::new(RecordType::PlannedExerciseSession, "pkg", 0);
        let exercise =
            Record::new(RecordType::ExerciseSession, "pkg", 1).with_planned_session(planned.id);

        CloudRestoreApplier::new(&store)
            .restore_changes(&[upsert(&planned), upsert(&exercise)], &[])
            .unwrap();

        let restored = store.get_record(exercise.id).unwrap().unwrap();
        assert_eq!(restored.planned_exercise_session_id, Some(planned.id));
    }

    #[test]
    fn deleting_absent_record_is_a_no_op() {
        let store = MemoryRecordStore::new();
        let stats = CloudRestoreApplier::new(&store)
            .restore_changes(&[BackupChange::deletion(RecordId::new(), 1).into()], &[])
            .unwrap();
        assert_eq!(stats.deleted, 0);
        assert_eq!(stats.upserted, 0);
    }

    #[test]
    fn mismatched_payload_is_skipped() {
        let store = MemoryRecordStore::new();
        let record = Record::new(RecordType::Steps, "pkg", 0);
        let mut change = upsert(&record);
        change.record_id = RecordId::new();

        let stats = CloudRestoreApplier::new(&store)
            .restore_changes(&[change], &[])
            .unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(store.total_records(), 0);
    }
}
