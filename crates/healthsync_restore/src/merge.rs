//! Merges a staged database into the live store.
//!
//! Every step is additive: a staged row is inserted only if the live store
//! has nothing with the same unique key, and nothing live is ever
//! overwritten except the grant-time blob. Running a merge a second time
//! over the same staged data therefore changes nothing.

use crate::config::MergeConfig;
use crate::error::{RestoreError, RestoreResult};
use healthsync_core::{
    CoreError, GrantTimeState, GrantTimeStore, HealthDataCategory, PageToken, RecordStore,
    RecordStoreExt, RecordType,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use uuid::Uuid;

/// Counts of what a merge added and skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Whether a staged grant-time blob replaced the live one.
    pub grant_times_applied: bool,
    /// App info rows added.
    pub apps_added: usize,
    /// Data sources added.
    pub data_sources_added: usize,
    /// Data sources already present live.
    pub data_sources_skipped: usize,
    /// Medical resources added.
    pub resources_added: usize,
    /// Medical resources already present live.
    pub resources_skipped: usize,
    /// Records added, per type.
    pub records_added: BTreeMap<RecordType, usize>,
    /// Records already present live.
    pub records_skipped: usize,
    /// Categories whose priority list changed.
    pub priority_lists_updated: usize,
}

impl MergeStats {
    /// Returns the total number of records added.
    pub fn total_records_added(&self) -> usize {
        self.records_added.values().sum()
    }
}

/// What a merge reads and writes.
pub struct MergeInput<'a> {
    /// Staged database, if one was staged.
    pub staged: Option<&'a dyn RecordStore>,
    /// The live store.
    pub live: &'a dyn RecordStore,
    /// Staged grant-time blob, if one was staged.
    pub grant_times: Option<GrantTimeState>,
    /// Owner of the live grant-time blob.
    pub grant_time_store: &'a dyn GrantTimeStore,
}

/// Copies staged rows into the live store with deduplication.
#[derive(Debug, Clone, Default)]
pub struct MergeEngine {
    config: MergeConfig,
}

impl MergeEngine {
    /// Creates an engine.
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Runs a full merge.
    ///
    /// The schema versions are compared before anything is written; a
    /// mismatch leaves both the live store and the grant times untouched.
    ///
    /// # Errors
    ///
    /// Returns `VersionMismatch` if the schema versions differ, or the
    /// first error of any step. Each step commits on its own, so an error
    /// leaves earlier steps applied and the failing table untouched.
    pub fn merge(&self, input: MergeInput<'_>) -> RestoreResult<MergeStats> {
        let mut stats = MergeStats::default();

        if let Some(staged) = input.staged {
            check_versions(staged, input.live)?;
        }

        if let Some(grant_times) = input.grant_times {
            input.grant_time_store.apply(grant_times)?;
            stats.grant_times_applied = true;
            tracing::debug!("merged grant times");
        }

        let Some(staged) = input.staged else {
            tracing::info!("no staged database, merged grant times only");
            return Ok(stats);
        };

        self.merge_app_infos(staged, input.live, &mut stats)?;
        if self.config.merge_phr {
            self.merge_medical_records(staged, input.live, &mut stats)?;
        } else {
            tracing::debug!("skipping personal health records");
        }
        for record_type in RecordType::backup_order() {
            self.merge_record_table(*record_type, staged, input.live, &mut stats)?;
        }
        self.merge_priority_lists(staged, input.live, &mut stats)?;

        tracing::info!(
            records_added = stats.total_records_added(),
            records_skipped = stats.records_skipped,
            resources_added = stats.resources_added,
            "merge finished"
        );
        Ok(stats)
    }

    fn merge_app_infos(
        &self,
        staged: &dyn RecordStore,
        live: &dyn RecordStore,
        stats: &mut MergeStats,
    ) -> RestoreResult<()> {
        let apps = staged.app_infos()?;
        stats.apps_added += live.write(|txn| {
            let mut added = 0usize;
            for app in apps {
                if txn.insert_app_info_if_absent(app)? {
                    added += 1;
                }
            }
            Ok(added)
        })?;
        Ok(())
    }

    fn merge_medical_records(
        &self,
        staged: &dyn RecordStore,
        live: &dyn RecordStore,
        stats: &mut MergeStats,
    ) -> RestoreResult<()> {
        let sources = staged.medical_data_sources()?;
        let page_size = self.config.page_size.max(1);

        let (sources_added, sources_skipped, resources_added, resources_skipped): (
            usize,
            usize,
            usize,
            usize,
        ) = live.write(|txn| {
            let mut ids: HashMap<Uuid, Uuid> = HashMap::new();
            let (mut sources_added, mut sources_skipped) = (0, 0);
            for source in sources {
                let staged_id = source.id;
                let (live_id, inserted) = txn.insert_data_source_if_absent(source)?;
                ids.insert(staged_id, live_id);
                if inserted {
                    sources_added += 1;
                } else {
                    sources_skipped += 1;
                }
            }

            let (mut resources_added, mut resources_skipped) = (0, 0);
            let mut offset = 0;
            loop {
                let page = staged.read_medical_resources(offset, page_size)?;
                if page.is_empty() {
                    break;
                }
                offset += page.len();
                for mut resource in page {
                    resource.data_source_id =
                        ids.get(&resource.data_source_id).copied().ok_or_else(|| {
                            CoreError::invalid_state(format!(
                                "no data source for staged resource {}",
                                resource.fhir_resource_id
                            ))
                        })?;
                    if txn.insert_medical_resource_if_absent(resource)? {
                        resources_added += 1;
                    } else {
                        resources_skipped += 1;
                    }
                }
            }
            Ok((sources_added, sources_skipped, resources_added, resources_skipped))
        })?;

        stats.data_sources_added += sources_added;
        stats.data_sources_skipped += sources_skipped;
        stats.resources_added += resources_added;
        stats.resources_skipped += resources_skipped;
        tracing::debug!(sources_added, resources_added, "merged personal health records");
        Ok(())
    }

    fn merge_record_table(
        &self,
        record_type: RecordType,
        staged: &dyn RecordStore,
        live: &dyn RecordStore,
        stats: &mut MergeStats,
    ) -> RestoreResult<()> {
        let page_size = self.config.page_size.max(1);

        let (added, skipped): (usize, usize) = live.write(|txn| {
            let mut used: HashMap<String, BTreeSet<RecordType>> = HashMap::new();
            let (mut added, mut skipped) = (0, 0);
            let mut token = PageToken::EMPTY;
            loop {
                let page = staged.read_page(record_type, token, page_size)?;
                for mut record in page.records {
                    if record_type == RecordType::PlannedExerciseSession {
                        record.completed_exercise_session_id = None;
                    }
                    let package = record.package_name.clone();
                    if txn.insert_record_if_absent(record)? {
                        added += 1;
                        used.entry(package).or_default().insert(record_type);
                    } else {
                        skipped += 1;
                    }
                }
                if page.next_page_token.is_empty() {
                    break;
                }
                token = page.next_page_token;
            }
            for (package, types) in &used {
                txn.add_record_types_used(package, types)?;
            }
            Ok((added, skipped))
        })?;

        if added > 0 {
            stats.records_added.insert(record_type, added);
        }
        stats.records_skipped += skipped;
        tracing::debug!(%record_type, added, skipped, "merged record table");
        Ok(())
    }

    fn merge_priority_lists(
        &self,
        staged: &dyn RecordStore,
        live: &dyn RecordStore,
        stats: &mut MergeStats,
    ) -> RestoreResult<()> {
        let imported = staged.priority_lists()?;
        let current = live.priority_lists()?;

        let mut updates: Vec<(HealthDataCategory, Vec<String>)> = Vec::new();
        for (category, packages) in imported {
            let existing = current.get(&category).cloned().unwrap_or_default();
            let merged = distinct_concat(&existing, &packages);
            if merged != existing {
                updates.push((category, merged));
            }
        }
        if updates.is_empty() {
            return Ok(());
        }

        stats.priority_lists_updated += updates.len();
        live.write(|txn| {
            for (category, packages) in updates {
                txn.set_priority_list(category, packages)?;
            }
            Ok(())
        })?;
        Ok(())
    }
}

/// Fails with `VersionMismatch` unless both stores share a schema version.
///
/// # Errors
///
/// Returns `VersionMismatch` on any difference.
pub fn check_versions(staged: &dyn RecordStore, live: &dyn RecordStore) -> RestoreResult<()> {
    let (staged, live) = (staged.schema_version(), live.schema_version());
    if staged != live {
        return Err(RestoreError::VersionMismatch { staged, live });
    }
    Ok(())
}

/// `current` followed by the new entries of `imported`, first occurrence wins.
fn distinct_concat(current: &[String], imported: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    current
        .iter()
        .chain(imported)
        .filter(|p| seen.insert(p.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_concat_keeps_first_occurrence() {
        let current = vec!["a".to_string(), "b".to_string()];
        let imported = vec!["c".to_string(), "a".to_string(), "c".to_string()];
        assert_eq!(distinct_concat(&current, &imported), vec!["a", "b", "c"]);
        assert_eq!(distinct_concat(&[], &imported), vec!["c", "a"]);
    }
}
