//! Persisted restore state.
//!
//! Every field lives in the key/value state under a stable key and is
//! written as a decimal code. The whole struct is loaded and stored at
//! once, so a reader never sees half of a transition.

use crate::error::{RestoreError, RestoreResult};
use crate::jobs::JobKind;
use healthsync_storage::KeyValueState;
use std::collections::BTreeMap;

/// Key of the download state.
pub const DATA_DOWNLOAD_STATE_KEY: &str = "data_download_state_key";
/// Key of the internal restore state.
pub const DATA_RESTORE_STATE_KEY: &str = "data_restore_state_key";
/// Key of the restore error.
pub const DATA_RESTORE_ERROR_KEY: &str = "data_restore_error_key";

/// Progress of the transport download of remote backup files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataDownloadState {
    /// No download was requested.
    #[default]
    None,
    /// The download is running.
    Started,
    /// The download is being retried.
    Retry,
    /// The download failed.
    Failed,
    /// Every file was downloaded.
    Success,
}

impl DataDownloadState {
    /// Returns the persisted code.
    pub const fn code(self) -> u8 {
        match self {
            DataDownloadState::None => 0,
            DataDownloadState::Started => 1,
            DataDownloadState::Retry => 2,
            DataDownloadState::Failed => 3,
            DataDownloadState::Success => 4,
        }
    }

    /// Parses a persisted code.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => DataDownloadState::None,
            1 => DataDownloadState::Started,
            2 => DataDownloadState::Retry,
            3 => DataDownloadState::Failed,
            4 => DataDownloadState::Success,
            _ => return None,
        })
    }

    /// Returns true while the download can still time out.
    pub fn is_pending(self) -> bool {
        matches!(self, DataDownloadState::Started | DataDownloadState::Retry)
    }
}

/// Internal progress of a device-to-device restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InternalRestoreState {
    /// No restore has started.
    #[default]
    Unknown,
    /// Waiting for the transport to hand over files.
    WaitingForStaging,
    /// Files are being copied into the staging area.
    StagingInProgress,
    /// Staging finished, merge not yet started.
    StagingDone,
    /// The staged data is being merged.
    MergingInProgress,
    /// Legacy alias of [`InternalRestoreState::StagingDone`].
    MergingDoneLegacy,
    /// Terminal state.
    MergingDone,
}

impl InternalRestoreState {
    /// Returns the persisted code.
    pub const fn code(self) -> u8 {
        match self {
            InternalRestoreState::Unknown => 0,
            InternalRestoreState::WaitingForStaging => 1,
            InternalRestoreState::StagingInProgress => 2,
            InternalRestoreState::StagingDone => 3,
            InternalRestoreState::MergingInProgress => 4,
            InternalRestoreState::MergingDoneLegacy => 5,
            InternalRestoreState::MergingDone => 6,
        }
    }

    /// Parses a persisted code.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => InternalRestoreState::Unknown,
            1 => InternalRestoreState::WaitingForStaging,
            2 => InternalRestoreState::StagingInProgress,
            3 => InternalRestoreState::StagingDone,
            4 => InternalRestoreState::MergingInProgress,
            5 => InternalRestoreState::MergingDoneLegacy,
            6 => InternalRestoreState::MergingDone,
            _ => return None,
        })
    }

    /// Returns true if a merge is still required.
    pub fn should_attempt_merging(self) -> bool {
        matches!(
            self,
            InternalRestoreState::StagingDone
                | InternalRestoreState::MergingInProgress
                | InternalRestoreState::MergingDoneLegacy
        )
    }

    /// Returns true while staging can still time out.
    pub fn is_staging_pending(self) -> bool {
        matches!(
            self,
            InternalRestoreState::WaitingForStaging | InternalRestoreState::StagingInProgress
        )
    }
}

/// Why the last restore did not complete cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataRestoreError {
    /// No error.
    #[default]
    None,
    /// The remote files could not be fetched in time.
    FetchingData,
    /// The staged database has a different schema version.
    VersionDiff,
    /// Staging or merging failed or timed out.
    Unknown,
}

impl DataRestoreError {
    /// Returns the persisted code.
    pub const fn code(self) -> u8 {
        match self {
            DataRestoreError::None => 0,
            DataRestoreError::FetchingData => 1,
            DataRestoreError::VersionDiff => 2,
            DataRestoreError::Unknown => 3,
        }
    }

    /// Parses a persisted code.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => DataRestoreError::None,
            1 => DataRestoreError::FetchingData,
            2 => DataRestoreError::VersionDiff,
            3 => DataRestoreError::Unknown,
            _ => return None,
        })
    }
}

/// Restore progress as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRestoreState {
    /// Nothing to do.
    Idle,
    /// A restore was requested and has not reached the merge yet.
    Pending,
    /// The merge is running.
    InProgress,
}

/// Deadline and cancellation marker of one timed phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseRecord {
    /// When the phase times out, as epoch milliseconds.
    pub deadline_millis: Option<i64>,
    /// When the phase's job was last superseded, as epoch milliseconds.
    pub cancelled_at_millis: Option<i64>,
}

impl PhaseRecord {
    /// Clears both fields.
    pub fn clear(&mut self) {
        *self = PhaseRecord::default();
    }
}

/// Every persisted restore field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRestoreState {
    /// Download progress.
    pub download: DataDownloadState,
    /// Internal restore progress.
    pub internal: InternalRestoreState,
    /// Last restore error.
    pub error: DataRestoreError,
    phases: BTreeMap<JobKind, PhaseRecord>,
}

impl Default for PersistedRestoreState {
    fn default() -> Self {
        Self {
            download: DataDownloadState::default(),
            internal: InternalRestoreState::default(),
            error: DataRestoreError::default(),
            phases: JobKind::ALL
                .into_iter()
                .map(|kind| (kind, PhaseRecord::default()))
                .collect(),
        }
    }
}

impl PersistedRestoreState {
    /// Loads the state. Missing or empty keys take their default.
    ///
    /// # Errors
    ///
    /// Returns `CorruptState` if a value cannot be parsed.
    pub fn load(state: &dyn KeyValueState) -> RestoreResult<Self> {
        let entries = state.snapshot()?;

        let mut phases = BTreeMap::new();
        for kind in JobKind::ALL {
            phases.insert(
                kind,
                PhaseRecord {
                    deadline_millis: parse_millis(&entries, kind.deadline_key())?,
                    cancelled_at_millis: parse_millis(&entries, kind.cancelled_key())?,
                },
            );
        }

        Ok(Self {
            download: parse_code(&entries, DATA_DOWNLOAD_STATE_KEY, DataDownloadState::from_code)?,
            internal: parse_code(&entries, DATA_RESTORE_STATE_KEY, InternalRestoreState::from_code)?,
            error: parse_code(&entries, DATA_RESTORE_ERROR_KEY, DataRestoreError::from_code)?,
            phases,
        })
    }

    /// Writes every field in one batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch cannot be written.
    pub fn persist(&self, state: &dyn KeyValueState) -> RestoreResult<()> {
        let entries = self.entries();
        let batch: Vec<(&str, &str)> = entries.iter().map(|(k, v)| (*k, v.as_str())).collect();
        state.write_batch(&batch)?;
        Ok(())
    }

    /// Returns every key with its encoded value.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        let mut entries = vec![
            (DATA_DOWNLOAD_STATE_KEY, self.download.code().to_string()),
            (DATA_RESTORE_STATE_KEY, self.internal.code().to_string()),
            (DATA_RESTORE_ERROR_KEY, self.error.code().to_string()),
        ];
        for kind in JobKind::ALL {
            let phase = self.phase(kind);
            entries.push((kind.deadline_key(), encode_millis(phase.deadline_millis)));
            entries.push((kind.cancelled_key(), encode_millis(phase.cancelled_at_millis)));
        }
        entries
    }

    /// Returns the record of one phase.
    pub fn phase(&self, kind: JobKind) -> PhaseRecord {
        self.phases.get(&kind).copied().unwrap_or_default()
    }

    /// Returns the record of one phase for update.
    pub fn phase_mut(&mut self, kind: JobKind) -> &mut PhaseRecord {
        self.phases.entry(kind).or_default()
    }

    /// Maps the internal fields to the caller-visible restore state.
    pub fn data_restore_state(&self) -> DataRestoreState {
        match self.internal {
            InternalRestoreState::MergingDone => DataRestoreState::Idle,
            InternalRestoreState::MergingInProgress => DataRestoreState::InProgress,
            InternalRestoreState::Unknown if self.download.is_pending() => {
                DataRestoreState::Pending
            }
            InternalRestoreState::Unknown => DataRestoreState::Idle,
            _ => DataRestoreState::Pending,
        }
    }
}

fn parse_code<T: Default>(
    entries: &BTreeMap<String, String>,
    key: &'static str,
    from_code: fn(u8) -> Option<T>,
) -> RestoreResult<T> {
    match entries.get(key).map(String::as_str) {
        None | Some("") => Ok(T::default()),
        Some(raw) => raw
            .parse::<u8>()
            .ok()
            .and_then(from_code)
            .ok_or_else(|| RestoreError::corrupt_state(key, raw)),
    }
}

fn parse_millis(entries: &BTreeMap<String, String>, key: &'static str) -> RestoreResult<Option<i64>> {
    match entries.get(key).map(String::as_str) {
        None | Some("") => Ok(None),
        Some(raw) => raw
            .parse::<i64>()
            .map(Some)
            .map_err(|_| RestoreError::corrupt_state(key, raw)),
    }
}

fn encode_millis(millis: Option<i64>) -> String {
    millis.map(|m| m.to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use healthsync_storage::InMemoryKeyValueState;

    #[test]
    fn missing_keys_load_as_defaults() {
        let kv = InMemoryKeyValueState::new();
        let state = PersistedRestoreState::load(&kv).unwrap();
        assert_eq!(state, PersistedRestoreState::default());
        assert_eq!(state.data_restore_state(), DataRestoreState::Idle);
    }

    #[test]
    fn persist_then_load() {
        let kv = InMemoryKeyValueState::new();
        let mut state = PersistedRestoreState {
            download: DataDownloadState::Success,
            internal: InternalRestoreState::StagingInProgress,
            error: DataRestoreError::None,
            ..Default::default()
        };
        state.phase_mut(JobKind::StagingTimeout).deadline_millis = Some(1_234);
        state.persist(&kv).unwrap();

        assert_eq!(kv.batches_written(), 1);
        assert_eq!(kv.get(DATA_RESTORE_STATE_KEY).unwrap().as_deref(), Some("2"));
        assert_eq!(kv.get("data_staging_timeout_key").unwrap().as_deref(), Some("1234"));
        assert_eq!(kv.get("data_merging_retry_key").unwrap().as_deref(), Some(""));
        assert_eq!(PersistedRestoreState::load(&kv).unwrap(), state);
    }

    #[test]
    fn garbage_is_corrupt_state() {
        let kv = InMemoryKeyValueState::with_entries([(DATA_RESTORE_STATE_KEY, "9")]);
        let err = PersistedRestoreState::load(&kv).unwrap_err();
        assert!(matches!(
            err,
            RestoreError::CorruptState { key: DATA_RESTORE_STATE_KEY, .. }
        ));

        let kv = InMemoryKeyValueState::with_entries([("data_download_timeout_key", "soon")]);
        assert!(PersistedRestoreState::load(&kv).is_err());
    }

    #[test]
    fn restore_state_mapping() {
        let mut state = PersistedRestoreState::default();
        state.download = DataDownloadState::Started;
        assert_eq!(state.data_restore_state(), DataRestoreState::Pending);

        state.download = DataDownloadState::Failed;
        assert_eq!(state.data_restore_state(), DataRestoreState::Idle);

        state.internal = InternalRestoreState::MergingDoneLegacy;
        assert_eq!(state.data_restore_state(), DataRestoreState::Pending);

        state.internal = InternalRestoreState::MergingInProgress;
        assert_eq!(state.data_restore_state(), DataRestoreState::InProgress);

        state.internal = InternalRestoreState::MergingDone;
        assert_eq!(state.data_restore_state(), DataRestoreState::Idle);
    }

    #[test]
    fn legacy_done_still_merges() {
        assert!(InternalRestoreState::MergingDoneLegacy.should_attempt_merging());
        assert!(InternalRestoreState::MergingInProgress.should_attempt_merging());
        assert!(!InternalRestoreState::MergingDone.should_attempt_merging());
        assert!(!InternalRestoreState::WaitingForStaging.should_attempt_merging());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(InternalRestoreState::MergingDone.code(), 6);
        assert_eq!(InternalRestoreState::MergingDoneLegacy.code(), 5);
        assert_eq!(DataDownloadState::Success.code(), 4);
        assert_eq!(DataRestoreError::VersionDiff.code(), 2);
        for code in 0..=6 {
            assert_eq!(InternalRestoreState::from_code(code).unwrap().code(), code);
        }
    }
}
