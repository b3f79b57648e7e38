//! Device-to-device restore state machine.
//!
//! The persisted [`PersistedRestoreState`] is the only source of truth.
//! Timeout jobs are derived from it: every transition persists the new
//! state first and then schedules or cancels jobs to match, and
//! [`RestoreStateMachine::schedule_all_jobs`] re-derives every job after a
//! restart. A crash between the two steps is therefore harmless.
//!
//! All transitions run under the states lock, so a job firing while an
//! API call transitions the machine cannot interleave partial writes.

use crate::config::RestoreConfig;
use crate::error::{RestoreError, RestoreResult};
use crate::gate::DataSyncGate;
use crate::jobs::{JobKind, JOB_NAMESPACE};
use crate::merge::{MergeEngine, MergeInput, MergeStats};
use crate::staging::{backup_file_names, write_grant_times, StagingArea, STAGED_DATABASE_NAME};
use crate::state::{
    DataDownloadState, DataRestoreError, DataRestoreState, InternalRestoreState,
    PersistedRestoreState,
};
use healthsync_core::{
    duration_millis, Clock, GrantTimeStore, JobHandler, JobRequest, JobScheduler, RecordStore,
    TaskExecutor,
};
use healthsync_storage::KeyValueState;
use parking_lot::{RwLock, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Result of a call to [`RestoreStateMachine::merge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Nothing to merge, or a merge is already running.
    Skipped,
    /// A migration is running; a retry job was armed.
    RetryScheduled,
    /// The staged data was merged.
    Merged(MergeStats),
    /// The staged database has another schema version; nothing was copied.
    VersionMismatch,
    /// The merge failed and the restore was completed with an error.
    Failed,
}

/// Result of [`RestoreStateMachine::stage_all_remote_data`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingReport {
    /// Files copied into the staging area.
    pub staged: Vec<String>,
    /// Files that could not be staged, with the reason.
    pub failures: BTreeMap<String, String>,
    /// What the merge that followed staging did.
    pub merge: MergeOutcome,
}

impl StagingReport {
    fn skipped() -> Self {
        Self {
            staged: Vec::new(),
            failures: BTreeMap::new(),
            merge: MergeOutcome::Skipped,
        }
    }
}

/// Collaborators of the state machine.
#[derive(Clone)]
pub struct RestoreServices {
    /// Where restore state is persisted.
    pub key_value: Arc<dyn KeyValueState>,
    /// The live record store.
    pub store: Arc<dyn RecordStore>,
    /// The live grant-time blob.
    pub grant_times: Arc<dyn GrantTimeStore>,
    /// Runs timeout and retry jobs.
    pub scheduler: Arc<dyn JobScheduler>,
    /// Runs merges dispatched on resume.
    pub executor: Arc<dyn TaskExecutor>,
    /// Wall clock for deadlines.
    pub clock: Arc<dyn Clock>,
    /// Process-wide sync gate.
    pub gate: Arc<DataSyncGate>,
}

enum JobOp {
    Schedule(JobRequest),
    Cancel(JobKind),
}

#[derive(Default)]
struct PendingJobOps(Vec<JobOp>);

impl PendingJobOps {
    fn mentions(&self, kind: JobKind) -> bool {
        self.0.iter().any(|op| match op {
            JobOp::Schedule(request) => request.name == kind.job_name(),
            JobOp::Cancel(k) => *k == kind,
        })
    }
}

/// Clears the running flag of a merge when released or dropped.
struct MergeRunning<'a>(Option<&'a AtomicBool>);

impl MergeRunning<'_> {
    fn release(&mut self) {
        if let Some(flag) = self.0.take() {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

impl Drop for MergeRunning<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Drives a restore through download, staging and merge.
pub struct RestoreStateMachine {
    config: RestoreConfig,
    services: RestoreServices,
    staging: StagingArea,
    engine: MergeEngine,
    states: RwLock<()>,
    merge_running: AtomicBool,
}

impl RestoreStateMachine {
    /// Creates a state machine staging files under `staging_dir`.
    ///
    /// The gate is initialized from the persisted state.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted state cannot be read.
    pub fn new(
        config: RestoreConfig,
        services: RestoreServices,
        staging_dir: impl Into<PathBuf>,
    ) -> RestoreResult<Self> {
        let machine = Self {
            engine: MergeEngine::new(config.merge.clone()),
            config,
            services,
            staging: StagingArea::new(staging_dir),
            states: RwLock::new(()),
            merge_running: AtomicBool::new(false),
        };
        let state = machine.load_state()?;
        machine.sync_gate(&state);
        tracing::debug!(
            internal = ?state.internal,
            download = ?state.download,
            "restore state machine created"
        );
        Ok(machine)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RestoreConfig {
        &self.config
    }

    /// Returns the sync gate.
    pub fn gate(&self) -> &Arc<DataSyncGate> {
        &self.services.gate
    }

    /// Returns the staging area.
    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Returns a copy of the persisted state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read.
    pub fn persisted_state(&self) -> RestoreResult<PersistedRestoreState> {
        let _guard = self.states.read();
        self.load_state()
    }

    /// Returns the restore state as reported to callers.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read.
    pub fn get_data_restore_state(&self) -> RestoreResult<DataRestoreState> {
        Ok(self.persisted_state()?.data_restore_state())
    }

    /// Returns the last restore error.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read.
    pub fn get_data_restore_error(&self) -> RestoreResult<DataRestoreError> {
        Ok(self.persisted_state()?.error)
    }

    /// Returns the internal restore state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read.
    pub fn get_internal_restore_state(&self) -> RestoreResult<InternalRestoreState> {
        Ok(self.persisted_state()?.internal)
    }

    /// Returns the download state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read.
    pub fn get_data_download_state(&self) -> RestoreResult<DataDownloadState> {
        Ok(self.persisted_state()?.download)
    }

    /// Returns true while the staged data is being merged.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read.
    pub fn is_restore_merging_in_progress(&self) -> RestoreResult<bool> {
        Ok(self.get_internal_restore_state()? == InternalRestoreState::MergingInProgress)
    }

    /// Runs `f` while holding the states lock shared.
    pub fn run_with_states_read_lock<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.states.read();
        f()
    }

    /// Moves to `state` and re-derives the timeout jobs.
    ///
    /// Does nothing if `state` is already current, unless `force` is set,
    /// in which case every applicable job is armed again.
    ///
    /// Returns true if anything was written.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or persisted.
    pub fn set_internal_restore_state(
        &self,
        state: InternalRestoreState,
        force: bool,
    ) -> RestoreResult<bool> {
        self.transition(force, |s| s.internal = state)
    }

    /// Records download progress. A failed download also records
    /// [`DataRestoreError::FetchingData`].
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or persisted.
    pub fn update_data_download_state(&self, state: DataDownloadState) -> RestoreResult<bool> {
        self.transition(false, |s| {
            s.download = state;
            if state == DataDownloadState::Failed {
                s.error = DataRestoreError::FetchingData;
            }
        })
    }

    /// Re-derives every job from the persisted state, typically on start.
    ///
    /// Jobs for phases that no longer apply are cancelled. If a merge is
    /// still required it is dispatched onto the executor.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or persisted.
    pub fn schedule_all_jobs(self: &Arc<Self>) -> RestoreResult<()> {
        let should_merge = {
            let _guard = self.states.write();
            let before = self.load_state()?;
            let mut after = before.clone();
            let now = self.services.clock.now_millis();

            let mut ops = self.plan_jobs(None, &mut after, true, now);
            for kind in JobKind::ALL {
                if !ops.mentions(kind) && !applies(kind, &after) {
                    ops.0.push(JobOp::Cancel(kind));
                }
            }

            if after != before {
                after.persist(&*self.services.key_value)?;
            }
            self.sync_gate(&after);
            self.apply_job_ops(ops);
            tracing::info!(
                internal = ?after.internal,
                download = ?after.download,
                "restore jobs re-derived"
            );
            after.internal.should_attempt_merging()
        };

        if should_merge {
            let machine = Arc::clone(self);
            self.services.executor.execute(Box::new(move || {
                if let Err(e) = machine.merge() {
                    tracing::error!(error = %e, "resumed merge failed");
                }
            }));
        }
        Ok(())
    }

    /// Handles a fired job.
    ///
    /// Each handler first clears its phase's deadline and marker, then acts
    /// only if the phase is still pending. A merging timeout that fires while
    /// a merge is copying rows is armed again instead. Unknown names are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or persisted.
    pub fn handle_job(&self, job_name: &str) -> RestoreResult<()> {
        let Some(kind) = JobKind::from_job_name(job_name) else {
            tracing::warn!(job = job_name, "unknown restore job ignored");
            return Ok(());
        };
        tracing::info!(job = job_name, "restore job fired");

        match kind {
            JobKind::DownloadTimeout => {
                let mut failed = false;
                self.transition(false, |s| {
                    s.phase_mut(kind).clear();
                    if s.download.is_pending() {
                        s.download = DataDownloadState::Failed;
                        s.error = DataRestoreError::FetchingData;
                        failed = true;
                    }
                })?;
                if failed {
                    tracing::warn!("download timed out, restore failed");
                }
            }
            JobKind::StagingTimeout | JobKind::MergingTimeout => {
                let (mut forced, mut deferred) = (false, false);
                self.transition(false, |s| {
                    // Clearing the deadline lets the transition arm a fresh
                    // one while the phase still applies.
                    s.phase_mut(kind).clear();
                    let pending = match kind {
                        JobKind::StagingTimeout => s.internal.is_staging_pending(),
                        _ => s.internal == InternalRestoreState::MergingInProgress,
                    };
                    if pending && kind == JobKind::MergingTimeout && self.is_merge_running() {
                        deferred = true;
                    } else if pending {
                        s.internal = InternalRestoreState::MergingDone;
                        s.error = DataRestoreError::Unknown;
                        forced = true;
                    }
                })?;
                if deferred {
                    tracing::warn!(job = job_name, "merge still running, timeout armed again");
                } else if forced {
                    tracing::warn!(job = job_name, "restore phase timed out, forcing completion");
                    self.delete_staged_data();
                }
            }
            JobKind::MergingRetry => {
                self.transition(false, |s| s.phase_mut(kind).clear())?;
                self.merge()?;
            }
        }
        Ok(())
    }

    /// Merges the staged data into the live store if a merge is required.
    ///
    /// While a migration is running the merge is deferred by arming the
    /// retry job. Merge failures end the restore with an error code and
    /// are not returned; only failures to persist state are.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or persisted.
    pub fn merge(&self) -> RestoreResult<MergeOutcome> {
        if self.merge_running.swap(true, Ordering::SeqCst) {
            tracing::debug!("merge already running");
            return Ok(MergeOutcome::Skipped);
        }
        let mut running = MergeRunning(Some(&self.merge_running));

        {
            let guard = self.states.write();
            let state = self.load_state()?;
            if !state.internal.should_attempt_merging() {
                tracing::debug!(internal = ?state.internal, "nothing to merge");
                return Ok(MergeOutcome::Skipped);
            }

            if self.services.gate.is_migration_in_progress() {
                running.release();
                // An overdue retry deadline, e.g. one that passed while the
                // process was down, also gets a full delay: this attempt
                // counts as the retry.
                let retry_at = self
                    .services
                    .clock
                    .now_millis()
                    .saturating_add(duration_millis(self.config.merging_retry_delay));
                self.transition_locked(&guard, true, |s| {
                    let retry = s.phase_mut(JobKind::MergingRetry);
                    retry.deadline_millis = Some(retry_at);
                    retry.cancelled_at_millis = None;
                })?;
                tracing::info!(
                    retry_in_ms = duration_millis(self.config.merging_retry_delay),
                    "migration in progress, merge deferred"
                );
                return Ok(MergeOutcome::RetryScheduled);
            }

            self.transition_locked(&guard, false, |s| {
                s.internal = InternalRestoreState::MergingInProgress;
            })?;
        }

        let (error, outcome) = match self.merge_staged() {
            Ok(stats) => (DataRestoreError::None, MergeOutcome::Merged(stats)),
            Err(RestoreError::VersionMismatch { staged, live }) => {
                tracing::warn!(staged, live, "staged database schema differs, nothing merged");
                (DataRestoreError::VersionDiff, MergeOutcome::VersionMismatch)
            }
            Err(e) => {
                tracing::error!(error = %e, "merge failed");
                (DataRestoreError::Unknown, MergeOutcome::Failed)
            }
        };

        let completed = {
            let guard = self.states.write();
            running.release();
            let completed = self.transition_locked(&guard, false, |s| {
                if s.internal == InternalRestoreState::MergingInProgress {
                    s.internal = InternalRestoreState::MergingDone;
                    s.error = error;
                }
            })?;
            if !completed {
                self.sync_gate(&self.load_state()?);
            }
            completed
        };
        if completed {
            self.delete_staged_data();
        } else {
            tracing::warn!(?outcome, "restore state changed during merge, result not recorded");
        }
        Ok(outcome)
    }

    /// Starts staging if no restore has started yet.
    ///
    /// Returns false if a restore was already under way.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or persisted.
    pub fn prep_for_staging_if_not_already_done(&self) -> RestoreResult<bool> {
        let guard = self.states.write();
        if self.load_state()?.internal != InternalRestoreState::Unknown {
            return Ok(false);
        }
        self.delete_staged_data();
        self.transition_locked(&guard, false, |s| {
            s.download = DataDownloadState::Success;
            s.internal = InternalRestoreState::WaitingForStaging;
        })?;
        Ok(true)
    }

    /// Copies downloaded backup files into the staging area and merges them.
    ///
    /// `files` maps backup file names to where the transport put them.
    /// Files that fail to stage are reported without stopping the rest.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or persisted.
    pub fn stage_all_remote_data(
        &self,
        files: &BTreeMap<String, PathBuf>,
    ) -> RestoreResult<StagingReport> {
        self.prep_for_staging_if_not_already_done()?;

        let internal = self.get_internal_restore_state()?;
        if internal != InternalRestoreState::WaitingForStaging {
            tracing::info!(internal = ?internal, "not waiting for staging, files ignored");
            return Ok(StagingReport::skipped());
        }

        self.set_internal_restore_state(InternalRestoreState::StagingInProgress, false)?;
        let mut staged = Vec::new();
        let mut failures = BTreeMap::new();
        for (name, source) in files {
            match self.staging.stage_file(name, source) {
                Ok(()) => staged.push(name.clone()),
                Err(e) => {
                    tracing::warn!(file = %name, error = %e, "failed to stage file");
                    failures.insert(name.clone(), e.to_string());
                }
            }
        }
        self.set_internal_restore_state(InternalRestoreState::StagingDone, false)?;
        tracing::info!(staged = staged.len(), failed = failures.len(), "staging done");

        let merge = self.merge()?;
        Ok(StagingReport {
            staged,
            failures,
            merge,
        })
    }

    /// Returns the names of the files making up a backup.
    pub fn get_all_backup_file_names(&self, for_device_transfer: bool) -> Vec<&'static str> {
        backup_file_names(for_device_transfer)
    }

    /// Returns the names of the files currently staged.
    pub fn get_staged_remote_file_names(&self) -> Vec<String> {
        self.staging.staged_file_names()
    }

    /// Writes the files of a backup into `target_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be written.
    pub fn write_backup_data(
        &self,
        target_dir: &Path,
        for_device_transfer: bool,
    ) -> RestoreResult<Vec<&'static str>> {
        if for_device_transfer {
            self.services
                .store
                .export_snapshot(&target_dir.join(STAGED_DATABASE_NAME))?;
        }
        write_grant_times(target_dir, &self.services.grant_times.current()?)?;
        tracing::info!(dir = %target_dir.display(), for_device_transfer, "backup data written");
        Ok(backup_file_names(for_device_transfer))
    }

    /// Cancels every restore job. Persisted state is left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler fails.
    pub fn cancel_all_jobs(&self) -> RestoreResult<()> {
        self.services.scheduler.cancel_all(JOB_NAMESPACE)?;
        Ok(())
    }

    /// Cancels all jobs, resets every persisted field and deletes staged data.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be reset.
    pub fn delete_and_reset_everything(&self) -> RestoreResult<()> {
        let _guard = self.states.write();
        self.cancel_all_jobs()?;
        let state = PersistedRestoreState::default();
        state.persist(&*self.services.key_value)?;
        self.staging.clear()?;
        self.sync_gate(&state);
        tracing::info!("restore state reset");
        Ok(())
    }

    /// Marks a data migration as started.
    ///
    /// # Errors
    ///
    /// Returns `MergeInProgress` while a restore merge is running.
    pub fn try_start_migration(&self) -> RestoreResult<()> {
        let _guard = self.states.read();
        if self.services.gate.is_restore_merging()
            || self.load_state()?.internal == InternalRestoreState::MergingInProgress
        {
            return Err(RestoreError::MergeInProgress);
        }
        self.services.gate.set_migration_in_progress(true);
        tracing::debug!("migration started");
        Ok(())
    }

    /// Marks a data migration as finished.
    pub fn finish_migration(&self) {
        self.services.gate.set_migration_in_progress(false);
        tracing::debug!("migration finished");
    }

    fn load_state(&self) -> RestoreResult<PersistedRestoreState> {
        PersistedRestoreState::load(&*self.services.key_value)
    }

    fn transition(
        &self,
        force: bool,
        mutate: impl FnOnce(&mut PersistedRestoreState),
    ) -> RestoreResult<bool> {
        let guard = self.states.write();
        self.transition_locked(&guard, force, mutate)
    }

    fn transition_locked(
        &self,
        _guard: &RwLockWriteGuard<'_, ()>,
        force: bool,
        mutate: impl FnOnce(&mut PersistedRestoreState),
    ) -> RestoreResult<bool> {
        let before = self.load_state()?;
        let mut after = before.clone();
        mutate(&mut after);
        if after == before && !force {
            return Ok(false);
        }

        let now = self.services.clock.now_millis();
        let ops = self.plan_jobs(Some(&before), &mut after, force, now);
        after.persist(&*self.services.key_value)?;
        self.sync_gate(&after);

        if before.internal != after.internal {
            tracing::info!(from = ?before.internal, to = ?after.internal, "restore state changed");
        }
        if before.download != after.download {
            tracing::info!(from = ?before.download, to = ?after.download, "download state changed");
        }
        self.apply_job_ops(ops);
        Ok(true)
    }

    /// Arms jobs for phases that apply to `after` and cancels the rest,
    /// updating deadlines and markers in `after`.
    fn plan_jobs(
        &self,
        before: Option<&PersistedRestoreState>,
        after: &mut PersistedRestoreState,
        rearm: bool,
        now: i64,
    ) -> PendingJobOps {
        let mut ops = PendingJobOps::default();
        let internal_changed = before.is_some_and(|b| b.internal != after.internal);

        for kind in JobKind::ALL {
            let retry_superseded = kind == JobKind::MergingRetry
                && internal_changed
                && matches!(
                    after.internal,
                    InternalRestoreState::MergingInProgress | InternalRestoreState::MergingDone
                );
            let applied_before = before.is_some_and(|b| applies(kind, b));

            if applies(kind, after) && !retry_superseded {
                if rearm || !applied_before || after.phase(kind).deadline_millis.is_none() {
                    ops.0.push(JobOp::Schedule(self.arm(kind, after, now)));
                }
            } else if after.phase(kind).deadline_millis.is_some() {
                let phase = after.phase_mut(kind);
                phase.deadline_millis = None;
                phase.cancelled_at_millis = Some(now);
                ops.0.push(JobOp::Cancel(kind));
            }
        }
        ops
    }

    /// Builds the job for `kind`, persisting a fresh deadline if none is set.
    fn arm(&self, kind: JobKind, state: &mut PersistedRestoreState, now: i64) -> JobRequest {
        let interval = self.interval(kind);
        let window = self.config.minimum_latency_window;
        let phase = state.phase_mut(kind);

        let (min_latency, max_delay) = match phase.deadline_millis {
            None => {
                phase.deadline_millis = Some(now.saturating_add(duration_millis(interval)));
                (interval, interval + window)
            }
            Some(deadline) if deadline <= now => (Duration::ZERO, window),
            Some(deadline) => {
                let remaining = Duration::from_millis(u64::try_from(deadline - now).unwrap_or(0));
                (remaining, remaining + window)
            }
        };
        phase.cancelled_at_millis = None;

        JobRequest::new(JOB_NAMESPACE, kind.job_name(), min_latency, max_delay)
    }

    fn interval(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::DownloadTimeout => self.config.download_timeout,
            JobKind::StagingTimeout => self.config.staging_timeout,
            JobKind::MergingTimeout => self.config.merging_timeout,
            JobKind::MergingRetry => self.config.merging_retry_delay,
        }
    }

    fn apply_job_ops(&self, ops: PendingJobOps) {
        for op in ops.0 {
            match op {
                JobOp::Schedule(request) => {
                    let name = request.name.clone();
                    let min_latency_ms = duration_millis(request.min_latency);
                    match self.services.scheduler.schedule(request) {
                        Ok(()) => {
                            tracing::debug!(job = %name, min_latency_ms, "restore job scheduled");
                        }
                        Err(e) => {
                            tracing::error!(job = %name, error = %e, "failed to schedule restore job");
                        }
                    }
                }
                JobOp::Cancel(kind) => {
                    let name = kind.job_name();
                    match self.services.scheduler.cancel(JOB_NAMESPACE, name) {
                        Ok(()) => tracing::debug!(job = name, "restore job cancelled"),
                        Err(e) => {
                            tracing::error!(job = name, error = %e, "failed to cancel restore job");
                        }
                    }
                }
            }
        }
    }

    fn merge_staged(&self) -> RestoreResult<MergeStats> {
        let grant_times = self.staging.read_grant_times()?;
        let staged = self.staging.open_staged_database()?;
        self.engine.merge(MergeInput {
            staged: staged.as_ref().map(|s| s as &dyn RecordStore),
            live: &*self.services.store,
            grant_times,
            grant_time_store: &*self.services.grant_times,
        })
    }

    fn delete_staged_data(&self) {
        if let Err(e) = self.staging.clear() {
            tracing::warn!(error = %e, "failed to delete staged data");
        }
    }

    fn is_merge_running(&self) -> bool {
        self.merge_running.load(Ordering::SeqCst)
    }

    /// The restore-merging flag stays up while a merge copies rows, even if
    /// the persisted state was changed underneath it.
    fn sync_gate(&self, state: &PersistedRestoreState) {
        self.services.gate.set_restore_merging(
            state.internal == InternalRestoreState::MergingInProgress || self.is_merge_running(),
        );
    }
}

impl JobHandler for RestoreStateMachine {
    fn on_job(&self, payload: &str) {
        if let Err(e) = self.handle_job(payload) {
            tracing::error!(job = payload, error = %e, "restore job failed");
        }
    }
}

/// Returns true if the job of `kind` should be pending in `state`.
fn applies(kind: JobKind, state: &PersistedRestoreState) -> bool {
    match kind {
        JobKind::DownloadTimeout => state.download.is_pending(),
        JobKind::StagingTimeout => state.internal.is_staging_pending(),
        JobKind::MergingTimeout => state.internal == InternalRestoreState::MergingInProgress,
        JobKind::MergingRetry => {
            state.internal.should_attempt_merging()
                && state.phase(JobKind::MergingRetry).deadline_millis.is_some()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use healthsync_core::{
        ManualClock, ManualExecutor, ManualJobScheduler, MemoryGrantTimeStore, MemoryRecordStore,
    };
    use healthsync_storage::InMemoryKeyValueState;

    const NOW: i64 = 1_700_000_000_000;

    struct Harness {
        machine: Arc<RestoreStateMachine>,
        scheduler: Arc<ManualJobScheduler>,
        clock: Arc<ManualClock>,
        kv: Arc<InMemoryKeyValueState>,
        executor: Arc<ManualExecutor>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(InMemoryKeyValueState::new());
        let scheduler = Arc::new(ManualJobScheduler::new());
        let clock = Arc::new(ManualClock::at(NOW));
        let executor = Arc::new(ManualExecutor::new());
        let services = RestoreServices {
            key_value: kv.clone(),
            store: Arc::new(MemoryRecordStore::new()),
            grant_times: Arc::new(MemoryGrantTimeStore::default()),
            scheduler: scheduler.clone(),
            executor: executor.clone(),
            clock: clock.clone(),
            gate: Arc::new(DataSyncGate::new()),
        };
        let machine =
            RestoreStateMachine::new(RestoreConfig::default(), services, dir.path().join("staged"))
                .unwrap();
        Harness {
            machine: Arc::new(machine),
            scheduler,
            clock,
            kv,
            executor,
            _dir: dir,
        }
    }

    #[test]
    fn same_state_is_not_rewritten() {
        let h = harness();
        assert!(h
            .machine
            .set_internal_restore_state(InternalRestoreState::WaitingForStaging, false)
            .unwrap());
        let writes = h.kv.batches_written();
        assert!(!h
            .machine
            .set_internal_restore_state(InternalRestoreState::WaitingForStaging, false)
            .unwrap());
        assert_eq!(h.kv.batches_written(), writes);
        assert_eq!(h.scheduler.schedule_calls(), 1);
    }

    #[test]
    fn force_rearms_with_remaining_time() {
        let h = harness();
        h.machine
            .set_internal_restore_state(InternalRestoreState::StagingInProgress, false)
            .unwrap();
        h.clock.advance(Duration::from_secs(3_600));
        h.machine
            .set_internal_restore_state(InternalRestoreState::StagingInProgress, true)
            .unwrap();

        let job = h.scheduler.pending_job(JobKind::StagingTimeout.job_name()).unwrap();
        assert_eq!(job.min_latency, Duration::from_secs(23 * 3_600));
        assert_eq!(h.scheduler.schedule_calls(), 2);
    }

    #[test]
    fn leaving_a_phase_writes_cancelled_marker() {
        let h = harness();
        h.machine
            .set_internal_restore_state(InternalRestoreState::WaitingForStaging, false)
            .unwrap();
        h.clock.advance(Duration::from_secs(5));
        h.machine
            .set_internal_restore_state(InternalRestoreState::StagingDone, false)
            .unwrap();

        let state = h.machine.persisted_state().unwrap();
        let staging = state.phase(JobKind::StagingTimeout);
        assert_eq!(staging.deadline_millis, None);
        assert_eq!(staging.cancelled_at_millis, Some(NOW + 5_000));
        assert!(h.scheduler.pending().is_empty());
    }

    #[test]
    fn download_failure_records_fetching_error() {
        let h = harness();
        h.machine
            .update_data_download_state(DataDownloadState::Started)
            .unwrap();
        assert!(h
            .scheduler
            .pending_job(JobKind::DownloadTimeout.job_name())
            .is_some());

        h.machine
            .update_data_download_state(DataDownloadState::Failed)
            .unwrap();
        assert_eq!(
            h.machine.get_data_restore_error().unwrap(),
            DataRestoreError::FetchingData
        );
        assert!(h.scheduler.pending().is_empty());
    }

    #[test]
    fn unknown_job_is_ignored() {
        let h = harness();
        h.machine.handle_job("not_a_job").unwrap();
        assert_eq!(h.kv.batches_written(), 0);
    }

    #[test]
    fn resume_dispatches_merge() {
        let h = harness();
        h.machine
            .set_internal_restore_state(InternalRestoreState::MergingDoneLegacy, false)
            .unwrap();
        h.machine.schedule_all_jobs().unwrap();
        assert_eq!(
            h.machine.get_internal_restore_state().unwrap(),
            InternalRestoreState::MergingDoneLegacy
        );

        assert_eq!(h.executor.run_pending(), 1);
        assert_eq!(
            h.machine.get_internal_restore_state().unwrap(),
            InternalRestoreState::MergingDone
        );
        assert_eq!(h.machine.get_data_restore_error().unwrap(), DataRestoreError::None);
        assert!(h.scheduler.pending().is_empty());
    }
}
