//! Timeout and retry jobs of the restore state machine.

use healthsync_core::{
    CoreError, CoreResult, JobHandler, JobRequest, JobScheduler, Task, TaskExecutor,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Scheduler namespace shared by every restore job.
pub const JOB_NAMESPACE: &str = "healthsync_backup_restore_jobs";

/// The four jobs that guard restore phases.
///
/// A job's name is the key of its phase deadline, and its payload is its
/// name, so a fired job can be dispatched without any other context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobKind {
    /// Marks a stuck download as failed.
    DownloadTimeout,
    /// Force-completes a stuck staging phase.
    StagingTimeout,
    /// Force-completes a stuck merge.
    MergingTimeout,
    /// Re-attempts a merge that was blocked by a migration.
    MergingRetry,
}

impl JobKind {
    /// Every job kind.
    pub const ALL: [JobKind; 4] = [
        JobKind::DownloadTimeout,
        JobKind::StagingTimeout,
        JobKind::MergingTimeout,
        JobKind::MergingRetry,
    ];

    /// Returns the scheduler job name.
    pub const fn job_name(self) -> &'static str {
        self.deadline_key()
    }

    /// Returns the key holding the phase deadline.
    pub const fn deadline_key(self) -> &'static str {
        match self {
            JobKind::DownloadTimeout => "data_download_timeout_key",
            JobKind::StagingTimeout => "data_staging_timeout_key",
            JobKind::MergingTimeout => "data_merging_timeout_key",
            JobKind::MergingRetry => "data_merging_retry_key",
        }
    }

    /// Returns the key holding the cancelled marker.
    pub const fn cancelled_key(self) -> &'static str {
        match self {
            JobKind::DownloadTimeout => "data_download_timeout_cancelled_key",
            JobKind::StagingTimeout => "data_staging_timeout_cancelled_key",
            JobKind::MergingTimeout => "data_merging_timeout_cancelled_key",
            JobKind::MergingRetry => "data_merging_retry_cancelled_key",
        }
    }

    /// Looks a job up by name.
    pub fn from_job_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.job_name() == name)
    }
}

type TaskMap = HashMap<(String, String), (u64, JoinHandle<()>)>;

/// A [`JobScheduler`] running jobs as tokio timers.
///
/// A job sleeps for its minimum latency and then runs the handler on the
/// blocking pool. Scheduling a name again aborts the earlier timer. Jobs do
/// not survive the runtime; callers re-derive them on start.
pub struct TokioJobScheduler {
    runtime: Handle,
    handler: RwLock<Option<Weak<dyn JobHandler>>>,
    tasks: Arc<Mutex<TaskMap>>,
    generation: AtomicU64,
}

impl TokioJobScheduler {
    /// Creates a scheduler spawning onto `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            handler: RwLock::new(None),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Sets the handler that receives fired jobs.
    ///
    /// Only a weak reference is kept, so the handler may own the scheduler.
    pub fn set_handler(&self, handler: Weak<dyn JobHandler>) {
        *self.handler.write() = Some(handler);
    }

    /// Returns the number of jobs that have not fired yet.
    pub fn pending_count(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl JobScheduler for TokioJobScheduler {
    fn schedule(&self, request: JobRequest) -> CoreResult<()> {
        let handler = self
            .handler
            .read()
            .clone()
            .ok_or_else(|| CoreError::scheduler("no job handler registered"))?;
        let key = (request.namespace.clone(), request.name.clone());
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let tasks = Arc::clone(&self.tasks);
        let task_key = key.clone();

        tracing::debug!(
            job = %request.name,
            min_latency_ms = request.min_latency.as_millis() as u64,
            "arming job timer"
        );

        // Held across the spawn so the task cannot finish and clean up
        // before its own entry is inserted.
        let mut pending = self.tasks.lock();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(request.min_latency).await;
            match handler.upgrade() {
                Some(handler) => {
                    let payload = request.payload;
                    if tokio::task::spawn_blocking(move || handler.on_job(&payload))
                        .await
                        .is_err()
                    {
                        tracing::error!(job = %request.name, "job handler panicked");
                    }
                }
                None => tracing::warn!(job = %request.name, "job handler dropped, job ignored"),
            }
            let mut tasks = tasks.lock();
            if tasks.get(&task_key).is_some_and(|(g, _)| *g == generation) {
                tasks.remove(&task_key);
            }
        });

        if let Some((_, previous)) = pending.insert(key, (generation, task)) {
            previous.abort();
        }
        Ok(())
    }

    fn cancel(&self, namespace: &str, name: &str) -> CoreResult<()> {
        let removed = self
            .tasks
            .lock()
            .remove(&(namespace.to_string(), name.to_string()));
        if let Some((_, task)) = removed {
            task.abort();
            tracing::debug!(job = name, "job timer cancelled");
        }
        Ok(())
    }

    fn cancel_all(&self, namespace: &str) -> CoreResult<()> {
        let mut tasks = self.tasks.lock();
        tasks.retain(|(ns, _), (_, task)| {
            if ns == namespace {
                task.abort();
                false
            } else {
                true
            }
        });
        Ok(())
    }
}

/// A [`TaskExecutor`] running tasks on the tokio blocking pool.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    runtime: Handle,
}

impl TokioExecutor {
    /// Creates an executor spawning onto `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }
}

impl TaskExecutor for TokioExecutor {
    fn execute(&self, task: Task) {
        let task = self.runtime.spawn_blocking(task);
        self.runtime.spawn(async move {
            if task.await.is_err() {
                tracing::error!("background task panicked");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Recorder(mpsc::UnboundedSender<String>);

    impl JobHandler for Recorder {
        fn on_job(&self, payload: &str) {
            let _ = self.0.send(payload.to_string());
        }
    }

    fn setup() -> (TokioJobScheduler, Arc<Recorder>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder(tx));
        let scheduler = TokioJobScheduler::new(Handle::current());
        let weak: Weak<dyn JobHandler> = Arc::downgrade(&recorder) as Weak<dyn JobHandler>;
        scheduler.set_handler(weak);
        (scheduler, recorder, rx)
    }

    fn request(name: &str, millis: u64) -> JobRequest {
        JobRequest::new(
            JOB_NAMESPACE,
            name,
            Duration::from_millis(millis),
            Duration::from_millis(millis * 2),
        )
    }

    #[test]
    fn job_names_round_trip() {
        for kind in JobKind::ALL {
            assert_eq!(JobKind::from_job_name(kind.job_name()), Some(kind));
            assert_ne!(kind.deadline_key(), kind.cancelled_key());
        }
        assert_eq!(JobKind::from_job_name("nope"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn executor_survives_panicking_task() {
        let executor = TokioExecutor::new(Handle::current());
        let (tx, mut rx) = mpsc::unbounded_channel();

        executor.execute(Box::new(|| panic!("boom")));
        executor.execute(Box::new(move || {
            let _ = tx.send(7);
        }));

        let ran = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(ran, Some(7));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fires_after_delay() {
        let (scheduler, _recorder, mut rx) = setup();
        scheduler.schedule(request("a", 10)).unwrap();

        let fired = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(fired.as_deref(), Some("a"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reschedule_replaces_previous_timer() {
        let (scheduler, _recorder, mut rx) = setup();
        scheduler.schedule(request("a", 60_000)).unwrap();
        scheduler
            .schedule(request("a", 10).with_payload("second"))
            .unwrap();

        let fired = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(fired.as_deref(), Some("second"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_job_never_fires() {
        let (scheduler, _recorder, mut rx) = setup();
        scheduler.schedule(request("a", 30)).unwrap();
        scheduler.schedule(request("b", 30)).unwrap();
        scheduler.cancel(JOB_NAMESPACE, "a").unwrap();
        scheduler.cancel_all(JOB_NAMESPACE).unwrap();
        assert_eq!(scheduler.pending_count(), 0);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn schedule_without_handler_fails() {
        let scheduler = TokioJobScheduler::new(Handle::current());
        assert!(scheduler.schedule(request("a", 1)).is_err());
    }
}
