//! Deferred job scheduling interface.

use crate::error::CoreResult;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A named unit of deferred work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    /// Namespace shared by related jobs, used by [`JobScheduler::cancel_all`].
    pub namespace: String,
    /// Job name, unique within the namespace.
    pub name: String,
    /// The job must not run before this delay has passed.
    pub min_latency: Duration,
    /// The job should run before this delay has passed.
    pub max_delay: Duration,
    /// Opaque string handed back to the [`JobHandler`] when the job runs.
    pub payload: String,
}

impl JobRequest {
    /// Creates a request whose payload is its own name.
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        min_latency: Duration,
        max_delay: Duration,
    ) -> Self {
        let name = name.into();
        Self {
            namespace: namespace.into(),
            payload: name.clone(),
            name,
            min_latency,
            max_delay,
        }
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }
}

/// Runs named jobs after a delay.
///
/// Scheduling a job replaces any pending job with the same namespace and
/// name. Jobs are not assumed to survive a process restart.
pub trait JobScheduler: Send + Sync {
    /// Schedules `request`, replacing a pending job of the same name.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler refuses the job.
    fn schedule(&self, request: JobRequest) -> CoreResult<()>;

    /// Cancels a pending job. Cancelling an unknown job is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler cannot be reached.
    fn cancel(&self, namespace: &str, name: &str) -> CoreResult<()>;

    /// Cancels every pending job of a namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler cannot be reached.
    fn cancel_all(&self, namespace: &str) -> CoreResult<()>;
}

/// Receives jobs when they become due.
pub trait JobHandler: Send + Sync {
    /// Runs the job identified by `payload`.
    fn on_job(&self, payload: &str);
}

/// A scheduler that only records requests.
///
/// Nothing ever fires on its own; tests inspect the pending set and fire
/// jobs by hand with [`ManualJobScheduler::take`].
#[derive(Debug, Default)]
pub struct ManualJobScheduler {
    pending: Mutex<BTreeMap<(String, String), JobRequest>>,
    schedule_calls: AtomicU64,
    cancel_all_calls: AtomicU64,
}

impl ManualJobScheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every pending job, ordered by namespace and name.
    #[must_use]
    pub fn pending(&self) -> Vec<JobRequest> {
        self.pending.lock().values().cloned().collect()
    }

    /// Returns the names of pending jobs.
    #[must_use]
    pub fn pending_names(&self) -> Vec<String> {
        self.pending.lock().values().map(|r| r.name.clone()).collect()
    }

    /// Returns the pending job called `name` in any namespace.
    #[must_use]
    pub fn pending_job(&self, name: &str) -> Option<JobRequest> {
        self.pending
            .lock()
            .values()
            .find(|r| r.name == name)
            .cloned()
    }

    /// Removes and returns the pending job called `name`, as if it fired.
    pub fn take(&self, name: &str) -> Option<JobRequest> {
        let mut pending = self.pending.lock();
        let key = pending.keys().find(|(_, n)| n == name).cloned()?;
        pending.remove(&key)
    }

    /// Returns how many times [`JobScheduler::schedule`] was called.
    #[must_use]
    pub fn schedule_calls(&self) -> u64 {
        self.schedule_calls.load(Ordering::SeqCst)
    }

    /// Returns how many times [`JobScheduler::cancel_all`] was called.
    #[must_use]
    pub fn cancel_all_calls(&self) -> u64 {
        self.cancel_all_calls.load(Ordering::SeqCst)
    }
}

impl JobScheduler for ManualJobScheduler {
    fn schedule(&self, request: JobRequest) -> CoreResult<()> {
        self.schedule_calls.fetch_add(1, Ordering::SeqCst);
        self.pending
            .lock()
            .insert((request.namespace.clone(), request.name.clone()), request);
        Ok(())
    }

    fn cancel(&self, namespace: &str, name: &str) -> CoreResult<()> {
        self.pending
            .lock()
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    fn cancel_all(&self, namespace: &str) -> CoreResult<()> {
        self.cancel_all_calls.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().retain(|(ns, _), _| ns != namespace);
        Ok(())
    }
}
