//! Queue module: job state, retry policy, and the in-memory broker.

mod memory;
mod record;
mod retry;
mod state;

pub use memory::{InMemoryJobQueue, QueueSettings};
pub use record::JobRecord;
pub use retry::{Backoff, RetryPolicy};
pub use state::JobState;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{Job, JobEnvelope, JobId, JobKind};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {0} is active and cannot be removed")]
    JobLocked(JobId),

    #[error("job {id} is {state}; only failed jobs can be retried")]
    NotFailed { id: JobId, state: JobState },

    /// The lease expired and the job was handed to someone else.
    #[error("lease on job {0} was lost")]
    LeaseLost(JobId),

    /// The broker could not be reached.
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Per-job options passed to [`JobQueue::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Explicit identity. While a job with this id is retained, adds are no-ops.
    pub job_id: Option<JobId>,
    pub delay: Duration,
    pub retry: RetryPolicy,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
}

impl JobOptions {
    pub fn with_id(mut self, id: JobId) -> Self {
        self.job_id = Some(id);
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn remove_on_complete(mut self, remove: bool) -> Self {
        self.remove_on_complete = remove;
        self
    }

    pub fn remove_on_fail(mut self, remove: bool) -> Self {
        self.remove_on_fail = remove;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueuedJob {
    pub id: JobId,
    /// A job with this identity already existed; nothing was added.
    pub deduplicated: bool,
}

/// Read-only view of a job.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub envelope: JobEnvelope,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub delay_remaining: Option<Duration>,
}

impl JobSnapshot {
    pub fn id(&self) -> &JobId {
        &self.envelope.id
    }

    pub fn kind(&self) -> Option<JobKind> {
        self.envelope.kind()
    }
}

/// What the queue decided after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    RetryScheduled { delay: Duration },
    /// No attempts left; the job is now Failed.
    Exhausted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

/// A leased job for processing.
/// The worker owns this lease and must either `ack` or `fail`.
///
/// Design intent:
/// - Queue manages state transitions (Waiting -> Active -> ...).
/// - Worker executes side effects and reports the result.
#[async_trait]
pub trait JobLease: Send {
    fn envelope(&self) -> &JobEnvelope;

    /// Executions so far, including this one.
    fn attempts_made(&self) -> u32;

    fn max_attempts(&self) -> u32;

    /// Mark success.
    async fn ack(self: Box<Self>) -> Result<(), QueueError>;

    /// Mark failure (queue decides retry/failed per the job's policy).
    async fn fail(self: Box<Self>, error: String) -> Result<FailDisposition, QueueError>;
}

/// Durable, at-least-once work queue port.
///
/// Handlers must tolerate the same job being delivered more than once.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(
        &self,
        name: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<EnqueuedJob, QueueError>;

    async fn get(&self, id: &JobId) -> Result<Option<JobSnapshot>, QueueError>;

    async fn list_delayed(&self) -> Result<Vec<JobSnapshot>, QueueError>;

    /// Remove a job that is not currently leased. `false` if it did not exist.
    async fn remove(&self, id: &JobId) -> Result<bool, QueueError>;

    /// Re-drive a failed job immediately, preserving identity and history.
    async fn retry(&self, id: &JobId) -> Result<(), QueueError>;

    /// Lease the next runnable job, waiting until one is available.
    async fn lease(&self) -> Option<Box<dyn JobLease>>;

    async fn counts(&self) -> Result<JobCounts, QueueError>;

    /// Round trip to the broker; `Ok` means it is up.
    async fn ping(&self) -> Result<(), QueueError>;

    async fn enqueue_job(&self, job: &Job, options: JobOptions) -> Result<EnqueuedJob, QueueError> {
        let payload = job.payload()?;
        self.enqueue(job.kind().as_str(), payload, options).await
    }
}
