//! Job record: metadata + envelope.

use std::time::Duration;

use tokio::time::Instant;

use super::{JobOptions, JobSnapshot, JobState, RetryPolicy};
use crate::domain::JobEnvelope;

/// Metadata + envelope for a job in the queue.
///
/// Design:
/// - This is the "single source of truth" for job state.
/// - Queue structures (ready/scheduled) hold JobIds only.
/// - All state transitions happen here.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub envelope: JobEnvelope,
    pub state: JobState,

    pub retry: RetryPolicy,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,

    /// Executions started so far (including the current one while Active).
    pub attempts_made: u32,

    /// Extra executions granted by explicit retries of a failed job.
    pub granted_retries: u32,

    pub last_error: Option<String>,

    /// When a Delayed job becomes eligible.
    pub run_at: Option<Instant>,

    /// Identifies the current lease; stale leases carry an older token.
    pub lease_token: Option<u64>,
    pub lease_expires_at: Option<Instant>,

}

impl JobRecord {
    pub fn new(envelope: JobEnvelope, options: &JobOptions, now: Instant) -> Self {
        let (state, run_at) = if options.delay.is_zero() {
            (JobState::Waiting, None)
        } else {
            (JobState::Delayed, Some(now + options.delay))
        };
        Self {
            envelope,
            state,
            retry: options.retry,
            remove_on_complete: options.remove_on_complete,
            remove_on_fail: options.remove_on_fail,
            attempts_made: 0,
            granted_retries: 0,
            last_error: None,
            run_at,
            lease_token: None,
            lease_expires_at: None,
        }
    }

    /// Attempt budget, including any explicit retries.
    pub fn max_attempts(&self) -> u32 {
        self.retry.attempts.saturating_add(self.granted_retries)
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts_made >= self.max_attempts()
    }

    /// Mark as Active under a fresh lease (increments attempts).
    pub fn start_attempt(&mut self, token: u64, lease_timeout: Duration, now: Instant) {
        self.state = JobState::Active;
        self.attempts_made += 1;
        self.lease_token = Some(token);
        self.lease_expires_at = Some(now + lease_timeout);
        self.run_at = None;
    }

    pub fn holds_lease(&self, token: u64) -> bool {
        self.state == JobState::Active && self.lease_token == Some(token)
    }

    pub fn mark_completed(&mut self) {
        self.state = JobState::Completed;
        self.clear_lease();
    }

    pub fn mark_failed(&mut self, error: String) {
        self.state = JobState::Failed;
        self.last_error = Some(error);
        self.clear_lease();
    }

    /// Failed attempt with budget left: wait out the backoff.
    pub fn schedule_retry(&mut self, run_at: Instant, error: String) {
        self.state = JobState::Delayed;
        self.run_at = Some(run_at);
        self.last_error = Some(error);
        self.clear_lease();
    }

    /// Delayed -> Waiting, or an expired lease back to Waiting.
    pub fn requeue(&mut self) {
        self.state = JobState::Waiting;
        self.run_at = None;
        self.clear_lease();
    }

    /// Failed -> Waiting, keeping identity and attempt history.
    pub fn revive(&mut self) {
        if self.is_exhausted() {
            self.granted_retries += self.attempts_made + 1 - self.max_attempts();
        }
        self.requeue();
    }

    pub fn lease_expired(&self, now: Instant) -> bool {
        self.state == JobState::Active && self.lease_expires_at.is_some_and(|at| at <= now)
    }

    pub fn snapshot(&self, now: Instant) -> JobSnapshot {
        JobSnapshot {
            envelope: self.envelope.clone(),
            state: self.state,
            attempts_made: self.attempts_made,
            max_attempts: self.max_attempts(),
            last_error: self.last_error.clone(),
            delay_remaining: self.run_at.map(|at| at.saturating_duration_since(now)),
        }
    }

    fn clear_lease(&mut self) {
        self.lease_token = None;
        self.lease_expires_at = None;
    }
}
