//! In-memory queue implementation.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    EnqueuedJob, FailDisposition, JobCounts, JobLease, JobOptions, JobQueue, JobRecord,
    JobSnapshot, JobState, QueueError,
};
use crate::domain::{JobEnvelope, JobId};
use crate::ports::{IdGenerator, SystemClock, UlidGenerator};

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    /// How long a worker may hold a job before it is handed out again.
    pub lease_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(30),
        }
    }
}

/// Scheduled job entry for priority queue.
///
/// We use Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledJob {
    run_at: Instant,
    job_id: JobId,
}

impl PartialOrd for ScheduledJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.job_id.cmp(&self.job_id))
    }
}

struct InMemoryQueueState {
    /// All job records (single source of truth).
    records: HashMap<JobId, JobRecord>,

    /// Ready queue (JobIds only). May hold stale ids; checked on pop.
    ready: VecDeque<JobId>,

    /// Delayed jobs by run time. May hold stale entries; checked on promote.
    scheduled: BinaryHeap<ScheduledJob>,

    next_lease_token: u64,
    settings: QueueSettings,
}

impl InMemoryQueueState {
    fn new(settings: QueueSettings) -> Self {
        Self {
            records: HashMap::new(),
            ready: VecDeque::new(),
            scheduled: BinaryHeap::new(),
            next_lease_token: 1,
            settings,
        }
    }

    fn allocate_lease_token(&mut self) -> u64 {
        let token = self.next_lease_token;
        self.next_lease_token += 1;
        token
    }

    fn schedule(&mut self, job_id: JobId, run_at: Instant) {
        self.scheduled.push(ScheduledJob { run_at, job_id });
    }

    /// Move delayed jobs to ready if their time has come.
    fn promote_scheduled_jobs(&mut self, now: Instant) {
        while let Some(entry) = self.scheduled.peek() {
            if entry.run_at > now {
                break; // Heap is sorted, so we can stop
            }
            let Some(entry) = self.scheduled.pop() else {
                break;
            };
            if let Some(record) = self.records.get_mut(&entry.job_id)
                && record.state == JobState::Delayed
                && record.run_at == Some(entry.run_at)
            {
                record.requeue();
                self.ready.push_back(entry.job_id);
            }
        }
    }

    /// Hand expired leases back to the ready queue (at-least-once delivery).
    fn reclaim_expired_leases(&mut self, now: Instant) {
        let expired: Vec<JobId> = self
            .records
            .iter()
            .filter(|(_, record)| record.lease_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(record) = self.records.get_mut(&id) {
                warn!(job = %id, name = %record.envelope.name, "lease expired, job will be redelivered");
                record.requeue();
                self.ready.push_back(id);
            }
        }
    }

    fn pop_ready(&mut self) -> Option<JobId> {
        while let Some(id) = self.ready.pop_front() {
            if self
                .records
                .get(&id)
                .is_some_and(|record| record.state.is_runnable())
            {
                return Some(id);
            }
        }
        None
    }

    /// Earliest moment something may become runnable without a notify.
    fn next_wake(&self) -> Option<Instant> {
        let scheduled = self.scheduled.peek().map(|entry| entry.run_at);
        let lease = self
            .records
            .values()
            .filter(|record| record.state == JobState::Active)
            .filter_map(|record| record.lease_expires_at)
            .min();
        match (scheduled, lease) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn counts(&self) -> JobCounts {
        let mut counts = JobCounts::default();
        for record in self.records.values() {
            match record.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

/// In-memory broker honouring the [`JobQueue`] contract: identity dedup,
/// delayed jobs, per-job retry/backoff, retained failures, lease expiry.
pub struct InMemoryJobQueue {
    state: Arc<Mutex<InMemoryQueueState>>,
    notify: Arc<Notify>,
    ids: Box<dyn IdGenerator>,
}

impl InMemoryJobQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryQueueState::new(settings))),
            notify: Arc::new(Notify::new()),
            ids: Box::new(UlidGenerator::new(SystemClock)),
        }
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(QueueSettings::default())
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(
        &self,
        name: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<EnqueuedJob, QueueError> {
        let id = options
            .job_id
            .clone()
            .unwrap_or_else(|| self.ids.generate_job_id());
        let now = Instant::now();

        {
            let mut state = self.state.lock().await;
            if let Some(existing) = state.records.get(&id) {
                debug!(job = %id, name, state = %existing.state, "duplicate job id, add ignored");
                return Ok(EnqueuedJob {
                    id,
                    deduplicated: true,
                });
            }

            let record = JobRecord::new(JobEnvelope::new(id.clone(), name, payload), &options, now);
            match record.run_at {
                Some(run_at) => state.schedule(id.clone(), run_at),
                None => state.ready.push_back(id.clone()),
            }
            state.records.insert(id.clone(), record);
        }

        debug!(job = %id, name, delay_ms = options.delay.as_millis() as u64, "job added");
        // Notify waiting workers (delayed jobs too: sleepers must recompute their wake time)
        self.notify.notify_one();

        Ok(EnqueuedJob {
            id,
            deduplicated: false,
        })
    }

    async fn get(&self, id: &JobId) -> Result<Option<JobSnapshot>, QueueError> {
        let state = self.state.lock().await;
        let now = Instant::now();
        Ok(state.records.get(id).map(|record| record.snapshot(now)))
    }

    async fn list_delayed(&self) -> Result<Vec<JobSnapshot>, QueueError> {
        let state = self.state.lock().await;
        let now = Instant::now();
        let mut delayed: Vec<&JobRecord> = state
            .records
            .values()
            .filter(|record| record.state == JobState::Delayed)
            .collect();
        delayed.sort_by_key(|record| record.run_at);
        Ok(delayed.into_iter().map(|record| record.snapshot(now)).collect())
    }

    async fn remove(&self, id: &JobId) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        match state.records.get(id).map(|record| record.state) {
            None => Ok(false),
            Some(JobState::Active) => Err(QueueError::JobLocked(id.clone())),
            Some(_) => {
                // ready/scheduled entries go stale and are skipped later
                state.records.remove(id);
                debug!(job = %id, "job removed");
                Ok(true)
            }
        }
    }

    async fn retry(&self, id: &JobId) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            let record = state
                .records
                .get_mut(id)
                .ok_or_else(|| QueueError::NotFound(id.clone()))?;
            if record.state != JobState::Failed {
                return Err(QueueError::NotFailed {
                    id: id.clone(),
                    state: record.state,
                });
            }
            record.revive();
            state.ready.push_back(id.clone());
        }
        debug!(job = %id, "failed job re-queued");
        self.notify.notify_one();
        Ok(())
    }

    async fn lease(&self) -> Option<Box<dyn JobLease>> {
        loop {
            let next_wake = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.promote_scheduled_jobs(now);
                state.reclaim_expired_leases(now);

                if let Some(job_id) = state.pop_ready() {
                    let token = state.allocate_lease_token();
                    let lease_timeout = state.settings.lease_timeout;
                    let more_ready = !state.ready.is_empty();
                    let record = state.records.get_mut(&job_id)?;
                    record.start_attempt(token, lease_timeout, now);
                    let lease = InMemoryLease {
                        job_id,
                        token,
                        envelope: record.envelope.clone(),
                        attempts_made: record.attempts_made,
                        max_attempts: record.max_attempts(),
                        queue: Arc::clone(&self.state),
                        notify: Arc::clone(&self.notify),
                    };
                    drop(state);
                    if more_ready {
                        // pass the baton so idle workers pick up the rest
                        self.notify.notify_one();
                    }
                    return Some(Box::new(lease));
                }

                state.next_wake()
            };

            // Wait for notification OR next scheduled time
            if let Some(wake_time) = next_wake {
                tokio::select! {
                    _ = self.notify.notified() => {},
                    _ = tokio::time::sleep_until(wake_time) => {},
                }
            } else {
                self.notify.notified().await;
            }
        }
    }

    async fn counts(&self) -> Result<JobCounts, QueueError> {
        let state = self.state.lock().await;
        Ok(state.counts())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        // taking the lock is the whole round trip here
        drop(self.state.lock().await);
        Ok(())
    }
}

/// Lease implementation for InMemoryJobQueue.
struct InMemoryLease {
    job_id: JobId,
    token: u64,
    envelope: JobEnvelope,
    attempts_made: u32,
    max_attempts: u32,
    queue: Arc<Mutex<InMemoryQueueState>>,
    notify: Arc<Notify>,
}

#[async_trait]
impl JobLease for InMemoryLease {
    fn envelope(&self) -> &JobEnvelope {
        &self.envelope
    }

    fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    async fn ack(self: Box<Self>) -> Result<(), QueueError> {
        let mut state = self.queue.lock().await;
        let record = state
            .records
            .get_mut(&self.job_id)
            .filter(|record| record.holds_lease(self.token))
            .ok_or_else(|| QueueError::LeaseLost(self.job_id.clone()))?;

        record.mark_completed();
        if record.remove_on_complete {
            state.records.remove(&self.job_id);
        }
        Ok(())
    }

    async fn fail(self: Box<Self>, error: String) -> Result<FailDisposition, QueueError> {
        let disposition = {
            let mut state = self.queue.lock().await;
            let now = Instant::now();
            let record = state
                .records
                .get_mut(&self.job_id)
                .filter(|record| record.holds_lease(self.token))
                .ok_or_else(|| QueueError::LeaseLost(self.job_id.clone()))?;

            if record.is_exhausted() {
                record.mark_failed(error);
                if record.remove_on_fail {
                    state.records.remove(&self.job_id);
                }
                FailDisposition::Exhausted
            } else {
                // Schedule retry with backoff
                let delay = record.retry.next_delay(record.attempts_made);
                if delay.is_zero() {
                    record.last_error = Some(error);
                    record.requeue();
                    state.ready.push_back(self.job_id.clone());
                } else {
                    let run_at = now + delay;
                    record.schedule_retry(run_at, error);
                    state.schedule(self.job_id.clone(), run_at);
                }
                FailDisposition::RetryScheduled { delay }
            }
        }; // Lock released here

        // Notify outside the lock
        if matches!(disposition, FailDisposition::RetryScheduled { .. }) {
            self.notify.notify_one();
        }

        Ok(disposition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RetryPolicy;

    const LEASE_WAIT: Duration = Duration::from_millis(200);

    async fn lease_now(queue: &InMemoryJobQueue) -> Box<dyn JobLease> {
        tokio::time::timeout(LEASE_WAIT, queue.lease())
            .await
            .expect("a job should be ready")
            .expect("queue is open")
    }

    async fn add(queue: &InMemoryJobQueue, name: &str, options: JobOptions) -> EnqueuedJob {
        queue
            .enqueue(name, serde_json::json!({"n": name}), options)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn enqueue_and_counts() {
        let queue = InMemoryJobQueue::default();
        add(&queue, "send", JobOptions::default()).await;
        add(&queue, "read", JobOptions::default().delayed(Duration::from_secs(60))).await;

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.delayed, 1);
        assert_eq!(counts.active, 0);
    }

    #[tokio::test]
    async fn duplicate_identity_is_ignored() {
        let queue = InMemoryJobQueue::default();
        let id = JobId::new("msg-1");
        let first = add(&queue, "send", JobOptions::default().with_id(id.clone())).await;
        let second = add(&queue, "send", JobOptions::default().with_id(id.clone())).await;

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(second.id, id);
        assert_eq!(queue.counts().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn generated_ids_are_distinct() {
        let queue = InMemoryJobQueue::default();
        let a = add(&queue, "read", JobOptions::default()).await;
        let b = add(&queue, "read", JobOptions::default()).await;
        assert_ne!(a.id, b.id);
        assert!(a.id.as_str().starts_with("job-"));
    }

    #[tokio::test]
    async fn lease_transitions_to_active() {
        let queue = InMemoryJobQueue::default();
        add(&queue, "send", JobOptions::default()).await;

        let lease = lease_now(&queue).await;
        assert_eq!(lease.envelope().name, "send");
        assert_eq!(lease.attempts_made(), 1);

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.waiting, 0);
        assert_eq!(counts.active, 1);
    }

    #[tokio::test]
    async fn ack_completes_or_discards() {
        let queue = InMemoryJobQueue::default();
        let kept = add(&queue, "read", JobOptions::default()).await;
        lease_now(&queue).await.ack().await.unwrap();
        assert_eq!(
            queue.get(&kept.id).await.unwrap().unwrap().state,
            JobState::Completed
        );

        let dropped = add(&queue, "send", JobOptions::default().remove_on_complete(true)).await;
        lease_now(&queue).await.ack().await.unwrap();
        assert!(queue.get(&dropped.id).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_job_runs_after_its_delay() {
        let queue = InMemoryJobQueue::default();
        add(&queue, "delivered", JobOptions::default().delayed(Duration::from_secs(5))).await;

        let early = tokio::time::timeout(Duration::from_secs(4), queue.lease()).await;
        assert!(early.is_err());

        let lease = tokio::time::timeout(Duration::from_secs(2), queue.lease())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.envelope().name, "delivered");
    }

    #[tokio::test(start_paused = true)]
    async fn failure_backs_off_then_exhausts() {
        let queue = InMemoryJobQueue::default();
        let options = JobOptions::default()
            .retry(RetryPolicy::exponential(3, Duration::from_secs(1)))
            .remove_on_fail(false);
        let job = add(&queue, "send", options).await;

        let d1 = lease_now(&queue).await.fail("e1".into()).await.unwrap();
        assert_eq!(d1, FailDisposition::RetryScheduled { delay: Duration::from_secs(1) });
        assert_eq!(queue.list_delayed().await.unwrap().len(), 1);

        let lease = queue.lease().await.unwrap();
        assert_eq!(lease.attempts_made(), 2);
        let d2 = lease.fail("e2".into()).await.unwrap();
        assert_eq!(d2, FailDisposition::RetryScheduled { delay: Duration::from_secs(2) });

        let d3 = queue.lease().await.unwrap().fail("e3".into()).await.unwrap();
        assert_eq!(d3, FailDisposition::Exhausted);

        let snapshot = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(snapshot.state, JobState::Failed);
        assert_eq!(snapshot.attempts_made, 3);
        assert_eq!(snapshot.last_error.as_deref(), Some("e3"));
    }

    #[tokio::test]
    async fn remove_on_fail_discards_exhausted_job() {
        let queue = InMemoryJobQueue::default();
        let job = add(&queue, "read", JobOptions::default().remove_on_fail(true)).await;
        let d = lease_now(&queue).await.fail("boom".into()).await.unwrap();
        assert_eq!(d, FailDisposition::Exhausted);
        assert!(queue.get(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_revives_failed_job_with_same_identity() {
        let queue = InMemoryJobQueue::default();
        let id = JobId::new("msg-1");
        add(&queue, "send", JobOptions::default().with_id(id.clone())).await;
        lease_now(&queue).await.fail("boom".into()).await.unwrap();

        queue.retry(&id).await.unwrap();

        let lease = lease_now(&queue).await;
        assert_eq!(lease.envelope().id, id);
        assert_eq!(lease.attempts_made(), 2);
        assert_eq!(lease.max_attempts(), 2);
        lease.ack().await.unwrap();
    }

    #[tokio::test]
    async fn retry_rejects_missing_or_unfailed_jobs() {
        let queue = InMemoryJobQueue::default();
        assert!(matches!(
            queue.retry(&JobId::new("nope")).await,
            Err(QueueError::NotFound(_))
        ));

        let job = add(&queue, "send", JobOptions::default()).await;
        assert!(matches!(
            queue.retry(&job.id).await,
            Err(QueueError::NotFailed { state: JobState::Waiting, .. })
        ));
    }

    #[tokio::test]
    async fn removed_jobs_are_never_leased() {
        let queue = InMemoryJobQueue::default();
        let delayed = add(&queue, "read", JobOptions::default().delayed(Duration::from_millis(20))).await;
        let waiting = add(&queue, "delivered", JobOptions::default()).await;

        assert!(queue.remove(&delayed.id).await.unwrap());
        assert!(queue.remove(&waiting.id).await.unwrap());
        assert!(!queue.remove(&waiting.id).await.unwrap());

        let nothing = tokio::time::timeout(Duration::from_millis(80), queue.lease()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn active_jobs_cannot_be_removed() {
        let queue = InMemoryJobQueue::default();
        let job = add(&queue, "send", JobOptions::default()).await;
        let _lease = lease_now(&queue).await;
        assert!(matches!(
            queue.remove(&job.id).await,
            Err(QueueError::JobLocked(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_redelivered_and_stale_ack_rejected() {
        let queue = InMemoryJobQueue::new(QueueSettings {
            lease_timeout: Duration::from_secs(10),
        });
        add(&queue, "delivered", JobOptions::default()).await;

        let stale = queue.lease().await.unwrap();
        let fresh = tokio::time::timeout(Duration::from_secs(11), queue.lease())
            .await
            .expect("lease should be reclaimed")
            .unwrap();
        assert_eq!(fresh.attempts_made(), 2);

        assert!(matches!(stale.ack().await, Err(QueueError::LeaseLost(_))));
        fresh.ack().await.unwrap();
    }

    #[tokio::test]
    async fn ping_answers_while_a_worker_waits() {
        let queue = Arc::new(InMemoryJobQueue::default());
        let waiter = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.lease().await.is_some() }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        tokio::time::timeout(LEASE_WAIT, queue.ping())
            .await
            .expect("ping must not block behind an idle lease")
            .unwrap();
        waiter.abort();
    }

    #[tokio::test]
    async fn waiting_workers_are_woken() {
        let queue = Arc::new(InMemoryJobQueue::default());
        let waiter = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.lease().await.map(|l| l.envelope().name.clone()) }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        add(&queue, "read", JobOptions::default()).await;

        let name = tokio::time::timeout(LEASE_WAIT, waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(name.as_deref(), Some("read"));
    }
}
