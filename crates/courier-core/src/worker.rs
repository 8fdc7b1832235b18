//! Worker: executes lifecycle jobs against the store.
//!
//! `Processor` owns the per-job state machine; `WorkerGroup` runs N lease
//! loops that feed it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::{
    Job, JobDecodeError, JobEnvelope, JobError, JobKind, Message, MessagePatch, MessageRef,
    MessageStatus,
};
use crate::ports::{Clock, Provider};
use crate::queue::{FailDisposition, JobLease, JobOptions, JobQueue, QueueError, RetryPolicy};
use crate::store::{MessageStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorSettings {
    /// SENT -> DELIVERED.
    pub delivered_delay: Duration,
    /// DELIVERED -> READ.
    pub read_delay: Duration,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            delivered_delay: Duration::from_secs(1),
            read_delay: Duration::from_secs(2),
        }
    }
}

pub struct Processor {
    store: Arc<dyn MessageStore>,
    queue: Arc<dyn JobQueue>,
    provider: Arc<dyn Provider>,
    clock: Arc<dyn Clock>,
    settings: ProcessorSettings,
}

impl Processor {
    pub fn new(
        store: Arc<dyn MessageStore>,
        queue: Arc<dyn JobQueue>,
        provider: Arc<dyn Provider>,
        clock: Arc<dyn Clock>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            store,
            queue,
            provider,
            clock,
            settings,
        }
    }

    /// Run one job. An `Err` is reported to the queue as a failed attempt.
    ///
    /// Every write is an absolute assignment, so a redelivered job converges
    /// on the same record.
    pub async fn process(&self, envelope: &JobEnvelope) -> Result<(), JobError> {
        let job = match Job::decode(envelope) {
            Ok(job) => job,
            Err(JobDecodeError::UnknownKind(name)) => {
                warn!(job = %envelope.id, name = %name, "unknown job name, acknowledged without effect");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        match &job {
            Job::Send(target) => self.send(target).await,
            Job::Delivered(target) => {
                self.advance(target, MessageStatus::Delivered).await?;
                Ok(())
            }
            Job::Read(target) => {
                self.advance(target, MessageStatus::Read).await?;
                Ok(())
            }
        }
    }

    /// Called after the queue recorded a failed attempt.
    ///
    /// Only a `send` job that has run out of attempts marks the message FAILED.
    pub async fn on_failed(
        &self,
        envelope: &JobEnvelope,
        error: &str,
        disposition: FailDisposition,
    ) -> Result<(), JobError> {
        if disposition != FailDisposition::Exhausted || envelope.kind() != Some(JobKind::Send) {
            return Ok(());
        }
        let job = Job::decode(envelope)?;
        let target = job.target();
        self.store
            .update(&target.user_id, &target.message_id, MessagePatch::failed(error))
            .await?;
        warn!(message_id = %target.message_id, reason = error, "send attempts exhausted, message failed");
        Ok(())
    }

    async fn send(&self, target: &MessageRef) -> Result<(), JobError> {
        self.advance(target, MessageStatus::Sending).await?;
        self.provider.send(target).await?;
        self.advance(target, MessageStatus::Sent).await?;

        let delivered_in = self.settings.delivered_delay;
        let read_in = delivered_in + self.settings.read_delay;
        for (kind, delay) in [(JobKind::Delivered, delivered_in), (JobKind::Read, read_in)] {
            let job = Job::new(kind, target.message_id, target.user_id.clone());
            let options = JobOptions::default()
                .delayed(delay)
                .retry(RetryPolicy::once())
                .remove_on_complete(true);
            let enqueued = self.queue.enqueue_job(&job, options).await?;
            debug!(message_id = %target.message_id, job = %enqueued.id, kind = %kind, delay_ms = delay.as_millis() as u64, "receipt scheduled");
        }
        Ok(())
    }

    /// Write `next` (and its timestamp). Off-machine moves are logged, not refused.
    async fn advance(&self, target: &MessageRef, next: MessageStatus) -> Result<Message, JobError> {
        let current = self
            .store
            .find_by_owner_and_id(&target.user_id, &target.message_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                user_id: target.user_id.clone(),
                id: target.message_id,
            })?;

        if current.status == next {
            debug!(message_id = %target.message_id, status = %next, "status already applied, rewriting");
        } else if !current.status.can_advance_to(next) {
            warn!(
                message_id = %target.message_id,
                from = %current.status,
                to = %next,
                "out-of-order status transition"
            );
        }

        let updated = self
            .store
            .update(
                &target.user_id,
                &target.message_id,
                MessagePatch::advance(next, self.clock.now()),
            )
            .await?;
        info!(message_id = %target.message_id, status = %next, "message status updated");
        Ok(updated)
    }
}

/// Worker group handle.
/// - `request_shutdown` stops every worker from taking new leases
/// - `shutdown_and_join` also waits for them to exit
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers.
    pub fn spawn(n: usize, queue: Arc<dyn JobQueue>, processor: Arc<Processor>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let q = Arc::clone(&queue);
            let p = Arc::clone(&processor);
            let mut rx = shutdown_rx.clone();

            let join = tokio::spawn(async move {
                worker_loop(worker_id, q, p, &mut rx).await;
            });
            joins.push(join);
        }
        info!(workers = n, "worker group started");

        Self { shutdown_tx, joins }
    }

    /// Request shutdown for all workers.
    /// In-flight jobs run to completion; no new leases are taken.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            let _ = j.await;
        }
        info!("worker group stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<dyn JobQueue>,
    processor: Arc<Processor>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // lease may wait; race it against shutdown
        let lease = tokio::select! {
            changed = shutdown_rx.changed() => {
                // sender gone means the group handle was dropped
                if changed.is_err() {
                    break;
                }
                continue;
            }
            lease = queue.lease() => lease,
        };

        let Some(lease) = lease else {
            tokio::task::yield_now().await;
            continue;
        };

        handle(worker_id, &processor, lease).await;
    }
    debug!(worker = worker_id, "worker exited");
}

async fn handle(worker_id: usize, processor: &Processor, lease: Box<dyn JobLease>) {
    // the lease is consumed by ack/fail, keep what we need
    let envelope = lease.envelope().clone();
    debug!(
        worker = worker_id,
        job = %envelope.id,
        name = %envelope.name,
        attempt = lease.attempts_made(),
        max_attempts = lease.max_attempts(),
        "job leased"
    );

    match processor.process(&envelope).await {
        Ok(()) => match lease.ack().await {
            Ok(()) => {}
            Err(QueueError::LeaseLost(id)) => {
                warn!(worker = worker_id, job = %id, "lease lost before ack, job will run again");
            }
            Err(e) => warn!(worker = worker_id, job = %envelope.id, error = %e, "ack failed"),
        },
        Err(err) => {
            let error = err.to_string();
            warn!(worker = worker_id, job = %envelope.id, name = %envelope.name, error = %error, "job attempt failed");
            match lease.fail(error.clone()).await {
                Ok(disposition) => {
                    if let Err(e) = processor.on_failed(&envelope, &error, disposition).await {
                        warn!(worker = worker_id, job = %envelope.id, error = %e, "failure hook failed");
                    }
                }
                Err(e) => {
                    warn!(worker = worker_id, job = %envelope.id, error = %e, "fail report failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CreateMessage, JobId, NewMessage, UserId};
    use crate::ports::{FixedClock, ScriptedProvider};
    use crate::queue::{InMemoryJobQueue, JobState};
    use crate::store::InMemoryMessageStore;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    struct Fixture {
        clock: Arc<FixedClock>,
        store: Arc<InMemoryMessageStore>,
        queue: Arc<InMemoryJobQueue>,
        provider: Arc<ScriptedProvider>,
        processor: Processor,
    }

    fn fixture(failures: u32) -> Fixture {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryMessageStore::new(clock.clone()));
        let queue = Arc::new(InMemoryJobQueue::default());
        let provider = Arc::new(ScriptedProvider::failing(failures));
        let processor = Processor::new(
            store.clone(),
            queue.clone(),
            provider.clone(),
            clock.clone(),
            ProcessorSettings::default(),
        );
        Fixture {
            clock,
            store,
            queue,
            provider,
            processor,
        }
    }

    async fn queued_message(store: &InMemoryMessageStore) -> Message {
        let user = UserId::new("alice");
        store
            .create(NewMessage::from_request(user, CreateMessage::new("+1555", "hi")))
            .await
            .unwrap()
    }

    fn envelope(kind: JobKind, message: &Message) -> JobEnvelope {
        let job = Job::new(kind, message.id, message.user_id.clone());
        JobEnvelope::new(JobId::new("test-job"), kind.as_str(), job.payload().unwrap())
    }

    async fn reload(f: &Fixture, message: &Message) -> Message {
        f.store
            .find_by_owner_and_id(&message.user_id, &message.id)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn send_marks_sent_and_schedules_receipts() {
        let f = fixture(0);
        let message = queued_message(&f.store).await;

        f.clock.advance(Duration::from_secs(1));
        f.processor
            .process(&envelope(JobKind::Send, &message))
            .await
            .unwrap();

        let sent = reload(&f, &message).await;
        assert_eq!(sent.status, MessageStatus::Sent);
        assert_eq!(sent.sending_at, Some(f.clock.now()));
        assert_eq!(sent.sent_at, Some(f.clock.now()));
        assert_eq!(f.provider.calls(), 1);

        let delayed = f.queue.list_delayed().await.unwrap();
        let kinds: Vec<_> = delayed.iter().map(|j| j.kind()).collect();
        assert_eq!(kinds, vec![Some(JobKind::Delivered), Some(JobKind::Read)]);
        assert!(delayed[1].delay_remaining > delayed[0].delay_remaining);
        assert!(delayed.iter().all(|j| j.envelope.message_id() == Some(message.id)));
    }

    #[tokio::test]
    async fn provider_failure_leaves_message_sending() {
        let f = fixture(1);
        let message = queued_message(&f.store).await;

        let err = f
            .processor
            .process(&envelope(JobKind::Send, &message))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Provider(_)));

        let current = reload(&f, &message).await;
        assert_eq!(current.status, MessageStatus::Sending);
        assert!(f.queue.list_delayed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn receipts_advance_status() {
        let f = fixture(0);
        let message = queued_message(&f.store).await;
        f.processor
            .process(&envelope(JobKind::Send, &message))
            .await
            .unwrap();

        f.processor
            .process(&envelope(JobKind::Delivered, &message))
            .await
            .unwrap();
        assert_eq!(reload(&f, &message).await.status, MessageStatus::Delivered);

        f.processor
            .process(&envelope(JobKind::Read, &message))
            .await
            .unwrap();
        let read = reload(&f, &message).await;
        assert_eq!(read.status, MessageStatus::Read);
        assert!(read.delivered_at.is_some());
        assert!(read.read_at.is_some());
    }

    #[tokio::test]
    async fn out_of_order_receipt_is_still_written() {
        let f = fixture(0);
        let message = queued_message(&f.store).await;

        f.processor
            .process(&envelope(JobKind::Delivered, &message))
            .await
            .unwrap();

        let current = reload(&f, &message).await;
        assert_eq!(current.status, MessageStatus::Delivered);
        assert_eq!(current.sent_at, None);
    }

    #[tokio::test]
    async fn redelivered_receipt_converges() {
        let f = fixture(0);
        let message = queued_message(&f.store).await;
        let delivered = envelope(JobKind::Delivered, &message);

        f.processor.process(&delivered).await.unwrap();
        let first = reload(&f, &message).await;
        f.processor.process(&delivered).await.unwrap();
        assert_eq!(reload(&f, &message).await, first);
    }

    #[tokio::test]
    async fn unknown_job_name_is_acknowledged() {
        let f = fixture(0);
        let env = JobEnvelope::new(JobId::new("x"), "bounce", serde_json::json!({}));
        f.processor.process(&env).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_payload_is_an_error() {
        let f = fixture(0);
        let env = JobEnvelope::new(JobId::new("x"), "read", serde_json::json!({"oops": 1}));
        let err = f.processor.process(&env).await.unwrap_err();
        assert!(matches!(err, JobError::Decode(_)));
    }

    #[tokio::test]
    async fn missing_message_is_an_error() {
        let f = fixture(0);
        let message = queued_message(&f.store).await;
        let mut env = envelope(JobKind::Read, &message);
        env.payload["userId"] = serde_json::json!("someone-else");
        let err = f.processor.process(&env).await.unwrap_err();
        assert!(matches!(err, JobError::Store(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn only_exhausted_send_marks_failed() {
        let f = fixture(0);
        let message = queued_message(&f.store).await;
        let send = envelope(JobKind::Send, &message);

        let retrying = FailDisposition::RetryScheduled {
            delay: Duration::from_secs(1),
        };
        f.processor.on_failed(&send, "boom", retrying).await.unwrap();
        assert_eq!(reload(&f, &message).await.status, MessageStatus::Queued);

        let read = envelope(JobKind::Read, &message);
        f.processor
            .on_failed(&read, "boom", FailDisposition::Exhausted)
            .await
            .unwrap();
        assert_eq!(reload(&f, &message).await.status, MessageStatus::Queued);

        f.processor
            .on_failed(&send, "boom", FailDisposition::Exhausted)
            .await
            .unwrap();
        let failed = reload(&f, &message).await;
        assert_eq!(failed.status, MessageStatus::Failed);
        assert_eq!(failed.failed_reason.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn worker_group_drives_a_send_job() {
        let f = fixture(0);
        let message = queued_message(&f.store).await;
        let job = Job::new(JobKind::Send, message.id, message.user_id.clone());
        f.queue
            .enqueue_job(&job, JobOptions::default().with_id(JobId::from(message.id)).remove_on_complete(true))
            .await
            .unwrap();

        let store = f.store.clone();
        let queue = f.queue.clone();
        let group = WorkerGroup::spawn(2, queue.clone(), Arc::new(f.processor));

        let sent = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let m = reload_from(&store, &message).await;
                if m.status == MessageStatus::Sent {
                    break m;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(sent.sent_at.is_some());

        group.shutdown_and_join().await;
        assert!(queue.get(&JobId::from(message.id)).await.unwrap().is_none());
        assert_eq!(queue.counts().await.unwrap().delayed, 2);
    }

    #[tokio::test]
    async fn worker_group_marks_exhausted_send_failed() {
        let f = fixture(u32::MAX);
        let message = queued_message(&f.store).await;
        let job = Job::new(JobKind::Send, message.id, message.user_id.clone());
        let options = JobOptions::default()
            .with_id(JobId::from(message.id))
            .retry(RetryPolicy::exponential(2, Duration::from_millis(5)));
        f.queue.enqueue_job(&job, options).await.unwrap();

        let store = f.store.clone();
        let queue = f.queue.clone();
        let group = WorkerGroup::spawn(1, queue.clone(), Arc::new(f.processor));

        let failed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let m = reload_from(&store, &message).await;
                if m.status == MessageStatus::Failed {
                    break m;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(failed.failed_reason.unwrap().contains("scripted failure"));

        group.shutdown_and_join().await;
        let job = queue.get(&JobId::from(message.id)).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_made, 2);
    }

    #[tokio::test]
    async fn shutdown_stops_idle_workers() {
        let f = fixture(0);
        let group = WorkerGroup::spawn(3, f.queue.clone(), Arc::new(f.processor));
        tokio::time::timeout(Duration::from_secs(1), group.shutdown_and_join())
            .await
            .unwrap();
    }

    const STATUSES: [MessageStatus; 6] = [
        MessageStatus::Queued,
        MessageStatus::Sending,
        MessageStatus::Sent,
        MessageStatus::Delivered,
        MessageStatus::Read,
        MessageStatus::Failed,
    ];

    const KINDS: [JobKind; 3] = [JobKind::Send, JobKind::Delivered, JobKind::Read];

    fn block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap()
            .block_on(fut)
    }

    /// Put a fresh message into `status`, whatever the path to it.
    async fn message_in(f: &Fixture, status: MessageStatus) -> Message {
        let message = queued_message(&f.store).await;
        let patch = match status {
            MessageStatus::Failed => MessagePatch::failed("earlier failure"),
            other => MessagePatch::advance(other, f.clock.now()),
        };
        f.store
            .update(&message.user_id, &message.id, patch)
            .await
            .unwrap()
    }

    proptest! {
        /// Whatever the stored status, a job writes its own status and stamp.
        #[test]
        fn every_job_writes_its_status_from_any_start(
            start in proptest::sample::select(STATUSES.to_vec()),
            kind in proptest::sample::select(KINDS.to_vec()),
        ) {
            let (written, at) = block_on(async {
                let f = fixture(0);
                let message = message_in(&f, start).await;
                f.clock.advance(Duration::from_secs(5));
                f.processor.process(&envelope(kind, &message)).await.unwrap();
                (reload(&f, &message).await, f.clock.now())
            });

            let (expected, stamp) = match kind {
                JobKind::Send => (MessageStatus::Sent, written.sent_at),
                JobKind::Delivered => (MessageStatus::Delivered, written.delivered_at),
                JobKind::Read => (MessageStatus::Read, written.read_at),
            };
            prop_assert_eq!(written.status, expected);
            prop_assert_eq!(stamp, Some(at));
            if kind == JobKind::Send {
                prop_assert_eq!(written.sending_at, Some(at));
            }
        }
    }

    async fn reload_from(store: &InMemoryMessageStore, message: &Message) -> Message {
        store
            .find_by_owner_and_id(&message.user_id, &message.id)
            .await
            .unwrap()
            .unwrap()
    }
}
