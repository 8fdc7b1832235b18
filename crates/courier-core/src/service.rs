//! Message service: the client-facing orchestrator.
//!
//! Owns submission, owner-scoped reads, retry and cancellation. It never
//! advances a message past QUEUED itself; that is the worker's job.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{
    CourierError, CreateMessage, Job, JobId, JobKind, ListQuery, Message, MessageId,
    MessagePatch, MessageStatus, NewMessage, UserId,
};
use crate::queue::{JobOptions, JobQueue, JobState, QueueError, RetryPolicy};
use crate::store::{MessageStore, StoreError};

/// Queue options for `send` jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendJobPolicy {
    pub retry: RetryPolicy,
}

impl SendJobPolicy {
    /// Job identity is the message id, so a message has at most one send job.
    pub fn options(&self, message_id: MessageId) -> JobOptions {
        JobOptions::default()
            .with_id(JobId::from(message_id))
            .retry(self.retry)
            .remove_on_complete(true)
            .remove_on_fail(false)
    }
}

impl Default for SendJobPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::exponential(3, std::time::Duration::from_secs(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryOutcome {
    /// The retained failed job was re-driven.
    pub retried: bool,
    /// No job was retained; a fresh one was enqueued under the same identity.
    pub enqueued: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedJob {
    pub id: JobId,
    pub kind: JobKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub removed: Vec<RemovedJob>,
}

pub struct MessageService {
    store: Arc<dyn MessageStore>,
    queue: Arc<dyn JobQueue>,
    send_policy: SendJobPolicy,
}

impl MessageService {
    pub fn new(
        store: Arc<dyn MessageStore>,
        queue: Arc<dyn JobQueue>,
        send_policy: SendJobPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            send_policy,
        }
    }

    /// Accept a message for delivery.
    ///
    /// With a `client_message_id`, repeated calls return the first message
    /// unchanged and enqueue nothing further.
    pub async fn create(
        &self,
        user_id: &UserId,
        request: CreateMessage,
    ) -> Result<Message, CourierError> {
        if user_id.as_str().trim().is_empty() {
            return Err(CourierError::Validation("user id must not be empty".into()));
        }
        request.validate()?;

        self.store.ensure_owner(user_id).await?;

        if let Some(token) = request.client_message_id.as_deref()
            && let Some(existing) = self.store.find_by_owner_and_token(user_id, token).await?
        {
            debug!(message_id = %existing.id, user = %user_id, "idempotent replay");
            return Ok(existing);
        }

        let message = match self
            .store
            .create(NewMessage::from_request(user_id.clone(), request))
            .await
        {
            Ok(message) => message,
            Err(StoreError::DuplicateToken { existing }) => {
                // lost a concurrent create with the same token
                debug!(message_id = %existing, user = %user_id, "create race lost, returning winner");
                return self
                    .store
                    .find_by_owner_and_id(user_id, &existing)
                    .await?
                    .ok_or_else(|| CourierError::message_not_found(existing));
            }
            Err(err) => return Err(err.into()),
        };

        self.enqueue_send(&message).await.map_err(|source| {
            warn!(message_id = %message.id, error = %source, "send job not enqueued");
            CourierError::PartialSubmission {
                message_id: message.id,
                source,
            }
        })?;

        info!(message_id = %message.id, user = %user_id, "message queued");
        Ok(message)
    }

    pub async fn get_by_id(
        &self,
        user_id: &UserId,
        id: &MessageId,
    ) -> Result<Message, CourierError> {
        self.store
            .find_by_owner_and_id(user_id, id)
            .await?
            .ok_or_else(|| CourierError::message_not_found(id))
    }

    pub async fn list(
        &self,
        user_id: &UserId,
        query: ListQuery,
    ) -> Result<Vec<Message>, CourierError> {
        query.validate()?;
        Ok(self.store.list(user_id, query).await?)
    }

    /// Put a FAILED message back on the send path under the same job identity.
    pub async fn retry(
        &self,
        user_id: &UserId,
        id: &MessageId,
    ) -> Result<RetryOutcome, CourierError> {
        let message = self.get_by_id(user_id, id).await?;
        if message.status != MessageStatus::Failed {
            return Err(CourierError::InvalidState {
                message_id: message.id,
                status: message.status,
                expected: MessageStatus::Failed,
            });
        }

        self.store
            .update(user_id, id, MessagePatch::requeue())
            .await?;

        let job_id = JobId::from(*id);
        let outcome = if self.queue.get(&job_id).await?.is_some() {
            match self.queue.retry(&job_id).await {
                Ok(()) => {}
                // a concurrent retry re-drove the job first
                Err(QueueError::NotFailed { .. }) => {
                    return Err(CourierError::InvalidState {
                        message_id: *id,
                        status: MessageStatus::Queued,
                        expected: MessageStatus::Failed,
                    });
                }
                Err(err) => return Err(err.into()),
            }
            RetryOutcome {
                retried: true,
                enqueued: false,
            }
        } else {
            self.enqueue_send(&message).await?;
            RetryOutcome {
                retried: false,
                enqueued: true,
            }
        };

        info!(message_id = %id, retried = outcome.retried, enqueued = outcome.enqueued, "message retried");
        Ok(outcome)
    }

    /// Remove the message's pending receipt jobs (`delivered`, `read`).
    ///
    /// The send job and the message status are left alone.
    pub async fn cancel(
        &self,
        user_id: &UserId,
        id: &MessageId,
    ) -> Result<CancelOutcome, CourierError> {
        self.get_by_id(user_id, id).await?;

        let mut outcome = CancelOutcome::default();
        for job in self.queue.list_delayed().await? {
            let Some(kind) = job.kind().filter(|kind| kind.is_receipt()) else {
                continue;
            };
            if job.envelope.message_id().as_ref() != Some(id) {
                continue;
            }
            // a job that became runnable meanwhile may already be running or gone
            match self.queue.remove(job.id()).await {
                Ok(true) => outcome.removed.push(RemovedJob {
                    id: job.id().clone(),
                    kind,
                }),
                Ok(false) => {}
                Err(QueueError::JobLocked(job_id)) => {
                    debug!(message_id = %id, job = %job_id, "receipt already running, not cancelled");
                }
                Err(err) => return Err(err.into()),
            }
        }

        info!(message_id = %id, removed = outcome.removed.len(), "pending receipts cancelled");
        Ok(outcome)
    }

    /// QUEUED messages whose send job is missing or parked in `Failed`.
    ///
    /// Either one means nothing will ever move the message again: a lost
    /// enqueue after create, or a retry that reset the message but did not
    /// reach the queue.
    pub async fn find_orphaned(&self) -> Result<Vec<Message>, CourierError> {
        let mut orphaned = Vec::new();
        for message in self.store.list_by_status(MessageStatus::Queued).await? {
            let job = self.queue.get(&JobId::from(message.id)).await?;
            if job.is_none_or(|job| job.state == JobState::Failed) {
                orphaned.push(message);
            }
        }
        Ok(orphaned)
    }

    /// Re-drive the send job of every orphaned message. Returns their ids.
    pub async fn requeue_orphaned(&self) -> Result<Vec<MessageId>, CourierError> {
        let mut requeued = Vec::new();
        for message in self.find_orphaned().await? {
            let job_id = JobId::from(message.id);
            match self.queue.get(&job_id).await? {
                Some(job) if job.state == JobState::Failed => self.queue.retry(&job_id).await?,
                Some(_) => continue,
                None => self.enqueue_send(&message).await?,
            }
            warn!(message_id = %message.id, "orphaned message re-driven");
            requeued.push(message.id);
        }
        Ok(requeued)
    }

    async fn enqueue_send(&self, message: &Message) -> Result<(), QueueError> {
        let job = Job::new(JobKind::Send, message.id, message.user_id.clone());
        let enqueued = self
            .queue
            .enqueue_job(&job, self.send_policy.options(message.id))
            .await?;
        if enqueued.deduplicated {
            debug!(message_id = %message.id, "send job already present");
        }
        Ok(())
    }
}
