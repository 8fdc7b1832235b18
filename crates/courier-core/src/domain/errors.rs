//! Errors surfaced by the service and by job handlers.

use thiserror::Error;

use super::ids::MessageId;
use super::job::JobDecodeError;
use super::message::MessageStatus;
use crate::ports::ProviderError;
use crate::queue::QueueError;
use crate::store::StoreError;

/// Caller-facing error taxonomy of [`crate::service::MessageService`].
#[derive(Debug, Error)]
pub enum CourierError {
    /// Missing, or owned by someone else. The two are deliberately the same.
    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("message {message_id} is {status}, expected {expected}")]
    InvalidState {
        message_id: MessageId,
        status: MessageStatus,
        expected: MessageStatus,
    },

    #[error("invalid input: {0}")]
    Validation(String),

    /// The record exists but its send job does not. Not healed here; see
    /// [`crate::service::MessageService::requeue_orphaned`].
    #[error("message {message_id} was stored but its send job was not enqueued: {source}")]
    PartialSubmission {
        message_id: MessageId,
        #[source]
        source: QueueError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl CourierError {
    pub fn message_not_found(id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            resource: format!("message {id}"),
        }
    }
}

/// Failure of a single job execution, reported back to the queue.
#[derive(Debug, Error)]
pub enum JobError {
    /// Transient; the queue's retry policy decides what happens next.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Decode(#[from] JobDecodeError),
}
