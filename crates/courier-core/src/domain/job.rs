//! Job kinds and the envelope the queue carries.
//!
//! The queue only knows a job by name and a JSON payload ([`JobEnvelope`]).
//! Workers decode that into [`Job`], so dispatch is an exhaustive match.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{JobId, MessageId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Send,
    Delivered,
    Read,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Send => "send",
            JobKind::Delivered => "delivered",
            JobKind::Read => "read",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "send" => Some(JobKind::Send),
            "delivered" => Some(JobKind::Delivered),
            "read" => Some(JobKind::Read),
            _ => None,
        }
    }

    /// Receipt kinds are the delayed follow-ups scheduled after a send.
    pub fn is_receipt(self) -> bool {
        matches!(self, JobKind::Delivered | JobKind::Read)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload shared by every kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub message_id: MessageId,
    pub user_id: UserId,
}

/// A decoded unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Send(MessageRef),
    Delivered(MessageRef),
    Read(MessageRef),
}

impl Job {
    pub fn new(kind: JobKind, message_id: MessageId, user_id: UserId) -> Self {
        let target = MessageRef {
            message_id,
            user_id,
        };
        match kind {
            JobKind::Send => Job::Send(target),
            JobKind::Delivered => Job::Delivered(target),
            JobKind::Read => Job::Read(target),
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Job::Send(_) => JobKind::Send,
            Job::Delivered(_) => JobKind::Delivered,
            Job::Read(_) => JobKind::Read,
        }
    }

    pub fn target(&self) -> &MessageRef {
        match self {
            Job::Send(t) | Job::Delivered(t) | Job::Read(t) => t,
        }
    }

    pub fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self.target())
    }

    pub fn decode(envelope: &JobEnvelope) -> Result<Self, JobDecodeError> {
        let kind = JobKind::from_name(&envelope.name)
            .ok_or_else(|| JobDecodeError::UnknownKind(envelope.name.clone()))?;
        let target: MessageRef = serde_json::from_value(envelope.payload.clone())
            .map_err(|source| JobDecodeError::Payload { kind, source })?;
        Ok(Job::new(kind, target.message_id, target.user_id))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobDecodeError {
    #[error("unknown job name {0:?}")]
    UnknownKind(String),

    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: JobKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Name + payload (+ identity), as stored by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: JobId,
    pub name: String,
    pub payload: serde_json::Value,
}

impl JobEnvelope {
    pub fn new(id: JobId, name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id,
            name: name.into(),
            payload,
        }
    }

    pub fn kind(&self) -> Option<JobKind> {
        JobKind::from_name(&self.name)
    }

    /// Message the payload points at, if it has one.
    pub fn message_id(&self) -> Option<MessageId> {
        self.payload
            .get("messageId")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }
}
