//! Message record and its delivery lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::CourierError;
use super::ids::{MessageId, UserId};

/// Upper bound on body length, in characters.
pub const MAX_BODY_CHARS: usize = 1000;

/// Delivery status of a message.
///
/// State transitions:
/// - Queued -> Sending -> Sent -> Delivered -> Read
/// - Sending -> Failed (send job exhausted its attempts)
/// - Failed -> Queued (explicit retry only)
///
/// The store does not enforce these; see [`MessageStatus::can_advance_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Queued,
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Position on the happy path. `Failed` sits off it.
    pub fn rank(self) -> Option<u8> {
        match self {
            MessageStatus::Queued => Some(0),
            MessageStatus::Sending => Some(1),
            MessageStatus::Sent => Some(2),
            MessageStatus::Delivered => Some(3),
            MessageStatus::Read => Some(4),
            MessageStatus::Failed => None,
        }
    }

    /// Is `next` a legal single step from `self`?
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Queued, Sending)
                | (Sending, Sent)
                | (Sent, Delivered)
                | (Delivered, Read)
                | (Sending, Failed)
                | (Failed, Queued)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Read | MessageStatus::Failed)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageStatus::Queued => "QUEUED",
            MessageStatus::Sending => "SENDING",
            MessageStatus::Sent => "SENT",
            MessageStatus::Delivered => "DELIVERED",
            MessageStatus::Read => "READ",
            MessageStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// A message as persisted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub user_id: UserId,
    pub to_number: String,
    pub body: String,
    pub client_message_id: Option<String>,
    pub status: MessageStatus,
    pub queued_at: DateTime<Utc>,
    pub sending_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
}

impl Message {
    /// Minimal view returned to a submitting client.
    pub fn receipt(&self) -> Receipt {
        Receipt {
            id: self.id,
            status: self.status,
            queued_at: self.queued_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub id: MessageId,
    pub status: MessageStatus,
    pub queued_at: DateTime<Utc>,
}

/// Client input for a new message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessage {
    pub to_number: String,
    pub body: String,
    #[serde(default)]
    pub client_message_id: Option<String>,
}

impl CreateMessage {
    pub fn new(to_number: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            to_number: to_number.into(),
            body: body.into(),
            client_message_id: None,
        }
    }

    pub fn with_client_id(mut self, token: impl Into<String>) -> Self {
        self.client_message_id = Some(token.into());
        self
    }

    /// Reject malformed input before anything is persisted or enqueued.
    pub fn validate(&self) -> Result<(), CourierError> {
        if self.to_number.trim().is_empty() {
            return Err(CourierError::Validation("toNumber must not be empty".into()));
        }
        let len = self.body.chars().count();
        if !(1..=MAX_BODY_CHARS).contains(&len) {
            return Err(CourierError::Validation(format!(
                "body must be 1..={MAX_BODY_CHARS} characters, got {len}"
            )));
        }
        if let Some(token) = &self.client_message_id
            && token.trim().is_empty()
        {
            return Err(CourierError::Validation(
                "clientMessageId must not be blank".into(),
            ));
        }
        Ok(())
    }
}

/// A fully-formed insert for the store (id and timestamps are assigned there).
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub user_id: UserId,
    pub to_number: String,
    pub body: String,
    pub client_message_id: Option<String>,
}

impl NewMessage {
    pub fn from_request(user_id: UserId, req: CreateMessage) -> Self {
        Self {
            user_id,
            to_number: req.to_number,
            body: req.body,
            client_message_id: req.client_message_id,
        }
    }
}

/// Field-level change: leave alone, or overwrite with a value (possibly none).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Field<T> {
    #[default]
    Keep,
    Set(T),
}

impl<T> Field<T> {
    fn apply_to(self, slot: &mut T) {
        if let Field::Set(value) = self {
            *slot = value;
        }
    }
}

/// Partial update applied by [`crate::store::MessageStore::update`].
///
/// Handlers only ever build absolute assignments, so applying the same patch
/// twice leaves the record as applying it once (modulo the timestamp value).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessagePatch {
    pub status: Field<MessageStatus>,
    pub sending_at: Field<Option<DateTime<Utc>>>,
    pub sent_at: Field<Option<DateTime<Utc>>>,
    pub delivered_at: Field<Option<DateTime<Utc>>>,
    pub read_at: Field<Option<DateTime<Utc>>>,
    pub failed_reason: Field<Option<String>>,
}

impl MessagePatch {
    /// Set `status` and stamp the timestamp that belongs to it.
    pub fn advance(status: MessageStatus, at: DateTime<Utc>) -> Self {
        let mut patch = Self {
            status: Field::Set(status),
            ..Self::default()
        };
        match status {
            MessageStatus::Sending => patch.sending_at = Field::Set(Some(at)),
            MessageStatus::Sent => patch.sent_at = Field::Set(Some(at)),
            MessageStatus::Delivered => patch.delivered_at = Field::Set(Some(at)),
            MessageStatus::Read => patch.read_at = Field::Set(Some(at)),
            // queued_at is set once at creation; failure has no timestamp
            MessageStatus::Queued | MessageStatus::Failed => {}
        }
        patch
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: Field::Set(MessageStatus::Failed),
            failed_reason: Field::Set(Some(reason.into())),
            ..Self::default()
        }
    }

    /// Back to QUEUED with every downstream field cleared.
    pub fn requeue() -> Self {
        Self {
            status: Field::Set(MessageStatus::Queued),
            sending_at: Field::Set(None),
            sent_at: Field::Set(None),
            delivered_at: Field::Set(None),
            read_at: Field::Set(None),
            failed_reason: Field::Set(None),
        }
    }

    pub fn apply(self, message: &mut Message) {
        self.status.apply_to(&mut message.status);
        self.sending_at.apply_to(&mut message.sending_at);
        self.sent_at.apply_to(&mut message.sent_at);
        self.delivered_at.apply_to(&mut message.delivered_at);
        self.read_at.apply_to(&mut message.read_at);
        self.failed_reason.apply_to(&mut message.failed_reason);
    }
}

/// Offset pagination for [`crate::service::MessageService::list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    pub page: u32,
    pub limit: u32,
}

impl ListQuery {
    pub const MAX_LIMIT: u32 = 100;

    pub fn new(page: u32, limit: u32) -> Self {
        Self { page, limit }
    }

    pub fn validate(&self) -> Result<(), CourierError> {
        if self.page == 0 {
            return Err(CourierError::Validation("page starts at 1".into()));
        }
        if self.limit == 0 || self.limit > Self::MAX_LIMIT {
            return Err(CourierError::Validation(format!(
                "limit must be 1..={}",
                Self::MAX_LIMIT
            )));
        }
        Ok(())
    }

    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.limit as usize
    }
}

impl Default for ListQuery {
    fn default() -> Self {
        Self { page: 1, limit: 20 }
    }
}
