//! Message persistence port and its in-memory implementation.

mod memory;

pub use memory::InMemoryMessageStore;

use async_trait::async_trait;

use crate::domain::{ListQuery, Message, MessageId, MessagePatch, MessageStatus, NewMessage, UserId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// No record under this owner (foreign ids look exactly like missing ones).
    #[error("message {id} not found for user {user_id}")]
    NotFound { user_id: UserId, id: MessageId },

    /// Unique (user, clientMessageId) index hit; `existing` won the race.
    #[error("clientMessageId already used by message {existing}")]
    DuplicateToken { existing: MessageId },
}

/// Key-addressable message store.
///
/// Every read and write is scoped by owner; ownership is never inferred from
/// the id alone. Nothing here deletes a message.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Upsert a stub owner record.
    async fn ensure_owner(&self, user_id: &UserId) -> Result<(), StoreError>;

    /// Assign an id, set QUEUED and `queued_at = now`, and persist.
    async fn create(&self, new: NewMessage) -> Result<Message, StoreError>;

    async fn find_by_owner_and_token(
        &self,
        user_id: &UserId,
        token: &str,
    ) -> Result<Option<Message>, StoreError>;

    async fn find_by_owner_and_id(
        &self,
        user_id: &UserId,
        id: &MessageId,
    ) -> Result<Option<Message>, StoreError>;

    /// Unconditional field patch. Returns the updated record.
    async fn update(
        &self,
        user_id: &UserId,
        id: &MessageId,
        patch: MessagePatch,
    ) -> Result<Message, StoreError>;

    /// Newest first by `queued_at`, offset/limit paged.
    async fn list(&self, user_id: &UserId, query: ListQuery) -> Result<Vec<Message>, StoreError>;

    /// All messages currently in `status`, across owners. Maintenance only.
    async fn list_by_status(&self, status: MessageStatus) -> Result<Vec<Message>, StoreError>;
}
