//! In-memory message store.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{MessageStore, StoreError};
use crate::domain::{
    ListQuery, Message, MessageId, MessagePatch, MessageStatus, NewMessage, UserId,
};
use crate::ports::{Clock, IdGenerator, SystemClock, UlidGenerator};

#[derive(Default)]
struct InMemoryStoreState {
    owners: HashSet<UserId>,

    /// All messages (single source of truth).
    messages: HashMap<MessageId, Message>,

    /// Unique secondary index on (user, clientMessageId).
    tokens: HashMap<(UserId, String), MessageId>,
}

impl InMemoryStoreState {
    fn owned(&self, user_id: &UserId, id: &MessageId) -> Option<&Message> {
        self.messages.get(id).filter(|m| &m.user_id == user_id)
    }
}

pub struct InMemoryMessageStore {
    state: Mutex<InMemoryStoreState>,
    clock: Arc<dyn Clock>,
    ids: Box<dyn IdGenerator>,
}

impl InMemoryMessageStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let ids = Box::new(UlidGenerator::new(Arc::clone(&clock)));
        Self {
            state: Mutex::new(InMemoryStoreState::default()),
            clock,
            ids,
        }
    }

    pub async fn has_owner(&self, user_id: &UserId) -> bool {
        self.state.lock().await.owners.contains(user_id)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn ensure_owner(&self, user_id: &UserId) -> Result<(), StoreError> {
        self.state.lock().await.owners.insert(user_id.clone());
        Ok(())
    }

    async fn create(&self, new: NewMessage) -> Result<Message, StoreError> {
        let mut state = self.state.lock().await;

        let token_key = new
            .client_message_id
            .clone()
            .map(|token| (new.user_id.clone(), token));
        if let Some(key) = &token_key
            && let Some(existing) = state.tokens.get(key)
        {
            return Err(StoreError::DuplicateToken {
                existing: *existing,
            });
        }

        let message = Message {
            id: self.ids.generate_message_id(),
            user_id: new.user_id,
            to_number: new.to_number,
            body: new.body,
            client_message_id: new.client_message_id,
            status: MessageStatus::Queued,
            queued_at: self.clock.now(),
            sending_at: None,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            failed_reason: None,
        };

        if let Some(key) = token_key {
            state.tokens.insert(key, message.id);
        }
        state.messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn find_by_owner_and_token(
        &self,
        user_id: &UserId,
        token: &str,
    ) -> Result<Option<Message>, StoreError> {
        let state = self.state.lock().await;
        let found = state
            .tokens
            .get(&(user_id.clone(), token.to_string()))
            .and_then(|id| state.owned(user_id, id))
            .cloned();
        Ok(found)
    }

    async fn find_by_owner_and_id(
        &self,
        user_id: &UserId,
        id: &MessageId,
    ) -> Result<Option<Message>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.owned(user_id, id).cloned())
    }

    async fn update(
        &self,
        user_id: &UserId,
        id: &MessageId,
        patch: MessagePatch,
    ) -> Result<Message, StoreError> {
        let mut state = self.state.lock().await;
        let message = state
            .messages
            .get_mut(id)
            .filter(|m| &m.user_id == user_id)
            .ok_or_else(|| StoreError::NotFound {
                user_id: user_id.clone(),
                id: *id,
            })?;
        patch.apply(message);
        Ok(message.clone())
    }

    async fn list(&self, user_id: &UserId, query: ListQuery) -> Result<Vec<Message>, StoreError> {
        let state = self.state.lock().await;
        let mut owned: Vec<&Message> = state
            .messages
            .values()
            .filter(|m| &m.user_id == user_id)
            .collect();
        owned.sort_by_key(|m| Reverse((m.queued_at, m.id)));
        Ok(owned
            .into_iter()
            .skip(query.offset())
            .take(query.limit as usize)
            .cloned()
            .collect())
    }

    async fn list_by_status(&self, status: MessageStatus) -> Result<Vec<Message>, StoreError> {
        let state = self.state.lock().await;
        let mut found: Vec<Message> = state
            .messages
            .values()
            .filter(|m| m.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|m| (m.queued_at, m.id));
        Ok(found)
    }
}
