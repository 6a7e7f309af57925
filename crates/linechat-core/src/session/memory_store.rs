use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::SessionError;

use super::store::{ConversationStore, StoreSession};
use super::Conversation;

/// In-process store for local runs and tests.
///
/// Records are kept serialized so every read goes through the same decode
/// path as the durable backends.
#[derive(Clone, Default)]
pub struct MemoryConversationStore {
    records: Arc<DashMap<String, String>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn open(&self) -> Result<Box<dyn StoreSession>, SessionError> {
        Ok(Box::new(MemorySession {
            records: self.records.clone(),
        }))
    }
}

struct MemorySession {
    records: Arc<DashMap<String, String>>,
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn get(&self, user_id: &str) -> Result<Option<Conversation>, SessionError> {
        let Some(raw) = self.records.get(user_id).map(|r| r.value().clone()) else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| SessionError::Corrupt(format!("{user_id}: {e}")))
    }

    async fn set(&self, user_id: &str, conversation: &Conversation) -> Result<(), SessionError> {
        let raw = serde_json::to_string(conversation)
            .map_err(|e| SessionError::Write(e.to_string()))?;
        self.records.insert(user_id.to_string(), raw);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), SessionError> {
        Ok(())
    }
}
