pub mod store;
pub mod memory_store;
pub mod file_store;

#[cfg(feature = "dynamodb-backend")]
pub mod dynamo_store;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Role;

pub use file_store::FileConversationStore;
pub use memory_store::MemoryConversationStore;
pub use store::{ConversationStore, StoreSession};

/// One message in a conversation. Never modified after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp,
        }
    }
}

/// Per-user conversation record.
///
/// Stored as `{"messages": [{role, content, timestamp}], "expiresAt": ...}`.
/// `expires_at` is fixed when the conversation starts; appending turns
/// does not extend it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(default)]
    pub messages: Vec<Turn>,
    pub expires_at: DateTime<Utc>,
}

impl Conversation {
    /// Start an empty conversation that expires `ttl` after `now`.
    pub fn new(now: DateTime<Utc>, ttl: Duration) -> Self {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            messages: Vec::new(),
            expires_at,
        }
    }

    /// A conversation is still usable at exactly `expires_at`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn push_turn(&mut self, role: Role, content: impl Into<String>, timestamp: DateTime<Utc>) {
        self.messages.push(Turn::new(role, content, timestamp));
    }

    pub fn history(&self) -> &[Turn] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
