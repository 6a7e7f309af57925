use async_trait::async_trait;

use crate::error::SessionError;
use crate::session::Conversation;

/// Trait for conversation storage backends.
///
/// A store hands out one [`StoreSession`] per webhook invocation, mirroring
/// a client connection that is opened for the request and released after it.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Backend name for logs (e.g. "memory", "file", "dynamodb").
    fn name(&self) -> &str;

    /// Open a session scoped to a single invocation.
    async fn open(&self) -> Result<Box<dyn StoreSession>, SessionError>;
}

/// Keyed access to conversation records, keyed by user id.
#[async_trait]
pub trait StoreSession: Send + Sync {
    /// Load a user's conversation. `Ok(None)` means the user has none yet.
    async fn get(&self, user_id: &str) -> Result<Option<Conversation>, SessionError>;

    /// Replace the user's whole conversation record.
    async fn set(&self, user_id: &str, conversation: &Conversation) -> Result<(), SessionError>;

    /// Release whatever the session holds.
    async fn close(self: Box<Self>) -> Result<(), SessionError>;
}
