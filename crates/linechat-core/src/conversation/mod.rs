//! Conversation lifecycle: load a user's history, drop it if expired, append
//! the new user turn, ask the completion API, append the reply and persist.
//!
//! Every invocation ends in exactly one [`Outcome`]. Nothing is retried here;
//! load, completion and persist are each attempted once.

pub mod locks;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConversationConfig, FailurePolicy};
use crate::error::{ProviderError, SessionError};
use crate::provider::LlmProvider;
use crate::session::{Conversation, ConversationStore, StoreSession};
use crate::types::Role;

pub use locks::UserLocks;

/// Terminal classification of one invocation.
#[derive(Debug)]
pub enum Outcome {
    /// Reply generated and the updated conversation persisted.
    Replied {
        reply: String,
        conversation: Conversation,
    },
    /// The completion API rejected the request for volume.
    Throttled { retry_after: Option<Duration> },
    /// Any other completion failure.
    UpstreamFailure(ProviderError),
    /// A reply was generated but the conversation could not be written.
    PersistFailure {
        reply: String,
        conversation: Conversation,
        error: SessionError,
    },
    /// The store could not be opened or read.
    FatalStoreError(SessionError),
    /// The caller cancelled before the next store or completion call.
    Cancelled,
}

impl Outcome {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Replied { .. } => "replied",
            Outcome::Throttled { .. } => "throttled",
            Outcome::UpstreamFailure(_) => "upstream_failure",
            Outcome::PersistFailure { .. } => "persist_failure",
            Outcome::FatalStoreError(_) => "fatal_store_error",
            Outcome::Cancelled => "cancelled",
        }
    }

    pub fn is_replied(&self) -> bool {
        matches!(self, Outcome::Replied { .. })
    }
}

/// Orchestrates one webhook message against the store and the completion API.
pub struct ConversationManager {
    store: Arc<dyn ConversationStore>,
    provider: Arc<dyn LlmProvider>,
    ttl: Duration,
    failure_policy: FailurePolicy,
    locks: Option<UserLocks>,
}

impl ConversationManager {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        provider: Arc<dyn LlmProvider>,
        config: &ConversationConfig,
    ) -> Self {
        Self {
            store,
            provider,
            ttl: config.ttl(),
            failure_policy: config.failure_policy,
            locks: config.serialize_per_user.then(UserLocks::new),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Process one text message from `user_id` received at `now`.
    pub async fn handle(&self, user_id: &str, text: &str, now: DateTime<Utc>) -> Outcome {
        self.handle_with_cancel(user_id, text, now, &CancellationToken::new())
            .await
    }

    /// Like [`handle`](Self::handle), stopping at the next I/O boundary once
    /// `cancel` fires.
    pub async fn handle_with_cancel(
        &self,
        user_id: &str,
        text: &str,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Outcome {
        let guard = match &self.locks {
            Some(locks) => tokio::select! {
                guard = locks.lock(user_id) => Some(guard),
                _ = cancel.cancelled() => return Outcome::Cancelled,
            },
            None => None,
        };

        let outcome = self.open_and_run(user_id, text, now, cancel).await;

        drop(guard);
        if let Some(locks) = &self.locks {
            locks.release(user_id);
        }

        info!(user_id = %user_id, outcome = outcome.kind(), "Conversation invocation finished");
        outcome
    }

    async fn open_and_run(
        &self,
        user_id: &str,
        text: &str,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Outcome {
        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        let session = match self.store.open().await {
            Ok(session) => session,
            Err(e) => {
                error!(user_id = %user_id, store = self.store.name(), "Failed to open conversation store: {}", e);
                return Outcome::FatalStoreError(e);
            }
        };

        let outcome = self.run(session.as_ref(), user_id, text, now, cancel).await;

        // Closed on every path once opened; a close failure does not change the outcome.
        if let Err(e) = session.close().await {
            warn!(user_id = %user_id, "Failed to close conversation store: {}", e);
        }

        outcome
    }

    async fn run(
        &self,
        session: &dyn StoreSession,
        user_id: &str,
        text: &str,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Outcome {
        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        let loaded = match session.get(user_id).await {
            Ok(conv) => conv,
            Err(e) => {
                error!(user_id = %user_id, "Failed to load conversation: {}", e);
                return Outcome::FatalStoreError(e);
            }
        };

        let mut conversation = match loaded {
            Some(conv) if !conv.is_expired(now) => conv,
            Some(conv) => {
                debug!(user_id = %user_id, expired_at = %conv.expires_at, "Conversation expired, starting fresh");
                Conversation::new(now, self.ttl)
            }
            None => Conversation::new(now, self.ttl),
        };

        conversation.push_turn(Role::User, text, now);

        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        // The history already ends with this user turn; the provider appends
        // `text` once more as the explicit final prompt.
        let reply = match self.provider.chat(conversation.history(), text).await {
            Ok(reply) => reply,
            Err(err) => {
                self.apply_failure_policy(session, user_id, &conversation).await;
                return match err {
                    ProviderError::RateLimited { retry_after } => {
                        warn!(user_id = %user_id, ?retry_after, "Completion API rate limited");
                        Outcome::Throttled { retry_after }
                    }
                    other => {
                        error!(user_id = %user_id, model = self.provider.model(), "Completion API failed: {}", other);
                        Outcome::UpstreamFailure(other)
                    }
                };
            }
        };

        let replied_at = Utc::now().max(now);
        conversation.push_turn(Role::Assistant, reply.clone(), replied_at);

        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        match session.set(user_id, &conversation).await {
            Ok(()) => {
                debug!(user_id = %user_id, turns = conversation.len(), "Conversation persisted");
                Outcome::Replied {
                    reply,
                    conversation,
                }
            }
            Err(e) => {
                error!(user_id = %user_id, "Failed to persist conversation: {}", e);
                Outcome::PersistFailure {
                    reply,
                    conversation,
                    error: e,
                }
            }
        }
    }

    async fn apply_failure_policy(
        &self,
        session: &dyn StoreSession,
        user_id: &str,
        conversation: &Conversation,
    ) {
        match self.failure_policy {
            FailurePolicy::DiscardTurn => {}
            FailurePolicy::KeepUserTurn => {
                if let Err(e) = session.set(user_id, conversation).await {
                    warn!(user_id = %user_id, "Failed to keep user turn after completion failure: {}", e);
                }
            }
        }
    }
}
