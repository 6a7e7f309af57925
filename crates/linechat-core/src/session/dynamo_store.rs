use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use tracing::debug;

use crate::error::SessionError;

use super::store::{ConversationStore, StoreSession};
use super::Conversation;

/// DynamoDB-based conversation store.
///
/// One item per user: `user_id` (partition key), `conversation` (JSON),
/// `expires_at` (epoch seconds, usable as the table's TTL attribute) and
/// `updated_at`.
pub struct DynamoConversationStore {
    client: Client,
    table_name: String,
}

impl DynamoConversationStore {
    pub fn new(client: Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }

    /// Build a client from the default AWS credential chain.
    pub async fn from_env(table_name: impl Into<String>) -> Self {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&aws_config), table_name)
    }
}

#[async_trait]
impl ConversationStore for DynamoConversationStore {
    fn name(&self) -> &str {
        "dynamodb"
    }

    async fn open(&self) -> Result<Box<dyn StoreSession>, SessionError> {
        // The SDK client pools its own connections; a session is a cheap handle.
        Ok(Box::new(DynamoSession {
            client: self.client.clone(),
            table_name: self.table_name.clone(),
        }))
    }
}

struct DynamoSession {
    client: Client,
    table_name: String,
}

#[async_trait]
impl StoreSession for DynamoSession {
    async fn get(&self, user_id: &str) -> Result<Option<Conversation>, SessionError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("user_id", AttributeValue::S(user_id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| SessionError::Read(format!("DynamoDB get_item: {}", e)))?;

        match output.item {
            Some(item) => parse_conversation_from_item(&item).map(Some),
            None => Ok(None),
        }
    }

    async fn set(&self, user_id: &str, conversation: &Conversation) -> Result<(), SessionError> {
        let conversation_json = serde_json::to_string(conversation)
            .map_err(|e| SessionError::Write(e.to_string()))?;
        let expires_at = conversation.expires_at.timestamp().to_string();
        let updated_at = chrono::Utc::now().to_rfc3339();

        self.client
            .put_item()
            .table_name(&self.table_name)
            .item("user_id", AttributeValue::S(user_id.to_string()))
            .item("conversation", AttributeValue::S(conversation_json))
            .item("expires_at", AttributeValue::N(expires_at))
            .item("updated_at", AttributeValue::S(updated_at))
            .send()
            .await
            .map_err(|e| SessionError::Write(format!("DynamoDB put_item: {}", e)))?;

        debug!("DynamoDB put_item for {} ({} turns)", user_id, conversation.len());
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), SessionError> {
        Ok(())
    }
}

fn parse_conversation_from_item(
    item: &HashMap<String, AttributeValue>,
) -> Result<Conversation, SessionError> {
    let raw = item
        .get("conversation")
        .and_then(|v| v.as_s().ok())
        .ok_or_else(|| SessionError::Corrupt("missing conversation attribute".to_string()))?;
    serde_json::from_str(raw).map_err(|e| SessionError::Corrupt(e.to_string()))
}
