#[cfg(feature = "http-api")]
pub mod http;

use std::sync::Arc;

use tracing::info;

use crate::config::{Config, StoreBackend, StoreConfig};
use crate::conversation::ConversationManager;
use crate::error::LinechatError;
use crate::provider;
use crate::session::{ConversationStore, FileConversationStore, MemoryConversationStore};

/// Build the conversation store selected by `config`.
pub async fn create_store(config: &StoreConfig) -> Result<Arc<dyn ConversationStore>, LinechatError> {
    let store: Arc<dyn ConversationStore> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryConversationStore::new()),
        StoreBackend::File => Arc::new(FileConversationStore::new(config.data_path())),
        #[cfg(feature = "dynamodb-backend")]
        StoreBackend::Dynamodb => Arc::new(
            crate::session::dynamo_store::DynamoConversationStore::from_env(config.table_name()).await,
        ),
        #[cfg(not(feature = "dynamodb-backend"))]
        StoreBackend::Dynamodb => {
            return Err(crate::error::ConfigError::Invalid(
                "dynamodb store requires the dynamodb-backend feature".to_string(),
            )
            .into())
        }
    };
    info!("Conversation store: {}", store.name());
    Ok(store)
}

/// Wire store and provider into a manager using `config`.
pub async fn create_manager(config: &Config) -> Result<ConversationManager, LinechatError> {
    let store = create_store(&config.store).await?;
    let provider = provider::create_provider(&config.provider)?;
    info!(
        "Conversation manager: model={}, ttl={}m, failure_policy={:?}",
        provider.model(),
        config.conversation.ttl_minutes,
        config.conversation.failure_policy
    );
    Ok(ConversationManager::new(
        store,
        Arc::from(provider),
        &config.conversation,
    ))
}
