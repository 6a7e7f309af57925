pub mod openai_compat;

use async_trait::async_trait;

use crate::config::ProviderConfig;
use crate::error::{ConfigError, ProviderError};
use crate::session::Turn;

/// Trait for chat-completion providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send `prior` in order followed by `text` as the final user message and
    /// return the first generated reply. Implementations never retry.
    async fn chat(&self, prior: &[Turn], text: &str) -> Result<String, ProviderError>;

    /// Model identifier requests are sent with.
    fn model(&self) -> &str;
}

/// Create the completion provider described by `config`.
pub fn create_provider(config: &ProviderConfig) -> Result<Box<dyn LlmProvider>, ConfigError> {
    if config.api_key.is_empty() {
        return Err(ConfigError::NoApiKey);
    }

    let provider = openai_compat::OpenAiCompatProvider::new(
        config.api_key.clone(),
        config.api_base.clone(),
        config.model.clone(),
    )
    .with_sampling(config.max_tokens, config.temperature);

    Ok(Box::new(provider))
}
