use std::time::Duration;

/// Core error types for linechat.
#[derive(Debug, thiserror::Error)]
pub enum LinechatError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("No API key configured")]
    NoApiKey,
}

/// Failures of the completion API.
///
/// Only [`ProviderError::RateLimited`] means "request volume exceeded";
/// every other variant is an ordinary upstream failure.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error ({status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Response contained no choices")]
    EmptyChoices,
}

impl ProviderError {
    pub fn is_rate_limited(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. } => true,
            ProviderError::Http(_)
            | ProviderError::Api { .. }
            | ProviderError::Parse(_)
            | ProviderError::EmptyChoices => false,
        }
    }
}

/// LINE API and webhook failures.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The LINE API could not be reached or its response could not be read.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The LINE API answered with a non-success status.
    #[error("LINE API error ({status}): {body}")]
    Send { status: u16, body: String },

    #[error("Invalid webhook payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Conversation store failures. "No conversation for this user" is not an
/// error and never surfaces here.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to open store: {0}")]
    Open(String),

    #[error("Failed to read conversation: {0}")]
    Read(String),

    #[error("Failed to write conversation: {0}")]
    Write(String),

    #[error("Corrupt conversation record: {0}")]
    Corrupt(String),

    #[error("Invalid user key: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, LinechatError>;
