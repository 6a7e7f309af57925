use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Root configuration for linechat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[derive(Default)]
pub struct Config {
    pub conversation: ConversationConfig,
    pub provider: ProviderConfig,
    pub store: StoreConfig,
    pub line: LineConfig,
    pub gateway: GatewayConfig,
}

/// What happens to the user's turn when the completion call fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailurePolicy {
    /// Drop the in-memory user turn; the stored conversation stays as it was.
    #[default]
    DiscardTurn,
    /// Persist the user turn even though no reply was produced.
    KeepUserTurn,
}

impl FromStr for FailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "discard" | "discardturn" | "discard_turn" => Ok(FailurePolicy::DiscardTurn),
            "keep" | "keepuserturn" | "keep_user_turn" => Ok(FailurePolicy::KeepUserTurn),
            other => Err(ConfigError::Invalid(format!("unknown failure policy: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConversationConfig {
    pub ttl_minutes: u64,
    pub failure_policy: FailurePolicy,
    /// Serialize invocations per user. Off by default: concurrent messages
    /// from one user race and the later write wins.
    pub serialize_per_user: bool,
    /// Send the generated reply even when it could not be persisted.
    pub deliver_on_persist_failure: bool,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: 30,
            failure_policy: FailurePolicy::default(),
            serialize_per_user: false,
            deliver_on_persist_failure: false,
        }
    }
}

impl ConversationConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_minutes.saturating_mul(60))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub api_key: String,
    pub api_base: Option<String>,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: None,
            model: "gpt-3.5-turbo".to_string(),
            max_tokens: None,
            temperature: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    File,
    Dynamodb,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "file" => Ok(StoreBackend::File),
            "dynamodb" | "dynamo" => Ok(StoreBackend::Dynamodb),
            other => Err(ConfigError::Invalid(format!("unknown store backend: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Table (DynamoDB) or collection name holding one record per user.
    pub table: String,
    /// Project or tenant the table belongs to. When set, it prefixes the
    /// table name as `{project}-{table}`.
    pub project: String,
    /// Directory for the file backend. Defaults to `~/.linechat/conversations`.
    pub path: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::File,
            table: "conversations".to_string(),
            project: String::new(),
            path: None,
        }
    }
}

impl StoreConfig {
    /// Table name the backend actually addresses.
    pub fn table_name(&self) -> String {
        if self.project.is_empty() {
            self.table.clone()
        } else {
            format!("{}-{}", self.project, self.table)
        }
    }

    pub fn data_path(&self) -> PathBuf {
        self.path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| get_data_dir().join("conversations"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LineConfig {
    pub channel_secret: String,
    pub channel_access_token: String,
    pub api_base: String,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            channel_secret: String::new(),
            channel_access_token: String::new(),
            api_base: "https://api.line.me".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

// ====== Config loading/saving ======

/// Load configuration from environment variables.
///
/// Priority:
/// 1. `LINECHAT_CONFIG` env var, full JSON config
/// 2. Individual env vars (merged on top of the file or defaults)
/// 3. File fallback (`~/.linechat/config.json`)
pub fn load_config_from_env() -> Config {
    if let Ok(json) = std::env::var("LINECHAT_CONFIG") {
        match serde_json::from_str::<Config>(&json) {
            Ok(config) => return config,
            Err(e) => {
                tracing::warn!("Failed to parse LINECHAT_CONFIG: {}", e);
            }
        }
    }

    let mut cfg = load_config(None);

    // Completion API
    if let Ok(v) = std::env::var("OPENAI_API_KEY") {
        cfg.provider.api_key = v;
    }
    if let Ok(v) = std::env::var("OPENAI_API_BASE") {
        cfg.provider.api_base = Some(v);
    }
    if let Ok(v) = std::env::var("LINECHAT_MODEL") {
        cfg.provider.model = v;
    }

    // Conversation lifecycle
    if let Ok(v) = std::env::var("LINECHAT_CONVERSATION_TTL_MINUTES") {
        match v.trim().parse() {
            Ok(minutes) => cfg.conversation.ttl_minutes = minutes,
            Err(e) => tracing::warn!("Ignoring LINECHAT_CONVERSATION_TTL_MINUTES={}: {}", v, e),
        }
    }
    if let Ok(v) = std::env::var("LINECHAT_FAILURE_POLICY") {
        match v.parse() {
            Ok(policy) => cfg.conversation.failure_policy = policy,
            Err(e) => tracing::warn!("Ignoring LINECHAT_FAILURE_POLICY: {}", e),
        }
    }

    // LINE
    if let Ok(v) = std::env::var("LINE_CHANNEL_SECRET") {
        cfg.line.channel_secret = v;
    }
    if let Ok(v) = std::env::var("LINE_CHANNEL_ACCESS_TOKEN") {
        cfg.line.channel_access_token = v;
    }

    // Store
    if let Ok(v) = std::env::var("LINECHAT_STORE") {
        match v.parse() {
            Ok(backend) => cfg.store.backend = backend,
            Err(e) => tracing::warn!("Ignoring LINECHAT_STORE: {}", e),
        }
    }
    if let Ok(v) = std::env::var("LINECHAT_STORE_TABLE") {
        cfg.store.table = v;
    }
    if let Ok(v) = std::env::var("LINECHAT_STORE_PROJECT").or_else(|_| std::env::var("GCP_PROJECT_ID")) {
        cfg.store.project = v;
    }

    cfg
}

/// Get the default configuration file path.
pub fn get_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".linechat")
        .join("config.json")
}

/// Get the linechat data directory.
pub fn get_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".linechat")
}

/// Load configuration from file or create default.
pub fn load_config(config_path: Option<&Path>) -> Config {
    let path = config_path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(get_config_path);

    if path.exists() {
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Config>(&content) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Failed to parse config from {}: {}", path.display(), e);
                    tracing::warn!("Using default configuration.");
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config from {}: {}", path.display(), e);
                tracing::warn!("Using default configuration.");
            }
        }
    }

    Config::default()
}

/// Save configuration to file.
pub fn save_config(config: &Config, config_path: Option<&Path>) -> std::result::Result<(), ConfigError> {
    let path = config_path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(get_config_path);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    }

    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, json).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    Ok(())
}
