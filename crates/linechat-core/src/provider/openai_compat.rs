use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::ProviderError;
use crate::session::Turn;
use crate::types::{to_messages, Message};
use crate::util::http;

/// OpenAI chat-completions provider.
/// Also works with any OpenAI-compatible API via `api_base`.
pub struct OpenAiCompatProvider {
    api_key: String,
    api_base: String,
    model: String,
    max_tokens: Option<u32>,
    temperature: Option<f64>,
}

impl OpenAiCompatProvider {
    pub fn new(api_key: String, api_base: Option<String>, model: String) -> Self {
        let base = api_base.unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        Self {
            api_key,
            api_base: base.trim_end_matches('/').to_string(),
            model,
            max_tokens: None,
            temperature: None,
        }
    }

    /// Override sampling parameters. `None` leaves the API default.
    pub fn with_sampling(mut self, max_tokens: Option<u32>, temperature: Option<f64>) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    fn build_body(&self, prior: &[Turn], text: &str) -> serde_json::Value {
        let mut messages = to_messages(prior);
        messages.push(Message::user(text));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if let Some(max_tokens) = self.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

#[async_trait]
impl super::LlmProvider for OpenAiCompatProvider {
    async fn chat(&self, prior: &[Turn], text: &str) -> Result<String, ProviderError> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = self.build_body(prior, text);

        debug!("OpenAI request to {} with model {} ({} prior turns)", url, self.model, prior.len());

        let response = http::client()
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = response.text().await.unwrap_or_default();
            return Err(classify_error(status, retry_after, &text));
        }

        let data: serde_json::Value = response.json().await?;
        parse_first_reply(&data)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

/// Map a non-success response onto [`ProviderError`].
///
/// Rate limiting is decided from the HTTP status or the structured `code`
/// field of the error body, never from the human-readable message.
pub fn classify_error(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ProviderError {
    let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok().map(|e| e.error);
    let code = parsed.as_ref().and_then(|e| match &e.code {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    });

    let code_says_throttled = matches!(code.as_deref(), Some("rate_limit_exceeded") | Some("429"));
    if status == StatusCode::TOO_MANY_REQUESTS || code_says_throttled {
        return ProviderError::RateLimited { retry_after };
    }

    ProviderError::Api {
        status: status.as_u16(),
        code,
        message: parsed.map(|e| e.message).unwrap_or_else(|| body.to_string()),
    }
}

/// Extract the first choice's message content from a chat-completions response.
pub fn parse_first_reply(data: &serde_json::Value) -> Result<String, ProviderError> {
    let choices = data
        .get("choices")
        .and_then(|c| c.as_array())
        .ok_or_else(|| ProviderError::Parse("No choices in response".to_string()))?;

    let choice = choices.first().ok_or(ProviderError::EmptyChoices)?;

    choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ProviderError::Parse("No message content in choice".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::LlmProvider;
    use crate::types::Role;

    fn provider() -> OpenAiCompatProvider {
        OpenAiCompatProvider::new("sk-test".into(), None, "gpt-3.5-turbo".into())
    }

    #[test]
    fn test_default_api_base() {
        let p = provider();
        assert_eq!(p.api_base, "https://api.openai.com/v1");
        assert_eq!(p.model(), "gpt-3.5-turbo");

        let p = OpenAiCompatProvider::new("k".into(), Some("http://localhost:8080/v1/".into()), "m".into());
        assert_eq!(p.api_base, "http://localhost:8080/v1");
    }

    #[test]
    fn test_build_body_appends_text_after_prior() {
        let now = chrono::Utc::now();
        let prior = vec![
            Turn::new(Role::User, "first", now),
            Turn::new(Role::Assistant, "reply", now),
            Turn::new(Role::User, "second", now),
        ];
        let body = provider().build_body(&prior, "second");

        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0]["role"], "user");
        assert_eq!(msgs[0]["content"], "first");
        assert_eq!(msgs[1]["role"], "assistant");
        assert_eq!(msgs[3]["role"], "user");
        assert_eq!(msgs[3]["content"], "second");
        assert_eq!(body["model"], "gpt-3.5-turbo");
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn test_build_body_with_sampling() {
        let body = provider().with_sampling(Some(256), Some(0.2)).build_body(&[], "hi");
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["temperature"], 0.2);
    }

    #[test]
    fn test_classify_429_status() {
        let err = classify_error(
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(20)),
            r#"{"error":{"message":"Slow down","type":"requests","code":"rate_limit_exceeded"}}"#,
        );
        match err {
            ProviderError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(20)));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_numeric_code() {
        let err = classify_error(
            StatusCode::BAD_REQUEST,
            None,
            r#"{"error":{"message":"too many","code":429}}"#,
        );
        assert!(err.is_rate_limited());
    }

    #[test]
    fn test_classify_other_errors() {
        let err = classify_error(
            StatusCode::UNAUTHORIZED,
            None,
            r#"{"error":{"message":"Incorrect API key provided","code":"invalid_api_key"}}"#,
        );
        match err {
            ProviderError::Api { status, code, message } => {
                assert_eq!(status, 401);
                assert_eq!(code.as_deref(), Some("invalid_api_key"));
                assert_eq!(message, "Incorrect API key provided");
            }
            other => panic!("expected Api, got {other:?}"),
        }

        // Message text mentioning rate limits does not make it a rate limit
        let err = classify_error(StatusCode::BAD_GATEWAY, None, "upstream rate limit exceeded");
        assert!(!err.is_rate_limited());
        assert!(matches!(err, ProviderError::Api { status: 502, .. }));
    }

    #[test]
    fn test_parse_first_reply() {
        let data = serde_json::json!({
            "choices": [
                { "index": 0, "message": { "role": "assistant", "content": "hi" }, "finish_reason": "stop" },
                { "index": 1, "message": { "role": "assistant", "content": "second" } }
            ]
        });
        assert_eq!(parse_first_reply(&data).unwrap(), "hi");
    }

    #[test]
    fn test_parse_empty_choices() {
        let data = serde_json::json!({ "choices": [] });
        assert!(matches!(parse_first_reply(&data), Err(ProviderError::EmptyChoices)));

        let data = serde_json::json!({ "id": "x" });
        assert!(matches!(parse_first_reply(&data), Err(ProviderError::Parse(_))));
    }
}
