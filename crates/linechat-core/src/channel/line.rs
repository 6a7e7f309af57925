use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::config::{ConversationConfig, LineConfig};
use crate::conversation::Outcome;
use crate::error::ChannelError;
use crate::util::http::client;

/// Sent when the completion API is rate limiting us.
pub const THROTTLED_MESSAGE: &str =
    "⚠️API利用制限につき一時的に利用できなくなっている可能性があります。時間を開けて再度ご利用下さい⚠️";

/// Sent for every other failure.
pub const FAILURE_MESSAGE: &str = "💥💥システム側で予期せぬエラーが発生しました💥💥";

/// LINE Messaging API channel (webhook mode).
pub struct LineChannel {
    access_token: String,
    api_base: String,
}

impl LineChannel {
    pub fn new(config: &LineConfig) -> Self {
        Self {
            access_token: config.channel_access_token.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
        }
    }

    /// Parse LINE webhook events from the request body.
    pub fn parse_webhook_events(body: &str) -> Result<Vec<LineEvent>, ChannelError> {
        let webhook: LineWebhook = serde_json::from_str(body)?;
        Ok(webhook.events)
    }

    /// Pick out a text message event from a user; everything else is ignored.
    pub fn text_message(event: &LineEvent) -> Option<TextMessage<'_>> {
        if event.event_type != "message" {
            debug!("Ignoring LINE event type: {}", event.event_type);
            return None;
        }
        let message = event.message.as_ref()?;
        if message.msg_type != "text" {
            debug!("Ignoring non-text LINE message: {}", message.msg_type);
            return None;
        }
        let user_id = event.source.as_ref()?.user_id.as_deref()?;

        Some(TextMessage {
            user_id,
            message_id: message.id.as_deref().unwrap_or(""),
            text: message.text.as_deref().unwrap_or(""),
            reply_token: event.reply_token.as_deref(),
        })
    }

    /// Reply to a LINE message using the reply token.
    /// Must be called within 1 minute of receiving the webhook.
    pub async fn reply(&self, reply_token: &str, text: &str) -> Result<(), ChannelError> {
        let body = serde_json::json!({
            "replyToken": reply_token,
            "messages": [{
                "type": "text",
                "text": text
            }]
        });

        let resp = client()
            .post(format!("{}/v2/bot/message/reply", self.api_base))
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!("LINE reply API error: {} {}", status, body);
            return Err(ChannelError::Send {
                status: status.as_u16(),
                body,
            });
        }

        debug!("LINE reply sent successfully");
        Ok(())
    }

    /// Fetch a user's profile. Only used to enrich logs.
    pub async fn get_profile(&self, user_id: &str) -> Result<LineProfile, ChannelError> {
        let resp = client()
            .get(format!("{}/v2/bot/profile/{}", self.api_base, user_id))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ChannelError::Send {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        resp.json()
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))
    }
}

/// The parts of a text message event the conversation flow needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextMessage<'a> {
    pub user_id: &'a str,
    pub message_id: &'a str,
    pub text: &'a str,
    pub reply_token: Option<&'a str>,
}

/// Text to send back to the user for an outcome, if any.
pub fn reply_text_for(outcome: &Outcome, config: &ConversationConfig) -> Option<String> {
    match outcome {
        Outcome::Replied { reply, .. } => Some(reply.clone()),
        Outcome::PersistFailure { reply, .. } if config.deliver_on_persist_failure => {
            Some(reply.clone())
        }
        Outcome::Throttled { .. } => Some(THROTTLED_MESSAGE.to_string()),
        Outcome::PersistFailure { .. }
        | Outcome::UpstreamFailure(_)
        | Outcome::FatalStoreError(_) => Some(FAILURE_MESSAGE.to_string()),
        Outcome::Cancelled => None,
    }
}

// ====== LINE Webhook Types ======

#[derive(Debug, Deserialize)]
pub struct LineWebhook {
    #[serde(default)]
    pub events: Vec<LineEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub reply_token: Option<String>,
    pub source: Option<LineSource>,
    pub message: Option<LineMessage>,
    pub timestamp: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    pub room_id: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LineMessage {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineProfile {
    #[serde(default)]
    pub display_name: String,
    pub user_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ProviderError, SessionError};
    use crate::session::Conversation;

    #[test]
    fn test_parse_webhook_text_message() {
        let body = r#"{
            "events": [{
                "type": "message",
                "replyToken": "token123",
                "source": {
                    "type": "user",
                    "userId": "U1234567890"
                },
                "message": {
                    "id": "msg001",
                    "type": "text",
                    "text": "Hello!"
                },
                "timestamp": 1625000000000
            }]
        }"#;

        let events = LineChannel::parse_webhook_events(body).unwrap();
        assert_eq!(events.len(), 1);

        let msg = LineChannel::text_message(&events[0]).unwrap();
        assert_eq!(msg.user_id, "U1234567890");
        assert_eq!(msg.message_id, "msg001");
        assert_eq!(msg.text, "Hello!");
        assert_eq!(msg.reply_token, Some("token123"));
    }

    #[test]
    fn test_follow_event_is_not_a_text_message() {
        let body = r#"{
            "events": [{
                "type": "follow",
                "replyToken": "r1",
                "source": { "type": "user", "userId": "U9999" },
                "timestamp": 1625000001000
            }]
        }"#;

        let events = LineChannel::parse_webhook_events(body).unwrap();
        assert_eq!(events.len(), 1);
        assert!(LineChannel::text_message(&events[0]).is_none());
    }

    #[test]
    fn test_sticker_message_is_ignored() {
        let body = r#"{
            "events": [{
                "type": "message",
                "replyToken": "r2",
                "source": { "type": "user", "userId": "U1" },
                "message": { "id": "m2", "type": "sticker" }
            }]
        }"#;
        let events = LineChannel::parse_webhook_events(body).unwrap();
        assert!(LineChannel::text_message(&events[0]).is_none());
    }

    #[test]
    fn test_parse_webhook_empty_and_invalid() {
        let events = LineChannel::parse_webhook_events(r#"{"events": []}"#).unwrap();
        assert!(events.is_empty());

        let err = LineChannel::parse_webhook_events("not json").unwrap_err();
        assert!(matches!(err, ChannelError::Payload(_)));
    }

    #[test]
    fn test_group_message_keys_by_sender() {
        let body = r#"{
            "events": [{
                "type": "message",
                "replyToken": "reply123",
                "source": { "type": "group", "groupId": "Gxyz", "userId": "U1234" },
                "message": { "id": "msg002", "type": "text", "text": "Hi from group" }
            }]
        }"#;

        let events = LineChannel::parse_webhook_events(body).unwrap();
        let msg = LineChannel::text_message(&events[0]).unwrap();
        assert_eq!(msg.user_id, "U1234");
        assert_eq!(events[0].source.as_ref().unwrap().group_id.as_deref(), Some("Gxyz"));
    }

    #[test]
    fn test_reply_text_for_outcomes() {
        let cfg = ConversationConfig::default();
        let conv = Conversation::new(chrono::Utc::now(), std::time::Duration::from_secs(60));

        let replied = Outcome::Replied {
            reply: "hi".into(),
            conversation: conv.clone(),
        };
        assert_eq!(reply_text_for(&replied, &cfg).as_deref(), Some("hi"));

        let throttled = Outcome::Throttled { retry_after: None };
        assert_eq!(reply_text_for(&throttled, &cfg).as_deref(), Some(THROTTLED_MESSAGE));

        let upstream = Outcome::UpstreamFailure(ProviderError::EmptyChoices);
        assert_eq!(reply_text_for(&upstream, &cfg).as_deref(), Some(FAILURE_MESSAGE));

        let fatal = Outcome::FatalStoreError(SessionError::Read("down".into()));
        assert_eq!(reply_text_for(&fatal, &cfg).as_deref(), Some(FAILURE_MESSAGE));

        assert_eq!(reply_text_for(&Outcome::Cancelled, &cfg), None);
    }

    #[test]
    fn test_persist_failure_reply_depends_on_config() {
        let conv = Conversation::new(chrono::Utc::now(), std::time::Duration::from_secs(60));
        let outcome = Outcome::PersistFailure {
            reply: "computed".into(),
            conversation: conv,
            error: SessionError::Write("quota".into()),
        };

        let mut cfg = ConversationConfig::default();
        assert_eq!(reply_text_for(&outcome, &cfg).as_deref(), Some(FAILURE_MESSAGE));

        cfg.deliver_on_persist_failure = true;
        assert_eq!(reply_text_for(&outcome, &cfg).as_deref(), Some("computed"));
    }

    /// Serve one canned HTTP response on a local port and return its base URL.
    async fn one_shot_server(status_line: &'static str, body: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            // Read headers plus the declared body before answering.
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let content_length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{}", addr)
    }

    fn channel_at(api_base: String) -> LineChannel {
        LineChannel::new(&LineConfig {
            channel_access_token: "token".into(),
            api_base,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_reply_unreachable_is_connection_error() {
        // Nothing listens on port 1.
        let line = channel_at("http://127.0.0.1:1".into());
        let err = line.reply("r1", "hi").await.unwrap_err();
        assert!(matches!(err, ChannelError::Connection(_)));
    }

    #[tokio::test]
    async fn test_reply_rejected_is_send_error() {
        let base = one_shot_server("400 Bad Request", r#"{"message":"Invalid reply token"}"#).await;
        let err = channel_at(base).reply("expired", "hi").await.unwrap_err();
        match err {
            ChannelError::Send { status, body } => {
                assert_eq!(status, 400);
                assert!(body.contains("Invalid reply token"));
            }
            other => panic!("expected Send, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reply_success() {
        let base = one_shot_server("200 OK", "{}").await;
        channel_at(base).reply("r1", "hi").await.unwrap();
    }

    #[tokio::test]
    async fn test_get_profile() {
        let base = one_shot_server("200 OK", r#"{"displayName":"Taro","userId":"U1"}"#).await;
        let profile = channel_at(base).get_profile("U1").await.unwrap();
        assert_eq!(profile.display_name, "Taro");

        let base = one_shot_server("404 Not Found", r#"{"message":"Not found"}"#).await;
        let err = channel_at(base).get_profile("U404").await.unwrap_err();
        assert!(matches!(err, ChannelError::Send { status: 404, .. }));
    }

    #[test]
    fn test_profile_deserialize() {
        let profile: LineProfile =
            serde_json::from_str(r#"{"displayName":"Taro","userId":"U1","pictureUrl":"x"}"#).unwrap();
        assert_eq!(profile.display_name, "Taro");
    }
}
