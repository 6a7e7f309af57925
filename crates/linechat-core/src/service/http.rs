use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::channel::line::{reply_text_for, LineChannel, TextMessage};
use crate::config::Config;
use crate::conversation::{ConversationManager, Outcome};
use crate::util::truncate_string;

/// LINE webhook bodies are small; anything larger is not a LINE delivery.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared application state for the webhook server.
pub struct AppState {
    pub config: Config,
    pub manager: ConversationManager,
    pub line: LineChannel,
    /// Fired on shutdown; in-flight conversations stop at their next I/O boundary.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Config, manager: ConversationManager) -> Self {
        let line = LineChannel::new(&config.line);
        Self {
            config,
            manager,
            line,
            shutdown: CancellationToken::new(),
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub git_hash: String,
}

/// Create the axum Router with the webhook and health routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhooks/line", post(handle_line_webhook))
        .route("/health", get(handle_health))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// POST /webhooks/line: LINE webhook
async fn handle_line_webhook(
    State(state): State<Arc<AppState>>,
    body: String,
) -> impl IntoResponse {
    info!("LINE webhook received: {} bytes", body.len());

    let events = match LineChannel::parse_webhook_events(&body) {
        Ok(events) => events,
        Err(e) => {
            error!("Failed to parse LINE webhook: {}", e);
            return (StatusCode::BAD_REQUEST, "Failed to parse Line request");
        }
    };

    let mut all_ok = true;
    for event in &events {
        if let Some(message) = LineChannel::text_message(event) {
            all_ok &= process_text_message(&state, message).await;
        }
    }

    if all_ok {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "error")
    }
}

/// Run one text message through the conversation manager and reply.
/// Returns false when the outcome or the reply delivery failed.
async fn process_text_message(state: &AppState, message: TextMessage<'_>) -> bool {
    let display_name = match state.line.get_profile(message.user_id).await {
        Ok(profile) => profile.display_name,
        Err(e) => {
            warn!(
                line_user_id = message.user_id,
                line_message_id = message.message_id,
                "get profile: {}",
                e
            );
            String::new()
        }
    };

    let outcome = state
        .manager
        .handle_with_cancel(message.user_id, message.text, chrono::Utc::now(), &state.shutdown)
        .await;

    log_outcome(&outcome, &message, &display_name);

    let mut ok = outcome.is_replied();
    let reply = reply_text_for(&outcome, &state.config.conversation);
    if let (Some(reply), Some(reply_token)) = (reply, message.reply_token) {
        if let Err(e) = state.line.reply(reply_token, &reply).await {
            error!(
                line_user_id = message.user_id,
                line_display_name = %display_name,
                line_message_id = message.message_id,
                line_text_message = message.text,
                outcome = outcome.kind(),
                "failed to reply: {}",
                e
            );
            ok = false;
        }
    }
    ok
}

fn log_outcome(outcome: &Outcome, message: &TextMessage<'_>, display_name: &str) {
    let preview = truncate_string(message.text, 200, "...");
    match outcome {
        Outcome::Replied { reply, conversation } => info!(
            line_user_id = message.user_id,
            line_display_name = display_name,
            line_message_id = message.message_id,
            turns = conversation.len(),
            chat_gpt_reply_message = %reply,
            "ChatGPT reply generated"
        ),
        Outcome::Throttled { retry_after } => warn!(
            line_user_id = message.user_id,
            line_display_name = display_name,
            line_message_id = message.message_id,
            line_text_message = %preview,
            ?retry_after,
            "completion API rate limited"
        ),
        Outcome::UpstreamFailure(e) => error!(
            line_user_id = message.user_id,
            line_display_name = display_name,
            line_message_id = message.message_id,
            line_text_message = %preview,
            "failed to call chat completion API: {}",
            e
        ),
        Outcome::PersistFailure { error: e, .. } => error!(
            line_user_id = message.user_id,
            line_message_id = message.message_id,
            "failed to persist conversation: {}",
            e
        ),
        Outcome::FatalStoreError(e) => error!(
            line_user_id = message.user_id,
            line_message_id = message.message_id,
            "failed to load conversation: {}",
            e
        ),
        Outcome::Cancelled => warn!(
            line_user_id = message.user_id,
            line_message_id = message.message_id,
            "conversation cancelled"
        ),
    }
}

/// GET /health: Health check
async fn handle_health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: crate::VERSION.to_string(),
        git_hash: crate::GIT_HASH.to_string(),
    })
}

/// Start the HTTP server on the given address, stopping when `state.shutdown` fires.
pub async fn serve(addr: &str, state: Arc<AppState>) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
