use std::sync::Arc;

use lambda_http::{run, Error};
use tracing::info;

use linechat_core::config::{self, StoreBackend};
use linechat_core::service::create_manager;
use linechat_core::service::http::{create_router, AppState};

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("linechat_core=info".parse()?),
        )
        .with_ansi(false)
        .init();

    info!("linechat Lambda starting...");

    let mut cfg = config::load_config_from_env();

    // Conversations always live in DynamoDB under Lambda
    cfg.store.backend = StoreBackend::Dynamodb;
    if let Ok(table) = std::env::var("DYNAMODB_CONVERSATIONS_TABLE") {
        cfg.store.table = table;
    }
    info!("Conversations table: {}", cfg.store.table_name());

    let manager = create_manager(&cfg).await?;
    let state = Arc::new(AppState::new(cfg, manager));

    run(create_router(state)).await?;

    Ok(())
}
