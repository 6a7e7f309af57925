use anyhow::Result;
use clap::{Parser, Subcommand};

use linechat_core::config::{self, Config};
use linechat_core::conversation::Outcome;
use linechat_core::service;

#[derive(Parser)]
#[command(
    name = "linechat",
    about = "LINE webhook bot that keeps per-user ChatGPT conversations",
    version = linechat_core::VERSION,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the LINE webhook over HTTP
    Serve {
        /// Bind host (defaults to gateway.host)
        #[arg(long)]
        host: Option<String>,
        /// Bind port (defaults to gateway.port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run one message through the conversation lifecycle without LINE
    Chat {
        /// User ID the conversation is keyed by
        #[arg(short, long, default_value = "cli")]
        user: String,
        /// Message text
        message: Vec<String>,
    },
    /// Write a default config file
    Init {
        /// Overwrite an existing config
        #[arg(short, long)]
        force: bool,
    },
    /// Show configuration status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("linechat=info".parse()?)
                .add_directive("linechat_core=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { host, port } => cmd_serve(host, port).await?,
        Commands::Chat { user, message } => cmd_chat(user, message).await?,
        Commands::Init { force } => cmd_init(force)?,
        Commands::Status => cmd_status()?,
    }

    Ok(())
}

// ====== Commands ======

#[cfg(feature = "http-api")]
async fn cmd_serve(host: Option<String>, port: Option<u16>) -> Result<()> {
    use std::sync::Arc;

    use linechat_core::service::http::{serve, AppState};

    let cfg = config::load_config_from_env();
    let addr = format!(
        "{}:{}",
        host.unwrap_or_else(|| cfg.gateway.host.clone()),
        port.unwrap_or(cfg.gateway.port)
    );

    let manager = service::create_manager(&cfg).await?;
    let state = Arc::new(AppState::new(cfg, manager));

    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    println!("Starting linechat webhook on {}...", addr);
    serve(&addr, state).await
}

#[cfg(not(feature = "http-api"))]
async fn cmd_serve(_host: Option<String>, _port: Option<u16>) -> Result<()> {
    anyhow::bail!("HTTP API not available. Rebuild with: cargo build --features http-api")
}

async fn cmd_chat(user: String, message: Vec<String>) -> Result<()> {
    let text = message.join(" ");
    if text.trim().is_empty() {
        anyhow::bail!("message is empty");
    }

    let cfg = config::load_config_from_env();
    let manager = service::create_manager(&cfg).await?;

    match manager.handle(&user, &text, chrono::Utc::now()).await {
        Outcome::Replied { reply, conversation } => {
            println!("{}", reply);
            tracing::debug!(
                "conversation: {}",
                serde_json::to_string(&conversation).unwrap_or_default()
            );
        }
        Outcome::PersistFailure { reply, error, .. } => {
            println!("{}", reply);
            eprintln!("warning: conversation not saved: {}", error);
        }
        Outcome::Throttled { retry_after } => match retry_after {
            Some(after) => anyhow::bail!("rate limited, retry after {}s", after.as_secs()),
            None => anyhow::bail!("rate limited"),
        },
        Outcome::UpstreamFailure(e) => anyhow::bail!("completion failed: {}", e),
        Outcome::FatalStoreError(e) => anyhow::bail!("conversation store failed: {}", e),
        Outcome::Cancelled => anyhow::bail!("cancelled"),
    }

    Ok(())
}

fn cmd_init(force: bool) -> Result<()> {
    let config_path = config::get_config_path();
    if config_path.exists() && !force {
        println!("Config already exists at {}", config_path.display());
        println!("Use --force to overwrite.");
        return Ok(());
    }

    config::save_config(&Config::default(), None)?;
    println!("✓ Created config at {}", config_path.display());
    println!("Set provider.apiKey and the line section, or use OPENAI_API_KEY / LINE_CHANNEL_ACCESS_TOKEN.");
    Ok(())
}

fn cmd_status() -> Result<()> {
    let config_path = config::get_config_path();
    let cfg = config::load_config_from_env();

    println!(
        "linechat {} ({})\n",
        linechat_core::VERSION,
        linechat_core::GIT_HASH
    );

    println!(
        "Config: {} {}",
        config_path.display(),
        if config_path.exists() { "✓" } else { "✗" }
    );
    println!("Model: {}", cfg.provider.model);
    println!(
        "OpenAI API: {}",
        if cfg.provider.api_key.is_empty() { "not set" } else { "✓" }
    );
    if let Some(ref base) = cfg.provider.api_base {
        println!("API base: {}", base);
    }
    println!(
        "LINE access token: {}",
        if cfg.line.channel_access_token.is_empty() { "not set" } else { "✓" }
    );
    println!(
        "Store: {:?} ({})",
        cfg.store.backend,
        match cfg.store.backend {
            config::StoreBackend::File => cfg.store.data_path().display().to_string(),
            _ => cfg.store.table_name(),
        }
    );
    println!("Conversation TTL: {}m", cfg.conversation.ttl_minutes);
    println!("Failure policy: {:?}", cfg.conversation.failure_policy);
    println!(
        "Per-user serialization: {}",
        if cfg.conversation.serialize_per_user { "on" } else { "off" }
    );

    Ok(())
}
