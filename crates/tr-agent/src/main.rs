//! term-relay agent daemon
//!
//! Runs on the administered machine, dials out to the relay, and serves
//! shells for the sessions it is asked to open.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tr_core::config::{self, AgentConfig};

#[derive(Parser)]
#[command(name = "tr-agent")]
#[command(about = "term-relay agent - serves shells through a relay")]
#[command(version)]
struct Args {
    /// Relay agent endpoint
    /// Example: ws://relay.example.com:3004/agent
    #[arg(short, long, env = "TERM_RELAY_URL")]
    relay: Option<String>,

    /// Node name shown to operators (defaults to hostname)
    #[arg(short, long, env = "TERM_RELAY_NODE_NAME")]
    node_name: Option<String>,

    /// API key sent in the x-api-key header
    #[arg(long, env = "TERM_RELAY_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("term-relay agent starting...");

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config::default_config_dir().join("agent.toml"));

    let mut config = if config_path.exists() {
        config::load_config(&config_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", config_path, e);
            AgentConfig::default()
        })
    } else {
        AgentConfig::default()
    };

    if let Some(relay) = args.relay {
        config.relay_url = relay;
    }
    if let Some(node_name) = args.node_name {
        config.node_name = Some(node_name);
    }
    if let Some(api_key) = args.api_key {
        config.api_key = Some(api_key);
    }

    tracing::info!("Connecting to relay at {}", config.relay_url);

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
            _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
        }

        cancel_clone.cancel();
    });

    tr_agent::run(config, cancel).await?;

    tracing::info!("Agent stopped");
    Ok(())
}
