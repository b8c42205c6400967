//! Lodestar Daemon - service lookup registry process
//!
//! `lodestard` loads its configuration, opens (and recovers) the registry
//! engine, reports metrics periodically and shuts the engine down cleanly on
//! Ctrl+C or SIGTERM. Client-facing transports embed the engine alongside.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod error;
mod server;

use config::DaemonConfig;
use server::Server;

/// Lodestar Daemon CLI
#[derive(Parser)]
#[command(name = "lodestard")]
#[command(about = "Lodestar Daemon - lease-based service lookup registry", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "LODESTAR_CONFIG")]
    config: Option<String>,

    /// Directory for the registry log and snapshot (omit for in-memory)
    #[arg(short, long, env = "LODESTAR_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "LODESTAR_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "LODESTAR_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config =
        DaemonConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    // Override with CLI args
    if let Some(dir) = cli.data_dir {
        config.registry.data_dir = Some(dir);
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.logging.json |= cli.json;

    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = ?config.registry.data_dir,
        "Starting lodestard"
    );

    let server = Server::new(config)
        .await
        .context("failed to open registry")?;
    server.run().await?;
    Ok(())
}
