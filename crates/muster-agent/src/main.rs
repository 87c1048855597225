//! Muster agent daemon
//!
//! Binds the compute listener and serves leased tasks dispatched to this
//! agent. Lease dispatch arrives through the library API; the daemon owns
//! the listener, the pending-connection registry and graceful shutdown.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use muster_agent::{ComputeListener, PendingConnectionRegistry};
use muster_core::config::{self, AgentConfig};

#[derive(Parser)]
#[command(name = "muster-agent")]
#[command(about = "Muster compute agent - executes leased payloads in sandboxes")]
#[command(version)]
struct Args {
    /// Address the compute listener binds to
    #[arg(short, long)]
    listen: Option<String>,

    /// Working directory; sandboxes are created under <dir>/sandbox
    #[arg(short, long)]
    working_dir: Option<PathBuf>,

    /// Pool this agent advertises itself in
    #[arg(long)]
    pool: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Muster agent starting...");

    // Load configuration
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

    // Apply command-line overrides
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(working_dir) = args.working_dir {
        config.working_dir = working_dir;
    }
    if let Some(pool) = args.pool {
        config.pool = Some(pool);
    }

    tokio::fs::create_dir_all(&config.working_dir)
        .await
        .with_context(|| format!("Failed to create working dir {:?}", config.working_dir))?;

    let registry = PendingConnectionRegistry::new();
    let mut listener = ComputeListener::bind(
        &config.listen_addr,
        registry.clone(),
        config.nonce_read_timeout,
    )
    .await
    .with_context(|| format!("Failed to bind compute listener on {}", config.listen_addr))?;

    tracing::info!(
        "Serving leases on {} (pool: {}, sandbox root: {:?})",
        listener.local_addr(),
        config.pool.as_deref().unwrap_or("-"),
        config.sandbox_root()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutdown signal received");
    listener.shutdown().await;

    Ok(())
}
