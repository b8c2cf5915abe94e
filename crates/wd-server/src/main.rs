//! Warden control-plane daemon
//!
//! Serves viewers over WebSocket, manages local and SSH terminal sessions
//! and keeps reverse tunnels open to remote machines.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wd_core::config::{self, ServerConfig};
use wd_core::store::MemoryStore;
use wd_server::{http, ControlPlane};
use wd_ssh::{ConfigProvider, ConnectionProvider, SshConnector};
use wd_terminal::{LocalSpawner, ShellSpawner, SshSpawner};
use wd_tunnel::SshTunnelConnector;

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Warden control-plane daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

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

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Warden starting...");

    let config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                ServerConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            ServerConfig::default()
        }
    };

    let bind_addr = args.bind.unwrap_or_else(|| config.bind_address.clone());
    tracing::info!("{} remote machines configured", config.machines.len());

    let provider: Arc<dyn ConnectionProvider> =
        Arc::new(ConfigProvider::new(config.machines.clone()));
    let connector = SshConnector::new(config.tunnel.connect_timeout);

    let ssh = SshSpawner::new(provider.clone(), connector.clone())
        .with_probe_timeout(config.tunnel.probe_timeout);
    let spawner = Arc::new(ShellSpawner::new(LocalSpawner::default(), Some(ssh)));
    let tunnel_connector = Arc::new(SshTunnelConnector::new(provider, connector));
    let store = Arc::new(MemoryStore::new());

    let plane = ControlPlane::new(config, store, spawner, tunnel_connector);
    plane.start();

    // Create cancellation token for graceful shutdown
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
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    tracing::info!("Listening on {}", bind_addr);

    axum::serve(listener, http::router(plane.clone()))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("HTTP server failed")?;

    plane.shutdown().await;
    tracing::info!("Warden shutdown complete");
    Ok(())
}
