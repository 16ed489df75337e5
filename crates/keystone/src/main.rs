//! # Keystone - cluster state node
//!
//! Runs a node's cluster state service and assigns the cluster-wide
//! identifier exactly once: the elected master generates it after recovering
//! state from the gateway, every node adopts it once committed.
//!
//! ## Architecture
//! ```text
//! HTTP → AppState → ClusterHandle ─┐
//!                                  ↓
//!               ClusterService (single task) → listeners (ClusterIdService)
//!                    ↓                       ↓
//!      Gateway (memory | Redis)     ReplicationService ⇄ peers (UDP)
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod cluster;
mod config;
mod gateway;
mod routes;
mod state;

use crate::cluster::{ClusterIdService, ClusterService, ReplicationConfig, ReplicationService};
use crate::config::{AppConfig, GatewayKind};
use crate::gateway::Gateway;
use crate::state::AppState;

/// Keystone - cluster state node
#[derive(Parser, Debug)]
#[command(name = "keystone")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/keystone.toml")]
    config: String,

    /// Redis URL (overrides config)
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// Node ID (overrides config)
    #[arg(long, env = "NODE_ID")]
    node_id: Option<String>,

    /// Metadata gateway backend (overrides config)
    #[arg(long, value_enum)]
    gateway: Option<GatewayKind>,

    /// Start without electing this node as master
    #[arg(long, default_value = "false")]
    follower: bool,

    /// UDP address for receiving replicated state (overrides config)
    #[arg(long, env = "REPLICATION_ADDR")]
    replication_addr: Option<String>,

    /// Replication address of a peer node (repeatable, overrides config)
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Pick up a local .env before reading env-backed arguments
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.json_logs)?;

    info!("Starting Keystone v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::load(&args.config, &args)?;
    info!(node = %config.node_id, "Configuration loaded from {}", args.config);

    // Create shutdown broadcast channel
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    // Metadata persistence
    let gateway = Gateway::connect(&config).await?;
    info!(gateway = gateway.kind(), "Gateway ready");

    // Cluster state service with the identity coordinator listening on it
    let (service, cluster) = ClusterService::new(config.node_id.clone(), gateway.clone());
    let mut service =
        service.with_recovery_retry(Duration::from_secs(config.cluster.recovery_retry_secs));
    let cluster_id = Arc::new(ClusterIdService::new(
        config.node_id.clone(),
        Arc::new(cluster.clone()),
    ));
    service.add_listener(cluster_id.clone());

    let service_shutdown = shutdown_tx.subscribe();
    let service_task = tokio::spawn(service.run(service_shutdown));

    // Replication to and from peers
    let replication = Arc::new(ReplicationService::new(
        ReplicationConfig {
            bind_addr: config.cluster.replication_addr.clone(),
            peers: config.cluster.peers.clone(),
            republish_interval: Duration::from_secs(config.cluster.republish_interval_secs.max(1)),
        },
        cluster.clone(),
    ));
    let replication_socket = replication.bind().await?;

    let receiver = replication.clone();
    let receiver_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move {
        if let Err(e) = receiver.run_receiver(replication_socket, receiver_shutdown).await {
            tracing::error!(error = %e, "Replication receiver error");
        }
    });

    let publisher = replication.clone();
    let publisher_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move {
        if let Err(e) = publisher.run_publisher(publisher_shutdown).await {
            tracing::error!(error = %e, "Replication publisher error");
        }
    });

    if config.cluster.master {
        cluster
            .elect_master(Some(config.node_id.clone()))
            .context("Cluster state service stopped before election")?;
    }

    // Build router
    let state = AppState::new(config.clone(), cluster, cluster_id, gateway);
    let app = routes::create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("Keystone listening on {}", config.listen_addr);

    // Handle graceful shutdown
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    service_task
        .await
        .context("Cluster state service panicked")??;

    info!("Keystone shutdown complete");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
