//! Configuration management for Keystone.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use keystone_common::constants::{
    DEFAULT_LISTEN_ADDR, DEFAULT_REDIS_URL, DEFAULT_REPLICATION_ADDR, RECOVERY_RETRY_SECS,
    REPUBLISH_INTERVAL_SECS,
};

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Redis connection URL (used by the Redis gateway)
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// This node's unique ID (auto-generated if not set)
    #[serde(default = "generate_node_id")]
    pub node_id: String,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,
}

/// Metadata persistence backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    /// Process memory only; state is lost on restart
    Memory,
    /// Redis document under `keystone:metadata`
    Redis,
}

/// Cluster-specific configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Elect this node as master at startup
    #[serde(default = "default_master")]
    pub master: bool,

    /// Where committed metadata is persisted
    #[serde(default = "default_gateway")]
    pub gateway: GatewayKind,

    /// UDP address receiving states published by the master
    #[serde(default = "default_replication_addr")]
    pub replication_addr: String,

    /// Replication addresses of the other nodes
    #[serde(default)]
    pub peers: Vec<String>,

    /// Seconds between re-sends of the latest state while master
    #[serde(default = "default_republish_interval")]
    pub republish_interval_secs: u64,

    /// Seconds between gateway recovery attempts after a failed load
    #[serde(default = "default_recovery_retry")]
    pub recovery_retry_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            master: default_master(),
            gateway: default_gateway(),
            replication_addr: default_replication_addr(),
            peers: Vec::new(),
            republish_interval_secs: default_republish_interval(),
            recovery_retry_secs: default_recovery_retry(),
        }
    }
}

// Default value functions
fn default_redis_url() -> String { DEFAULT_REDIS_URL.to_string() }
fn default_listen_addr() -> String { DEFAULT_LISTEN_ADDR.to_string() }
fn default_master() -> bool { true }
fn default_gateway() -> GatewayKind { GatewayKind::Memory }
fn default_replication_addr() -> String { DEFAULT_REPLICATION_ADDR.to_string() }
fn default_republish_interval() -> u64 { REPUBLISH_INTERVAL_SECS }
fn default_recovery_retry() -> u64 { RECOVERY_RETRY_SECS }

fn generate_node_id() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    format!("node-{:08x}", rng.random::<u32>())
}

impl AppConfig {
    /// Load configuration from file, with CLI overrides
    pub fn load(config_path: &str, args: &super::Args) -> Result<Self> {
        let mut config = if Path::new(config_path).exists() {
            let settings = config::Config::builder()
                .add_source(config::File::with_name(config_path))
                .add_source(config::Environment::with_prefix("KEYSTONE").separator("__"))
                .build()
                .context("Failed to load config file")?;

            settings
                .try_deserialize()
                .context("Failed to parse config")?
        } else {
            // Use defaults if config file doesn't exist
            tracing::warn!("Config file not found, using defaults");
            Self::default()
        };

        // Apply CLI overrides
        if let Some(ref redis_url) = args.redis_url {
            config.redis_url = redis_url.clone();
        }
        if let Some(ref listen) = args.listen {
            config.listen_addr = listen.clone();
        }
        if let Some(ref node_id) = args.node_id {
            config.node_id = node_id.clone();
        }
        if let Some(gateway) = args.gateway {
            config.cluster.gateway = gateway;
        }
        if args.follower {
            config.cluster.master = false;
        }
        if let Some(ref replication_addr) = args.replication_addr {
            config.cluster.replication_addr = replication_addr.clone();
        }
        if !args.peers.is_empty() {
            config.cluster.peers = args.peers.clone();
        }

        Ok(config)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            listen_addr: default_listen_addr(),
            node_id: generate_node_id(),
            cluster: ClusterConfig::default(),
        }
    }
}
