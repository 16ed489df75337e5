//! Application state and shared resources.

use chrono::{DateTime, Utc};
use keystone_common::ClusterId;
use std::sync::Arc;

use crate::cluster::{ClusterHandle, ClusterIdService};
use crate::config::AppConfig;
use crate::gateway::Gateway;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: AppConfig,

    /// Node identifier for clustering
    pub node_id: String,

    /// Access to the local cluster state service
    pub cluster: ClusterHandle,

    /// Cluster identity, adopted once committed
    pub cluster_id: Arc<ClusterIdService>,

    /// Metadata persistence backend (readiness probe)
    pub gateway: Gateway,

    /// Process start time
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        cluster: ClusterHandle,
        cluster_id: Arc<ClusterIdService>,
        gateway: Gateway,
    ) -> Self {
        let node_id = cluster.node_id().to_string();

        Self {
            config,
            node_id,
            cluster,
            cluster_id,
            gateway,
            started_at: Utc::now(),
        }
    }

    /// Committed cluster identifier, if this node has adopted one
    pub fn current_cluster_id(&self) -> Option<ClusterId> {
        self.cluster_id.current_identifier()
    }

    pub fn uptime_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }
}
