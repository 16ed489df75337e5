//! Cluster identity and state endpoints.

use axum::{
    extract::State,
    Json,
};
use keystone_common::constants::sources;
use keystone_common::{ClusterBlocks, ClusterId, KeystoneError, Metadata, Priority, Settings};
use serde::{Deserialize, Serialize};

use super::ApiError;
use crate::cluster::{ClusterStateSubmitter, UpdateSettingsTask};
use crate::state::AppState;

#[derive(Serialize)]
pub struct ClusterIdResponse {
    node_id: String,
    /// `null` until the identifier is committed and adopted
    cluster_id: Option<ClusterId>,
}

/// Current cluster identifier; absence is reported, never an error
pub async fn get_cluster_id(
    State(state): State<AppState>,
) -> Json<ClusterIdResponse> {
    Json(ClusterIdResponse {
        node_id: state.node_id.clone(),
        cluster_id: state.current_cluster_id(),
    })
}

#[derive(Serialize)]
pub struct StateResponse {
    node_id: String,
    master_node_id: Option<String>,
    is_master: bool,
    /// Whether this node stands for election at startup
    master_eligible: bool,
    gateway: &'static str,
    replication_peers: Vec<String>,
    version: u64,
    cluster_id: Option<ClusterId>,
    uptime_secs: u64,
    metadata: Metadata,
    blocks: ClusterBlocks,
}

/// Snapshot of the locally applied cluster state
pub async fn get_state(
    State(state): State<AppState>,
) -> Json<StateResponse> {
    let cluster = state.cluster.state();

    Json(StateResponse {
        node_id: state.node_id.clone(),
        master_node_id: cluster.master_node_id().map(str::to_string),
        is_master: cluster.is_local_node_master(),
        master_eligible: state.config.cluster.master,
        gateway: state.gateway.kind(),
        replication_peers: state.config.cluster.peers.clone(),
        version: cluster.version(),
        cluster_id: state.current_cluster_id(),
        uptime_secs: state.uptime_secs(),
        metadata: cluster.metadata().clone(),
        blocks: cluster.blocks().clone(),
    })
}

#[derive(Deserialize)]
pub struct UpdateSettingsRequest {
    #[serde(default)]
    persistent: Settings,
    #[serde(default)]
    transient: Settings,
}

#[derive(Serialize)]
pub struct UpdateSettingsResponse {
    acknowledged: bool,
    version: u64,
}

/// Merge settings into cluster metadata; waits for the commit
pub async fn update_settings(
    State(state): State<AppState>,
    Json(payload): Json<UpdateSettingsRequest>,
) -> Result<Json<UpdateSettingsResponse>, ApiError> {
    if payload.persistent.is_empty() && payload.transient.is_empty() {
        return Err(KeystoneError::InvalidInput("no settings to update".into()).into());
    }

    let (task, reply) = UpdateSettingsTask::new(payload.persistent, payload.transient);
    state
        .cluster
        .submit_state_update_task(sources::UPDATE_SETTINGS, Priority::High, Box::new(task));

    let version = reply.await.map_err(|_| KeystoneError::QueueClosed)??;

    tracing::info!(version, "Cluster settings updated");

    Ok(Json(UpdateSettingsResponse {
        acknowledged: true,
        version,
    }))
}
