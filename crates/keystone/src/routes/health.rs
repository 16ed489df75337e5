//! Health check endpoints.

use axum::{
    extract::State,
    http::StatusCode,
    Json,
};
use keystone_common::ClusterId;
use serde::Serialize;

use crate::gateway::Gateway;
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Basic health check (is the server running?)
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
pub struct ReadyResponse {
    status: &'static str,
    cluster_id: ClusterId,
    gateway: &'static str,
}

/// Readiness check: the cluster identifier is assigned and the gateway reachable
pub async fn ready_check(
    State(state): State<AppState>,
) -> Result<Json<ReadyResponse>, StatusCode> {
    let Some(cluster_id) = state.current_cluster_id() else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    if !check_gateway(&state.gateway).await {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(Json(ReadyResponse {
        status: "ready",
        cluster_id,
        gateway: state.gateway.kind(),
    }))
}

async fn check_gateway(gateway: &Gateway) -> bool {
    match gateway {
        Gateway::Memory(_) => true,
        Gateway::Redis(redis) => redis.ping().await,
    }
}
