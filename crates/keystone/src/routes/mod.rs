//! HTTP route handlers for Keystone.

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, put},
};
use keystone_common::KeystoneError;
use keystone_common::constants::headers;
use serde::Serialize;
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

mod cluster;
mod health;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Status
        .route("/health", get(health::health_check))
        .route("/ready", get(health::ready_check))

        // Cluster identity
        .route("/cluster-id", get(cluster::get_cluster_id))

        // Admin endpoints
        .nest("/admin", admin_routes())

        .layer(middleware::from_fn_with_state(state.clone(), tag_response))
        .layer(TraceLayer::new_for_http())

        // Add shared state
        .with_state(state)
}

/// Admin routes (state inspection, settings)
fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/state", get(cluster::get_state))
        .route("/settings", put(cluster::update_settings))
}

/// Tag every response with the node and, once known, the cluster identifier
async fn tag_response(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let response_headers = response.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&state.node_id) {
        response_headers.insert(headers::X_NODE_ID, value);
    }
    if let Some(cluster_id) = state.current_cluster_id() {
        if let Ok(value) = HeaderValue::from_str(cluster_id.value()) {
            response_headers.insert(headers::X_CLUSTER_ID, value);
        }
    }

    response
}

/// Errors surfaced by handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Cluster(#[from] KeystoneError),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Cluster(e) => StatusCode::from_u16(e.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        };

        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterIdService, ClusterService};
    use crate::config::AppConfig;
    use crate::gateway::{Gateway, MemoryGateway};
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tower::ServiceExt;

    fn spawn_app(elect: bool) -> (Router, AppState, broadcast::Sender<()>) {
        let config = AppConfig {
            node_id: "node-1".to_string(),
            ..Default::default()
        };
        let gateway = Gateway::Memory(MemoryGateway::default());
        let (mut service, handle) = ClusterService::new("node-1", gateway.clone());
        let cluster_id = Arc::new(ClusterIdService::new("node-1", Arc::new(handle.clone())));
        service.add_listener(cluster_id.clone());

        let (shutdown, _) = broadcast::channel(1);
        tokio::spawn(service.run(shutdown.subscribe()));
        if elect {
            handle.elect_master(Some("node-1".into())).unwrap();
        }

        let state = AppState::new(config, handle, cluster_id, gateway);
        (create_router(state.clone()), state, shutdown)
    }

    async fn wait_for_cluster_id(state: &AppState) {
        for _ in 0..200 {
            if state.current_cluster_id().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("cluster id never assigned");
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn put_json(uri: &str, json: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("PUT")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_unassigned_cluster_id_is_reported_as_null() {
        let (app, _state, shutdown) = spawn_app(false);

        let response = app.clone().oneshot(get("/cluster-id")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[headers::X_NODE_ID], "node-1");
        assert!(response.headers().get(headers::X_CLUSTER_ID).is_none());
        let body = body_json(response).await;
        assert!(body["cluster_id"].is_null());

        let response = app.oneshot(get("/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_ready_once_cluster_id_assigned() {
        let (app, state, shutdown) = spawn_app(true);
        wait_for_cluster_id(&state).await;
        let cluster_id = state.current_cluster_id().unwrap();

        let response = app.clone().oneshot(get("/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[headers::X_CLUSTER_ID],
            cluster_id.value()
        );

        let body = body_json(app.oneshot(get("/cluster-id")).await.unwrap()).await;
        assert_eq!(body["cluster_id"], cluster_id.value());

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_settings_update_and_state() {
        let (app, state, shutdown) = spawn_app(true);
        wait_for_cluster_id(&state).await;

        let response = app
            .clone()
            .oneshot(put_json(
                "/admin/settings",
                r#"{"transient": {"cluster.blocks.read_only": "true"}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["acknowledged"], true);

        let body = body_json(app.oneshot(get("/admin/state")).await.unwrap()).await;
        assert_eq!(body["is_master"], true);
        assert_eq!(body["master_eligible"], true);
        assert_eq!(body["gateway"], "memory");
        assert_eq!(body["blocks"], serde_json::json!(["read_only"]));
        assert_eq!(
            body["metadata"]["transient_settings"]["cluster.blocks.read_only"],
            "true"
        );

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_cluster_id_cannot_be_set_through_settings() {
        let (app, state, shutdown) = spawn_app(true);
        wait_for_cluster_id(&state).await;
        let before = state.current_cluster_id();

        let response = app
            .clone()
            .oneshot(put_json("/admin/settings", r#"{"transient": {"cluster_id": "forged"}}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(put_json("/admin/settings", "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert_eq!(state.current_cluster_id(), before);
        assert_eq!(
            state.cluster.state().cluster_id(),
            before
        );

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _state, shutdown) = spawn_app(false);
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
        let _ = shutdown.send(());
    }
}
