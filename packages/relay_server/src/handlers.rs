use axum::{
    Json, Router,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

use recoil_relay::{ConnectionId, TxId};

use crate::actor::RelayHandle;
use crate::config::ServerConfig;
use crate::ws::{PortParams, handle_port};

#[derive(Clone)]
pub struct AppState {
    pub relay: RelayHandle,
    pub server_config: Arc<ServerConfig>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(relay: RelayHandle, server_config: ServerConfig) -> Self {
        Self {
            relay,
            server_config: Arc::new(server_config),
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/connections", get(list_connections_handler))
        .route("/api/connections/{id}", get(get_connection_handler))
        .route("/api/connections/{id}/values/{key}", get(get_value_handler))
        .route("/api/connections/{id}/diff/{key}", get(get_diff_handler))
        .route("/api/connections/{id}/nodes/{key}", get(get_node_handler))
        .route("/api/connections/{id}/snapshot", get(get_snapshot_handler))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct TxQuery {
    pub tx: Option<TxId>,
}

/// Whole-snapshot answer; mirrors the `status` tagging of single-key lookups
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum SnapshotResponse {
    Present { values: BTreeMap<String, Value> },
    Unavailable,
}

fn not_found(id: ConnectionId) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "error": "unknown_connection",
            "connection_id": id,
        })),
    )
        .into_response()
}

fn relay_unavailable(e: anyhow::Error) -> Response {
    error!("Relay query failed: {}", e);
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({ "error": "relay_unavailable" })),
    )
        .into_response()
}

/// Upgrade to a relay port
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<PortParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let relay = state.relay.clone();
    let capacity = state.server_config.send_channel_capacity;
    ws.on_upgrade(move |socket| handle_port(socket, relay, params, capacity))
}

pub async fn list_connections_handler(State(state): State<AppState>) -> Response {
    match state.relay.list_connections().await {
        Ok(connections) => Json(connections).into_response(),
        Err(e) => relay_unavailable(e),
    }
}

pub async fn get_connection_handler(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> Response {
    let id = ConnectionId(id);
    match state.relay.get_connection(id).await {
        Ok(Some(summary)) => Json(summary).into_response(),
        Ok(None) => not_found(id),
        Err(e) => relay_unavailable(e),
    }
}

pub async fn get_value_handler(
    State(state): State<AppState>,
    Path((id, key)): Path<(u32, String)>,
    Query(query): Query<TxQuery>,
) -> Response {
    let id = ConnectionId(id);
    match state.relay.get_value(id, key, query.tx).await {
        Ok(Some(lookup)) => Json(lookup).into_response(),
        Ok(None) => not_found(id),
        Err(e) => relay_unavailable(e),
    }
}

pub async fn get_diff_handler(
    State(state): State<AppState>,
    Path((id, key)): Path<(u32, String)>,
    Query(query): Query<TxQuery>,
) -> Response {
    let id = ConnectionId(id);
    match state.relay.get_diff(id, key, query.tx).await {
        Ok(Some(diff)) => Json(diff).into_response(),
        Ok(None) => not_found(id),
        Err(e) => relay_unavailable(e),
    }
}

pub async fn get_node_handler(
    State(state): State<AppState>,
    Path((id, key)): Path<(u32, String)>,
) -> Response {
    let id = ConnectionId(id);
    match state.relay.get_node(id, key).await {
        Ok(Some(details)) => Json(details).into_response(),
        Ok(None) => not_found(id),
        Err(e) => relay_unavailable(e),
    }
}

pub async fn get_snapshot_handler(
    State(state): State<AppState>,
    Path(id): Path<u32>,
    Query(query): Query<TxQuery>,
) -> Response {
    let id = ConnectionId(id);
    match state.relay.get_snapshot(id, query.tx).await {
        Ok(Some(Some(values))) => Json(SnapshotResponse::Present { values }).into_response(),
        Ok(Some(None)) => Json(SnapshotResponse::Unavailable).into_response(),
        Ok(None) => not_found(id),
        Err(e) => relay_unavailable(e),
    }
}

/// Health check endpoint - relay counters plus uptime
pub async fn health_handler(State(state): State<AppState>) -> Response {
    match state.relay.health().await {
        Ok(health) => Json(serde_json::json!({
            "status": "healthy",
            "connections": health.connections,
            "subscribers": health.subscribers,
            "open_ports": health.open_ports,
            "uptime_secs": state.started_at.elapsed().as_secs(),
            "stats": health.stats,
        }))
        .into_response(),
        Err(e) => relay_unavailable(e),
    }
}
