//! HTTP surface of the gateway.
//!
//! Everything a client needs before it has a WebSocket: `/status` for
//! handshake parameters, `/servers` for instance discovery, `/tasks` for
//! the pending queue (polled by the notification hook), and `/rpc` for the
//! tool-call surface over plain HTTP. CORS is permissive; the page the
//! client script runs on is never same-origin with this server.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;

use super::{ws, AppState, ConnectionState};
use crate::store::Change;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/servers", get(servers))
        .route("/tasks", get(tasks))
        .route("/rpc", post(rpc))
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Handshake parameters for a client that already knows the port.
async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let connection = match state.conn_state() {
        ConnectionState::Disconnected => "disconnected",
        ConnectionState::Connecting => "connecting",
        ConnectionState::Connected => "connected",
    };
    Json(json!({
        "status": "ok",
        "wsPort": state.port,
        "requiresToken": true,
        "projectName": state.project_name,
        "pid": std::process::id(),
        "version": env!("CARGO_PKG_VERSION"),
        "connection": connection,
    }))
}

/// Every live instance on this machine, dead entries pruned.
async fn servers(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({ "servers": state.registry.live_entries() }))
}

/// Pending queue summaries. The notification hook polls this.
async fn tasks(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let tasks: Vec<serde_json::Value> = state
        .store
        .get_pending(false)
        .iter()
        .map(Change::summary)
        .collect();
    Json(json!({ "count": tasks.len(), "tasks": tasks }))
}

/// The tool-call surface over HTTP. Notifications get 204.
async fn rpc(State(state): State<Arc<AppState>>, body: String) -> Response {
    match state.rpc.handle_raw(&body) {
        Some(response) => Json(response).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}
