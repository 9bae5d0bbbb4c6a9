//! The client-facing WebSocket: handshake authentication, the inbound
//! message protocol, and outbound broadcasting.
//!
//! One client is tracked at a time. A second connection with a valid token
//! replaces the tracked client (the superseded socket loop notices the
//! generation bump and exits); an invalid token is rejected with a distinct
//! close code before any Change can be created. Malformed inbound frames
//! are logged and dropped without closing the connection.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::AppState;
use crate::store::change::{Change, ElementDescriptor};

/// Close code sent on a token mismatch (private-use range).
pub const AUTH_CLOSE_CODE: u16 = 4001;

/// How often a socket loop re-checks whether it has been superseded.
const SUPERSEDE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

// ── Message types ────────────────────────────────────────────────────

/// Messages the browser client sends.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Submit one flagged visual change
    VisualFeedback { payload: VisualFeedbackPayload },
    /// Ask for the current task table
    GetTasks,
    /// Liveness only; no reply
    Ping,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualFeedbackPayload {
    #[serde(default)]
    pub id: Option<String>,
    pub feedback: String,
    pub element: ElementDescriptor,
    #[serde(default)]
    pub project_path: String,
    #[serde(default)]
    pub page_url: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub visual_adjustments: BTreeMap<String, String>,
    #[serde(default)]
    pub css_framework: String,
}

/// Messages the server pushes to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "task_update")]
    TaskUpdate { task: Change },
    #[serde(rename = "tasks")]
    Tasks { tasks: Vec<serde_json::Value> },
    #[serde(rename = "CHANGE_APPLIED")]
    ChangeApplied {
        #[serde(rename = "changeId")]
        change_id: String,
    },
    #[serde(rename = "CHANGE_FAILED")]
    ChangeFailed {
        #[serde(rename = "changeId")]
        change_id: String,
        reason: String,
    },
    #[serde(rename = "AUTO_APPLY_FAILED")]
    AutoApplyFailed {
        #[serde(rename = "changeId")]
        change_id: String,
        error: String,
    },
}

/// Serialize and broadcast a ServerMessage to the connected client.
/// Silently a no-op when nothing is connected.
pub fn broadcast_message(tx: &broadcast::Sender<String>, msg: &ServerMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(err) => warn!(error = %err, "Failed to serialize outbound message"),
    }
}

// ── Handshake ────────────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let authorized = token_matches(params.get("token").map(String::as_str), &state.token);
    if authorized {
        state.set_conn_state(super::ConnectionState::Connecting);
    }
    ws.on_upgrade(move |socket| async move {
        if authorized {
            handle_socket(socket, state).await;
        } else {
            reject_socket(socket).await;
        }
    })
}

/// Constant-shape comparison of the handshake token against ours.
pub fn token_matches(presented: Option<&str>, expected: &str) -> bool {
    matches!(presented, Some(token) if token == expected)
}

/// Token mismatch: close with the distinct auth code without ever entering
/// the message loop, so no Change can originate from this connection. The
/// tracked client, if any, is left undisturbed.
async fn reject_socket(mut socket: WebSocket) {
    warn!("Rejecting connection: token mismatch");
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: AUTH_CLOSE_CODE,
            reason: "invalid token".into(),
        })))
        .await;
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let generation = state.connection_opened();
    info!(generation, "Client connected");

    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.outbound.subscribe();
    let mut supersede_check = tokio::time::interval(SUPERSEDE_CHECK_INTERVAL);
    supersede_check.tick().await;

    'socket: loop {
        tokio::select! {
            _ = supersede_check.tick() => {
                if !state.connection_is_current(generation) {
                    debug!(generation, "Superseded by a newer connection");
                    break;
                }
            }

            result = rx.recv() => {
                match result {
                    Ok(frame) => {
                        if sender.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Client fell behind on broadcasts");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        for reply in handle_client_text(&state, &text) {
                            if sender.send(Message::Text(reply.into())).await.is_err() {
                                debug!(generation, "Reply send failed, closing socket");
                                break 'socket;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(error = %err, "Socket error");
                        break;
                    }
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
    state.connection_closed(generation);
    info!(generation, "Client disconnected");
}

// ── Inbound protocol ─────────────────────────────────────────────────

/// Process one inbound text frame, returning the replies to send back in
/// order. Malformed frames produce no replies and leave all state
/// untouched.
pub fn handle_client_text(state: &Arc<AppState>, text: &str) -> Vec<String> {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(err) => {
            warn!(error = %err, "Dropping malformed inbound message");
            return Vec::new();
        }
    };

    match message {
        ClientMessage::Ping => Vec::new(),
        ClientMessage::GetTasks => {
            let tasks: Vec<serde_json::Value> = state
                .store
                .get_pending(true)
                .iter()
                .map(Change::summary)
                .collect();
            match serde_json::to_string(&ServerMessage::Tasks { tasks }) {
                Ok(reply) => vec![reply],
                Err(_) => Vec::new(),
            }
        }
        ClientMessage::VisualFeedback { payload } => submit_change(state, payload),
    }
}

fn submit_change(state: &Arc<AppState>, payload: VisualFeedbackPayload) -> Vec<String> {
    let mut change = Change::new(
        payload.id,
        payload.element,
        payload.feedback,
        payload.project_path,
        payload.page_url,
        payload.model,
    );
    change.visual_adjustments = payload.visual_adjustments;
    change.css_framework = payload.css_framework;

    if let Err(err) = state.store.add(change.clone()) {
        warn!(id = %change.id, error = %err, "Failed to persist change");
        return vec![serde_json::json!({
            "success": false,
            "error": err.to_string(),
        })
        .to_string()];
    }

    info!(id = %change.id, feedback = %change.feedback, "Change confirmed");

    let mut replies = Vec::new();
    if let Ok(update) = serde_json::to_string(&ServerMessage::TaskUpdate {
        task: change.clone(),
    }) {
        replies.push(update);
    }
    replies.push(
        serde_json::json!({
            "success": true,
            "taskId": change.id,
        })
        .to_string(),
    );

    // Subprocess deployments deliver immediately; tool-call deployments
    // leave the record for the agent to pull.
    if let Some(executor) = &state.executor {
        let executor = Arc::clone(executor);
        tokio::spawn(async move {
            executor.execute(change).await;
        });
    }

    replies
}
