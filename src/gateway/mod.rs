//! Transport gateway: the authenticated WebSocket the browser client talks
//! to, plus the HTTP surface for status, discovery, pending-task listing,
//! and the network framing of the tool-call protocol.

pub mod api;
pub mod server;
pub mod token;
pub mod ws;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::Config;
use crate::delivery::rpc::RpcHandler;
use crate::delivery::subprocess::SubprocessExecutor;
use crate::delivery::toolcall::ToolCallSurface;
use crate::memory::MemoryStore;
use crate::registry::InstanceRegistry;
use crate::store::{Change, ChangeStore};

/// Connection lifecycle, driven entirely by socket open/close events.
/// Reconnection timing is owned by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Service object owning all gateway state. Constructed once at process
/// start; the backing files remain the source of truth and are re-read on
/// each query.
pub struct AppState {
    pub store: ChangeStore,
    pub memory: MemoryStore,
    pub registry: InstanceRegistry,
    pub token: String,
    pub port: u16,
    pub project_name: String,
    /// Fan-out to the connected client (text frames, already serialized)
    pub outbound: broadcast::Sender<String>,
    /// Bumped per accepted connection; older socket loops observe the bump
    /// and exit, implementing replace-not-reject for a second client.
    conn_gen: AtomicU64,
    conn_state: std::sync::RwLock<ConnectionState>,
    /// Present when the deployment delivers by spawning the agent
    pub executor: Option<Arc<SubprocessExecutor>>,
    /// Tool-call surface framed as JSON-RPC, served at POST /rpc
    pub rpc: RpcHandler,
}

impl AppState {
    pub fn new(
        config: &Config,
        token: String,
        outbound: broadcast::Sender<String>,
        executor: Option<Arc<SubprocessExecutor>>,
    ) -> Self {
        let project_name = std::env::current_dir()
            .ok()
            .and_then(|dir| dir.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_default();
        let store = ChangeStore::new(config.tasks_file());
        let memory = MemoryStore::new(config.memory_dir());
        let rpc = RpcHandler::new(ToolCallSurface::new(
            store.clone(),
            memory.clone(),
            outbound.clone(),
            config.clone(),
        ));
        Self {
            store,
            memory,
            registry: InstanceRegistry::new(config.registry_file()),
            token,
            port: config.port,
            project_name,
            outbound,
            conn_gen: AtomicU64::new(0),
            conn_state: std::sync::RwLock::new(ConnectionState::Disconnected),
            executor,
            rpc,
        }
    }

    /// Register a newly-accepted connection, returning its generation.
    /// Any previously-tracked connection is superseded.
    pub fn connection_opened(&self) -> u64 {
        let generation = self.conn_gen.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_conn_state(ConnectionState::Connected);
        generation
    }

    /// True while `generation` is still the tracked connection.
    pub fn connection_is_current(&self, generation: u64) -> bool {
        self.conn_gen.load(Ordering::SeqCst) == generation
    }

    pub fn connection_closed(&self, generation: u64) {
        // Only the tracked connection's close moves the state machine;
        // a superseded socket closing must not mark the new one dead.
        if self.connection_is_current(generation) {
            self.set_conn_state(ConnectionState::Disconnected);
        }
    }

    pub fn conn_state(&self) -> ConnectionState {
        *self.conn_state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_conn_state(&self, state: ConnectionState) {
        *self.conn_state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    // ── Outbound notifications ──────────────────────────────────────────

    pub fn notify_task_update(&self, change: &Change) {
        self.broadcast(&ws::ServerMessage::TaskUpdate {
            task: change.clone(),
        });
    }

    pub fn notify_change_applied(&self, change_id: &str) {
        self.broadcast(&ws::ServerMessage::ChangeApplied {
            change_id: change_id.to_string(),
        });
    }

    pub fn notify_change_failed(&self, change_id: &str, reason: &str) {
        self.broadcast(&ws::ServerMessage::ChangeFailed {
            change_id: change_id.to_string(),
            reason: reason.to_string(),
        });
    }

    pub fn notify_auto_apply_failed(&self, change_id: &str, error: &str) {
        self.broadcast(&ws::ServerMessage::AutoApplyFailed {
            change_id: change_id.to_string(),
            error: error.to_string(),
        });
    }

    fn broadcast(&self, msg: &ws::ServerMessage) {
        ws::broadcast_message(&self.outbound, msg);
    }
}
