//! Server runtime: bind, register in the discovery table, serve until
//! shutdown, unregister.
//!
//! Binds loopback only. The client script and the agent both run on the
//! developer's machine; nothing here is meant to be reachable from
//! elsewhere.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use super::{api, token, AppState};
use crate::config::{Config, DeliveryMode};
use crate::delivery::subprocess::SubprocessExecutor;
use crate::errors::GatewayError;
use crate::memory::MemoryStore;
use crate::store::ChangeStore;

/// Outbound frames buffered per connection before the client starts
/// lagging.
const BROADCAST_CAPACITY: usize = 256;

/// Run the gateway until ctrl-c. Owns the full server lifecycle including
/// the discovery-registry entry.
pub async fn run(config: Config) -> Result<(), GatewayError> {
    let token = token::load_or_generate(&config.token_file())?;
    let (outbound, _) = broadcast::channel(BROADCAST_CAPACITY);

    let executor = match config.delivery {
        DeliveryMode::Subprocess => Some(Arc::new(SubprocessExecutor::new(
            ChangeStore::new(config.tasks_file()),
            MemoryStore::new(config.memory_dir()),
            outbound.clone(),
            config.clone(),
        ))),
        DeliveryMode::ToolCall => None,
    };

    let state = Arc::new(AppState::new(&config, token.clone(), outbound, executor));

    let project_path = std::env::current_dir()
        .map(|dir| dir.to_string_lossy().to_string())
        .unwrap_or_default();
    if let Err(err) = state.registry.register(&token, config.port, &project_path) {
        warn!(error = %err, "Could not register in discovery table");
    }

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| GatewayError::BindFailed {
            addr: addr.to_string(),
            source,
        })?;

    info!(
        %addr,
        delivery = ?config.delivery,
        project = %state.project_name,
        "Server listening"
    );

    let app = api::router(Arc::clone(&state));
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Unregister on every exit path, clean shutdown or serve error alike.
    if let Err(err) = state.registry.unregister() {
        warn!(error = %err, "Could not remove discovery entry");
    }

    serve_result.map_err(|e| GatewayError::Other(anyhow::anyhow!("server error: {e}")))?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown requested");
}
