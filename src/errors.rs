//! Typed error hierarchy for the nudge orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `StoreError` — request store, subject memory, and registry failures
//! - `GatewayError` — socket/HTTP transport and authentication failures
//! - `DeliveryError` — agent delivery failures (spawn and tool-call paths)

use thiserror::Error;

/// Errors from the durable stores (request queue, subject memory, registry).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to read backing file at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write backing file at {path}: {source}")]
    WriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Change {id} not found")]
    NotFound { id: String },

    #[error("Backing table is corrupt: {0}")]
    Corrupt(#[source] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    /// True for failures of the backing medium (as opposed to unknown ids).
    /// Callers log these and fall back to a safe default rather than crash.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            StoreError::ReadFailed { .. } | StoreError::WriteFailed { .. } | StoreError::Corrupt(_)
        )
    }
}

/// Errors from the transport gateway (WebSocket + HTTP surface).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Connection token mismatch")]
    Auth,

    #[error("Malformed inbound message: {0}")]
    Protocol(String),

    #[error("Failed to bind {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from a delivery strategy handing a Change to the agent.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Failed to spawn agent process '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent exited with non-zero code {exit_code}")]
    NonZeroExit { exit_code: i32 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_not_found_carries_id() {
        let err = StoreError::NotFound { id: "chg-1".into() };
        match &err {
            StoreError::NotFound { id } => assert_eq!(id, "chg-1"),
            _ => panic!("Expected NotFound variant"),
        }
        assert!(err.to_string().contains("chg-1"));
        assert!(!err.is_persistence());
    }

    #[test]
    fn store_error_write_failed_is_persistence() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only fs");
        let err = StoreError::WriteFailed {
            path: std::path::PathBuf::from("/tmp/tasks.json"),
            source: io_err,
        };
        assert!(err.is_persistence());
        assert!(err.to_string().contains("tasks.json"));
    }

    #[test]
    fn gateway_error_auth_is_matchable() {
        let err = GatewayError::Auth;
        assert!(matches!(err, GatewayError::Auth));
    }

    #[test]
    fn gateway_error_converts_from_store_error() {
        let inner = StoreError::NotFound { id: "x".into() };
        let gw: GatewayError = inner.into();
        assert!(matches!(gw, GatewayError::Store(StoreError::NotFound { .. })));
    }

    #[test]
    fn delivery_error_spawn_carries_command() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = DeliveryError::Spawn {
            command: "claude".into(),
            source: io_err,
        };
        match &err {
            DeliveryError::Spawn { command, source } => {
                assert_eq!(command, "claude");
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected Spawn variant"),
        }
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::NotFound { id: "a".into() });
        assert_std_error(&GatewayError::Auth);
        assert_std_error(&DeliveryError::NonZeroExit { exit_code: 1 });
    }
}
