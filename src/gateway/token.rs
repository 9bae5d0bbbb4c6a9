//! Shared-secret pairing token.
//!
//! Generated once per server lifetime if no persisted token exists, else
//! reloaded so a client can reconnect after a server restart without
//! re-pairing. A persisted token shorter than the minimum is treated as
//! invalid and replaced.

use std::fs;
use std::path::Path;

use tracing::warn;

use crate::errors::StoreError;

/// Tokens shorter than this are rejected on load and regenerated.
pub const MIN_TOKEN_LEN: usize = 16;

/// Load the persisted token, or generate and persist a fresh one.
pub fn load_or_generate(path: &Path) -> Result<String, StoreError> {
    match fs::read_to_string(path) {
        Ok(raw) => {
            let token = raw.trim().to_string();
            if token.len() >= MIN_TOKEN_LEN {
                return Ok(token);
            }
            warn!(
                len = token.len(),
                "Persisted token below minimum length, regenerating"
            );
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Failed to read token, regenerating");
        }
    }

    let token = generate();
    persist(path, &token)?;
    Ok(token)
}

fn generate() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn persist(path: &Path, token: &str) -> Result<(), StoreError> {
    let write_err = |source| StoreError::WriteFailed {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    fs::write(path, token).map_err(write_err)?;
    Ok(())
}
