//! Discovery registry of running server instances.
//!
//! One nudge server runs per project; a client that was started
//! independently (browser extension, agent session) reads this table to
//! find the right port and pairing token. Entries are keyed by process id
//! and pruned on every read/write: if the process is gone, so is the entry.
//!
//! All operations are best-effort. Registry I/O failures are logged and
//! never crash the host process.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::StoreError;

const SCHEMA_VERSION: u32 = 1;

/// Discovery record for one running server instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEntry {
    /// Pairing token for the owning process
    pub token: String,
    pub project_path: String,
    pub project_name: String,
    pub port: u16,
    pub process_id: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct RegistryTable {
    schema: u32,
    /// Keyed by process id (stringified for JSON object keys)
    servers: BTreeMap<String, ServerEntry>,
}

impl RegistryTable {
    fn empty() -> Self {
        Self {
            schema: SCHEMA_VERSION,
            servers: BTreeMap::new(),
        }
    }
}

/// File-backed registry table shared by all instances on the machine.
#[derive(Debug, Clone)]
pub struct InstanceRegistry {
    path: PathBuf,
}

impl InstanceRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Upsert this process's entry, pruning dead entries first.
    pub fn register(
        &self,
        token: &str,
        port: u16,
        project_path: &str,
    ) -> Result<ServerEntry, StoreError> {
        let pid = std::process::id();
        let entry = ServerEntry {
            token: token.to_string(),
            project_path: project_path.to_string(),
            project_name: project_name_of(project_path),
            port,
            process_id: pid,
            started_at: Utc::now(),
        };

        let mut table = self.load_pruned();
        table.servers.insert(pid.to_string(), entry.clone());
        self.write(&table)?;
        Ok(entry)
    }

    /// Remove this process's entry. Called on every exit path.
    pub fn unregister(&self) -> Result<(), StoreError> {
        let pid = std::process::id().to_string();
        let mut table = self.load_pruned();
        table.servers.remove(&pid);
        self.write(&table)?;
        Ok(())
    }

    /// All entries whose owning process is still alive. Pruned entries are
    /// also removed from the backing file as a side effect.
    pub fn live_entries(&self) -> Vec<ServerEntry> {
        let table = self.load_pruned();
        // Persist the prune so later readers skip the liveness probes.
        // Best-effort: a write failure only delays the cleanup.
        if let Err(err) = self.write(&table) {
            warn!(error = %err, "Failed to persist registry prune");
        }
        table.servers.into_values().collect()
    }

    fn load_pruned(&self) -> RegistryTable {
        let mut table = self.load();
        table
            .servers
            .retain(|_, entry| process_alive(entry.process_id));
        table
    }

    fn load(&self) -> RegistryTable {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return RegistryTable::empty();
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "Failed to read registry");
                return RegistryTable::empty();
            }
        };
        match serde_json::from_str::<RegistryTable>(&raw) {
            Ok(table) if table.schema == SCHEMA_VERSION => table,
            Ok(table) => {
                warn!(schema = table.schema, "Unknown registry schema, starting empty");
                RegistryTable::empty()
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "Corrupt registry, starting empty");
                RegistryTable::empty()
            }
        }
    }

    fn write(&self, table: &RegistryTable) -> Result<(), StoreError> {
        let write_err = |source| StoreError::WriteFailed {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let json = serde_json::to_string_pretty(table)
            .map_err(|e| StoreError::Other(anyhow::anyhow!("serialize registry: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(write_err)?;
        fs::rename(&tmp, &self.path).map_err(write_err)?;
        Ok(())
    }
}

fn project_name_of(project_path: &str) -> String {
    Path::new(project_path)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| project_path.to_string())
}

/// Signal-zero liveness probe. EPERM means the process exists but belongs
/// to another user, which still counts as alive.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Without a portable probe, entries are only removed by explicit
/// unregister on this platform.
#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn registry(dir: &Path) -> InstanceRegistry {
        InstanceRegistry::new(dir.join("servers.json"))
    }

    fn dead_entry(pid: u32) -> ServerEntry {
        ServerEntry {
            token: "tok".to_string(),
            project_path: "/tmp/other".to_string(),
            project_name: "other".to_string(),
            port: 4100,
            process_id: pid,
            started_at: Utc::now(),
        }
    }

    /// A pid that is extremely unlikely to exist (beyond default pid_max).
    const DEAD_PID: u32 = 4_000_000;

    #[test]
    fn register_then_live_entries_contains_self() {
        let dir = tempdir().unwrap();
        let registry = registry(dir.path());

        registry.register("secret", 4100, "/tmp/myproj").unwrap();
        let entries = registry.live_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].process_id, std::process::id());
        assert_eq!(entries[0].project_name, "myproj");
        assert_eq!(entries[0].port, 4100);
        assert_eq!(entries[0].token, "secret");
    }

    #[test]
    fn unregister_removes_own_entry() {
        let dir = tempdir().unwrap();
        let registry = registry(dir.path());

        registry.register("secret", 4100, "/tmp/myproj").unwrap();
        registry.unregister().unwrap();
        assert!(registry.live_entries().is_empty());
    }

    #[test]
    fn register_is_an_upsert() {
        let dir = tempdir().unwrap();
        let registry = registry(dir.path());

        registry.register("old", 4100, "/tmp/a").unwrap();
        registry.register("new", 4200, "/tmp/b").unwrap();
        let entries = registry.live_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].token, "new");
        assert_eq!(entries[0].port, 4200);
    }

    #[cfg(unix)]
    #[test]
    fn dead_entries_are_pruned_live_ones_kept() {
        let dir = tempdir().unwrap();
        let registry = registry(dir.path());

        // Seed a table with one live (our own pid) and one dead entry.
        let mut table = RegistryTable::empty();
        let live_pid = std::process::id();
        let mut live = dead_entry(live_pid);
        live.project_name = "live".to_string();
        table.servers.insert(live_pid.to_string(), live);
        table
            .servers
            .insert(DEAD_PID.to_string(), dead_entry(DEAD_PID));
        registry.write(&table).unwrap();

        let entries = registry.live_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].process_id, live_pid);

        // The prune is persisted back to the file.
        let raw = fs::read_to_string(registry.path()).unwrap();
        assert!(!raw.contains(&DEAD_PID.to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(DEAD_PID));
    }

    #[test]
    fn corrupt_registry_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("servers.json");
        fs::write(&path, "garbage").unwrap();

        let registry = InstanceRegistry::new(&path);
        assert!(registry.live_entries().is_empty());
        registry.register("t", 1, "/p").unwrap();
        assert_eq!(registry.live_entries().len(), 1);
    }

    #[test]
    fn missing_file_is_empty_registry() {
        let dir = tempdir().unwrap();
        let registry = registry(dir.path());
        assert!(registry.live_entries().is_empty());
    }

    #[test]
    fn entry_serializes_camel_case() {
        let entry = dead_entry(123);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains(r#""projectPath""#));
        assert!(json.contains(r#""processId""#));
        assert!(json.contains(r#""startedAt""#));
    }
}
