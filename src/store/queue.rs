//! Durable, file-backed request queue.
//!
//! The whole table lives in one pretty-printed JSON file. Every mutation is
//! a full read-modify-write: load the table, mutate in memory, serialize the
//! whole table back. Writes go through a temp file + rename, and an advisory
//! file lock is held across the read-modify-write so two server instances
//! sharing a data dir cannot lose updates to each other.
//!
//! The file is the sole source of truth; nothing is cached between calls.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::warn;

use crate::errors::StoreError;
use crate::store::change::{Change, ChangeStatus};

/// Current on-disk schema version.
const SCHEMA_VERSION: u32 = 1;

/// Oldest records are evicted once the table grows past this.
const MAX_RETAINED: usize = 100;

#[derive(serde::Serialize, serde::Deserialize)]
struct Table {
    schema: u32,
    /// Insertion order, oldest first.
    changes: Vec<Change>,
}

impl Table {
    fn empty() -> Self {
        Table {
            schema: SCHEMA_VERSION,
            changes: Vec::new(),
        }
    }
}

/// The durable request store. Cheap to clone; holds only paths.
#[derive(Debug, Clone)]
pub struct ChangeStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl ChangeStore {
    /// Open a store backed by `path` (conventionally `<data dir>/tasks.json`).
    /// The file is created lazily on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("json.lock");
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert a new Change. Fails if the id already exists or the backing
    /// file cannot be written. Evicts oldest records past the retention cap.
    pub fn add(&self, change: Change) -> Result<(), StoreError> {
        self.with_table(|table| {
            if table.changes.iter().any(|c| c.id == change.id) {
                return Err(StoreError::Other(anyhow::anyhow!(
                    "duplicate change id {}",
                    change.id
                )));
            }
            table.changes.push(change);
            while table.changes.len() > MAX_RETAINED {
                let evicted = table.changes.remove(0);
                warn!(id = %evicted.id, "Evicting oldest change past retention cap");
            }
            Ok(())
        })
    }

    /// Fetch one record by id.
    pub fn get(&self, id: &str) -> Result<Change, StoreError> {
        let table = self.load();
        table
            .changes
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    /// All records awaiting the agent, in insertion order. With
    /// `include_applied` the full table is returned instead.
    pub fn get_pending(&self, include_applied: bool) -> Vec<Change> {
        let table = self.load();
        table
            .changes
            .into_iter()
            .filter(|c| include_applied || c.status.is_pending())
            .collect()
    }

    /// Transition a record to `processing`. Used by delivery strategies
    /// before handing the Change to the agent.
    pub fn mark_processing(&self, id: &str) -> Result<Change, StoreError> {
        self.mutate(id, |c| {
            c.status = ChangeStatus::Processing;
        })
    }

    /// Transition to `applied`. Idempotent: marking an already-applied
    /// record is a no-op success.
    pub fn mark_applied(&self, id: &str) -> Result<Change, StoreError> {
        self.mutate(id, |c| {
            if c.status != ChangeStatus::Applied {
                c.status = ChangeStatus::Applied;
                c.failure_reason = None;
            }
        })
    }

    /// Transition to `failed`, bump the retry counter, and overwrite the
    /// failure reason. Calling twice records two attempts.
    pub fn mark_failed(&self, id: &str, reason: &str) -> Result<Change, StoreError> {
        self.mutate(id, |c| {
            c.status = ChangeStatus::Failed;
            c.retry_count += 1;
            c.failure_reason = Some(reason.to_string());
        })
    }

    /// Apply delivery bookkeeping (captured log, exit code, commit info)
    /// without touching the status fields.
    pub fn record_delivery(
        &self,
        id: &str,
        output_log: &str,
        exit_code: Option<i32>,
        commit: Option<String>,
        commit_url: Option<String>,
    ) -> Result<Change, StoreError> {
        self.mutate(id, |c| {
            c.output_log = output_log.to_string();
            c.exit_code = exit_code;
            c.commit = commit.clone();
            c.commit_url = commit_url.clone();
        })
    }

    /// Remove one record.
    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.with_table(|table| {
            let before = table.changes.len();
            table.changes.retain(|c| c.id != id);
            if table.changes.len() == before {
                return Err(StoreError::NotFound { id: id.to_string() });
            }
            Ok(())
        })
    }

    /// Empty the table.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.with_table(|table| {
            table.changes.clear();
            Ok(())
        })
    }

    /// Count of records per status, used for reporting before a bulk clear.
    pub fn status_counts(&self) -> HashMap<ChangeStatus, usize> {
        let table = self.load();
        let mut counts = HashMap::new();
        for change in &table.changes {
            *counts.entry(change.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.load().changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Backing-file plumbing ───────────────────────────────────────────

    /// Load the table, falling back to an empty one on a missing, corrupt,
    /// or unknown-schema file. Persistence failures are logged, never fatal.
    fn load(&self) -> Table {
        match self.try_load() {
            Ok(table) => table,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "Falling back to empty table");
                Table::empty()
            }
        }
    }

    fn try_load(&self) -> Result<Table, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Table::empty());
            }
            Err(err) => {
                return Err(StoreError::ReadFailed {
                    path: self.path.clone(),
                    source: err,
                });
            }
        };
        let table: Table = serde_json::from_str(&raw).map_err(StoreError::Corrupt)?;
        if table.schema != SCHEMA_VERSION {
            warn!(
                schema = table.schema,
                "Unknown table schema version, starting empty"
            );
            return Ok(Table::empty());
        }
        Ok(table)
    }

    /// Run a mutation against the table under the advisory lock, then write
    /// the whole table back atomically.
    fn with_table<T>(&self, f: impl FnOnce(&mut Table) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let _guard = self.lock()?;
        let mut table = self.try_load().unwrap_or_else(|err| {
            warn!(path = %self.path.display(), error = %err, "Rebuilding table from empty");
            Table::empty()
        });
        let out = f(&mut table)?;
        self.write_table(&table)?;
        Ok(out)
    }

    fn mutate(&self, id: &str, f: impl FnOnce(&mut Change)) -> Result<Change, StoreError> {
        self.with_table(|table| {
            let change = table
                .changes
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
            f(change);
            Ok(change.clone())
        })
    }

    /// Serialize and replace the backing file via temp + rename so readers
    /// never observe a partial write.
    fn write_table(&self, table: &Table) -> Result<(), StoreError> {
        let write_err = |source| StoreError::WriteFailed {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let json = serde_json::to_string_pretty(table)
            .map_err(|e| StoreError::Other(anyhow::anyhow!("serialize table: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(write_err)?;
        fs::rename(&tmp, &self.path).map_err(write_err)?;
        Ok(())
    }

    /// Advisory lock held for the duration of one read-modify-write.
    fn lock(&self) -> Result<LockGuard, StoreError> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::WriteFailed {
                path: self.lock_path.clone(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|source| StoreError::WriteFailed {
                path: self.lock_path.clone(),
                source,
            })?;
        file.lock_exclusive().map_err(|source| StoreError::WriteFailed {
            path: self.lock_path.clone(),
            source,
        })?;
        Ok(LockGuard { file })
    }
}

struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
