//! Tool-call delivery: the queue exposed as callable tools for a
//! long-running agent session.
//!
//! Instead of spawning a process per Change, the agent pulls work itself:
//! `retrieve` hands over every pending record as a rendered prompt and
//! moves it to `processing`; the agent reports back through `mark_applied`
//! / `mark_failed`. Every transition made here is broadcast to the
//! connected client exactly as the subprocess path would.

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::Config;
use crate::delivery::prompt;
use crate::errors::StoreError;
use crate::gateway::ws::{broadcast_message, ServerMessage};
use crate::memory::{format_context, MemoryStore};
use crate::store::{Change, ChangeStatus, ChangeStore};

/// Separator between rendered changes in a multi-task `retrieve` reply.
const TASK_SEPARATOR: &str = "\n\n────────────────────────────────\n\n";

pub struct ToolCallSurface {
    store: ChangeStore,
    memory: MemoryStore,
    outbound: broadcast::Sender<String>,
    config: Config,
}

impl ToolCallSurface {
    pub fn new(
        store: ChangeStore,
        memory: MemoryStore,
        outbound: broadcast::Sender<String>,
        config: Config,
    ) -> Self {
        Self {
            store,
            memory,
            outbound,
            config,
        }
    }

    /// Hand the pending queue to the agent as rendered prompts. Pending
    /// records transition to `processing` as they are handed over; with
    /// `include_applied` the full table is shown and nothing transitions.
    pub fn retrieve(&self, include_applied: bool) -> String {
        let changes = self.store.get_pending(include_applied);
        if changes.is_empty() {
            return "No pending changes. The queue is empty.".to_string();
        }

        let mut sections = Vec::with_capacity(changes.len());
        for change in &changes {
            if !include_applied && change.status.is_pending() {
                match self.store.mark_processing(&change.id) {
                    Ok(updated) => {
                        broadcast_message(
                            &self.outbound,
                            &ServerMessage::TaskUpdate { task: updated },
                        );
                    }
                    Err(err) => {
                        warn!(id = %change.id, error = %err, "Could not mark change processing");
                    }
                }
            }
            sections.push(self.render(change));
        }

        info!(count = changes.len(), "Handed queue to agent");
        format!(
            "{} change(s):{}{}",
            changes.len(),
            TASK_SEPARATOR,
            sections.join(TASK_SEPARATOR)
        )
    }

    /// The agent reports a Change as done. Records the outcome on the
    /// element's bead and notifies the client.
    pub fn mark_applied(&self, id: &str) -> Result<String, StoreError> {
        let change = self.store.mark_applied(id)?;
        self.save_bead(&change, true);
        broadcast_message(
            &self.outbound,
            &ServerMessage::ChangeApplied {
                change_id: id.to_string(),
            },
        );
        broadcast_message(&self.outbound, &ServerMessage::TaskUpdate { task: change });
        info!(id = %id, "Agent reported change applied");
        Ok(format!("Marked {id} as applied."))
    }

    /// The agent reports a Change as not applicable. The record stays in
    /// the queue as `failed`; any retry is the client's decision.
    pub fn mark_failed(&self, id: &str, reason: &str) -> Result<String, StoreError> {
        let change = self.store.mark_failed(id, reason)?;
        self.save_bead(&change, false);
        broadcast_message(
            &self.outbound,
            &ServerMessage::ChangeFailed {
                change_id: id.to_string(),
                reason: reason.to_string(),
            },
        );
        broadcast_message(&self.outbound, &ServerMessage::TaskUpdate { task: change });
        warn!(id = %id, reason = %reason, "Agent reported change failed");
        Ok(format!("Marked {id} as failed: {reason}"))
    }

    /// Full record dump for one Change, status history included.
    pub fn inspect(&self, id: &str) -> Result<String, StoreError> {
        let change = self.store.get(id)?;
        serde_json::to_string_pretty(&change)
            .map_err(|e| StoreError::Other(anyhow::anyhow!("serialize change: {e}")))
    }

    /// Drop the whole table, reporting what was dropped per status.
    pub fn clear_all(&self) -> Result<String, StoreError> {
        let counts = self.store.status_counts();
        let total: usize = counts.values().sum();
        if total == 0 {
            return Ok("Queue already empty.".to_string());
        }
        self.store.clear()?;

        let mut parts: Vec<String> = Vec::new();
        for status in [
            ChangeStatus::Confirmed,
            ChangeStatus::Processing,
            ChangeStatus::Applied,
            ChangeStatus::Failed,
        ] {
            if let Some(n) = counts.get(&status) {
                parts.push(format!("{n} {}", status.as_str()));
            }
        }
        info!(total, "Cleared change queue");
        Ok(format!("Cleared {total} change(s): {}.", parts.join(", ")))
    }

    fn render(&self, change: &Change) -> String {
        let bead = self.memory.load(&change.element);
        let history = format_context(bead.as_ref());
        let template = self
            .config
            .template_file
            .as_ref()
            .and_then(|path| std::fs::read_to_string(path).ok());
        match template {
            Some(template) => prompt::render(change, history.as_deref(), &template),
            None => prompt::render_default(change, history.as_deref()),
        }
    }

    fn save_bead(&self, change: &Change, success: bool) {
        if let Err(err) = self
            .memory
            .save(&change.element, &change.feedback, &change.id, success)
        {
            warn!(id = %change.id, error = %err, "Could not save subject bead");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::change::ElementDescriptor;
    use tempfile::tempdir;

    fn surface(dir: &std::path::Path) -> (ToolCallSurface, ChangeStore) {
        let store = ChangeStore::new(dir.join("tasks.json"));
        let memory = MemoryStore::new(dir.join("memory"));
        let (outbound, _) = broadcast::channel(64);
        let config = Config::with_data_dir(dir);
        (
            ToolCallSurface::new(store.clone(), memory, outbound, config),
            store,
        )
    }

    fn add_change(store: &ChangeStore, id: &str, feedback: &str) {
        store
            .add(Change::new(
                Some(id.to_string()),
                ElementDescriptor {
                    selector: ".cta".to_string(),
                    tag: "button".to_string(),
                    classes: vec!["cta".to_string()],
                    ..Default::default()
                },
                feedback.to_string(),
                "/tmp/proj".to_string(),
                "http://localhost:3000/".to_string(),
                None,
            ))
            .unwrap();
    }

    #[test]
    fn retrieve_on_empty_queue_says_so() {
        let dir = tempdir().unwrap();
        let (surface, _) = surface(dir.path());
        assert!(surface.retrieve(false).contains("queue is empty"));
    }

    #[test]
    fn retrieve_renders_and_marks_processing() {
        let dir = tempdir().unwrap();
        let (surface, store) = surface(dir.path());
        add_change(&store, "a", "make button blue");
        add_change(&store, "b", "increase padding");

        let out = surface.retrieve(false);
        assert!(out.starts_with("2 change(s):"));
        assert!(out.contains("make button blue"));
        assert!(out.contains("increase padding"));

        assert_eq!(store.get("a").unwrap().status, ChangeStatus::Processing);
        assert_eq!(store.get("b").unwrap().status, ChangeStatus::Processing);
        // Handed-over work is no longer pending
        assert!(store.get_pending(false).is_empty());
    }

    #[test]
    fn retrieve_with_applied_is_read_only() {
        let dir = tempdir().unwrap();
        let (surface, store) = surface(dir.path());
        add_change(&store, "a", "make button blue");
        store.mark_applied("a").unwrap();
        add_change(&store, "b", "increase padding");

        let out = surface.retrieve(true);
        assert!(out.starts_with("2 change(s):"));
        // Nothing transitioned
        assert_eq!(store.get("b").unwrap().status, ChangeStatus::Confirmed);
    }

    #[test]
    fn mark_applied_records_bead_and_broadcasts() {
        let dir = tempdir().unwrap();
        let (surface, store) = surface(dir.path());
        add_change(&store, "a", "make button blue");
        let mut rx = surface.outbound.subscribe();

        let reply = surface.mark_applied("a").unwrap();
        assert!(reply.contains("applied"));
        assert_eq!(store.get("a").unwrap().status, ChangeStatus::Applied);

        let memory = MemoryStore::new(dir.path().join("memory"));
        let bead = memory
            .load(&store.get("a").unwrap().element)
            .expect("bead recorded");
        assert!(bead.changes[0].success);

        let frame = rx.try_recv().unwrap();
        assert!(frame.contains("CHANGE_APPLIED"));
    }

    #[test]
    fn mark_failed_keeps_record_in_queue() {
        let dir = tempdir().unwrap();
        let (surface, store) = surface(dir.path());
        add_change(&store, "a", "make button blue");

        let reply = surface.mark_failed("a", "element not found").unwrap();
        assert!(reply.contains("element not found"));

        let stored = store.get("a").unwrap();
        assert_eq!(stored.status, ChangeStatus::Failed);
        assert_eq!(stored.retry_count, 1);
        // Failed records come back on the next retrieve
        assert_eq!(store.get_pending(false).len(), 1);
    }

    #[test]
    fn marking_unknown_id_is_not_found() {
        let dir = tempdir().unwrap();
        let (surface, _) = surface(dir.path());
        assert!(matches!(
            surface.mark_applied("ghost"),
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            surface.mark_failed("ghost", "x"),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn inspect_dumps_the_full_record() {
        let dir = tempdir().unwrap();
        let (surface, store) = surface(dir.path());
        add_change(&store, "a", "make button blue");
        store.mark_failed("a", "flaky").unwrap();

        let dump = surface.inspect("a").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&dump).unwrap();
        assert_eq!(parsed["id"], "a");
        assert_eq!(parsed["status"], "failed");
        assert_eq!(parsed["failureReason"], "flaky");
        assert_eq!(parsed["retryCount"], 1);
    }

    #[test]
    fn clear_all_reports_per_status_counts() {
        let dir = tempdir().unwrap();
        let (surface, store) = surface(dir.path());
        add_change(&store, "a", "one");
        add_change(&store, "b", "two");
        add_change(&store, "c", "three");
        store.mark_applied("a").unwrap();
        store.mark_failed("b", "x").unwrap();

        let reply = surface.clear_all().unwrap();
        assert!(reply.contains("Cleared 3 change(s)"));
        assert!(reply.contains("1 applied"));
        assert!(reply.contains("1 failed"));
        assert!(reply.contains("1 confirmed"));
        assert!(store.is_empty());

        assert_eq!(surface.clear_all().unwrap(), "Queue already empty.");
    }
}
