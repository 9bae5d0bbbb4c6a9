//! Subprocess delivery: one agent process per Change.
//!
//! The executor renders the prompt, spawns the agent binary with the
//! Change's project path as working directory, streams its output into the
//! Change's running log, and classifies the exit code. Every status
//! transition is broadcast to the connected client, and the element's
//! subject bead records the outcome either way.
//!
//! Multiple children may be in flight at once; each completion mutates only
//! its own Change record. No timeout is enforced on the agent.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::delivery::{commit, prompt};
use crate::errors::DeliveryError;
use crate::gateway::ws::{broadcast_message, ServerMessage};
use crate::memory::{format_context, MemoryStore};
use crate::store::{Change, ChangeStore};

pub struct SubprocessExecutor {
    store: ChangeStore,
    memory: MemoryStore,
    outbound: broadcast::Sender<String>,
    config: Config,
}

/// What one agent invocation produced.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub log: String,
    pub commit: Option<String>,
}

impl SubprocessExecutor {
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

    /// Deliver one Change to a freshly-spawned agent and record the outcome.
    /// Never returns an error to the caller; every failure path ends in a
    /// `failed` status on the record plus a client notification.
    pub async fn execute(&self, change: Change) {
        let id = change.id.clone();

        if let Err(err) = self.store.mark_processing(&id) {
            warn!(id = %id, error = %err, "Could not mark change processing");
        }
        self.notify_task_update(&id);

        match self.run_agent(&change).await {
            Ok(outcome) => self.record_outcome(&change, outcome),
            Err(DeliveryError::Spawn { command, source }) => {
                let reason = format!("Failed to spawn agent '{command}': {source}");
                error!(id = %id, "{reason}");
                if let Err(err) = self.store.mark_failed(&id, &reason) {
                    warn!(id = %id, error = %err, "Could not mark change failed");
                }
                self.save_bead(&change, false);
                broadcast_message(
                    &self.outbound,
                    &ServerMessage::AutoApplyFailed {
                        change_id: id.clone(),
                        error: reason,
                    },
                );
                self.notify_task_update(&id);
            }
            Err(err) => {
                let reason = err.to_string();
                error!(id = %id, error = %reason, "Agent delivery failed");
                if let Err(err) = self.store.mark_failed(&id, &reason) {
                    warn!(id = %id, error = %err, "Could not mark change failed");
                }
                self.save_bead(&change, false);
                broadcast_message(
                    &self.outbound,
                    &ServerMessage::ChangeFailed {
                        change_id: id.clone(),
                        reason,
                    },
                );
                self.notify_task_update(&id);
            }
        }
    }

    /// Spawn the agent and capture its output. Exit code 0 is success.
    async fn run_agent(&self, change: &Change) -> Result<ExecutionOutcome, DeliveryError> {
        let rendered = self.render_prompt(change);

        let mut cmd = Command::new(&self.config.agent_cmd);
        for flag in self.config.agent_flags(change.model.as_deref()) {
            cmd.arg(flag);
        }
        cmd.arg(&rendered);

        if !change.project_path.is_empty() {
            cmd.current_dir(&change.project_path);
        }
        cmd.env("PATH", self.config.agent_path_env());
        if let Some(home) = dirs::home_dir() {
            cmd.env("HOME", home);
        }
        if let Some(key) = &self.config.agent_api_key {
            cmd.env("ANTHROPIC_API_KEY", key);
        }

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| DeliveryError::Spawn {
                command: self.config.agent_cmd.clone(),
                source,
            })?;

        info!(id = %change.id, pid = ?child.id(), agent = %self.config.agent_cmd, "Agent spawned");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Collect stderr on the side while streaming stdout here.
        let stderr_task = tokio::spawn(async move {
            let mut captured = String::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    captured.push_str(&line);
                    captured.push('\n');
                }
            }
            captured
        });

        let mut log = String::new();
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| DeliveryError::Other(anyhow::anyhow!("agent stdout: {e}")))?
            {
                log.push_str(&line);
                log.push('\n');
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| DeliveryError::Other(anyhow::anyhow!("agent wait: {e}")))?;
        if let Ok(captured) = stderr_task.await {
            log.push_str(&captured);
        }

        let exit_code = status.code();
        Ok(ExecutionOutcome {
            success: status.success(),
            exit_code,
            commit: commit::extract_commit(&log),
            log,
        })
    }

    fn record_outcome(&self, change: &Change, outcome: ExecutionOutcome) {
        let id = &change.id;
        let commit_url = outcome
            .commit
            .as_ref()
            .and_then(|hash| commit::derive_commit_url(&outcome.log, hash));

        if let Err(err) = self.store.record_delivery(
            id,
            &outcome.log,
            outcome.exit_code,
            outcome.commit.clone(),
            commit_url,
        ) {
            warn!(id = %id, error = %err, "Could not record delivery output");
        }

        if outcome.success {
            info!(id = %id, commit = ?outcome.commit, "Agent applied change");
            if let Err(err) = self.store.mark_applied(id) {
                warn!(id = %id, error = %err, "Could not mark change applied");
            }
            broadcast_message(
                &self.outbound,
                &ServerMessage::ChangeApplied {
                    change_id: id.clone(),
                },
            );
        } else {
            let reason = format!(
                "Agent exited with code {}",
                outcome
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "unknown (signal)".to_string())
            );
            warn!(id = %id, "{reason}");
            if let Err(err) = self.store.mark_failed(id, &reason) {
                warn!(id = %id, error = %err, "Could not mark change failed");
            }
            broadcast_message(
                &self.outbound,
                &ServerMessage::ChangeFailed {
                    change_id: id.clone(),
                    reason,
                },
            );
        }

        self.save_bead(change, outcome.success);
        self.notify_task_update(id);
    }

    /// Record the attempt on the element's bead regardless of outcome.
    fn save_bead(&self, change: &Change, success: bool) {
        if let Err(err) = self
            .memory
            .save(&change.element, &change.feedback, &change.id, success)
        {
            warn!(id = %change.id, error = %err, "Could not save subject bead");
        }
    }

    fn render_prompt(&self, change: &Change) -> String {
        let bead = self.memory.load(&change.element);
        let history = format_context(bead.as_ref());
        let template = self
            .config
            .template_file
            .as_ref()
            .and_then(|path| match std::fs::read_to_string(path) {
                Ok(template) => Some(template),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Falling back to default template");
                    None
                }
            });
        match template {
            Some(template) => prompt::render(change, history.as_deref(), &template),
            None => prompt::render_default(change, history.as_deref()),
        }
    }

    fn notify_task_update(&self, id: &str) {
        if let Ok(change) = self.store.get(id) {
            broadcast_message(&self.outbound, &ServerMessage::TaskUpdate { task: change });
        }
    }
}
