//! Notification hook for agent sessions.
//!
//! A long-running agent session wires this in as a periodic check: it polls
//! the local server's `/tasks` endpoint and prints a short notice when
//! visual changes are waiting. An unreachable server is a normal condition
//! (the developer simply isn't running one) and reports as no pending work
//! rather than an error.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

/// The server is local; anything slower than this means it isn't there.
const POLL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct TasksReply {
    count: usize,
    #[serde(default)]
    tasks: Vec<TaskSummary>,
}

#[derive(Debug, Deserialize)]
struct TaskSummary {
    id: String,
    #[serde(default)]
    feedback: String,
}

/// Poll the queue once and describe it for the agent session. Never fails.
pub async fn check(port: u16) -> String {
    match poll(port).await {
        Ok(reply) if reply.count > 0 => render_notice(&reply),
        Ok(_) => "No pending visual changes.".to_string(),
        Err(err) => {
            debug!(error = %err, "Queue poll failed, treating as empty");
            "No pending visual changes (no server running).".to_string()
        }
    }
}

async fn poll(port: u16) -> Result<TasksReply, reqwest::Error> {
    let client = reqwest::Client::builder().timeout(POLL_TIMEOUT).build()?;
    client
        .get(format!("http://127.0.0.1:{port}/tasks"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await
}

fn render_notice(reply: &TasksReply) -> String {
    let mut lines = vec![format!(
        "{} visual change(s) pending. Retrieve them with the `retrieve` tool.",
        reply.count
    )];
    for task in &reply.tasks {
        lines.push(format!("  {} — {}", task.id, task.feedback));
    }
    lines.join("\n")
}
