//! Runtime configuration for nudge.
//!
//! Settings come from three layers, later layers winning: built-in
//! defaults, an optional `config.toml` in the data dir, and environment
//! variables (`NUDGE_HOME`, `NUDGE_PORT`, `NUDGE_AGENT_CMD`,
//! `NUDGE_DELIVERY`). CLI flags override on top of all of these in main.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// How Changes reach the agent. One strategy is active per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Spawn one agent process per Change as it arrives
    Subprocess,
    /// Expose the queue as tool calls for a long-running agent session
    ToolCall,
}

impl std::str::FromStr for DeliveryMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "subprocess" => Ok(DeliveryMode::Subprocess),
            "toolcall" | "tool-call" | "mcp" => Ok(DeliveryMode::ToolCall),
            other => anyhow::bail!("unknown delivery mode '{other}' (expected subprocess or toolcall)"),
        }
    }
}

/// Shape of the optional `config.toml`.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    delivery: Option<DeliveryMode>,
    #[serde(default)]
    agent: AgentFileConfig,
}

#[derive(Debug, Default, Deserialize)]
struct AgentFileConfig {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    template_file: Option<PathBuf>,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data dir holding all persisted state (default `~/.nudge`)
    pub data_dir: PathBuf,
    /// Port serving both the HTTP surface and the WebSocket upgrade
    pub port: u16,
    pub delivery: DeliveryMode,
    /// Agent binary (default "claude")
    pub agent_cmd: String,
    /// Default model passed to the agent unless the client picked one
    pub agent_model: Option<String>,
    /// API credential forwarded to the agent's environment, if configured
    pub agent_api_key: Option<String>,
    /// Prompt template override; the built-in default is used when absent
    pub template_file: Option<PathBuf>,
}

pub const DEFAULT_PORT: u16 = 4100;

impl Config {
    /// Resolve configuration from the data dir's config.toml and env vars.
    pub fn load() -> Result<Self> {
        let data_dir = Self::resolve_data_dir()?;
        let file = Self::read_file_config(&data_dir.join("config.toml"))?;

        let port = std::env::var("NUDGE_PORT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .or(file.port)
            .unwrap_or(DEFAULT_PORT);

        let delivery = match std::env::var("NUDGE_DELIVERY") {
            Ok(raw) => raw.parse()?,
            Err(_) => file.delivery.unwrap_or(DeliveryMode::ToolCall),
        };

        let agent_cmd = std::env::var("NUDGE_AGENT_CMD")
            .ok()
            .or(file.agent.command)
            .unwrap_or_else(|| "claude".to_string());

        let agent_api_key = std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .or(file.agent.api_key);

        Ok(Self {
            data_dir,
            port,
            delivery,
            agent_cmd,
            agent_model: file.agent.model,
            agent_api_key,
            template_file: file.agent.template_file,
        })
    }

    /// A config rooted at an explicit data dir, defaults elsewhere. Used by
    /// tests and by commands that only need the store paths.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            port: DEFAULT_PORT,
            delivery: DeliveryMode::ToolCall,
            agent_cmd: "claude".to_string(),
            agent_model: None,
            agent_api_key: None,
            template_file: None,
        }
    }

    fn resolve_data_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("NUDGE_HOME") {
            return Ok(PathBuf::from(dir));
        }
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".nudge"))
    }

    fn read_file_config(path: &Path) -> Result<FileConfig> {
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                toml::from_str(&raw).with_context(|| format!("Invalid config at {}", path.display()))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(FileConfig::default()),
            Err(err) => Err(err).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    // ── Persisted file locations ────────────────────────────────────────

    pub fn tasks_file(&self) -> PathBuf {
        self.data_dir.join("tasks.json")
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.data_dir.join("memory")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.data_dir.join("servers.json")
    }

    pub fn token_file(&self) -> PathBuf {
        self.data_dir.join("token")
    }

    /// Flags passed to the agent binary ahead of the positional prompt.
    pub fn agent_flags(&self, model: Option<&str>) -> Vec<String> {
        let mut flags = vec![
            "--print".to_string(),
            "--dangerously-skip-permissions".to_string(),
        ];
        if let Some(model) = model.or(self.agent_model.as_deref()) {
            flags.push("--model".to_string());
            flags.push(model.to_string());
        }
        flags
    }

    /// PATH for the spawned agent: the inherited PATH plus common install
    /// locations that GUI-launched processes tend to be missing.
    pub fn agent_path_env(&self) -> String {
        let mut path = std::env::var("PATH").unwrap_or_default();
        for extra in ["/usr/local/bin", "/opt/homebrew/bin"] {
            if !path.split(':').any(|p| p == extra) {
                path.push(':');
                path.push_str(extra);
            }
        }
        if let Some(home) = dirs::home_dir() {
            let local_bin = home.join(".local/bin");
            let local_bin = local_bin.to_string_lossy();
            if !path.split(':').any(|p| p == local_bin) {
                path.push(':');
                path.push_str(&local_bin);
            }
        }
        path
    }
}
