use clap::{Parser, Subcommand};

use nudge::config::Config;
use nudge::delivery::rpc::{self, RpcHandler};
use nudge::delivery::toolcall::ToolCallSurface;
use nudge::gateway;
use nudge::hook;
use nudge::memory::MemoryStore;
use nudge::store::ChangeStore;

#[derive(Parser)]
#[command(
    name = "nudge",
    version,
    about = "Routes visual tweaks flagged on a live web page to a code-editing agent"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway server (WebSocket + HTTP on one port)
    Serve {
        /// Port to listen on (overrides config and NUDGE_PORT)
        #[arg(long)]
        port: Option<u16>,
        /// Delivery strategy: subprocess or toolcall
        #[arg(long)]
        delivery: Option<String>,
        /// Agent binary to spawn in subprocess mode
        #[arg(long)]
        agent_cmd: Option<String>,
    },
    /// Serve the tool-call surface over stdio for an agent session
    Mcp,
    /// Poll the local server for pending changes (agent-session hook)
    Hook {
        /// Port of the server to poll
        #[arg(long)]
        port: Option<u16>,
    },
    /// List queued changes
    Tasks {
        /// Include applied and processing changes
        #[arg(long)]
        all: bool,
    },
    /// Drop every queued change
    Clear,
    /// Show running server instances
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            port,
            delivery,
            agent_cmd,
        } => {
            let mut config = Config::load()?;
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(delivery) = delivery {
                config.delivery = delivery.parse()?;
            }
            if let Some(agent_cmd) = agent_cmd {
                config.agent_cmd = agent_cmd;
            }
            gateway::server::run(config).await?;
        }

        Command::Mcp => {
            let config = Config::load()?;
            let (outbound, _) = tokio::sync::broadcast::channel(8);
            let surface = ToolCallSurface::new(
                ChangeStore::new(config.tasks_file()),
                MemoryStore::new(config.memory_dir()),
                outbound,
                config,
            );
            let handler = RpcHandler::new(surface);
            // Frames own stdout; logs already go to stderr.
            tokio::task::spawn_blocking(move || rpc::run_stdio(&handler)).await??;
        }

        Command::Hook { port } => {
            let config = Config::load()?;
            println!("{}", hook::check(port.unwrap_or(config.port)).await);
        }

        Command::Tasks { all } => {
            let config = Config::load()?;
            let store = ChangeStore::new(config.tasks_file());
            let changes = store.get_pending(all);
            if changes.is_empty() {
                println!("No queued changes.");
            } else {
                for change in &changes {
                    print!(
                        "{}  [{}]  {}",
                        change.id,
                        change.status.as_str(),
                        change.feedback
                    );
                    if let Some(reason) = &change.failure_reason {
                        print!("  ({reason})");
                    }
                    println!();
                }
                println!("{} change(s).", changes.len());
            }
        }

        Command::Clear => {
            let config = Config::load()?;
            let (outbound, _) = tokio::sync::broadcast::channel(8);
            let surface = ToolCallSurface::new(
                ChangeStore::new(config.tasks_file()),
                MemoryStore::new(config.memory_dir()),
                outbound,
                config,
            );
            println!("{}", surface.clear_all()?);
        }

        Command::Status => {
            let config = Config::load()?;
            let registry = nudge::registry::InstanceRegistry::new(config.registry_file());
            let entries = registry.live_entries();
            if entries.is_empty() {
                println!("No running servers.");
            } else {
                let client = reqwest::Client::builder()
                    .timeout(std::time::Duration::from_secs(2))
                    .build()?;
                for entry in &entries {
                    let connection = probe_connection(&client, entry.port).await;
                    println!(
                        "{}  port {}  pid {}  started {}  client {}",
                        entry.project_name,
                        entry.port,
                        entry.process_id,
                        entry.started_at.format("%Y-%m-%d %H:%M:%S"),
                        connection
                    );
                }
            }
        }
    }

    Ok(())
}

/// Ask a registered instance for its client connection state. A registry
/// entry can outlive the server briefly, so unreachable is a real answer.
async fn probe_connection(client: &reqwest::Client, port: u16) -> String {
    let result = async {
        client
            .get(format!("http://127.0.0.1:{port}/status"))
            .send()
            .await?
            .error_for_status()?
            .json::<serde_json::Value>()
            .await
    }
    .await;
    match result {
        Ok(status) => status["connection"]
            .as_str()
            .unwrap_or("unknown")
            .to_string(),
        Err(_) => "unreachable".to_string(),
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("NUDGE_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("nudge=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
