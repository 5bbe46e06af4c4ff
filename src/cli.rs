use clap::{Parser, Subcommand};

use crate::agent::AgentMetadata;
use crate::config::AgentSettings;
use crate::registry::AgentReport;

#[derive(Debug, Parser)]
#[command(
    name = "patrol",
    version,
    about = "Supervises background agents that watch pull requests and push automated fixes"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the enabled agents until interrupted.
    Run {
        /// Execute queued remediation tasks in-process as they appear.
        #[arg(long)]
        drain: bool,
        /// Poll once, then exit instead of running continuously.
        #[arg(long)]
        once: bool,
    },
    /// List the registered agents.
    List,
    /// Show one agent's status.
    Status {
        /// Agent name, as shown by `list`.
        name: String,
    },
    /// Show the status of every registered agent.
    StatusAll,
    /// Enable an agent in the project config.
    Enable { name: String },
    /// Disable an agent in the project config.
    Disable { name: String },
    /// Show an agent's resolved configuration.
    Config { name: String },
    /// Restart a running agent, picking up current configuration.
    Restart { name: String },
    /// Read one pull_request_review event as JSON on stdin and enqueue it.
    Webhook {
        /// Execute the queued task immediately instead of leaving it queued.
        #[arg(long)]
        drain: bool,
    },
}

pub fn format_agent_list(agents: &[AgentMetadata]) -> String {
    if agents.is_empty() {
        return "no agents registered".to_string();
    }
    agents
        .iter()
        .map(|a| format!("{}  {}", a.name, a.description))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_report(report: &AgentReport) -> String {
    serde_json::to_string_pretty(report)
        .unwrap_or_else(|_| format!("{}: status unavailable", report.metadata.name))
}

pub fn format_settings(name: &str, settings: &AgentSettings) -> String {
    format!(
        "{name}\n  enabled: {}\n  interval_ms: {}\n  test: {}\n  typecheck: {}\n  lint: {}",
        settings.enabled,
        settings.interval_ms,
        settings.gates.test,
        settings.gates.typecheck,
        settings.gates.lint
    )
}
