use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use patrol::agent::BackgroundAgent;
use patrol::cli::{self, Cli, Command};
use patrol::commands::{ProcessClient, RepoCommands};
use patrol::config::{self, Config};
use patrol::error::{Error, Result};
use patrol::executor::RemediationExecutor;
use patrol::monitor::{ReviewEvent, ReviewMonitor};
use patrol::registry::AgentRegistry;
use patrol::state::StateStore;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!(error = %e, "patrol failed");
        std::process::exit(1);
    }
}

/// The monitor and executor share one command wrapper, and through it one
/// working copy and one resolved repo identity.
struct Host {
    monitor: Arc<ReviewMonitor>,
    executor: RemediationExecutor,
}

fn build_host(project_root: &Path, config: &Config) -> Host {
    let settings = config.settings_for(ReviewMonitor::NAME);
    let client = Arc::new(ProcessClient::new(project_root));
    let commands = Arc::new(RepoCommands::new(client, settings.gates.clone()));
    let store = StateStore::new(StateStore::default_path(project_root));
    Host {
        monitor: Arc::new(ReviewMonitor::new(Arc::clone(&commands), store)),
        executor: RemediationExecutor::new(commands),
    }
}

/// Registry with every hosted agent registered. Commands that address an
/// agent by name resolve it here rather than against a hard-coded list.
fn build_registry(host: &Host) -> Result<AgentRegistry> {
    let mut registry = AgentRegistry::default();
    registry.register(host.monitor.clone())?;
    Ok(registry)
}

async fn run(cli: Cli) -> Result<()> {
    let project_root = std::env::current_dir()?;
    let config = Config::load(
        config::global_path().as_deref(),
        &config::project_path(&project_root),
    )?;

    match cli.command {
        Command::Run { drain, once } => run_agents(&project_root, &config, drain, once).await,
        Command::Restart { name } => {
            let host = build_host(&project_root, &config);
            let registry = build_registry(&host)?;
            if !registry.has(&name) {
                return Err(Error::UnknownAgent(name));
            }
            info!(agent = %name, "restarting with current configuration");
            run_agents(&project_root, &config, false, false).await
        }
        Command::List => {
            let host = build_host(&project_root, &config);
            let registry = build_registry(&host)?;
            println!("{}", cli::format_agent_list(&registry.list()));
            Ok(())
        }
        Command::Status { name } => {
            let host = build_host(&project_root, &config);
            let registry = build_registry(&host)?;
            print_report(&registry, &name).await
        }
        Command::StatusAll => {
            let host = build_host(&project_root, &config);
            let registry = build_registry(&host)?;
            for metadata in registry.list() {
                print_report(&registry, &metadata.name).await?;
            }
            Ok(())
        }
        Command::Enable { name } => {
            let host = build_host(&project_root, &config);
            let registry = build_registry(&host)?;
            if !registry.has(&name) {
                return Err(Error::UnknownAgent(name));
            }
            config::set_enabled(&config::project_path(&project_root), &name, true)?;
            println!("enabled agent {name}");
            Ok(())
        }
        Command::Disable { name } => {
            let host = build_host(&project_root, &config);
            let registry = build_registry(&host)?;
            if !registry.has(&name) {
                return Err(Error::UnknownAgent(name));
            }
            config::set_enabled(&config::project_path(&project_root), &name, false)?;
            println!("disabled agent {name}");
            Ok(())
        }
        Command::Config { name } => {
            let host = build_host(&project_root, &config);
            let registry = build_registry(&host)?;
            if !registry.has(&name) {
                return Err(Error::UnknownAgent(name));
            }
            println!("{}", cli::format_settings(&name, &config.settings_for(&name)));
            Ok(())
        }
        Command::Webhook { drain } => {
            let mut payload = String::new();
            std::io::stdin().read_to_string(&mut payload)?;
            let event: ReviewEvent = serde_json::from_str(&payload)
                .map_err(|e| Error::Validation(format!("invalid review event: {e}")))?;

            let host = build_host(&project_root, &config);
            host.monitor.initialize().await?;
            if host.monitor.process_webhook(&event).await? {
                println!("queued remediation task for PR #{}", event.pull_request.number);
                if drain {
                    drain_queue(&host).await;
                }
            } else {
                println!("event ignored");
            }
            Ok(())
        }
    }
}

async fn print_report(registry: &AgentRegistry, name: &str) -> Result<()> {
    let agent = registry
        .get(name)
        .ok_or_else(|| Error::UnknownAgent(name.to_string()))?;
    // Load persisted state so the report reflects past runs, not just this
    // short-lived process.
    agent.initialize().await?;
    let report = registry.agent_report(name).await?;
    println!("{}", cli::format_report(&report));
    Ok(())
}

async fn run_agents(project_root: &Path, config: &Config, drain: bool, once: bool) -> Result<()> {
    let host = build_host(project_root, config);
    let settings = config.settings_for(ReviewMonitor::NAME);

    if once {
        host.monitor.initialize().await?;
        host.monitor.poll_once().await?;
        if drain {
            drain_queue(&host).await;
        }
        return Ok(());
    }

    if !settings.enabled {
        warn!(agent = ReviewMonitor::NAME, "agent is disabled in config, nothing to run");
        return Ok(());
    }

    let mut registry = build_registry(&host)?;
    registry
        .start_agent(ReviewMonitor::NAME, settings.interval())
        .await?;
    info!(
        agent = ReviewMonitor::NAME,
        interval_ms = settings.interval_ms,
        "running, press ctrl-c to stop"
    );

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "failed to listen for shutdown signal");
                }
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)), if drain => {
                drain_queue(&host).await;
            }
        }
    }

    info!("shutting down");
    registry.stop_all().await?;
    Ok(())
}

/// Execute queued tasks one at a time. The executor assumes exclusive use of
/// the working copy, so the queue is always drained serially.
async fn drain_queue(host: &Host) {
    while let Some(task) = host.monitor.dequeue_task() {
        match host.executor.execute(&task).await {
            Ok(outcome) if outcome.pushed => info!(
                pr = task.pr_number,
                sha = outcome.commit_sha.as_deref().unwrap_or("unknown"),
                "remediation pushed"
            ),
            Ok(outcome) => warn!(
                pr = task.pr_number,
                errors = outcome.gates.errors.len(),
                "quality gates failed, nothing pushed"
            ),
            Err(e) => warn!(pr = task.pr_number, error = %e, "remediation failed"),
        }
        if host.executor.needs_escalation() {
            warn!(pr = task.pr_number, "retries exhausted, human attention needed");
        }
    }
}
