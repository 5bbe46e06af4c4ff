use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::agent::{AgentMetadata, AgentStatus, BackgroundAgent};
use crate::error::{Error, Result};

/// Consecutive poll failures after which an agent is reported unhealthy.
pub const UNHEALTHY_THRESHOLD: u32 = 3;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry-tracked runtime state for one agent. Owned by the registry, not
/// the agent; destroyed when the agent stops.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentRuntime {
    pub is_running: bool,
    pub last_poll_time: Option<u64>,
    pub error_count: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthEvent {
    pub agent: String,
    pub state: HealthState,
    pub error_count: u32,
    pub last_error: Option<String>,
}

/// Sink for health transitions. The registry reports each transition exactly
/// once: unhealthy when the failure count crosses the threshold, healthy when
/// a failing agent next succeeds.
pub trait HealthReporter: Send + Sync {
    fn report(&self, event: HealthEvent);
}

/// Default reporter that writes transitions to the log.
pub struct TracingReporter;

impl HealthReporter for TracingReporter {
    fn report(&self, event: HealthEvent) {
        match event.state {
            HealthState::Unhealthy => warn!(
                agent = %event.agent,
                error_count = event.error_count,
                last_error = event.last_error.as_deref().unwrap_or("unknown"),
                "agent is unhealthy"
            ),
            HealthState::Healthy => info!(agent = %event.agent, "agent recovered"),
        }
    }
}

struct RuntimeHandle {
    state: Arc<Mutex<AgentRuntime>>,
    timer: JoinHandle<()>,
}

struct Registered {
    agent: Arc<dyn BackgroundAgent>,
    runtime: Option<RuntimeHandle>,
}

/// Combined view of an agent for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct AgentReport {
    pub metadata: AgentMetadata,
    pub runtime: AgentRuntime,
    pub status: AgentStatus,
}

/// Owns the set of background agents and drives their polling timers. A
/// single owner holds the registry mutably; the agents themselves are shared
/// with their timer tasks.
pub struct AgentRegistry {
    agents: HashMap<String, Registered>,
    reporter: Arc<dyn HealthReporter>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(Arc::new(TracingReporter))
    }
}

impl AgentRegistry {
    pub fn new(reporter: Arc<dyn HealthReporter>) -> Self {
        Self {
            agents: HashMap::new(),
            reporter,
        }
    }

    /// Register an agent under its metadata name. Registering a name twice is
    /// an error and leaves the first registration intact.
    pub fn register(&mut self, agent: Arc<dyn BackgroundAgent>) -> Result<()> {
        let name = agent.metadata().name;
        if self.agents.contains_key(&name) {
            return Err(Error::AlreadyRegistered(name));
        }
        info!(agent = %name, "registered agent");
        self.agents.insert(name, Registered {
            agent,
            runtime: None,
        });
        Ok(())
    }

    pub fn has(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// Metadata for all registered agents, sorted by name.
    pub fn list(&self) -> Vec<AgentMetadata> {
        let mut all: Vec<AgentMetadata> = self
            .agents
            .values()
            .map(|r| r.agent.metadata())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BackgroundAgent>> {
        self.agents.get(name).map(|r| Arc::clone(&r.agent))
    }

    /// Initialize and start an agent, then drive its `poll` on a fixed
    /// interval. The first poll happens one interval after start, not
    /// immediately. A tick that arrives while the previous poll is still in
    /// flight is skipped; polls never overlap and never queue up.
    pub async fn start_agent(&mut self, name: &str, interval: Duration) -> Result<()> {
        let entry = self
            .agents
            .get_mut(name)
            .ok_or_else(|| Error::UnknownAgent(name.to_string()))?;
        if entry.runtime.is_some() {
            return Err(Error::AlreadyRunning(name.to_string()));
        }

        entry.agent.initialize().await?;
        entry.agent.start().await?;

        let state = Arc::new(Mutex::new(AgentRuntime {
            is_running: true,
            ..AgentRuntime::default()
        }));
        let polling = Arc::new(AtomicBool::new(false));

        let timer = {
            let agent = Arc::clone(&entry.agent);
            let state = Arc::clone(&state);
            let reporter = Arc::clone(&self.reporter);
            let name = name.to_string();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if polling.swap(true, Ordering::SeqCst) {
                        debug!(agent = %name, "previous poll still in flight, skipping tick");
                        continue;
                    }
                    let agent = Arc::clone(&agent);
                    let state = Arc::clone(&state);
                    let reporter = Arc::clone(&reporter);
                    let polling = Arc::clone(&polling);
                    let name = name.clone();
                    tokio::spawn(async move {
                        let result = agent.poll().await;
                        record_poll_outcome(&name, result, &state, reporter.as_ref());
                        polling.store(false, Ordering::SeqCst);
                    });
                }
            })
        };

        info!(agent = %name, interval_ms = interval.as_millis() as u64, "started agent");
        entry.runtime = Some(RuntimeHandle { state, timer });
        Ok(())
    }

    /// Stop an agent's timer and the agent itself. The runtime record is
    /// destroyed; a later start begins with fresh counters.
    pub async fn stop_agent(&mut self, name: &str) -> Result<()> {
        let entry = self
            .agents
            .get_mut(name)
            .ok_or_else(|| Error::UnknownAgent(name.to_string()))?;

        if let Some(runtime) = entry.runtime.take() {
            runtime.timer.abort();
        }
        entry.agent.stop().await?;
        info!(agent = %name, "stopped agent");
        Ok(())
    }

    pub async fn restart_agent(&mut self, name: &str, interval: Duration) -> Result<()> {
        self.stop_agent(name).await?;
        self.start_agent(name, interval).await
    }

    pub async fn start_all(&mut self, interval: Duration) -> Result<()> {
        let names: Vec<String> = self.agents.keys().cloned().collect();
        for name in names {
            self.start_agent(&name, interval).await?;
        }
        Ok(())
    }

    pub async fn stop_all(&mut self) -> Result<()> {
        let names: Vec<String> = self.agents.keys().cloned().collect();
        for name in names {
            self.stop_agent(&name).await?;
        }
        Ok(())
    }

    /// Snapshot of registry-side runtime state, if the agent is running.
    pub fn runtime(&self, name: &str) -> Option<AgentRuntime> {
        self.agents
            .get(name)?
            .runtime
            .as_ref()
            .map(|r| r.state.lock().expect("runtime lock poisoned").clone())
    }

    /// Combined registry and agent-reported status.
    pub async fn agent_report(&self, name: &str) -> Result<AgentReport> {
        let entry = self
            .agents
            .get(name)
            .ok_or_else(|| Error::UnknownAgent(name.to_string()))?;
        let runtime = entry
            .runtime
            .as_ref()
            .map(|r| r.state.lock().expect("runtime lock poisoned").clone())
            .unwrap_or_default();
        Ok(AgentReport {
            metadata: entry.agent.metadata(),
            runtime,
            status: entry.agent.status().await,
        })
    }

    /// An agent is healthy unless its consecutive failure count has reached
    /// the threshold. Stopped and unknown-runtime agents count as healthy.
    pub fn is_healthy(&self, name: &str) -> bool {
        self.runtime(name)
            .map(|r| r.error_count < UNHEALTHY_THRESHOLD)
            .unwrap_or(true)
    }
}

fn record_poll_outcome(
    name: &str,
    result: Result<()>,
    state: &Mutex<AgentRuntime>,
    reporter: &dyn HealthReporter,
) {
    let mut state = state.lock().expect("runtime lock poisoned");
    match result {
        Ok(()) => {
            let had_errors = state.error_count > 0;
            state.last_poll_time = Some(now_secs());
            state.error_count = 0;
            state.last_error = None;
            if had_errors {
                reporter.report(HealthEvent {
                    agent: name.to_string(),
                    state: HealthState::Healthy,
                    error_count: 0,
                    last_error: None,
                });
            }
        }
        Err(e) => {
            state.error_count += 1;
            state.last_error = Some(e.to_string());
            debug!(agent = %name, error_count = state.error_count, error = %e, "poll failed");
            // Report the crossing exactly once; failures past the threshold
            // stay silent until recovery.
            if state.error_count == UNHEALTHY_THRESHOLD {
                reporter.report(HealthEvent {
                    agent: name.to_string(),
                    state: HealthState::Unhealthy,
                    error_count: state.error_count,
                    last_error: state.last_error.clone(),
                });
            }
        }
    }
}
