use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

/// Static description of a background agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentMetadata {
    pub name: String,
    pub description: String,
}

/// Agent-reported status snapshot. `detail` is agent-defined JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStatus {
    pub running: bool,
    pub detail: serde_json::Value,
}

/// Capability contract for components hosted by the registry. Anything
/// implementing this set can be registered; the registry never special-cases
/// a concrete agent.
#[async_trait]
pub trait BackgroundAgent: Send + Sync {
    fn metadata(&self) -> AgentMetadata;

    /// One-time setup before the first start (load state, warm caches).
    async fn initialize(&self) -> Result<()>;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// One unit of periodic work, driven by the registry's timer.
    async fn poll(&self) -> Result<()>;

    async fn status(&self) -> AgentStatus;
}
