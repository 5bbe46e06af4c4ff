//! Core for supervising background agents that watch pull requests and push
//! automated remediation commits.
//!
//! The pieces compose as a pipeline: [`monitor::ReviewMonitor`] classifies
//! review comments and queues [`monitor::RemediationTask`]s,
//! [`executor::RemediationExecutor`] runs each task through quality gates
//! against the shared working copy, and [`registry::AgentRegistry`] owns the
//! polling timers and health reporting for every registered agent. All git
//! and GitHub access goes through [`commands::RepoCommands`].

pub mod agent;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod registry;
pub mod state;

#[cfg(test)]
pub mod test_support;
