use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::commands::GateCommands;
use crate::error::{Error, Result};

/// Default polling interval when no config file sets one.
pub const DEFAULT_INTERVAL_MS: u64 = 60_000;

/// Per-agent settings as written in a config file. Every field is optional;
/// absent fields fall through to the other layer, then to built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSettingsFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typecheck_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lint_command: Option<String>,
}

impl AgentSettingsFile {
    /// Overlay `other` onto `self`, field by field. Set fields in `other`
    /// win; unset fields keep the current value.
    fn overlay(&mut self, other: &AgentSettingsFile) {
        if other.enabled.is_some() {
            self.enabled = other.enabled;
        }
        if other.interval_ms.is_some() {
            self.interval_ms = other.interval_ms;
        }
        if other.test_command.is_some() {
            self.test_command = other.test_command.clone();
        }
        if other.typecheck_command.is_some() {
            self.typecheck_command = other.typecheck_command.clone();
        }
        if other.lint_command.is_some() {
            self.lint_command = other.lint_command.clone();
        }
    }
}

/// On-disk shape of an `agents.json` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentsFile {
    #[serde(default)]
    pub agents: HashMap<String, AgentSettingsFile>,
}

/// Fully resolved settings for one agent, defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub enabled: bool,
    pub interval_ms: u64,
    pub gates: GateCommands,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: DEFAULT_INTERVAL_MS,
            gates: GateCommands::default(),
        }
    }
}

impl AgentSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Merged view of the global (`~/.oss/agents.json`) and project
/// (`<project>/.oss/agents.json`) config layers. Project values win per
/// field, not per agent block.
#[derive(Debug, Clone, Default)]
pub struct Config {
    agents: HashMap<String, AgentSettingsFile>,
}

/// Global config file location, if a home directory is known.
pub fn global_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".oss").join("agents.json"))
}

/// Project-level config file location.
pub fn project_path(project_root: &Path) -> PathBuf {
    project_root.join(".oss").join("agents.json")
}

fn load_file(path: &Path) -> Result<AgentsFile> {
    if !path.exists() {
        debug!(path = %path.display(), "config file absent, using defaults");
        return Ok(AgentsFile::default());
    }
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|source| Error::ConfigParse {
        path: path.to_path_buf(),
        source,
    })
}

fn save_file(path: &Path, file: &AgentsFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(file)
        .map_err(|e| Error::State(format!("failed to serialize config: {e}")))?;
    std::fs::write(path, content)?;
    Ok(())
}

impl Config {
    /// Load and merge the two config layers. Missing files are treated as
    /// empty; a file that exists but does not parse is an error, never
    /// silently ignored.
    pub fn load(global: Option<&Path>, project: &Path) -> Result<Self> {
        let mut agents = match global {
            Some(path) => load_file(path)?.agents,
            None => HashMap::new(),
        };
        for (name, settings) in load_file(project)?.agents {
            agents.entry(name).or_default().overlay(&settings);
        }
        Ok(Self { agents })
    }

    /// Resolved settings for an agent. Unconfigured agents get defaults.
    pub fn settings_for(&self, name: &str) -> AgentSettings {
        let mut settings = AgentSettings::default();
        if let Some(raw) = self.agents.get(name) {
            if let Some(enabled) = raw.enabled {
                settings.enabled = enabled;
            }
            if let Some(interval_ms) = raw.interval_ms {
                settings.interval_ms = interval_ms;
            }
            if let Some(test) = &raw.test_command {
                settings.gates.test = test.clone();
            }
            if let Some(typecheck) = &raw.typecheck_command {
                settings.gates.typecheck = typecheck.clone();
            }
            if let Some(lint) = &raw.lint_command {
                settings.gates.lint = lint.clone();
            }
        }
        settings
    }

    /// Raw merged block for an agent, if any layer mentions it.
    pub fn raw(&self, name: &str) -> Option<&AgentSettingsFile> {
        self.agents.get(name)
    }

    pub fn configured_agents(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Flip one agent's `enabled` flag in a config file, creating the file if
/// needed and leaving all other settings untouched.
pub fn set_enabled(path: &Path, agent: &str, enabled: bool) -> Result<()> {
    let mut file = load_file(path)?;
    file.agents.entry(agent.to_string()).or_default().enabled = Some(enabled);
    save_file(path, &file)
}
