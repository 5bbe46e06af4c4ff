use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Processed comment ids are forgotten after 30 days.
pub const DEDUP_TTL_SECS: u64 = 30 * 24 * 60 * 60;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Older persisted files stored processed comments as a bare id list. Those
/// entries migrate with "now" as their processed time instead of being
/// dropped.
fn de_processed<'de, D>(deserializer: D) -> std::result::Result<HashMap<String, u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ProcessedField {
        Timestamped(HashMap<String, u64>),
        Legacy(Vec<String>),
    }

    Ok(match ProcessedField::deserialize(deserializer)? {
        ProcessedField::Timestamped(map) => map,
        ProcessedField::Legacy(ids) => {
            let now = now_secs();
            ids.into_iter().map(|id| (id, now)).collect()
        }
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StateData {
    #[serde(default, deserialize_with = "de_processed")]
    pub processed_comments: HashMap<String, u64>,
    #[serde(default)]
    pub last_poll_time: Option<u64>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub stats: HashMap<String, u64>,
}

/// Durable dedup set plus operational counters, persisted as whole-file JSON
/// at `<project>/.oss/pr-monitor-state.json`.
pub struct StateStore {
    path: PathBuf,
    data: StateData,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            data: StateData::default(),
        }
    }

    /// Default state file location relative to a project root.
    pub fn default_path(project_root: &Path) -> PathBuf {
        project_root.join(".oss").join("pr-monitor-state.json")
    }

    /// Load state from disk. A missing or corrupt file yields default state;
    /// expired entries are purged before any query is served.
    pub fn load(&mut self) {
        self.data = if !self.path.exists() {
            StateData::default()
        } else {
            match std::fs::read_to_string(&self.path) {
                Ok(content) => match serde_json::from_str::<StateData>(&content) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!("corrupted state file {}: {e}, resetting", self.path.display());
                        StateData::default()
                    }
                },
                Err(e) => {
                    warn!(
                        "failed to read state file {}: {e}, resetting",
                        self.path.display()
                    );
                    StateData::default()
                }
            }
        };
        self.purge_expired();
    }

    /// Persist state, purging expired entries first. Whole-file overwrite.
    pub fn save(&mut self) -> Result<()> {
        self.purge_expired();

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::State(format!("failed to create state dir: {e}")))?;
        }

        let content = serde_json::to_string_pretty(&self.data)
            .map_err(|e| Error::State(format!("failed to serialize state: {e}")))?;

        std::fs::write(&self.path, content)
            .map_err(|e| Error::State(format!("failed to write state file: {e}")))?;

        Ok(())
    }

    fn purge_expired(&mut self) {
        let cutoff = now_secs().saturating_sub(DEDUP_TTL_SECS);
        let before = self.data.processed_comments.len();
        self.data
            .processed_comments
            .retain(|_, processed_at| *processed_at >= cutoff);
        let purged = before - self.data.processed_comments.len();
        if purged > 0 {
            debug!(purged, "purged expired dedup entries");
        }
    }

    pub fn add_processed_comment(&mut self, id: &str) {
        self.data
            .processed_comments
            .insert(id.to_string(), now_secs());
    }

    pub fn is_processed(&self, id: &str) -> bool {
        self.data.processed_comments.contains_key(id)
    }

    pub fn update_last_poll_time(&mut self) {
        self.data.last_poll_time = Some(now_secs());
    }

    pub fn last_poll_time(&self) -> Option<u64> {
        self.data.last_poll_time
    }

    pub fn set_last_error(&mut self, error: Option<String>) {
        self.data.last_error = error;
    }

    pub fn last_error(&self) -> Option<&str> {
        self.data.last_error.as_deref()
    }

    pub fn increment_stat(&mut self, name: &str) {
        *self.data.stats.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn stats(&self) -> &HashMap<String, u64> {
        &self.data.stats
    }
}
