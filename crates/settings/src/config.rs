//! Task list configuration

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use stealthwire_core::Task;
use tracing::{debug, info};

use crate::{Result, SettingsError};

/// The document a node is started with: every relay task it should run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub tasks: Vec<Task>,
}

impl TunnelConfig {
    /// Read, parse and validate the config at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&content)?;
        info!(path = %path.display(), tasks = config.tasks.len(), "Loaded task config");
        Ok(config)
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: TunnelConfig = serde_json::from_str(json).map_err(SettingsError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configs the runner could not start cleanly.
    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(SettingsError::EmptyTaskList);
        }

        let mut ids = HashSet::new();
        let mut listens = HashSet::new();
        for task in &self.tasks {
            task.validate()?;
            if !ids.insert(task.id) {
                return Err(SettingsError::DuplicateId(task.id));
            }
            if !listens.insert(task.listen_addr.as_str()) {
                return Err(SettingsError::DuplicateListen(task.listen_addr.clone()));
            }
            debug!(task = ?task, "task ok");
        }
        Ok(())
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(SettingsError::ParseError)
    }
}
