//! StealthWire Settings
//!
//! Loading and validation of the task list a node runs.
//!
//! ## Usage
//!
//! ```no_run
//! use stealthwire_settings::TunnelConfig;
//!
//! let config = TunnelConfig::load("/etc/stealthwire/tunnel.json")?;
//! for task in &config.tasks {
//!     println!("task {} ({})", task.id, task.mode);
//! }
//! # Ok::<(), stealthwire_settings::SettingsError>(())
//! ```

mod config;

pub use config::TunnelConfig;

use std::path::PathBuf;

use stealthwire_core::{TaskId, TunnelError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read config {path:?}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ParseError(serde_json::Error),

    #[error("Config contains no tasks")]
    EmptyTaskList,

    #[error(transparent)]
    InvalidTask(#[from] TunnelError),

    #[error("Duplicate task id {0}")]
    DuplicateId(TaskId),

    #[error("Listen address {0} is used by more than one task")]
    DuplicateListen(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Where the agent looks for its task list when no path is given
pub fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/stealthwire/tunnel.json")
}
