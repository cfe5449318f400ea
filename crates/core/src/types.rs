use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Result, TunnelError};

/// Task identifier assigned by the controller
pub type TaskId = u64;

/// Relay role a task runs as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    /// Accepts plaintext clients and forwards them encrypted to a downstream peer
    Transit,
    /// Terminates the encrypted tunnel and forwards plaintext to a local destination
    Exit,
}

impl fmt::Display for TaskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transit => f.write_str("transit"),
            Self::Exit => f.write_str("exit"),
        }
    }
}

/// Key schedule used by the frame cipher of a task.
///
/// | Mode          | Keys                                  | Nonce layout        |
/// |---------------|---------------------------------------|---------------------|
/// | `directional` | one HKDF subkey per direction         | 96-bit big-endian   |
/// | `legacy`      | SHA-256(secret) for both directions   | low byte first      |
///
/// `legacy` matches nodes already deployed in the field. It seals the first
/// frame of each direction under the same key and nonce, so it should only be
/// used where interoperability requires it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CipherMode {
    #[default]
    Directional,
    Legacy,
}

/// One relay assignment pushed down by the controller.
///
/// `target_addr` is the downstream peer for `transit` tasks and the final
/// local destination for `exit` tasks.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub mode: TaskMode,
    pub listen_addr: String,
    pub target_addr: String,
    /// Shared secret, identical on both ends of the tunnel
    pub key: String,
    #[serde(default)]
    pub cipher: CipherMode,
}

impl Task {
    pub fn new(
        id: TaskId,
        mode: TaskMode,
        listen_addr: impl Into<String>,
        target_addr: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            id,
            mode,
            listen_addr: listen_addr.into(),
            target_addr: target_addr.into(),
            key: key.into(),
            cipher: CipherMode::default(),
        }
    }

    pub fn with_cipher(mut self, cipher: CipherMode) -> Self {
        self.cipher = cipher;
        self
    }

    /// Check the fields a relay session cannot run without.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| TunnelError::InvalidTask {
            id: self.id,
            reason: reason.to_string(),
        };

        if self.key.is_empty() {
            return Err(invalid("empty key"));
        }
        if self.listen_addr.trim().is_empty() {
            return Err(invalid("empty listen_addr"));
        }
        if self.target_addr.trim().is_empty() {
            return Err(invalid("empty target_addr"));
        }
        if !looks_like_host_port(&self.listen_addr) {
            return Err(invalid("listen_addr is not host:port"));
        }
        if !looks_like_host_port(&self.target_addr) {
            return Err(invalid("target_addr is not host:port"));
        }
        Ok(())
    }
}

// The secret never reaches the logs.
impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("listen_addr", &self.listen_addr)
            .field("target_addr", &self.target_addr)
            .field("key", &"<redacted>")
            .field("cipher", &self.cipher)
            .finish()
    }
}

fn looks_like_host_port(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}
