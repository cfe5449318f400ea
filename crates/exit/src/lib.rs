//! StealthWire Exit Node
//!
//! Exit relay role: terminates the encrypted tunnel and forwards plaintext to
//! a fixed local destination.
//!
//! ## Responsibilities
//!
//! 1. Accept tunnel connections and run the responder handshake
//! 2. Close connections that fail to authenticate, with nothing written back
//! 3. Dial the local destination and splice until either side ends

mod session;

pub use session::ExitSession;

use stealthwire_crypto::CipherError;
use stealthwire_relay::RelayError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExitError {
    #[error("Handshake failed: {0}")]
    Handshake(CipherError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Invalid stream configuration: {0}")]
    Config(CipherError),
}

impl ExitError {
    /// True for peers that failed to authenticate their first frame.
    pub fn is_probe(&self) -> bool {
        matches!(self, Self::Handshake(e) if e.is_probe())
    }
}

pub type Result<T> = std::result::Result<T, ExitError>;
