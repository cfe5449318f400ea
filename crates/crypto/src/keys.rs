use std::fmt;

use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use stealthwire_core::CipherMode;

use crate::{CipherError, NonceLayout, Result};

/// 256-bit ChaCha20-Poly1305 key
pub type SymmetricKey = [u8; 32];

const INITIATOR_TO_RESPONDER: &[u8] = b"stealthwire/v1 initiator->responder";
const RESPONDER_TO_INITIATOR: &[u8] = b"stealthwire/v1 responder->initiator";

/// Hash data using SHA-256
pub fn hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Base key of a shared secret: SHA-256 of its UTF-8 bytes.
pub fn derive_key(secret: &str) -> SymmetricKey {
    hash(secret.as_bytes())
}

/// Which end of a secure stream this side is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dials out and sends the handshake frame (transit side)
    Initiator,
    /// Accepts and reads the handshake frame first (exit side)
    Responder,
}

/// Key material of one task, derived once and shared by all its connections.
#[derive(Clone)]
pub struct SessionKeys {
    initiator_to_responder: SymmetricKey,
    responder_to_initiator: SymmetricKey,
    mode: CipherMode,
}

impl SessionKeys {
    pub fn derive(secret: &str, mode: CipherMode) -> Result<Self> {
        let base = derive_key(secret);

        match mode {
            CipherMode::Legacy => Ok(Self {
                initiator_to_responder: base,
                responder_to_initiator: base,
                mode,
            }),
            CipherMode::Directional => {
                let hk = Hkdf::<Sha256>::new(None, &base);
                let mut i2r = [0u8; 32];
                let mut r2i = [0u8; 32];
                hk.expand(INITIATOR_TO_RESPONDER, &mut i2r)
                    .map_err(|_| CipherError::KeyDerivation)?;
                hk.expand(RESPONDER_TO_INITIATOR, &mut r2i)
                    .map_err(|_| CipherError::KeyDerivation)?;
                Ok(Self {
                    initiator_to_responder: i2r,
                    responder_to_initiator: r2i,
                    mode,
                })
            }
        }
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    pub fn nonce_layout(&self) -> NonceLayout {
        match self.mode {
            CipherMode::Directional => NonceLayout::BigEndian,
            CipherMode::Legacy => NonceLayout::LowByteFirst,
        }
    }

    /// Key this side seals outgoing frames with.
    pub fn send_key(&self, role: Role) -> &SymmetricKey {
        match role {
            Role::Initiator => &self.initiator_to_responder,
            Role::Responder => &self.responder_to_initiator,
        }
    }

    /// Key this side opens incoming frames with.
    pub fn recv_key(&self, role: Role) -> &SymmetricKey {
        match role {
            Role::Initiator => &self.responder_to_initiator,
            Role::Responder => &self.initiator_to_responder,
        }
    }

    /// Short non-secret tag for logs, so operators can tell whether two ends
    /// were configured with the same secret.
    pub fn fingerprint(&self) -> String {
        hex::encode(&hash(&self.initiator_to_responder)[..4])
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("mode", &self.mode)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}
