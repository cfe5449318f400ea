use thiserror::Error;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decrypt header failed (suspicious probing)")]
    SuspiciousProbe,

    #[error("Decrypt body failed")]
    BodyDecrypt,

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Nonce space exhausted")]
    NonceExhausted,

    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Stream unusable after an earlier failure")]
    Failed,

    #[error("Write failed after {written} bytes: {source}")]
    PartialWrite {
        written: usize,
        #[source]
        source: Box<CipherError>,
    },
}

impl CipherError {
    /// Wrap `source` with the plaintext progress made before it occurred.
    pub(crate) fn after(written: usize, source: CipherError) -> Self {
        if written == 0 {
            source
        } else {
            Self::PartialWrite {
                written,
                source: Box::new(source),
            }
        }
    }

    /// Plaintext bytes delivered to the transport before the error.
    pub fn bytes_written(&self) -> usize {
        match self {
            Self::PartialWrite { written, .. } => *written,
            _ => 0,
        }
    }

    /// True when a peer failed to authenticate its very first bytes, which is
    /// what an active probe or a wrong key looks like.
    pub fn is_probe(&self) -> bool {
        match self {
            Self::SuspiciousProbe => true,
            Self::PartialWrite { source, .. } => source.is_probe(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CipherError>;
