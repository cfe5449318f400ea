//! StealthWire Cryptography
//!
//! The frame cipher: an authenticated, length-concealing duplex stream built on
//! ChaCha20-Poly1305 and a shared secret.
//!
//! ## Wire format
//!
//! Every frame is a sealed 2-byte big-endian length followed, when the length
//! is non-zero, by the sealed payload:
//!
//! ```text
//! +-------------------------+---------------------------------+
//! | Seal(n, u16_be(len))    | Seal(n + 1, payload[..len])     |
//! | 2 + 16 bytes            | len + 16 bytes (absent if 0)    |
//! +-------------------------+---------------------------------+
//! ```
//!
//! Zero-length frames carry no body and are skipped by readers; the initiator
//! sends one as its handshake.

mod error;
mod frame;
mod jitter;
mod keys;
mod nonce;
mod stream;

pub use error::*;
pub use frame::*;
pub use jitter::*;
pub use keys::*;
pub use nonce::*;
pub use stream::*;
