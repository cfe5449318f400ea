//! StealthWire Relay
//!
//! Transit relay role plus the plumbing shared with the exit role: the accept
//! loop, outbound dialing, and the two-task splice between a plaintext socket
//! and a secure stream.
//!
//! A transit session accepts plaintext clients, dials its downstream peer,
//! opens the secure stream as initiator and splices the two until either side
//! ends.

mod error;
mod net;
mod splice;
mod transit;

pub use error::{RelayError, Result};
pub use net::{bind, connect, serve};
pub use splice::{splice, ClientSide, SpliceStats, COPY_BUFFER_SIZE};
pub use transit::TransitSession;
