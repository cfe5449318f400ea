//! StealthWire Core Types
//!
//! This crate defines the data structures shared by the relay roles, the task
//! runner and the metering collaborator: relay tasks, traffic counters and the
//! traffic registry.

mod error;
mod traffic;
mod types;

pub use error::*;
pub use traffic::*;
pub use types::*;
