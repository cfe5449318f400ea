//! StealthWire Daemon
//!
//! Supervises the relay sessions of a node and reports their traffic.
//!
//! ## Components
//!
//! - **TaskRunner**: one relay session per task, under a [`SupervisionPolicy`]
//! - **MeteringReporter**: periodically drains the traffic registry into a
//!   [`TrafficSink`](stealthwire_core::TrafficSink)
//!
//! ## Supervision
//!
//! - `isolated` (default): a failed session is logged and reported, the others
//!   keep running; optionally restarted after a backoff
//! - `fail-fast`: the first session to stop ends the run and cancels the rest

#[cfg(unix)]
mod limits;
mod metering;
mod runner;

#[cfg(unix)]
pub use limits::{raise_nofile_limit, NOFILE_TARGET};
pub use metering::{LogSink, MeteringReporter, DEFAULT_REPORT_INTERVAL};
pub use runner::{run_session, SessionEvent, SessionExit, SupervisionPolicy, TaskRunner};

use stealthwire_core::TaskId;
use stealthwire_exit::ExitError;
use stealthwire_relay::RelayError;
use stealthwire_settings::SettingsError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("No tasks to run")]
    EmptyTaskList,

    #[error("Transit session failed: {0}")]
    Relay(#[from] RelayError),

    #[error("Exit session failed: {0}")]
    Exit(#[from] ExitError),

    #[error("Session for task {0} panicked")]
    SessionPanicked(TaskId),

    #[error("All {0} sessions stopped")]
    AllSessionsStopped(usize),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),
}

pub type Result<T> = std::result::Result<T, RunnerError>;
