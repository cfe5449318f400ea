use thiserror::Error;

use crate::TaskId;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Invalid task #{id}: {reason}")]
    InvalidTask { id: TaskId, reason: String },

    #[error("Traffic report failed: {0}")]
    ReportFailed(String),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
