//! Process resource limits.

use tracing::{info, warn};

/// Open file limit a node asks for; every relayed connection holds two
/// descriptors.
pub const NOFILE_TARGET: u64 = 65535;

/// Raise the soft open file limit toward [`NOFILE_TARGET`], bounded by the
/// hard limit. Failure is logged and the process carries on with what it has.
pub fn raise_nofile_limit() -> Option<u64> {
    match rlimit::increase_nofile_limit(NOFILE_TARGET) {
        Ok(limit) => {
            info!(limit, "open file limit set");
            Some(limit)
        }
        Err(e) => {
            warn!(error = %e, wanted = NOFILE_TARGET, "failed to raise open file limit");
            None
        }
    }
}
