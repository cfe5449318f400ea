//! Tracing subscriber setup shared by StealthWire binaries.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,stealthwire=debug";

/// Filter used when `RUST_LOG` is unset and `verbose` is requested
pub const VERBOSE_FILTER: &str = "debug,stealthwire=trace";

/// Build the filter: `RUST_LOG` wins, otherwise the default for `verbose`.
pub fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER })
    })
}

/// Install the global subscriber.
///
/// Returns `false` if one was already installed, which happens when tests or
/// an embedding application set up logging first.
pub fn init(verbose: bool) -> bool {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(env_filter(verbose))
        .try_init()
        .is_ok()
}
