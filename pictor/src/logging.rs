//! Logging setup for binaries and tests.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is the embedder's call. This helper wires up a sensible default:
//! compact console output filtered by `RUST_LOG` (defaulting to `info`).

use tracing_subscriber::EnvFilter;

/// Initializes console logging.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .compact()
        .try_init();
}
