//! Tracing bootstrap for binaries and tests embedding the engine.

use tracing_subscriber::EnvFilter;

/// Install a global `tracing` subscriber honoring `RUST_LOG`.
///
/// Idempotent: a second call (or a subscriber installed by the host
/// application) leaves the existing one in place.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
