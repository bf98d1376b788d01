//! Ambient logging setup (§10.1): wires `tracing` events emitted throughout
//! the crate to a process-wide subscriber.

use tracing_subscriber::EnvFilter;

/// Install a `tracing_subscriber::fmt` subscriber filtered by `RUST_LOG`,
/// defaulting to `info` when the variable is unset or unparsable.
///
/// Callers that already manage their own subscriber (the CLI surface, the
/// dashboard) shouldn't call this — it's for embedding this crate directly
/// or for its own integration tests.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
