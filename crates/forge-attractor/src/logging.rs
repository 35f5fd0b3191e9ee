//! Ambient tracing setup. Every run-loop step, stage attempt, and provider
//! dispatch emits a `tracing` event; this module only owns process-wide
//! subscriber initialization so callers (forge-cli, tests) don't each
//! reinvent it.
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILTER: &str = "info";

/// Installs a global `tracing` subscriber reading `RUST_LOG`, falling back
/// to [`DEFAULT_LOG_FILTER`]. Safe to call more than once; later calls are
/// no-ops (the global subscriber can only be set once per process).
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_tracing_expected_idempotent() {
        init_tracing();
        init_tracing();
    }
}
