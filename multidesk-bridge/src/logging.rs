//! Tracing subscriber setup for shells embedding the mirroring core.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directive, e.g.
/// `MULTIDESK_LOG=multidesk_bridge=debug`.
pub const LOG_ENV: &str = "MULTIDESK_LOG";

/// Install a `fmt` subscriber filtered by [`LOG_ENV`], or by `default_filter`
/// when the variable is unset or unparsable.
///
/// Returns `false` if a global subscriber was already installed, which is
/// not an error: the shell may have set up its own.
pub fn init(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
        .is_ok()
}
