//! Opt-in `tracing` subscriber setup.

use tracing_subscriber::EnvFilter;

/// Installs a global subscriber configured from `RUST_LOG`, defaulting to
/// `info` for this crate when the variable is unset.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sitewright=info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
