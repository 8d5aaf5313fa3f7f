//! Tracing setup
//!
//! Initializes a `tracing_subscriber` using `RALLY_LOG` first, then
//! `RUST_LOG`, then an `info` default.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber; safe to call more than once
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .try_init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("RALLY_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
