//! Tracing setup for Flowscript binaries.
//!
//! The library itself only emits events; installing a subscriber is the
//! binary's job. Filtering comes from `FLOWSCRIPT_LOG`, then `RUST_LOG`,
//! then the level passed in.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable consulted first for filter directives.
pub const LOG_ENV: &str = "FLOWSCRIPT_LOG";

fn filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Install the global subscriber; `json` selects newline-delimited JSON
/// output. Only the first call in a process has an effect.
pub fn init_tracing(json: bool, level: Level) {
    let registry = tracing_subscriber::registry().with(filter(level));
    let layer = fmt::layer().with_target(false);
    let installed = if json {
        registry.with(layer.json()).try_init()
    } else {
        registry.with(layer).try_init()
    };
    if installed.is_ok() {
        tracing::debug!(event = "telemetry.ready", json, level = %level);
    }
}
