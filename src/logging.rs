//! Structured logging setup
//!
//! The subscriber is built from [`LoggingConfig`]: the configured level is
//! the default directive and `RUST_LOG` may still refine it.

use anyhow::{anyhow, Result};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Parse a configured level name
pub fn parse_level(level: &str) -> Result<Level> {
    level
        .to_lowercase()
        .parse()
        .map_err(|e| anyhow!("Failed to parse log level '{}': {}", level, e))
}

/// Filter with `level` as the default directive, overridable via `RUST_LOG`
pub fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
}

/// Install the global subscriber. `verbose` forces DEBUG.
///
/// Logs go to stderr so command output on stdout stays machine-readable.
pub fn init(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        parse_level(&config.level)?
    };

    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter(level));

    let installed = match config.format.to_lowercase().as_str() {
        "json" => builder.json().try_init(),
        "pretty" => builder.pretty().try_init(),
        "compact" => builder.compact().try_init(),
        other => return Err(anyhow!("Invalid log format: {}", other)),
    };
    installed.map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))
}
