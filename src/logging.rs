//! Subscriber setup for binaries built on Workhorse.

use crate::{Result, WorkhorseError, config::LoggingConfig};
use tracing_subscriber::{EnvFilter, fmt};

/// Builds the filter for `config`. `RUST_LOG` wins over the configured level
/// when it is set.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives),
        _ => EnvFilter::try_new(&config.level),
    }
    .map_err(|e| WorkhorseError::Config(format!("invalid log filter: {}", e)))
}

/// Installs a global `tracing` subscriber. Fails if one is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let builder = fmt()
        .with_env_filter(env_filter(config)?)
        .with_target(true)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| WorkhorseError::Config(format!("failed to install logger: {}", e)))
}
