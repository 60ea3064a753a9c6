//! Logging setup

use crate::{config::TelemetryConfig, Error, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global `tracing` subscriber
///
/// `RUST_LOG` wins over the configured level. Fails if a subscriber is
/// already installed.
pub fn init_tracing(config: &TelemetryConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| Error::Config(format!("Invalid log level '{}': {}", config.log_level, e)))?;

    let builder = fmt()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {}", e)))
}
