//! Log subscriber installation.

use tracing_subscriber::EnvFilter;

use crate::{config::LoggingConfig, NodeError};

/// Install the global `fmt` subscriber. `RUST_LOG` takes precedence over the
/// configured filter. Fails if a subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<(), NodeError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|error| NodeError::Config(error.to_string()))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi)
        .with_target(true)
        .try_init()
        .map_err(|error| NodeError::Config(error.to_string()))
}
