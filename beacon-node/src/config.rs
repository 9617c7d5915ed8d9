//! Node configuration, loaded from TOML. Every section and field has a
//! default, so an empty document is a valid configuration.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::NodeError;

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// Backoff applied to chain calls and resubscriptions.
    pub retry: BackoffPolicy,
    /// Session runtime limits.
    pub session: SessionConfig,
    /// Log output.
    pub logging: LoggingConfig,
}

impl NodeConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(document: &str) -> Result<Self, NodeError> {
        toml::from_str(document).map_err(|error| NodeError::Config(error.to_string()))
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, NodeError> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path)
            .map_err(|error| NodeError::Config(format!("{}: {error}", path.display())))?;
        Self::from_toml_str(&document)
    }
}

/// Exponential backoff with a bounded number of attempts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffPolicy {
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound of any delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Factor applied to the delay after every failed attempt.
    pub multiplier: u32,
    /// Attempts in total, the first one included.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2,
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// The delay after failed attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.multiplier).saturating_pow(attempt);
        Duration::from_millis(
            self.initial_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }
}

/// Session runtime limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Capacity of the command channel of the node loop.
    pub command_capacity: usize,
    /// Capacity of the per-session channel of routed chain events.
    pub event_capacity: usize,
    /// Capacity of the transaction queue.
    pub transaction_capacity: usize,
    /// DKG attempts per seed, the first one included.
    pub max_dkg_attempts: u32,
    /// How many blocks of event identities are remembered for
    /// deduplication.
    pub dedup_horizon_blocks: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_capacity: 32,
            event_capacity: 64,
            transaction_capacity: 64,
            max_dkg_attempts: 3,
            dedup_horizon_blocks: 256,
        }
    }
}

/// Log output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive, used when `RUST_LOG` is not set.
    pub filter: String,
    /// Colored output.
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            ansi: true,
        }
    }
}
