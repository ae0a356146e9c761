//! Shaping configuration with TOML file support.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::QosError;
use crate::limiter::ALLOW_ALL_TRAFFIC;

/// Configuration for a [`QosListener`](crate::QosListener).
///
/// Can be loaded from a TOML file via [`QosConfig::from_toml_file`] or
/// built programmatically (e.g. for tests). Bandwidths use the shaping
/// encoding: negative means unlimited, zero blocks all traffic, a positive
/// value is bytes per second.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QosConfig {
    /// Aggregate bandwidth across all connections, bytes per second.
    #[serde(default = "default_bandwidth")]
    pub global_bandwidth: i32,

    /// Bandwidth of each individual connection, bytes per second.
    #[serde(default = "default_bandwidth")]
    pub per_connection_bandwidth: i32,

    /// Divisor applied to a limiter's burst when sizing one chunk of I/O.
    /// Larger values mean smaller chunks: fairer sharing and faster
    /// reaction to limit changes, at more per-chunk overhead.
    #[serde(default = "default_chunk_divisor")]
    pub chunk_divisor: u64,

    /// Log format: "human" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Log level filter: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_bandwidth() -> i32 {
    ALLOW_ALL_TRAFFIC
}

fn default_chunk_divisor() -> u64 {
    10_000
}

fn default_log_format() -> String {
    "human".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            global_bandwidth: default_bandwidth(),
            per_connection_bandwidth: default_bandwidth(),
            chunk_divisor: default_chunk_divisor(),
            log_format: default_log_format(),
            log_level: default_log_level(),
        }
    }
}

impl QosConfig {
    /// Load configuration from a TOML file. Missing fields take their
    /// defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, QosError> {
        let raw = std::fs::read_to_string(path)?;
        let config: QosConfig =
            toml::from_str(&raw).map_err(|e| QosError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the shaping layer cannot operate with.
    pub fn validate(&self) -> Result<(), QosError> {
        if self.chunk_divisor == 0 {
            return Err(QosError::Config("chunk_divisor must be at least 1".into()));
        }
        Ok(())
    }
}
