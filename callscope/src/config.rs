//! Profiler configuration
//!
//! Loaded from a JSON file (every field optional) and then overridden by CLI
//! flags. Values are validated when turned into the types that use them.
//!
//! ```json
//! { "trace_limit": 1000000, "max_empty_factor": 0.2, "poll_interval_ms": 100 }
//! ```

use crate::collector::policy::{DEFAULT_MAX_EMPTY_FACTOR, DEFAULT_MIN_EMPTY_FACTOR, DEFAULT_TRACE_LIMIT};
use crate::collector::BufferingPolicy;
use crate::domain::CollectorError;
use crate::patcher::DEFAULT_BLOCK_SIZE;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Per-thread record budget
    pub trace_limit: usize,
    pub max_empty_factor: f64,
    pub min_empty_factor: f64,
    /// Statistics update period
    pub poll_interval_ms: u64,
    /// Size of each executable block reserved for thunks
    pub block_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trace_limit: DEFAULT_TRACE_LIMIT,
            max_empty_factor: DEFAULT_MAX_EMPTY_FACTOR,
            min_empty_factor: DEFAULT_MIN_EMPTY_FACTOR,
            poll_interval_ms: 100,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl Config {
    /// Read a JSON configuration file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// # Errors
    /// Returns [`CollectorError::InvalidPolicy`] for out-of-range factors
    pub fn buffering_policy(&self) -> Result<BufferingPolicy, CollectorError> {
        BufferingPolicy::new(self.trace_limit, self.max_empty_factor, self.min_empty_factor)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
