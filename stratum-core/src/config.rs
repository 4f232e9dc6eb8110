//! Runtime Configuration
//!
//! Tunables for a [`Runtime`](crate::Runtime). Every field has a default, so
//! a partial JSON document (or `{}`) is a valid configuration.

use serde::{Deserialize, Serialize};

/// Default number of height buckets allocated up front.
pub const DEFAULT_HEAP_CAPACITY: usize = 2000;

/// Configuration for a reactive runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of height buckets the scheduler allocates when created.
    /// The scheduler grows past this on demand; raising it ahead of time
    /// avoids reallocations when building very deep graphs.
    pub heap_capacity: usize,

    /// Retry a failed computation once per clock tick when it is read.
    pub self_heal: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heap_capacity: DEFAULT_HEAP_CAPACITY,
            self_heal: true,
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(ConfigError::Parse)
    }
}

/// Errors produced while loading a [`RuntimeConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The document was not valid JSON or had mistyped fields.
    #[error("invalid runtime config: {0}")]
    Parse(#[source] serde_json::Error),
}
