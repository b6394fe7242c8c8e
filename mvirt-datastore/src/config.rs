//! Data store configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Tuning knobs for stores and the commit broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatastoreConfig {
    /// Maximum number of commits waiting in the broker pipeline.
    pub max_commit_queue_size: usize,
    /// Maximum number of queued notifications a coalescing listener receives at once.
    pub max_listener_batch: usize,
    /// Capacity of the leaf interning table (0 disables interning).
    pub leaf_intern_cache_size: usize,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            max_commit_queue_size: 5000,
            max_listener_batch: 100,
            leaf_intern_cache_size: 4096,
        }
    }
}

impl DatastoreConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_commit_queue_size == 0 {
            return Err(StoreError::Config(
                "max_commit_queue_size must be at least 1".to_string(),
            ));
        }
        if self.max_listener_batch == 0 {
            return Err(StoreError::Config(
                "max_listener_batch must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
