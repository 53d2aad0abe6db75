// Node Configuration
//
// Explicit configuration handed to the state machine's constructor.
// Loadable from JSON; every field has a built-in default.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Settings consumed by the DD state machine and its driving loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DdNodeConfig {
    /// Buffered DDL records that force a drain.
    pub flush_dd_buffer_size: usize,

    /// Root of the durable metadata store.
    pub meta_root_path: PathBuf,

    /// Bound of the flush coordinator channel.
    pub flush_channel_capacity: usize,

    /// Implicit per-collection partition that cannot be dropped on its own.
    pub default_partition_name: String,

    pub max_batch_retries: u32,
    pub retry_backoff_ms: u64,

    /// Evaluate registered invariants after every applied record.
    pub check_invariants: bool,
}

impl Default for DdNodeConfig {
    fn default() -> Self {
        Self {
            flush_dd_buffer_size: 32,
            meta_root_path: PathBuf::from("by-dev/meta"),
            flush_channel_capacity: 64,
            default_partition_name: "_default".into(),
            max_batch_retries: 3,
            retry_backoff_ms: 100,
            check_invariants: true,
        }
    }
}

impl DdNodeConfig {
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.flush_dd_buffer_size = size;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_dd_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "flush_dd_buffer_size must be at least 1".into(),
            ));
        }
        if self.flush_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "flush_channel_capacity must be at least 1".into(),
            ));
        }
        if self.meta_root_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("meta_root_path is empty".into()));
        }
        Ok(())
    }
}
