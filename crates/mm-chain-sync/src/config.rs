//! # Sync Configuration
//!
//! Tunables for the indexer loop.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Indexer configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Fixed delay between failed attempts at the same block.
    pub retry_delay_ms: u64,

    /// The indexer reports `DOWN` when its last successful iteration is
    /// older than this.
    pub status_timeout_ms: u64,

    /// Capacity of the worker's command channel.
    pub command_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 1000,
            status_timeout_ms: 30_000,
            command_buffer: 64,
        }
    }
}

impl SyncConfig {
    /// Create a config for testing (short delays).
    pub fn for_testing() -> Self {
        Self {
            retry_delay_ms: 10,
            status_timeout_ms: 5_000,
            command_buffer: 16,
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }
}
