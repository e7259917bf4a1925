//! # Inbound Ports
//!
//! What the sync core exposes: the indexer API used by bootstrap code and
//! the head subscription, the block processing seam, and the submission
//! status callback.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mm_types::{Hash, ProcessedBlock, TokenId};
use serde::{Deserialize, Serialize};

use crate::domain::{ChangeSet, SyncError};

/// Health as reported to the REST status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceStatus {
    Up,
    Down,
}

/// Snapshot of indexer health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerStatus {
    pub status: ServiceStatus,
    pub last_processed_block: Option<ProcessedBlock>,
    /// Last successful iteration, no-ops included.
    pub last_activity: Option<DateTime<Utc>>,
}

/// Indexer API.
#[async_trait]
pub trait IndexerApi: Send + Sync {
    /// Process at most one block towards `latest_finalised`. Retries until it
    /// succeeds; returns `None` when already caught up.
    async fn process_next_block(&self, latest_finalised: Hash)
        -> Result<Option<Hash>, SyncError>;

    /// Process every block up to `latest_finalised`. Returns the hash of the
    /// last block processed by this call, if any.
    async fn process_all_blocks(&self, latest_finalised: Hash)
        -> Result<Option<Hash>, SyncError>;

    fn status(&self) -> IndexerStatus;
}

/// Turns one finalised block into a change set.
#[async_trait]
pub trait BlockProcessor: Send + Sync {
    async fn handle_block(&self, block_hash: &Hash) -> Result<ChangeSet, SyncError>;
}

/// Progress of a submitted `run_process` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionUpdate {
    /// Accepted by the ledger.
    Submitted { call_hash: Hash },
    InBlock { block_hash: Hash },
    /// Terminal. `token_ids` are the tokens minted by the call, in output
    /// order; empty for processes without outputs.
    Finalised {
        block_hash: Hash,
        token_ids: Vec<TokenId>,
    },
    /// Terminal.
    Failed { reason: String },
}

/// Receives submission progress. Called in order, with exactly one terminal
/// update per submission.
#[async_trait]
pub trait SubmissionObserver: Send + Sync {
    async fn on_update(&self, update: SubmissionUpdate);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_status_wire_format() {
        assert_eq!(serde_json::to_string(&ServiceStatus::Up).unwrap(), "\"UP\"");
        assert_eq!(serde_json::to_string(&ServiceStatus::Down).unwrap(), "\"DOWN\"");
    }
}
