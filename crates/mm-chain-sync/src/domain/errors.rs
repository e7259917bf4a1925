//! # Domain Errors
//!
//! Error types for chain synchronisation and submission.
//!
//! ## Taxonomy
//!
//! | Category | Variants | Effect |
//! |----------|----------|--------|
//! | Protocol | `UnknownProcess`, `UnsupportedVersion`, `MissingRole`, `MissingMetadata`, `InvalidMetadata`, `UnexpectedTokenCount` | Event fails, block is retried wholesale |
//! | Resolution | `UnknownToken`, `IncompleteRecord`, `InconsistentChain` | Block is retried wholesale |
//! | Transient | `Chain`, `Store` | Logged and retried after a fixed delay |
//! | Lifecycle | `IndexerClosed`, `InvalidState` | Surfaced to the caller |

use mm_types::{hash_hex, Hash, TokenId};
use thiserror::Error;

/// Errors reported by the ledger client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// RPC transport failed or timed out.
    #[error("Chain RPC failed: {0}")]
    Rpc(String),

    /// No block with this hash.
    #[error("Block not found: {}", hash_hex(.0))]
    BlockNotFound(Hash),

    /// No token with this id at the requested block.
    #[error("Token {token_id} not found at block {}", hash_hex(.block_hash))]
    TokenNotFound { token_id: TokenId, block_hash: Hash },

    /// The ledger refused the extrinsic before inclusion.
    #[error("Extrinsic rejected: {0}")]
    InvalidExtrinsic(String),

    /// The finalised-head subscription ended.
    #[error("Subscription closed")]
    SubscriptionClosed,
}

/// Errors reported by the relational store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Store unreachable or query failed.
    #[error("Database error: {0}")]
    Database(String),

    /// A row to update does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A unique key already exists (e.g. a block processed by a sibling).
    #[error("Conflict on {kind}: {id}")]
    Conflict { kind: &'static str, id: String },
}

/// Errors raised while turning finalised blocks into store mutations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The event names a process this indexer does not understand.
    #[error("Unknown process: {0}")]
    UnknownProcess(String),

    /// The process is known but its version is not.
    #[error("Unsupported version {version} for process {process}")]
    UnsupportedVersion { process: String, version: u32 },

    /// A required role is absent from an output token.
    #[error("Missing role {role:?} on token {token_id}")]
    MissingRole { role: &'static str, token_id: TokenId },

    /// A required metadata key is absent from an output token.
    #[error("Missing metadata {key:?} on token {token_id}")]
    MissingMetadata { key: &'static str, token_id: TokenId },

    /// A metadata value could not be interpreted.
    #[error("Invalid metadata {key:?} on token {token_id}: {value:?}")]
    InvalidMetadata {
        key: &'static str,
        token_id: TokenId,
        value: String,
    },

    /// Inputs or outputs do not match the process's positional contract.
    #[error("Process {process} expects {expected} {side}, got {got}")]
    UnexpectedTokenCount {
        process: &'static str,
        side: &'static str,
        expected: usize,
        got: usize,
    },

    /// An input token maps to no local entity.
    #[error("Unknown token: {0}")]
    UnknownToken(TokenId),

    /// An insert record lacks a field the entity requires.
    #[error("Incomplete {kind} record {id}: missing {field}")]
    IncompleteRecord {
        kind: &'static str,
        id: String,
        field: &'static str,
    },

    /// A walked-back header does not link to its child.
    #[error("Inconsistent chain at {}: {reason}", hash_hex(.hash))]
    InconsistentChain { hash: Hash, reason: String },

    /// Ledger client failure.
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The indexer was closed while the request was pending.
    #[error("Indexer closed")]
    IndexerClosed,

    /// Lifecycle call made in the wrong state.
    #[error("Invalid indexer state: expected {expected}, was {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
}

impl SyncError {
    /// Errors that can never heal by waiting: the block keeps failing until
    /// the indexer is upgraded or the data is repaired. They are still
    /// retried, but logged at error level.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::UnknownProcess(_)
                | SyncError::UnsupportedVersion { .. }
                | SyncError::MissingRole { .. }
                | SyncError::MissingMetadata { .. }
                | SyncError::InvalidMetadata { .. }
                | SyncError::UnexpectedTokenCount { .. }
                | SyncError::UnknownToken(_)
                | SyncError::IncompleteRecord { .. }
                | SyncError::InconsistentChain { .. }
        )
    }
}

/// Errors raised while preparing a transaction for submission.
#[derive(Debug, Error)]
pub enum SubmissionError {
    /// Nonce query or submission RPC failed.
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// The call could not be encoded for signing.
    #[error("Encoding failed: {0}")]
    Encoding(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_version_error() {
        let err = SyncError::UnsupportedVersion {
            process: "demand_create".to_string(),
            version: 2,
        };
        assert!(err.to_string().contains("demand_create"));
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_transient_errors_are_not_protocol_errors() {
        let err: SyncError = ChainError::Rpc("timeout".to_string()).into();
        assert!(!err.is_protocol_error());
        let err: SyncError = StoreError::Database("down".to_string()).into();
        assert!(!err.is_protocol_error());
    }

    #[test]
    fn test_block_not_found_renders_hex() {
        let err = ChainError::BlockNotFound([0xab; 32]);
        assert!(err.to_string().contains(&"ab".repeat(32)));
    }

    #[test]
    fn test_token_count_error() {
        let err = SyncError::UnexpectedTokenCount {
            process: "match2_propose",
            side: "outputs",
            expected: 3,
            got: 2,
        };
        assert_eq!(
            err.to_string(),
            "Process match2_propose expects 3 outputs, got 2"
        );
    }
}
