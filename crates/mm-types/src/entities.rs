//! # Core Domain Entities
//!
//! Relational records mirrored from the ledger.
//!
//! ## Clusters
//!
//! - **Matching**: `Demand`, `Match2` and their comments
//! - **Content**: `Attachment`
//! - **Submission**: `Transaction`
//! - **Sync progress**: `ProcessedBlock`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use uuid::Uuid;

use crate::chain::{Address, Hash, TokenId};
use crate::errors::ParseEnumError;

/// Declares a fieldless enum with a fixed wire spelling per variant.
///
/// Generates `as_str`, `Display` and `FromStr`; serde goes through those so
/// the store, the chain metadata and the REST layer agree on one spelling.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident ($kind:literal) {
            $( $(#[$vmeta:meta])* $variant:ident => $wire:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Wire spelling of this value.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $wire ),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $wire => Ok(Self::$variant), )+
                    other => Err(ParseEnumError::new($kind, other)),
                }
            }
        }
    };
}

// =============================================================================
// CLUSTER A: MATCHING
// =============================================================================

wire_enum! {
    /// Which side of a match a demand sits on.
    DemandSubtype ("demand subtype") {
        /// Demand A (e.g. an order).
        DemandA => "demand_a",
        /// Demand B (e.g. a capacity).
        DemandB => "demand_b",
    }
}

wire_enum! {
    /// Demand lifecycle: `pending → created → allocated | cancelled`.
    DemandState ("demand state") {
        /// Created locally, not yet minted.
        Pending => "pending",
        /// Minted on-chain.
        Created => "created",
        /// Consumed by an `acceptedFinal` match.
        Allocated => "allocated",
        /// Withdrawn through a match cancellation or rematch.
        Cancelled => "cancelled",
    }
}

wire_enum! {
    /// Match2 lifecycle:
    /// `pending → proposed → acceptedA | acceptedB → acceptedFinal → cancelled | rejected`.
    Match2State ("match2 state") {
        /// Created locally, not yet minted.
        Pending => "pending",
        /// Proposed by an optimiser.
        Proposed => "proposed",
        /// Accepted by member A only.
        AcceptedA => "acceptedA",
        /// Accepted by member B only.
        AcceptedB => "acceptedB",
        /// Accepted by both members; demands are allocated.
        AcceptedFinal => "acceptedFinal",
        /// Cancelled after final acceptance, or superseded by a rematch.
        Cancelled => "cancelled",
        /// Rejected by a member.
        Rejected => "rejected",
    }
}

wire_enum! {
    /// Comment lifecycle: `pending → created`.
    CommentState ("comment state") {
        /// Created locally, waiting for the carrying transaction.
        Pending => "pending",
        /// Confirmed on-chain.
        Created => "created",
    }
}

/// One side of a potential match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Demand {
    pub id: Uuid,
    pub owner: Address,
    pub subtype: DemandSubtype,
    pub state: DemandState,
    pub parameters_attachment_id: Uuid,
    /// Advances with every state-changing on-chain event.
    pub latest_token_id: Option<TokenId>,
    /// Set once, at first mint.
    pub original_token_id: Option<TokenId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A proposed pairing of one A-demand and one B-demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match2 {
    pub id: Uuid,
    pub optimiser: Address,
    pub member_a: Address,
    pub member_b: Address,
    pub state: Match2State,
    pub demand_a_id: Uuid,
    pub demand_b_id: Uuid,
    /// The `acceptedFinal` match this one supersedes (rematch).
    pub replaces_id: Option<Uuid>,
    pub latest_token_id: Option<TokenId>,
    pub original_token_id: Option<TokenId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Annotation attached to a demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemandComment {
    pub id: Uuid,
    pub owner: Address,
    pub state: CommentState,
    pub demand: Uuid,
    pub attachment_id: Uuid,
    /// Transaction that carries the comment, when submitted by this API.
    pub transaction_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Annotation attached to a match (e.g. the reason for a cancellation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match2Comment {
    pub id: Uuid,
    pub owner: Address,
    pub state: CommentState,
    pub match2: Uuid,
    pub attachment_id: Uuid,
    pub transaction_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// CLUSTER B: CONTENT
// =============================================================================

/// Off-chain content referenced from chain metadata by integrity hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Uuid,
    pub integrity_hash: String,
    pub owner_address: Address,
    pub filename: Option<String>,
    pub size: Option<u64>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// CLUSTER C: SUBMISSION
// =============================================================================

wire_enum! {
    /// Which entity kind a transaction acts on.
    TransactionApiType ("transaction api type") {
        Demand => "demand",
        Match2 => "match2",
    }
}

wire_enum! {
    /// What a transaction does to its entity.
    TransactionType ("transaction type") {
        Creation => "creation",
        Comment => "comment",
        Proposal => "proposal",
        Accept => "accept",
        Rejection => "rejection",
        Cancellation => "cancellation",
    }
}

wire_enum! {
    /// Submission lifecycle: `submitted → inBlock → finalised | failed`.
    TransactionState ("transaction state") {
        Submitted => "submitted",
        InBlock => "inBlock",
        Finalised => "finalised",
        Failed => "failed",
    }
}

impl TransactionState {
    /// `finalised` and `failed` are never left.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalised | Self::Failed)
    }
}

/// A transaction submitted by this API instance.
///
/// `hash` is the call hash: the idempotency key that correlates this row
/// with the `ProcessRan` event the ledger eventually emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub api_type: TransactionApiType,
    pub transaction_type: TransactionType,
    /// Demand or Match2 this transaction acts on.
    pub local_id: Uuid,
    pub state: TransactionState,
    pub hash: Hash,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// CLUSTER D: SYNC PROGRESS
// =============================================================================

/// A block known to the indexer, processed or not.
///
/// Rows form a hash-linked chain back to a single height-0 marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessedBlock {
    pub hash: Hash,
    pub parent: Hash,
    pub height: u64,
}

impl ProcessedBlock {
    /// The synthetic height-0 row anchoring a chain whose first processed
    /// block has parent `parent`.
    pub fn anchor(parent: Hash) -> Self {
        Self {
            hash: parent,
            parent,
            height: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_enum_round_trips_through_str() {
        assert_eq!("demand_b".parse::<DemandSubtype>(), Ok(DemandSubtype::DemandB));
        assert_eq!(Match2State::AcceptedFinal.as_str(), "acceptedFinal");
        assert_eq!(TransactionState::InBlock.to_string(), "inBlock");
    }

    #[test]
    fn test_wire_enum_rejects_unknown_value() {
        let err = "demand_c".parse::<DemandSubtype>().unwrap_err();
        assert_eq!(err.kind, "demand subtype");
        assert!(err.to_string().contains("demand_c"));
    }

    #[test]
    fn test_wire_enum_serde_uses_wire_spelling() {
        let json = serde_json::to_string(&Match2State::AcceptedA).unwrap();
        assert_eq!(json, "\"acceptedA\"");
        let state: CommentState = serde_json::from_str("\"created\"").unwrap();
        assert_eq!(state, CommentState::Created);
    }

    #[test]
    fn test_terminal_transaction_states() {
        assert!(TransactionState::Finalised.is_terminal());
        assert!(TransactionState::Failed.is_terminal());
        assert!(!TransactionState::InBlock.is_terminal());
    }

    #[test]
    fn test_anchor_is_self_parented_at_height_zero() {
        let anchor = ProcessedBlock::anchor([7u8; 32]);
        assert_eq!(anchor.height, 0);
        assert_eq!(anchor.hash, anchor.parent);
    }
}
