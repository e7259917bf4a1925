//! # Matchmaker Chain Sync
//!
//! Keeps the matchmaker's relational view of demands, matches and comments
//! in step with the finalised ledger, and submits `run_process` extrinsics
//! on behalf of the API.
//!
//! ## Purpose
//!
//! - **Submission** (`ChainNode`): signs and submits extrinsics with a
//!   locally serialised nonce and reports every status change to an
//!   observer.
//! - **Indexing** (`Indexer`): discovers unprocessed finalised blocks,
//!   turns their `ProcessRan` events into a `ChangeSet` and commits each
//!   block atomically, retrying forever on failure.
//!
//! ## Block Pipeline
//!
//! ```text
//! finalised head ──→ gap discovery ──→ BlockHandler ──→ EventHandler ──→ processor
//!                     (unprocessed rows)   (fold events)   (resolve inputs)  (per process)
//!                                                │
//!                                                ↓
//!                                       BlockCommitter ──→ Store::commit_block
//!                                     (attachments first, deleted again on failure)
//! ```
//!
//! ## Domain Invariants
//!
//! | Invariant | Enforcement Location |
//! |-----------|---------------------|
//! | Blocks commit in height order, each exactly once | `application/indexer.rs` single worker |
//! | Block commit is all-or-nothing | `Store::commit_block` |
//! | One nonce per extrinsic, never reused | `application/chain_node.rs` nonce mutex |
//! | Later change-set fields win | `domain/change_set.rs` `merge` |
//!
//! ## Module Structure (Hexagonal Architecture)
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  adapters/     - InMemoryLedger, InMemoryStore                  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ports/inbound.rs  - IndexerApi, BlockProcessor, observers      │
//! │  ports/outbound.rs - ChainClient, LedgerSubmitter, Store        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  application/  - Indexer, BlockHandler, EventHandler, ChainNode │
//! │  domain/       - ChangeSet, event processors, errors            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;

pub use adapters::{InMemoryLedger, InMemoryStore};
pub use application::*;
pub use config::SyncConfig;
pub use domain::*;
pub use ports::*;
