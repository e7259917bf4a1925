//! # Application Layer
//!
//! Services wiring the domain to the ports: event and block handling, the
//! atomic block commit, the indexer driver and the submission node.

pub mod block_handler;
pub mod chain_node;
pub mod commit;
pub mod event_handler;
pub mod indexer;

pub use block_handler::BlockHandler;
pub use chain_node::{
    address_of, call_hash, sign_extrinsic, signing_payload, verify_extrinsic, ChainNode,
    TransactionTracker,
};
pub use commit::BlockCommitter;
pub use event_handler::EventHandler;
pub use indexer::{Indexer, IndexerCore, IndexerState};
