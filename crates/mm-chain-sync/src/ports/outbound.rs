//! # Outbound Ports
//!
//! Traits for the collaborators the sync core drives: the ledger (read and
//! submit sides), the relational store and the attachment service.

use async_trait::async_trait;
use mm_types::{
    sha256, Address, Attachment, BlockHeader, Demand, DemandComment, Hash, Match2,
    Match2Comment, ProcessRanEvent, ProcessedBlock, SignedExtrinsic, TokenContent, TokenId,
    Transaction, TransactionState,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::domain::{
    ChainError, DemandCommentRecord, DemandRecord, Match2CommentRecord, Match2Record, StoreError,
};

// =============================================================================
// LEDGER
// =============================================================================

/// Read side of the ledger.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Hash of the most recent finalised block.
    async fn last_finalised_block_hash(&self) -> Result<Hash, ChainError>;

    /// Header of any known block.
    async fn get_header(&self, hash: &Hash) -> Result<BlockHeader, ChainError>;

    /// `ProcessRan` events of a block, in emission order.
    async fn get_process_ran_events(
        &self,
        block_hash: &Hash,
    ) -> Result<Vec<ProcessRanEvent>, ChainError>;

    /// Token content as of `block_hash`.
    async fn get_token(
        &self,
        token_id: TokenId,
        block_hash: &Hash,
    ) -> Result<TokenContent, ChainError>;

    /// Subscribe to newly finalised block hashes.
    fn watch_finalised_blocks(&self) -> broadcast::Receiver<Hash>;
}

/// Inclusion progress of a submitted extrinsic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtrinsicStatus {
    /// Accepted into the pool.
    Ready,
    /// Included in a block, possibly with a dispatch error.
    InBlock {
        block_hash: Hash,
        dispatch_error: Option<String>,
    },
    /// The including block was finalised. `events` are the block's
    /// `ProcessRan` events.
    Finalized {
        block_hash: Hash,
        dispatch_error: Option<String>,
        events: Vec<ProcessRanEvent>,
    },
    /// Refused by the pool.
    Invalid { reason: String },
    /// Evicted before inclusion.
    Dropped,
}

/// Submission side of the ledger.
#[async_trait]
pub trait LedgerSubmitter: Send + Sync {
    /// Next nonce the ledger expects from `account`. Does not count
    /// extrinsics still waiting in the pool.
    async fn account_next_index(&self, account: &Address) -> Result<u64, ChainError>;

    /// Submit and watch. The stream ends after a terminal status.
    async fn submit_extrinsic(
        &self,
        extrinsic: SignedExtrinsic,
    ) -> Result<mpsc::UnboundedReceiver<ExtrinsicStatus>, ChainError>;
}

// =============================================================================
// STORE
// =============================================================================

/// One row write inside a block commit.
///
/// Comment updates are keyed by the carrying transaction's id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityWrite {
    InsertDemand(Demand),
    UpdateDemand(DemandRecord),
    InsertMatch2(Match2),
    UpdateMatch2(Match2Record),
    InsertDemandComment(DemandComment),
    UpdateDemandComment(DemandCommentRecord),
    InsertMatch2Comment(Match2Comment),
    UpdateMatch2Comment(Match2CommentRecord),
}

/// Everything a block contributes to the store, applied atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockCommit {
    pub block: ProcessedBlock,
    /// Height-0 row, present only when committing height 1.
    pub anchor: Option<ProcessedBlock>,
    /// Applied in order.
    pub writes: Vec<EntityWrite>,
}

/// Relational store shared by the indexer and the REST layer.
#[async_trait]
pub trait Store: Send + Sync {
    // --- sync progress ---

    async fn get_last_processed_block(&self) -> Result<Option<ProcessedBlock>, StoreError>;

    /// Record a known-but-unprocessed block. Returns `false` if the hash is
    /// already known (processed or not); never fails on that conflict.
    async fn try_insert_unprocessed_block(&self, block: ProcessedBlock)
        -> Result<bool, StoreError>;

    async fn get_unprocessed_block(&self, hash: &Hash)
        -> Result<Option<ProcessedBlock>, StoreError>;

    async fn get_next_unprocessed_block_at_height(
        &self,
        height: u64,
    ) -> Result<Option<ProcessedBlock>, StoreError>;

    // --- lookups ---

    async fn get_transaction_by_hash(&self, hash: &Hash)
        -> Result<Option<Transaction>, StoreError>;

    /// Demand or match whose latest token is `token_id`.
    async fn find_local_id_for_token(&self, token_id: TokenId)
        -> Result<Option<Uuid>, StoreError>;

    // --- entity CRUD ---

    async fn insert_demand(&self, demand: Demand) -> Result<(), StoreError>;

    async fn get_demand(&self, id: &Uuid) -> Result<Option<Demand>, StoreError>;

    async fn insert_match2(&self, match2: Match2) -> Result<(), StoreError>;

    async fn get_match2(&self, id: &Uuid) -> Result<Option<Match2>, StoreError>;

    async fn insert_demand_comment(&self, comment: DemandComment) -> Result<(), StoreError>;

    async fn get_demand_comments(&self, demand: &Uuid)
        -> Result<Vec<DemandComment>, StoreError>;

    async fn insert_match2_comment(&self, comment: Match2Comment) -> Result<(), StoreError>;

    async fn get_match2_comments(&self, match2: &Uuid)
        -> Result<Vec<Match2Comment>, StoreError>;

    async fn insert_transaction(&self, transaction: Transaction) -> Result<(), StoreError>;

    async fn get_transaction(&self, id: &Uuid) -> Result<Option<Transaction>, StoreError>;

    async fn update_transaction_state(
        &self,
        id: &Uuid,
        state: TransactionState,
    ) -> Result<(), StoreError>;

    // --- atomic unit ---

    /// Mark `commit.block` processed and apply its writes, all or nothing.
    ///
    /// A block hash that is already processed is a `Conflict`.
    async fn commit_block(&self, commit: BlockCommit) -> Result<(), StoreError>;
}

/// Attachment service. Inserts happen outside the store transaction.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn insert_attachment(
        &self,
        integrity_hash: &str,
        owner_address: &Address,
    ) -> Result<Attachment, StoreError>;

    async fn delete_attachment(&self, id: &Uuid) -> Result<(), StoreError>;

    async fn get_attachment(&self, id: &Uuid) -> Result<Option<Attachment>, StoreError>;
}

// =============================================================================
// Mock Implementations for Testing
// =============================================================================

/// Deterministic hash of the mock block at `height`.
pub fn mock_block_hash(height: u64) -> Hash {
    sha256(format!("mock-block-{height}").as_bytes())
}

#[derive(Default)]
struct MockChainState {
    headers: HashMap<Hash, BlockHeader>,
    events: HashMap<Hash, Vec<ProcessRanEvent>>,
    tokens: HashMap<TokenId, TokenContent>,
    finalised: Hash,
    height: u64,
}

/// Scripted ledger for indexer tests.
///
/// Starts at a genesis block (height 0). Every [`push_block`] appends and
/// finalises one block.
///
/// [`push_block`]: MockChainClient::push_block
pub struct MockChainClient {
    state: RwLock<MockChainState>,
    heads: broadcast::Sender<Hash>,
    /// Upcoming `get_process_ran_events` calls that fail.
    event_failures: AtomicUsize,
    event_calls: AtomicUsize,
    /// Upcoming `last_finalised_block_hash` calls that fail.
    head_failures: AtomicUsize,
}

impl Default for MockChainClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChainClient {
    pub fn new() -> Self {
        let genesis = BlockHeader {
            hash: mock_block_hash(0),
            parent: [0u8; 32],
            height: 0,
        };
        let mut state = MockChainState {
            finalised: genesis.hash,
            ..Default::default()
        };
        state.headers.insert(genesis.hash, genesis);
        let (heads, _) = broadcast::channel(64);

        Self {
            state: RwLock::new(state),
            heads,
            event_failures: AtomicUsize::new(0),
            event_calls: AtomicUsize::new(0),
            head_failures: AtomicUsize::new(0),
        }
    }

    /// Append and finalise a block carrying `events`. Event block hashes are
    /// rewritten to the new block.
    pub fn push_block(&self, events: Vec<ProcessRanEvent>) -> BlockHeader {
        let header = {
            let mut state = self.state.write();
            let height = state.height + 1;
            let header = BlockHeader {
                hash: mock_block_hash(height),
                parent: state.finalised,
                height,
            };
            let events = events
                .into_iter()
                .map(|event| ProcessRanEvent {
                    block_hash: header.hash,
                    ..event
                })
                .collect();
            state.headers.insert(header.hash, header);
            state.events.insert(header.hash, events);
            state.finalised = header.hash;
            state.height = height;
            header
        };
        let _ = self.heads.send(header.hash);
        header
    }

    /// Append `count` empty blocks, returning the last header.
    pub fn push_empty_blocks(&self, count: u64) -> Option<BlockHeader> {
        (0..count).map(|_| self.push_block(Vec::new())).last()
    }

    pub fn add_token(&self, token: TokenContent) {
        self.state.write().tokens.insert(token.id, token);
    }

    /// Make the next `count` event fetches fail with an RPC error.
    pub fn fail_next_event_fetches(&self, count: usize) {
        self.event_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` finalised head fetches fail with an RPC error.
    pub fn fail_next_head_fetches(&self, count: usize) {
        self.head_failures.store(count, Ordering::SeqCst);
    }

    /// Number of `get_process_ran_events` calls so far, failed ones included.
    pub fn event_fetch_count(&self) -> usize {
        self.event_calls.load(Ordering::SeqCst)
    }

    pub fn header_at(&self, height: u64) -> Option<BlockHeader> {
        self.state.read().headers.get(&mock_block_hash(height)).copied()
    }

    pub fn finalised_hash(&self) -> Hash {
        self.state.read().finalised
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn last_finalised_block_hash(&self) -> Result<Hash, ChainError> {
        let failing = self
            .head_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ChainError::Rpc("timeout".to_string()));
        }
        Ok(self.state.read().finalised)
    }

    async fn get_header(&self, hash: &Hash) -> Result<BlockHeader, ChainError> {
        self.state
            .read()
            .headers
            .get(hash)
            .copied()
            .ok_or(ChainError::BlockNotFound(*hash))
    }

    async fn get_process_ran_events(
        &self,
        block_hash: &Hash,
    ) -> Result<Vec<ProcessRanEvent>, ChainError> {
        self.event_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .event_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ChainError::Rpc("Mock failure".to_string()));
        }

        let state = self.state.read();
        if !state.headers.contains_key(block_hash) {
            return Err(ChainError::BlockNotFound(*block_hash));
        }
        Ok(state.events.get(block_hash).cloned().unwrap_or_default())
    }

    async fn get_token(
        &self,
        token_id: TokenId,
        block_hash: &Hash,
    ) -> Result<TokenContent, ChainError> {
        self.state
            .read()
            .tokens
            .get(&token_id)
            .cloned()
            .ok_or(ChainError::TokenNotFound {
                token_id,
                block_hash: *block_hash,
            })
    }

    fn watch_finalised_blocks(&self) -> broadcast::Receiver<Hash> {
        self.heads.subscribe()
    }
}
