//! # In-Memory Ledger
//!
//! A single-node development ledger implementing both [`ChainClient`] and
//! [`LedgerSubmitter`].
//!
//! - Submitted extrinsics are signature-checked; stale nonces are refused
//!   and future nonces wait in the pool.
//! - [`InMemoryLedger::produce_block`] includes every ready extrinsic in
//!   nonce order, burns inputs, mints outputs and emits `ProcessRan` events.
//! - Blocks are final as soon as they are produced.
//!
//! Dispatch fails (the nonce is still consumed) when an input token is not
//! live.

use async_trait::async_trait;
use mm_types::{
    hash_hex, sha256, Address, BlockHeader, Hash, ProcessRanEvent, SignedExtrinsic,
    TokenContent, TokenId,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::application::verify_extrinsic;
use crate::domain::ChainError;
use crate::ports::{ChainClient, ExtrinsicStatus, LedgerSubmitter};

/// Capacity of the finalised-head broadcast.
const HEAD_CHANNEL_CAPACITY: usize = 256;

struct PendingExtrinsic {
    extrinsic: SignedExtrinsic,
    status: mpsc::UnboundedSender<ExtrinsicStatus>,
}

struct MintedToken {
    content: TokenContent,
    height: u64,
}

struct LedgerState {
    headers: HashMap<Hash, BlockHeader>,
    events: HashMap<Hash, Vec<ProcessRanEvent>>,
    tokens: HashMap<TokenId, MintedToken>,
    live_tokens: HashSet<TokenId>,
    next_token_id: TokenId,
    head: BlockHeader,
    /// Next nonce each account must use.
    nonces: HashMap<Address, u64>,
    pool: Vec<PendingExtrinsic>,
}

/// Development ledger. See the module docs.
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    heads: broadcast::Sender<Hash>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        let genesis = BlockHeader {
            hash: sha256(b"genesis"),
            parent: [0u8; 32],
            height: 0,
        };
        let mut headers = HashMap::new();
        headers.insert(genesis.hash, genesis);
        let (heads, _) = broadcast::channel(HEAD_CHANNEL_CAPACITY);

        Self {
            state: Mutex::new(LedgerState {
                headers,
                events: HashMap::new(),
                tokens: HashMap::new(),
                live_tokens: HashSet::new(),
                next_token_id: 1,
                head: genesis,
                nonces: HashMap::new(),
                pool: Vec::new(),
            }),
            heads,
        }
    }

    /// Current (finalised) head.
    pub fn head(&self) -> BlockHeader {
        self.state.lock().head
    }

    /// Extrinsics waiting for inclusion.
    pub fn pool_len(&self) -> usize {
        self.state.lock().pool.len()
    }

    /// Whether `token_id` has been minted and not burnt.
    pub fn is_live(&self, token_id: TokenId) -> bool {
        self.state.lock().live_tokens.contains(&token_id)
    }

    /// Build, execute and finalise the next block.
    pub fn produce_block(&self) -> BlockHeader {
        let mut notifications = Vec::new();
        let header = {
            let mut state = self.state.lock();
            let included = take_ready(&mut state);

            let parent = state.head.hash;
            let height = state.head.height + 1;
            let mut preimage = Vec::with_capacity(40 + included.len() * 32);
            preimage.extend_from_slice(&parent);
            preimage.extend_from_slice(&height.to_le_bytes());
            for pending in &included {
                preimage.extend_from_slice(&pending.extrinsic.hash);
            }
            let header = BlockHeader {
                hash: sha256(&preimage),
                parent,
                height,
            };

            let mut events = Vec::new();
            let mut outcomes = Vec::with_capacity(included.len());
            for pending in included {
                let outcome = execute(&mut state, &pending.extrinsic, header);
                if let Ok(event) = &outcome {
                    events.push(event.clone());
                }
                outcomes.push((pending.status, outcome.err()));
            }

            state.headers.insert(header.hash, header);
            state.events.insert(header.hash, events.clone());
            state.head = header;

            for (status, dispatch_error) in outcomes {
                notifications.push((status, dispatch_error, events.clone()));
            }
            header
        };

        for (status, dispatch_error, events) in notifications {
            let _ = status.send(ExtrinsicStatus::InBlock {
                block_hash: header.hash,
                dispatch_error: dispatch_error.clone(),
            });
            let _ = status.send(ExtrinsicStatus::Finalized {
                block_hash: header.hash,
                dispatch_error,
                events,
            });
        }
        let _ = self.heads.send(header.hash);

        debug!(
            block_height = header.height,
            block_hash = %hash_hex(&header.hash),
            "Produced block"
        );
        header
    }
}

/// Remove every extrinsic whose nonce is next in line, repeatedly, so that
/// a run of consecutive nonces is included in order.
fn take_ready(state: &mut LedgerState) -> Vec<PendingExtrinsic> {
    let mut included = Vec::new();
    loop {
        let ready = state.pool.iter().position(|pending| {
            let expected = state
                .nonces
                .get(&pending.extrinsic.signer)
                .copied()
                .unwrap_or(0);
            pending.extrinsic.nonce == expected
        });
        let Some(index) = ready else { break };
        let pending = state.pool.remove(index);
        *state
            .nonces
            .entry(pending.extrinsic.signer.clone())
            .or_insert(0) += 1;
        included.push(pending);
    }
    included
}

/// Run one extrinsic against the token set. Returns the event or the
/// dispatch error.
fn execute(
    state: &mut LedgerState,
    extrinsic: &SignedExtrinsic,
    header: BlockHeader,
) -> Result<ProcessRanEvent, String> {
    let call = &extrinsic.call;

    let mut seen = HashSet::new();
    for input in &call.inputs {
        if !seen.insert(*input) || !state.live_tokens.contains(input) {
            return Err(format!("Input token {input} is not available"));
        }
    }
    for input in &call.inputs {
        state.live_tokens.remove(input);
    }

    let mut outputs = Vec::with_capacity(call.outputs.len());
    for output in &call.outputs {
        let id = state.next_token_id;
        state.next_token_id += 1;
        state.tokens.insert(
            id,
            MintedToken {
                content: TokenContent {
                    id,
                    roles: output.roles.clone(),
                    metadata: output.metadata.clone(),
                },
                height: header.height,
            },
        );
        state.live_tokens.insert(id);
        outputs.push(id);
    }

    Ok(ProcessRanEvent {
        call_hash: extrinsic.hash,
        block_hash: header.hash,
        sender: extrinsic.signer.clone(),
        process: call.process.clone(),
        inputs: call.inputs.clone(),
        outputs,
    })
}

#[async_trait]
impl ChainClient for InMemoryLedger {
    async fn last_finalised_block_hash(&self) -> Result<Hash, ChainError> {
        Ok(self.state.lock().head.hash)
    }

    async fn get_header(&self, hash: &Hash) -> Result<BlockHeader, ChainError> {
        self.state
            .lock()
            .headers
            .get(hash)
            .copied()
            .ok_or(ChainError::BlockNotFound(*hash))
    }

    async fn get_process_ran_events(
        &self,
        block_hash: &Hash,
    ) -> Result<Vec<ProcessRanEvent>, ChainError> {
        let state = self.state.lock();
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
        let state = self.state.lock();
        let at = state
            .headers
            .get(block_hash)
            .ok_or(ChainError::BlockNotFound(*block_hash))?;
        state
            .tokens
            .get(&token_id)
            .filter(|token| token.height <= at.height)
            .map(|token| token.content.clone())
            .ok_or(ChainError::TokenNotFound {
                token_id,
                block_hash: *block_hash,
            })
    }

    fn watch_finalised_blocks(&self) -> broadcast::Receiver<Hash> {
        self.heads.subscribe()
    }
}

#[async_trait]
impl LedgerSubmitter for InMemoryLedger {
    async fn account_next_index(&self, account: &Address) -> Result<u64, ChainError> {
        Ok(self.state.lock().nonces.get(account).copied().unwrap_or(0))
    }

    async fn submit_extrinsic(
        &self,
        extrinsic: SignedExtrinsic,
    ) -> Result<mpsc::UnboundedReceiver<ExtrinsicStatus>, ChainError> {
        verify_extrinsic(&extrinsic).map_err(ChainError::InvalidExtrinsic)?;

        let mut state = self.state.lock();
        let expected = state.nonces.get(&extrinsic.signer).copied().unwrap_or(0);
        if extrinsic.nonce < expected {
            return Err(ChainError::InvalidExtrinsic(format!(
                "stale nonce {} (expected at least {expected})",
                extrinsic.nonce
            )));
        }
        let duplicate = state.pool.iter().any(|pending| {
            pending.extrinsic.signer == extrinsic.signer
                && pending.extrinsic.nonce == extrinsic.nonce
        });
        if duplicate {
            return Err(ChainError::InvalidExtrinsic(format!(
                "nonce {} already in pool",
                extrinsic.nonce
            )));
        }

        let (status, statuses) = mpsc::unbounded_channel();
        let _ = status.send(ExtrinsicStatus::Ready);
        info!(
            call_hash = %hash_hex(&extrinsic.hash),
            nonce = extrinsic.nonce,
            process = %extrinsic.call.process,
            "Extrinsic accepted into pool"
        );
        state.pool.push(PendingExtrinsic { extrinsic, status });
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::sign_extrinsic;
    use ed25519_dalek::SigningKey;
    use mm_types::{OutputToken, ProcessId, RunProcessCall};

    fn key() -> SigningKey {
        SigningKey::from_bytes(&[3u8; 32])
    }

    fn call(process: &str, inputs: Vec<TokenId>, outputs: usize) -> RunProcessCall {
        RunProcessCall {
            process: ProcessId::new(process, 1),
            inputs,
            outputs: (0..outputs)
                .map(|_| OutputToken::new().with_role("owner", "alice"))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_block_mints_and_burns() {
        let ledger = InMemoryLedger::new();
        let create = sign_extrinsic(&key(), call("demand_create", vec![], 1), 0).unwrap();
        let comment = sign_extrinsic(&key(), call("demand_comment", vec![1], 1), 1).unwrap();
        ledger.submit_extrinsic(create).await.unwrap();
        ledger.submit_extrinsic(comment).await.unwrap();

        let block = ledger.produce_block();

        let events = ledger.get_process_ran_events(&block.hash).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].outputs, vec![1]);
        assert_eq!(events[1].inputs, vec![1]);
        assert_eq!(events[1].outputs, vec![2]);
        assert!(!ledger.is_live(1));
        assert!(ledger.is_live(2));
    }

    #[tokio::test]
    async fn test_future_nonce_waits_in_pool() {
        let ledger = InMemoryLedger::new();
        let later = sign_extrinsic(&key(), call("demand_create", vec![], 1), 1).unwrap();
        ledger.submit_extrinsic(later).await.unwrap();

        ledger.produce_block();
        assert_eq!(ledger.pool_len(), 1);

        let first = sign_extrinsic(&key(), call("demand_create", vec![], 1), 0).unwrap();
        ledger.submit_extrinsic(first).await.unwrap();
        let block = ledger.produce_block();

        assert_eq!(ledger.pool_len(), 0);
        assert_eq!(ledger.get_process_ran_events(&block.hash).await.unwrap().len(), 2);
        let address = crate::application::address_of(&key());
        assert_eq!(ledger.account_next_index(&address).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stale_nonce_is_refused() {
        let ledger = InMemoryLedger::new();
        let first = sign_extrinsic(&key(), call("demand_create", vec![], 1), 0).unwrap();
        ledger.submit_extrinsic(first.clone()).await.unwrap();
        ledger.produce_block();

        let err = ledger.submit_extrinsic(first).await.unwrap_err();
        assert!(matches!(err, ChainError::InvalidExtrinsic(_)));
    }

    #[tokio::test]
    async fn test_token_not_visible_before_mint() {
        let ledger = InMemoryLedger::new();
        let genesis = ledger.head();
        let create = sign_extrinsic(&key(), call("demand_create", vec![], 1), 0).unwrap();
        ledger.submit_extrinsic(create).await.unwrap();
        let block = ledger.produce_block();

        assert!(ledger.get_token(1, &block.hash).await.is_ok());
        assert!(matches!(
            ledger.get_token(1, &genesis.hash).await,
            Err(ChainError::TokenNotFound { token_id: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_blocks_link_to_parent() {
        let ledger = InMemoryLedger::new();
        let genesis = ledger.head();
        let mut heads = ledger.watch_finalised_blocks();

        let first = ledger.produce_block();
        let second = ledger.produce_block();

        assert_eq!(first.parent, genesis.hash);
        assert_eq!(second.parent, first.hash);
        assert_ne!(first.hash, second.hash);
        assert_eq!(heads.recv().await.unwrap(), first.hash);
        assert_eq!(ledger.last_finalised_block_hash().await.unwrap(), second.hash);
    }
}
