//! # Chain Node
//!
//! Submission side of the sync core: signs `run_process` calls with
//! monotonically assigned nonces and reports their progress to an observer.
//!
//! ## Nonce Assignment
//!
//! The ledger's next-index RPC ignores extrinsics still in the pool, so two
//! requests prepared back to back would both see the same value. Each nonce
//! is therefore `max(chain_next, last_assigned + 1)`, computed and recorded
//! under one lock. The RPC and the signing happen outside the lock.

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use mm_telemetry::CHAIN_TRANSACTIONS;
use mm_types::{
    hash_hex, sha256, Address, Hash, RunProcessCall, SignedExtrinsic, TransactionState,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::SubmissionError;
use crate::ports::{
    ExtrinsicStatus, LedgerSubmitter, Store, SubmissionObserver, SubmissionUpdate,
};

// =============================================================================
// SIGNING
// =============================================================================

/// Bytes covered by the signature: `(call, signer, nonce)`.
pub fn signing_payload(
    call: &RunProcessCall,
    signer: &Address,
    nonce: u64,
) -> Result<Vec<u8>, SubmissionError> {
    bincode::serialize(&(call, signer, nonce)).map_err(|e| SubmissionError::Encoding(e.to_string()))
}

/// SHA-256 over the encoded signed extrinsic, excluding the hash itself.
pub fn call_hash(extrinsic: &SignedExtrinsic) -> Result<Hash, SubmissionError> {
    let encoded = bincode::serialize(&(
        &extrinsic.call,
        &extrinsic.signer,
        extrinsic.nonce,
        &extrinsic.signature[..],
    ))
    .map_err(|e| SubmissionError::Encoding(e.to_string()))?;
    Ok(sha256(&encoded))
}

/// Hex-encoded public key, the account address of `key`.
pub fn address_of(key: &SigningKey) -> Address {
    hex::encode(key.verifying_key().as_bytes())
}

/// Sign `call` with `key` at `nonce`.
pub fn sign_extrinsic(
    key: &SigningKey,
    call: RunProcessCall,
    nonce: u64,
) -> Result<SignedExtrinsic, SubmissionError> {
    let signer = address_of(key);
    let payload = signing_payload(&call, &signer, nonce)?;
    let signature = key.sign(&payload).to_bytes();

    let mut extrinsic = SignedExtrinsic {
        call,
        signer,
        nonce,
        signature,
        hash: [0u8; 32],
    };
    extrinsic.hash = call_hash(&extrinsic)?;
    Ok(extrinsic)
}

/// Check the signature against the signer address and the call hash.
pub fn verify_extrinsic(extrinsic: &SignedExtrinsic) -> Result<(), String> {
    let key_bytes: [u8; 32] = hex::decode(&extrinsic.signer)
        .map_err(|e| format!("invalid signer address: {e}"))?
        .try_into()
        .map_err(|_| "signer address is not 32 bytes".to_string())?;
    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|e| format!("invalid signer key: {e}"))?;

    let payload = signing_payload(&extrinsic.call, &extrinsic.signer, extrinsic.nonce)
        .map_err(|e| e.to_string())?;
    key.verify(&payload, &Signature::from_bytes(&extrinsic.signature))
        .map_err(|_| "bad signature".to_string())?;

    let expected = call_hash(extrinsic).map_err(|e| e.to_string())?;
    if expected != extrinsic.hash {
        return Err("call hash mismatch".to_string());
    }
    Ok(())
}

// =============================================================================
// CHAIN NODE
// =============================================================================

/// Prepares, signs and submits `run_process` extrinsics for one account.
pub struct ChainNode<L: LedgerSubmitter> {
    ledger: Arc<L>,
    signing_key: SigningKey,
    address: Address,
    last_nonce: Mutex<Option<u64>>,
}

impl<L: LedgerSubmitter> ChainNode<L> {
    pub fn new(ledger: Arc<L>, signing_key: SigningKey) -> Self {
        let address = address_of(&signing_key);
        Self {
            ledger,
            signing_key,
            address,
            last_nonce: Mutex::new(None),
        }
    }

    /// Build the signing key from a 32-byte ed25519 seed.
    pub fn from_seed(ledger: Arc<L>, seed: &[u8; 32]) -> Self {
        Self::new(ledger, SigningKey::from_bytes(seed))
    }

    /// Account address transactions are signed with.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Sign `call` with the next free nonce.
    pub async fn prepare_run_process(
        &self,
        call: RunProcessCall,
    ) -> Result<SignedExtrinsic, SubmissionError> {
        let chain_next = self.ledger.account_next_index(&self.address).await?;
        let nonce = self.assign_nonce(chain_next);
        let extrinsic = sign_extrinsic(&self.signing_key, call, nonce)?;

        debug!(
            process = %extrinsic.call.process,
            nonce,
            call_hash = %hash_hex(&extrinsic.hash),
            "Prepared run_process"
        );
        Ok(extrinsic)
    }

    fn assign_nonce(&self, chain_next: u64) -> u64 {
        let mut last = self.last_nonce.lock();
        let nonce = match *last {
            Some(assigned) => chain_next.max(assigned + 1),
            None => chain_next,
        };
        *last = Some(nonce);
        nonce
    }

    /// Submit `extrinsic` and report every transition to `observer`.
    ///
    /// Never fails: every outcome ends in exactly one terminal update,
    /// `Finalised` or `Failed`.
    pub async fn submit_run_process<O>(&self, extrinsic: SignedExtrinsic, observer: &O)
    where
        O: SubmissionObserver + ?Sized,
    {
        let call_hash = extrinsic.hash;
        let nonce = extrinsic.nonce;

        let mut statuses = match self.ledger.submit_extrinsic(extrinsic).await {
            Ok(statuses) => statuses,
            Err(err) => {
                fail(observer, &call_hash, format!("Submission rejected: {err}")).await;
                return;
            }
        };
        CHAIN_TRANSACTIONS.with_label_values(&["submitted"]).inc();
        observer
            .on_update(SubmissionUpdate::Submitted { call_hash })
            .await;

        while let Some(status) = statuses.recv().await {
            match status {
                ExtrinsicStatus::Ready => {}
                ExtrinsicStatus::InBlock {
                    block_hash,
                    dispatch_error: None,
                } => {
                    CHAIN_TRANSACTIONS.with_label_values(&["in_block"]).inc();
                    observer
                        .on_update(SubmissionUpdate::InBlock { block_hash })
                        .await;
                }
                ExtrinsicStatus::InBlock {
                    dispatch_error: Some(reason),
                    ..
                }
                | ExtrinsicStatus::Finalized {
                    dispatch_error: Some(reason),
                    ..
                } => {
                    fail(observer, &call_hash, format!("Dispatch error: {reason}")).await;
                    return;
                }
                ExtrinsicStatus::Finalized {
                    block_hash,
                    dispatch_error: None,
                    events,
                } => {
                    let Some(event) = events.iter().find(|event| event.call_hash == call_hash)
                    else {
                        fail(
                            observer,
                            &call_hash,
                            format!("No ProcessRan event in block {}", hash_hex(&block_hash)),
                        )
                        .await;
                        return;
                    };

                    CHAIN_TRANSACTIONS.with_label_values(&["finalised"]).inc();
                    info!(
                        call_hash = %hash_hex(&call_hash),
                        block_hash = %hash_hex(&block_hash),
                        nonce,
                        tokens = ?event.outputs,
                        "Transaction finalised"
                    );
                    observer
                        .on_update(SubmissionUpdate::Finalised {
                            block_hash,
                            token_ids: event.outputs.clone(),
                        })
                        .await;
                    return;
                }
                ExtrinsicStatus::Invalid { reason } => {
                    fail(observer, &call_hash, format!("Invalid: {reason}")).await;
                    return;
                }
                ExtrinsicStatus::Dropped => {
                    fail(observer, &call_hash, "Dropped from pool".to_string()).await;
                    return;
                }
            }
        }

        fail(
            observer,
            &call_hash,
            "Status stream ended before finalisation".to_string(),
        )
        .await;
    }
}

async fn fail<O>(observer: &O, call_hash: &Hash, reason: String)
where
    O: SubmissionObserver + ?Sized,
{
    CHAIN_TRANSACTIONS.with_label_values(&["failed"]).inc();
    warn!(call_hash = %hash_hex(call_hash), reason = %reason, "Transaction failed");
    observer.on_update(SubmissionUpdate::Failed { reason }).await;
}

// =============================================================================
// TRANSACTION TRACKER
// =============================================================================

/// Mirrors submission progress onto a local Transaction row.
pub struct TransactionTracker<S: Store> {
    store: Arc<S>,
    transaction_id: Uuid,
}

impl<S: Store> TransactionTracker<S> {
    pub fn new(store: Arc<S>, transaction_id: Uuid) -> Self {
        Self {
            store,
            transaction_id,
        }
    }
}

#[async_trait]
impl<S: Store> SubmissionObserver for TransactionTracker<S> {
    async fn on_update(&self, update: SubmissionUpdate) {
        let state = match update {
            SubmissionUpdate::Submitted { .. } => TransactionState::Submitted,
            SubmissionUpdate::InBlock { .. } => TransactionState::InBlock,
            SubmissionUpdate::Finalised { .. } => TransactionState::Finalised,
            SubmissionUpdate::Failed { .. } => TransactionState::Failed,
        };

        if let Err(err) = self
            .store
            .update_transaction_state(&self.transaction_id, state)
            .await
        {
            warn!(
                transaction_id = %self.transaction_id,
                state = %state,
                error = %err,
                "Failed to record transaction state"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryLedger;
    use mm_types::{OutputToken, ProcessId};

    /// Collects every update it receives.
    #[derive(Default)]
    struct RecordingObserver {
        updates: Mutex<Vec<SubmissionUpdate>>,
    }

    #[async_trait]
    impl SubmissionObserver for RecordingObserver {
        async fn on_update(&self, update: SubmissionUpdate) {
            self.updates.lock().push(update);
        }
    }

    fn create_call() -> RunProcessCall {
        RunProcessCall {
            process: ProcessId::new("demand_create", 1),
            inputs: Vec::new(),
            outputs: vec![OutputToken::new()
                .with_role("owner", "alice")
                .with_metadata("subtype", "demand_a")
                .with_metadata("parameters", "hash")],
        }
    }

    fn node(ledger: Arc<InMemoryLedger>) -> ChainNode<InMemoryLedger> {
        ChainNode::from_seed(ledger, &[7u8; 32])
    }

    #[test]
    fn test_signed_extrinsic_verifies() {
        let key = SigningKey::from_bytes(&[1u8; 32]);
        let extrinsic = sign_extrinsic(&key, create_call(), 3).unwrap();
        assert_eq!(verify_extrinsic(&extrinsic), Ok(()));
        assert_eq!(extrinsic.signer, address_of(&key));
    }

    #[test]
    fn test_tampered_extrinsic_is_rejected() {
        let key = SigningKey::from_bytes(&[1u8; 32]);
        let mut extrinsic = sign_extrinsic(&key, create_call(), 3).unwrap();
        extrinsic.nonce = 4;
        assert!(verify_extrinsic(&extrinsic).is_err());
    }

    #[test]
    fn test_call_hash_depends_on_nonce() {
        let key = SigningKey::from_bytes(&[1u8; 32]);
        let a = sign_extrinsic(&key, create_call(), 0).unwrap();
        let b = sign_extrinsic(&key, create_call(), 1).unwrap();
        assert_ne!(a.hash, b.hash);
    }

    #[tokio::test]
    async fn test_nonces_advance_past_pool() {
        let ledger = Arc::new(InMemoryLedger::new());
        let node = node(ledger.clone());

        let first = node.prepare_run_process(create_call()).await.unwrap();
        let second = node.prepare_run_process(create_call()).await.unwrap();

        assert_eq!(first.nonce, 0);
        assert_eq!(second.nonce, 1);
    }

    #[tokio::test]
    async fn test_fifty_concurrent_prepares_get_distinct_nonces() {
        let ledger = Arc::new(InMemoryLedger::new());
        let node = Arc::new(node(ledger));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let node = node.clone();
                tokio::spawn(async move { node.prepare_run_process(create_call()).await })
            })
            .collect();

        let mut nonces = Vec::new();
        for handle in handles {
            nonces.push(handle.await.unwrap().unwrap().nonce);
        }
        nonces.sort_unstable();
        assert_eq!(nonces, (0..50).collect::<Vec<u64>>());
    }

    #[test]
    fn test_chain_nonce_wins_when_ahead() {
        let ledger = Arc::new(InMemoryLedger::new());
        let node = node(ledger.clone());
        assert_eq!(node.assign_nonce(0), 0);
        assert_eq!(node.assign_nonce(5), 5);
        assert_eq!(node.assign_nonce(2), 6);
    }

    #[tokio::test]
    async fn test_submission_finalises_with_tokens() {
        let ledger = Arc::new(InMemoryLedger::new());
        let node = Arc::new(node(ledger.clone()));
        let extrinsic = node.prepare_run_process(create_call()).await.unwrap();
        let call_hash = extrinsic.hash;
        let observer = Arc::new(RecordingObserver::default());

        let submission = {
            let node = node.clone();
            let observer = observer.clone();
            tokio::spawn(async move { node.submit_run_process(extrinsic, observer.as_ref()).await })
        };
        while ledger.pool_len() == 0 {
            tokio::task::yield_now().await;
        }
        let block = ledger.produce_block();
        submission.await.unwrap();

        let updates = observer.updates.lock().clone();
        assert_eq!(
            updates,
            vec![
                SubmissionUpdate::Submitted { call_hash },
                SubmissionUpdate::InBlock { block_hash: block.hash },
                SubmissionUpdate::Finalised {
                    block_hash: block.hash,
                    token_ids: vec![1],
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_dispatch_error_reports_failed() {
        let ledger = Arc::new(InMemoryLedger::new());
        let node = Arc::new(node(ledger.clone()));
        let call = RunProcessCall {
            process: ProcessId::new("match2_reject", 1),
            inputs: vec![999],
            outputs: Vec::new(),
        };
        let extrinsic = node.prepare_run_process(call).await.unwrap();
        let observer = Arc::new(RecordingObserver::default());

        let submission = {
            let node = node.clone();
            let observer = observer.clone();
            tokio::spawn(async move { node.submit_run_process(extrinsic, observer.as_ref()).await })
        };
        while ledger.pool_len() == 0 {
            tokio::task::yield_now().await;
        }
        ledger.produce_block();
        submission.await.unwrap();

        let updates = observer.updates.lock().clone();
        assert_eq!(updates.len(), 2);
        assert!(matches!(updates[1], SubmissionUpdate::Failed { .. }));
    }

    #[tokio::test]
    async fn test_rejected_submission_reports_failed_only() {
        let ledger = Arc::new(InMemoryLedger::new());
        let node = node(ledger.clone());
        let mut extrinsic = node.prepare_run_process(create_call()).await.unwrap();
        extrinsic.signature = [0u8; 64];
        let observer = RecordingObserver::default();

        node.submit_run_process(extrinsic, &observer).await;

        let updates = observer.updates.lock().clone();
        assert_eq!(updates.len(), 1);
        assert!(matches!(updates[0], SubmissionUpdate::Failed { .. }));
    }
}
