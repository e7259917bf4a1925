//! # Node Runtime Tests
//!
//! Drive a full node (dev block producer, chain node, indexer) and check that
//! submitted transactions end up in the store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mm_chain_sync::{ServiceStatus, Store, SubmissionObserver, SubmissionUpdate, SyncConfig};
use mm_node::{DevChainConfig, NodeConfig, NodeRuntime, SignerConfig};
use mm_types::{OutputToken, ProcessId, RunProcessCall};
use parking_lot::Mutex;
use tokio::time::timeout;

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

fn test_config(block_time_ms: u64) -> NodeConfig {
    NodeConfig {
        sync: SyncConfig::for_testing(),
        signer: SignerConfig { seed: [5u8; 32] },
        dev_chain: DevChainConfig { block_time_ms },
        ..NodeConfig::default()
    }
}

#[tokio::test]
async fn test_submitted_demand_is_indexed() {
    let runtime = NodeRuntime::new(test_config(20));
    runtime.start().await.unwrap();

    let node = runtime.chain_node();
    let owner = node.address().clone();
    let call = RunProcessCall {
        process: ProcessId::new("demand_create", 1),
        inputs: Vec::new(),
        outputs: vec![OutputToken::new()
            .with_role("owner", owner.clone())
            .with_metadata("subtype", "demand_a")
            .with_metadata("parameters", "params-hash")],
    };
    let extrinsic = node.prepare_run_process(call).await.unwrap();
    let observer = Arc::new(RecordingObserver::default());

    timeout(Duration::from_secs(5), node.submit_run_process(extrinsic, observer.as_ref()))
        .await
        .expect("submission should finish");
    assert!(matches!(
        observer.updates.lock().last(),
        Some(SubmissionUpdate::Finalised { token_ids, .. }) if token_ids == &vec![1]
    ));

    let store = runtime.store();
    let demand_id = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(id) = store.find_local_id_for_token(1).await.unwrap() {
                break id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("indexer should store the demand");

    let demand = store.get_demand(&demand_id).await.unwrap().unwrap();
    assert_eq!(demand.owner, owner);
    assert_eq!(runtime.status().status, ServiceStatus::Up);

    runtime.shutdown().await;
    assert_eq!(runtime.status().status, ServiceStatus::Down);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_producer_leaves_chain_at_genesis() {
    let runtime = NodeRuntime::new(test_config(0));
    runtime.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(runtime.ledger().head().height, 0);
    assert_eq!(runtime.store().processed_block_count(), 0);

    runtime.shutdown().await;
}
