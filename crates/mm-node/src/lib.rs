//! # Matchmaker Node Runtime
//!
//! Wires the chain sync core into a running node.
//!
//! ## Startup Sequence
//!
//! 1. Load configuration (from env)
//! 2. Initialise telemetry
//! 3. Build ledger, store, chain node and indexer by constructor injection
//! 4. Start the indexer (catch up, then follow finalised heads)
//! 5. Start the dev block producer
//!
//! ## Component Graph
//!
//! ```text
//!              ┌──────────────── InMemoryLedger ────────────────┐
//!              │ ChainClient                    LedgerSubmitter │
//!              ↓                                         ↑      │
//!   Indexer ──→ BlockHandler ──→ EventHandler      ChainNode    │
//!      │                                                        │
//!      ↓                                    block producer ─────┘
//!   InMemoryStore (Store + AttachmentStore)
//! ```

pub mod config;

pub use config::{ConfigError, DevChainConfig, NodeConfig, SignerConfig};

use std::sync::Arc;
use std::time::Duration;

use mm_chain_sync::{
    BlockHandler, ChainNode, InMemoryLedger, InMemoryStore, Indexer, IndexerApi, IndexerStatus,
    SyncError,
};
use mm_types::hash_hex;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Indexer over the development ledger and the in-memory store.
pub type DevIndexer = Indexer<
    InMemoryLedger,
    InMemoryStore,
    InMemoryStore,
    BlockHandler<InMemoryLedger, InMemoryStore>,
>;

/// The node runtime owning every long-lived component.
pub struct NodeRuntime {
    config: NodeConfig,
    ledger: Arc<InMemoryLedger>,
    store: Arc<InMemoryStore>,
    chain_node: Arc<ChainNode<InMemoryLedger>>,
    indexer: Arc<DevIndexer>,
    /// Shutdown signal sender.
    shutdown_tx: watch::Sender<bool>,
    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeRuntime {
    /// Create a new node runtime with configuration.
    pub fn new(config: NodeConfig) -> Self {
        info!("Creating matchmaker node runtime");

        let ledger = Arc::new(InMemoryLedger::new());
        let store = Arc::new(InMemoryStore::new());
        let chain_node = Arc::new(ChainNode::from_seed(ledger.clone(), &config.signer.seed));
        let indexer = Arc::new(Indexer::with_block_handler(
            config.sync.clone(),
            ledger.clone(),
            store.clone(),
            store.clone(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            ledger,
            store,
            chain_node,
            indexer,
            shutdown_tx,
            shutdown_rx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start the indexer, then the dev block producer.
    pub async fn start(&self) -> Result<(), SyncError> {
        info!(
            signer = %self.chain_node.address(),
            block_time_ms = self.config.dev_chain.block_time_ms,
            "Starting matchmaker node"
        );

        self.indexer.start().await?;

        let block_time = self.config.dev_chain.block_time_ms;
        if block_time > 0 {
            let producer = tokio::spawn(produce_blocks(
                self.ledger.clone(),
                Duration::from_millis(block_time),
                self.shutdown_rx.clone(),
            ));
            self.tasks.lock().push(producer);
        } else {
            info!("Dev block producer disabled");
        }

        info!("Matchmaker node running");
        Ok(())
    }

    /// Stop the block producer and the indexer.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown...");
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Node task ended abnormally");
            }
        }
        self.indexer.close().await;

        match mm_telemetry::encode_metrics() {
            Ok(metrics) => debug!(metrics = %metrics, "Final metrics"),
            Err(err) => warn!(error = %err, "Failed to encode metrics"),
        }
        info!("Shutdown complete");
    }

    /// Indexer health.
    pub fn status(&self) -> IndexerStatus {
        self.indexer.status()
    }

    pub fn ledger(&self) -> Arc<InMemoryLedger> {
        Arc::clone(&self.ledger)
    }

    pub fn store(&self) -> Arc<InMemoryStore> {
        Arc::clone(&self.store)
    }

    /// Submission node signing with the configured seed.
    pub fn chain_node(&self) -> Arc<ChainNode<InMemoryLedger>> {
        Arc::clone(&self.chain_node)
    }

    pub fn indexer(&self) -> Arc<DevIndexer> {
        Arc::clone(&self.indexer)
    }
}

/// Seal a block every `block_time` until shutdown.
async fn produce_blocks(
    ledger: Arc<InMemoryLedger>,
    block_time: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(block_time);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                info!("Block producer shutting down");
                break;
            }
            _ = ticker.tick() => {
                let header = ledger.produce_block();
                debug!(
                    block_height = header.height,
                    block_hash = %hash_hex(&header.hash),
                    "Dev block sealed"
                );
            }
        }
    }
}
