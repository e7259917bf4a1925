//! # Indexer
//!
//! Drives finalised blocks from the ledger into the store, one block at a
//! time, in strictly increasing height order.
//!
//! ## Architecture
//!
//! ```text
//! start() ──┐                     ┌── head watcher (finalised heads)
//!           ▼                     ▼
//!     process_all_blocks ──► command channel ──► worker ──► IndexerCore
//!     process_next_block                          (single task)
//! ```
//!
//! Every caller goes through the command channel, so at most one block is in
//! flight per process no matter how many callers there are. Sibling
//! instances sharing the store coordinate only through idempotent inserts and
//! by re-reading the last processed block on every iteration.
//!
//! ## Failure Policy
//!
//! Any error while processing a block is logged and the same block is
//! retried after `retry_delay`, indefinitely. Only `close()` ends the loop.

use chrono::{DateTime, Utc};
use mm_telemetry::{
    log_block_event, time_histogram, BLOCKS_PROCESSED, BLOCK_PROCESSING_DURATION,
    INDEXER_RETRIES, LAST_PROCESSED_HEIGHT,
};
use mm_types::{hash_hex, Hash, ProcessedBlock};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::block_handler::BlockHandler;
use super::commit::BlockCommitter;
use crate::config::SyncConfig;
use crate::domain::SyncError;
use crate::ports::{
    AttachmentStore, BlockProcessor, ChainClient, IndexerApi, IndexerStatus, ServiceStatus, Store,
};

// =============================================================================
// HEALTH
// =============================================================================

#[derive(Default)]
struct HealthState {
    last_processed: Option<ProcessedBlock>,
    last_activity: Option<(Instant, DateTime<Utc>)>,
}

/// Progress shared between the worker and status readers.
#[derive(Default)]
struct Health {
    state: RwLock<HealthState>,
}

impl Health {
    fn record_last_processed(&self, block: Option<ProcessedBlock>) {
        self.state.write().last_processed = block;
    }

    fn record_activity(&self) {
        self.state.write().last_activity = Some((Instant::now(), Utc::now()));
    }
}

// =============================================================================
// CORE
// =============================================================================

/// The block processing algorithm, without any concurrency control.
pub struct IndexerCore<C, S, A, P>
where
    C: ChainClient,
    S: Store,
    A: AttachmentStore,
    P: BlockProcessor,
{
    chain: Arc<C>,
    store: Arc<S>,
    processor: Arc<P>,
    committer: BlockCommitter<S, A>,
    config: SyncConfig,
    health: Arc<Health>,
    /// Highest unprocessed row whose chain down to the last processed block
    /// is already in the store.
    known_tip: Mutex<Option<ProcessedBlock>>,
}

impl<C, S, A, P> IndexerCore<C, S, A, P>
where
    C: ChainClient,
    S: Store,
    A: AttachmentStore,
    P: BlockProcessor,
{
    /// One attempt at the next block. `Ok(None)` means caught up.
    pub async fn try_process_next_block(
        &self,
        latest_finalised: Hash,
    ) -> Result<Option<Hash>, SyncError> {
        let last = self.store.get_last_processed_block().await?;
        self.health.record_last_processed(last);

        if last.map(|block| block.hash) == Some(latest_finalised) {
            return Ok(None);
        }

        self.update_unprocessed_blocks(latest_finalised, last.as_ref())
            .await?;

        let next_height = last.map_or(0, |block| block.height) + 1;
        let Some(next) = self
            .store
            .get_next_unprocessed_block_at_height(next_height)
            .await?
        else {
            return Ok(None);
        };

        let _timer = time_histogram!(BLOCK_PROCESSING_DURATION);
        let change_set = self.processor.handle_block(&next.hash).await?;
        let records = change_set.len();
        self.committer.commit(next, change_set).await?;

        self.health.record_last_processed(Some(next));
        BLOCKS_PROCESSED.inc();
        LAST_PROCESSED_HEIGHT.set(next.height as f64);
        log_block_event!(
            info,
            "Processed block",
            next.height,
            hash_hex(&next.hash),
            records = records
        );

        Ok(Some(next.hash))
    }

    /// Make sure the store holds a gapless, hash-linked run of unprocessed
    /// blocks from `last + 1` up to `latest_finalised`.
    ///
    /// Rows already known are reused; headers are fetched only for the rest.
    /// The walk stops early at the top of the run completed by an earlier
    /// call. A finalised block at or below the last processed height means
    /// the ledger's pointer moved backwards, which is a no-op.
    pub async fn update_unprocessed_blocks(
        &self,
        latest_finalised: Hash,
        last: Option<&ProcessedBlock>,
    ) -> Result<(), SyncError> {
        let last_height = last.map_or(0, |block| block.height);
        let known_tip = (*self.known_tip.lock()).filter(|tip| tip.height > last_height);
        let mut hash = latest_finalised;
        let mut top: Option<ProcessedBlock> = None;
        let mut child: Option<ProcessedBlock> = None;

        loop {
            let at_tip = known_tip.filter(|tip| tip.hash == hash);
            let (block, known) = match at_tip {
                Some(tip) => (tip, true),
                None => match self.store.get_unprocessed_block(&hash).await? {
                    Some(block) => (block, true),
                    None => (ProcessedBlock::from(self.chain.get_header(&hash).await?), false),
                },
            };

            if let Some(child) = child {
                if block.height + 1 != child.height {
                    return Err(SyncError::InconsistentChain {
                        hash: child.hash,
                        reason: format!(
                            "parent height {} does not precede child height {}",
                            block.height, child.height
                        ),
                    });
                }
            }

            if block.height <= last_height {
                debug!(
                    block_height = block.height,
                    last_height, "Finalised block already behind last processed block"
                );
                return Ok(());
            }
            let run_top = *top.get_or_insert(block);

            if !known && self.store.try_insert_unprocessed_block(block).await? {
                debug!(
                    block_height = block.height,
                    block_hash = %hash_hex(&block.hash),
                    "Discovered unprocessed block"
                );
            }

            if at_tip.is_some() {
                *self.known_tip.lock() = Some(run_top);
                return Ok(());
            }

            if block.height == last_height + 1 {
                if let Some(last) = last {
                    if block.parent != last.hash {
                        return Err(SyncError::InconsistentChain {
                            hash: block.hash,
                            reason: format!(
                                "parent {} is not the last processed block {}",
                                hash_hex(&block.parent),
                                hash_hex(&last.hash)
                            ),
                        });
                    }
                }
                *self.known_tip.lock() = Some(run_top);
                return Ok(());
            }

            child = Some(block);
            hash = block.parent;
        }
    }

    /// Process the next block, retrying with a fixed delay until it works.
    ///
    /// `shutdown` is only checked between attempts and during the retry
    /// sleep. A started attempt always runs to completion, so a block is
    /// never left half-committed.
    pub async fn process_next_block(
        &self,
        latest_finalised: Hash,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Hash>, SyncError> {
        loop {
            if *shutdown.borrow() {
                return Err(SyncError::IndexerClosed);
            }

            match self.try_process_next_block(latest_finalised).await {
                Ok(result) => {
                    self.health.record_activity();
                    return Ok(result);
                }
                Err(err) => {
                    INDEXER_RETRIES.inc();
                    if err.is_protocol_error() {
                        error!(
                            latest_finalised = %hash_hex(&latest_finalised),
                            error = %err,
                            retry_delay_ms = self.config.retry_delay_ms,
                            "Block processing failed, retrying"
                        );
                    } else {
                        warn!(
                            latest_finalised = %hash_hex(&latest_finalised),
                            error = %err,
                            retry_delay_ms = self.config.retry_delay_ms,
                            "Block processing failed, retrying"
                        );
                    }
                    retry_sleep(&self.config, shutdown).await?;
                }
            }
        }
    }

    /// Process blocks until caught up. Returns the last one processed.
    pub async fn process_all_blocks(
        &self,
        latest_finalised: Hash,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Hash>, SyncError> {
        let mut last = None;
        while let Some(hash) = self.process_next_block(latest_finalised, shutdown).await? {
            last = Some(hash);
        }
        Ok(last)
    }
}

/// Wait `retry_delay`, or fail with `IndexerClosed` if shutdown comes first.
async fn retry_sleep(
    config: &SyncConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), SyncError> {
    tokio::select! {
        biased;
        _ = shutdown.changed() => Err(SyncError::IndexerClosed),
        _ = tokio::time::sleep(config.retry_delay()) => Ok(()),
    }
}

// =============================================================================
// WORKER
// =============================================================================

type Reply = oneshot::Sender<Result<Option<Hash>, SyncError>>;

enum Command {
    ProcessNext { latest: Hash, reply: Reply },
    ProcessAll { latest: Hash, reply: Option<Reply> },
}

async fn run_worker<C, S, A, P>(
    core: Arc<IndexerCore<C, S, A, P>>,
    mut commands: mpsc::Receiver<Command>,
    mut shutdown: watch::Receiver<bool>,
) where
    C: ChainClient,
    S: Store,
    A: AttachmentStore,
    P: BlockProcessor,
{
    debug!("Indexer worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let command = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        let (result, reply) = match command {
            Command::ProcessNext { latest, reply } => {
                (core.process_next_block(latest, &mut shutdown).await, Some(reply))
            }
            Command::ProcessAll { latest, reply } => {
                (core.process_all_blocks(latest, &mut shutdown).await, reply)
            }
        };

        let closed = matches!(result, Err(SyncError::IndexerClosed));
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
        if closed {
            break;
        }
    }

    info!("Indexer worker stopped");
}

async fn watch_heads(
    mut heads: tokio::sync::broadcast::Receiver<Hash>,
    commands: mpsc::Sender<Command>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let head = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            head = heads.recv() => head,
        };

        match head {
            Ok(latest) => {
                debug!(block_hash = %hash_hex(&latest), "New finalised head");
                let command = Command::ProcessAll {
                    latest,
                    reply: None,
                };
                if commands.send(command).await.is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                // The next head catches up through gap discovery.
                warn!(skipped, "Finalised head subscription lagged");
            }
            Err(RecvError::Closed) => {
                warn!("Finalised head subscription closed");
                break;
            }
        }
    }
}

// =============================================================================
// INDEXER
// =============================================================================

/// Lifecycle of an [`Indexer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexerState {
    Created,
    Started,
    Stopped,
}

impl IndexerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexerState::Created => "created",
            IndexerState::Started => "started",
            IndexerState::Stopped => "stopped",
        }
    }
}

/// The indexer service. See the module docs.
pub struct Indexer<C, S, A, P>
where
    C: ChainClient + 'static,
    S: Store + 'static,
    A: AttachmentStore + 'static,
    P: BlockProcessor + 'static,
{
    core: Arc<IndexerCore<C, S, A, P>>,
    chain: Arc<C>,
    config: SyncConfig,
    health: Arc<Health>,
    state: Mutex<IndexerState>,
    commands: mpsc::Sender<Command>,
    pending_commands: Mutex<Option<mpsc::Receiver<Command>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C, S, A> Indexer<C, S, A, BlockHandler<C, S>>
where
    C: ChainClient + 'static,
    S: Store + 'static,
    A: AttachmentStore + 'static,
{
    /// Indexer using the standard [`BlockHandler`].
    pub fn with_block_handler(
        config: SyncConfig,
        chain: Arc<C>,
        store: Arc<S>,
        attachments: Arc<A>,
    ) -> Self {
        let processor = Arc::new(BlockHandler::new(chain.clone(), store.clone()));
        Self::new(config, chain, store, attachments, processor)
    }
}

impl<C, S, A, P> Indexer<C, S, A, P>
where
    C: ChainClient + 'static,
    S: Store + 'static,
    A: AttachmentStore + 'static,
    P: BlockProcessor + 'static,
{
    pub fn new(
        config: SyncConfig,
        chain: Arc<C>,
        store: Arc<S>,
        attachments: Arc<A>,
        processor: Arc<P>,
    ) -> Self {
        let health = Arc::new(Health::default());
        let core = Arc::new(IndexerCore {
            chain: chain.clone(),
            committer: BlockCommitter::new(store.clone(), attachments),
            store,
            processor,
            config: config.clone(),
            health: health.clone(),
            known_tip: Mutex::new(None),
        });
        let (commands, pending_commands) = mpsc::channel(config.command_buffer.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            core,
            chain,
            config,
            health,
            state: Mutex::new(IndexerState::Created),
            commands,
            pending_commands: Mutex::new(Some(pending_commands)),
            shutdown_tx,
            shutdown_rx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> IndexerState {
        *self.state.lock()
    }

    /// Start the worker, catch up to the ledger's current finalised block,
    /// then follow new finalised heads. Ledger errors while fetching the
    /// head are retried, never returned.
    pub async fn start(&self) -> Result<(), SyncError> {
        {
            let mut state = self.state.lock();
            if *state != IndexerState::Created {
                return Err(SyncError::InvalidState {
                    expected: IndexerState::Created.as_str(),
                    actual: state.as_str(),
                });
            }
            *state = IndexerState::Started;
        }
        self.ensure_worker();

        // Subscribe before catching up so no head is missed in between.
        let heads = self.chain.watch_finalised_blocks();
        let watcher = tokio::spawn(watch_heads(
            heads,
            self.commands.clone(),
            self.shutdown_rx.clone(),
        ));
        self.tasks.lock().push(watcher);

        let latest = self.latest_finalised_block_hash().await?;
        let processed = self.process_all_blocks(latest).await?;
        info!(
            latest_finalised = %hash_hex(&latest),
            caught_up_to = ?processed.as_ref().map(hash_hex),
            "Indexer started"
        );
        Ok(())
    }

    /// Stop the worker and wait for it. A block already being committed is
    /// finished first. Pending and later calls fail with `IndexerClosed`.
    pub async fn close(&self) {
        *self.state.lock() = IndexerState::Stopped;
        let _ = self.shutdown_tx.send(true);
        // Drop an unstarted worker's queue so queued callers are released.
        self.pending_commands.lock().take();

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Indexer task ended abnormally");
            }
        }
        info!("Indexer closed");
    }

    /// The ledger's finalised head, retried after `retry_delay` until it
    /// answers or the indexer is closed.
    async fn latest_finalised_block_hash(&self) -> Result<Hash, SyncError> {
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            if *shutdown.borrow() {
                return Err(SyncError::IndexerClosed);
            }

            match self.chain.last_finalised_block_hash().await {
                Ok(hash) => return Ok(hash),
                Err(err) => {
                    INDEXER_RETRIES.inc();
                    warn!(
                        error = %err,
                        retry_delay_ms = self.config.retry_delay_ms,
                        "Failed to fetch finalised head, retrying"
                    );
                    retry_sleep(&self.config, &mut shutdown).await?;
                }
            }
        }
    }

    fn ensure_worker(&self) {
        if let Some(commands) = self.pending_commands.lock().take() {
            let worker = tokio::spawn(run_worker(
                self.core.clone(),
                commands,
                self.shutdown_rx.clone(),
            ));
            self.tasks.lock().push(worker);
        }
    }

    async fn request(
        &self,
        command: impl FnOnce(Reply) -> Command,
    ) -> Result<Option<Hash>, SyncError> {
        if self.state() == IndexerState::Stopped {
            return Err(SyncError::IndexerClosed);
        }
        self.ensure_worker();

        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SyncError::IndexerClosed)?;
        response.await.map_err(|_| SyncError::IndexerClosed)?
    }
}

#[async_trait::async_trait]
impl<C, S, A, P> IndexerApi for Indexer<C, S, A, P>
where
    C: ChainClient + 'static,
    S: Store + 'static,
    A: AttachmentStore + 'static,
    P: BlockProcessor + 'static,
{
    async fn process_next_block(&self, latest_finalised: Hash) -> Result<Option<Hash>, SyncError> {
        self.request(|reply| Command::ProcessNext {
            latest: latest_finalised,
            reply,
        })
        .await
    }

    async fn process_all_blocks(&self, latest_finalised: Hash) -> Result<Option<Hash>, SyncError> {
        self.request(|reply| Command::ProcessAll {
            latest: latest_finalised,
            reply: Some(reply),
        })
        .await
    }

    /// `UP` only while started and the last successful iteration is younger
    /// than `status_timeout`.
    fn status(&self) -> IndexerStatus {
        let started = self.state() == IndexerState::Started;
        let health = self.health.state.read();
        let fresh = health
            .last_activity
            .is_some_and(|(at, _)| at.elapsed() < self.config.status_timeout());

        IndexerStatus {
            status: if started && fresh {
                ServiceStatus::Up
            } else {
                ServiceStatus::Down
            },
            last_processed_block: health.last_processed,
            last_activity: health.last_activity.map(|(_, at)| at),
        }
    }
}

impl<C, S, A, P> Drop for Indexer<C, S, A, P>
where
    C: ChainClient + 'static,
    S: Store + 'static,
    A: AttachmentStore + 'static,
    P: BlockProcessor + 'static,
{
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
