//! # Block Handler
//!
//! Folds every `ProcessRan` event of a block, in emission order, into one
//! change set.

use async_trait::async_trait;
use mm_types::{hash_hex, Hash};
use std::sync::Arc;
use tracing::debug;

use super::event_handler::EventHandler;
use crate::domain::{ChangeSet, SyncError};
use crate::ports::{BlockProcessor, ChainClient, Store};

pub struct BlockHandler<C: ChainClient, S: Store> {
    chain: Arc<C>,
    events: EventHandler<C, S>,
}

impl<C: ChainClient, S: Store> BlockHandler<C, S> {
    pub fn new(chain: Arc<C>, store: Arc<S>) -> Self {
        Self {
            events: EventHandler::new(chain.clone(), store),
            chain,
        }
    }
}

#[async_trait]
impl<C: ChainClient, S: Store> BlockProcessor for BlockHandler<C, S> {
    async fn handle_block(&self, block_hash: &Hash) -> Result<ChangeSet, SyncError> {
        let events = self.chain.get_process_ran_events(block_hash).await?;

        let mut change_set = ChangeSet::new();
        for event in &events {
            change_set = self.events.handle_event(event, change_set).await?;
        }

        debug!(
            block_hash = %hash_hex(block_hash),
            events = events.len(),
            records = change_set.len(),
            "Handled block"
        );
        Ok(change_set)
    }
}
