//! # In-Memory Store
//!
//! [`Store`] and [`AttachmentStore`] backed by process memory. Used by the
//! dev binary and by tests.
//!
//! `commit_block` is copy-on-write: writes are applied to a clone of the
//! state and swapped in only when all of them succeed, which gives the same
//! all-or-nothing behaviour as a SQL transaction.

use async_trait::async_trait;
use chrono::Utc;
use mm_types::{
    hash_hex, Address, Attachment, Demand, DemandComment, Hash, Match2, Match2Comment,
    ProcessedBlock, TokenId, Transaction, TransactionState,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

use crate::domain::StoreError;
use crate::ports::{AttachmentStore, BlockCommit, EntityWrite, Store};

/// Copy record fields that are set onto the target row.
macro_rules! patch {
    ($target:expr, $record:expr; $($field:ident),* ; optional $($opt:ident),*) => {
        $( if let Some(value) = &$record.$field { $target.$field = value.clone(); } )*
        $( if let Some(value) = &$record.$opt { $target.$opt = Some(value.clone()); } )*
    };
}

#[derive(Debug, Clone, Default)]
struct StoreState {
    /// Processed blocks by height.
    processed: BTreeMap<u64, ProcessedBlock>,
    processed_hashes: HashMap<Hash, u64>,
    unprocessed: HashMap<Hash, ProcessedBlock>,
    demands: HashMap<Uuid, Demand>,
    matches: HashMap<Uuid, Match2>,
    demand_comments: HashMap<Uuid, DemandComment>,
    match2_comments: HashMap<Uuid, Match2Comment>,
    transactions: HashMap<Uuid, Transaction>,
    attachments: HashMap<Uuid, Attachment>,
}

impl StoreState {
    fn mark_processed(&mut self, block: ProcessedBlock) {
        self.unprocessed.remove(&block.hash);
        self.processed_hashes.insert(block.hash, block.height);
        self.processed.insert(block.height, block);
    }

    fn apply(&mut self, write: EntityWrite) -> Result<(), StoreError> {
        let now = Utc::now();
        match write {
            EntityWrite::InsertDemand(demand) => {
                insert_new(&mut self.demands, "demand", demand.id, demand)
            }
            EntityWrite::UpdateDemand(record) => {
                let demand = existing(&mut self.demands, "demand", &record.id)?;
                patch!(demand, record;
                    owner, subtype, state, parameters_attachment_id;
                    optional latest_token_id);
                if demand.original_token_id.is_none() {
                    demand.original_token_id = record.original_token_id;
                }
                demand.updated_at = now;
                Ok(())
            }
            EntityWrite::InsertMatch2(match2) => {
                insert_new(&mut self.matches, "match2", match2.id, match2)
            }
            EntityWrite::UpdateMatch2(record) => {
                let match2 = existing(&mut self.matches, "match2", &record.id)?;
                patch!(match2, record;
                    optimiser, member_a, member_b, state, demand_a_id, demand_b_id;
                    optional replaces_id, latest_token_id);
                if match2.original_token_id.is_none() {
                    match2.original_token_id = record.original_token_id;
                }
                match2.updated_at = now;
                Ok(())
            }
            EntityWrite::InsertDemandComment(comment) => insert_new(
                &mut self.demand_comments,
                "demand_comment",
                comment.id,
                comment,
            ),
            EntityWrite::UpdateDemandComment(record) => {
                let comment = self
                    .demand_comments
                    .values_mut()
                    .find(|c| c.transaction_id == Some(record.id))
                    .ok_or_else(|| not_found("demand_comment", &record.id))?;
                patch!(comment, record;
                    owner, state, demand, attachment_id;
                    optional transaction_id);
                comment.updated_at = now;
                Ok(())
            }
            EntityWrite::InsertMatch2Comment(comment) => insert_new(
                &mut self.match2_comments,
                "match2_comment",
                comment.id,
                comment,
            ),
            EntityWrite::UpdateMatch2Comment(record) => {
                let comment = self
                    .match2_comments
                    .values_mut()
                    .find(|c| c.transaction_id == Some(record.id))
                    .ok_or_else(|| not_found("match2_comment", &record.id))?;
                patch!(comment, record;
                    owner, state, match2, attachment_id;
                    optional transaction_id);
                comment.updated_at = now;
                Ok(())
            }
        }
    }
}

fn not_found(kind: &'static str, id: &Uuid) -> StoreError {
    StoreError::NotFound {
        kind,
        id: id.to_string(),
    }
}

fn existing<'a, T>(
    rows: &'a mut HashMap<Uuid, T>,
    kind: &'static str,
    id: &Uuid,
) -> Result<&'a mut T, StoreError> {
    rows.get_mut(id).ok_or_else(|| not_found(kind, id))
}

fn insert_new<T>(
    rows: &mut HashMap<Uuid, T>,
    kind: &'static str,
    id: Uuid,
    row: T,
) -> Result<(), StoreError> {
    if rows.contains_key(&id) {
        return Err(StoreError::Conflict {
            kind,
            id: id.to_string(),
        });
    }
    rows.insert(id, row);
    Ok(())
}

/// In-memory store with fault injection for tests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
    /// Upcoming `commit_block` calls that fail.
    commit_failures: AtomicUsize,
    /// Upcoming `delete_attachment` calls that fail.
    delete_failures: AtomicUsize,
    unprocessed_lookups: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` block commits fail with a database error.
    pub fn fail_next_commits(&self, count: usize) {
        self.commit_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` attachment deletes fail.
    pub fn fail_next_attachment_deletes(&self, count: usize) {
        self.delete_failures.store(count, Ordering::SeqCst);
    }

    /// Processed rows, height-0 anchor included.
    pub fn processed_block_count(&self) -> usize {
        self.state.read().processed.len()
    }

    pub fn unprocessed_block_count(&self) -> usize {
        self.state.read().unprocessed.len()
    }

    pub fn attachment_count(&self) -> usize {
        self.state.read().attachments.len()
    }

    /// Number of `get_unprocessed_block` calls so far.
    pub fn unprocessed_lookup_count(&self) -> usize {
        self.unprocessed_lookups.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_last_processed_block(&self) -> Result<Option<ProcessedBlock>, StoreError> {
        Ok(self
            .state
            .read()
            .processed
            .last_key_value()
            .map(|(_, block)| *block))
    }

    async fn try_insert_unprocessed_block(
        &self,
        block: ProcessedBlock,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        if state.processed_hashes.contains_key(&block.hash)
            || state.unprocessed.contains_key(&block.hash)
        {
            return Ok(false);
        }
        state.unprocessed.insert(block.hash, block);
        Ok(true)
    }

    async fn get_unprocessed_block(
        &self,
        hash: &Hash,
    ) -> Result<Option<ProcessedBlock>, StoreError> {
        self.unprocessed_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.read().unprocessed.get(hash).copied())
    }

    async fn get_next_unprocessed_block_at_height(
        &self,
        height: u64,
    ) -> Result<Option<ProcessedBlock>, StoreError> {
        Ok(self
            .state
            .read()
            .unprocessed
            .values()
            .find(|block| block.height == height)
            .copied())
    }

    async fn get_transaction_by_hash(
        &self,
        hash: &Hash,
    ) -> Result<Option<Transaction>, StoreError> {
        Ok(self
            .state
            .read()
            .transactions
            .values()
            .find(|tx| &tx.hash == hash)
            .cloned())
    }

    async fn find_local_id_for_token(
        &self,
        token_id: TokenId,
    ) -> Result<Option<Uuid>, StoreError> {
        let state = self.state.read();
        let demand = state
            .demands
            .values()
            .find(|d| d.latest_token_id == Some(token_id))
            .map(|d| d.id);
        Ok(demand.or_else(|| {
            state
                .matches
                .values()
                .find(|m| m.latest_token_id == Some(token_id))
                .map(|m| m.id)
        }))
    }

    async fn insert_demand(&self, demand: Demand) -> Result<(), StoreError> {
        let mut state = self.state.write();
        insert_new(&mut state.demands, "demand", demand.id, demand)
    }

    async fn get_demand(&self, id: &Uuid) -> Result<Option<Demand>, StoreError> {
        Ok(self.state.read().demands.get(id).cloned())
    }

    async fn insert_match2(&self, match2: Match2) -> Result<(), StoreError> {
        let mut state = self.state.write();
        insert_new(&mut state.matches, "match2", match2.id, match2)
    }

    async fn get_match2(&self, id: &Uuid) -> Result<Option<Match2>, StoreError> {
        Ok(self.state.read().matches.get(id).cloned())
    }

    async fn insert_demand_comment(&self, comment: DemandComment) -> Result<(), StoreError> {
        let mut state = self.state.write();
        insert_new(&mut state.demand_comments, "demand_comment", comment.id, comment)
    }

    async fn get_demand_comments(&self, demand: &Uuid) -> Result<Vec<DemandComment>, StoreError> {
        Ok(self
            .state
            .read()
            .demand_comments
            .values()
            .filter(|c| &c.demand == demand)
            .cloned()
            .collect())
    }

    async fn insert_match2_comment(&self, comment: Match2Comment) -> Result<(), StoreError> {
        let mut state = self.state.write();
        insert_new(&mut state.match2_comments, "match2_comment", comment.id, comment)
    }

    async fn get_match2_comments(&self, match2: &Uuid) -> Result<Vec<Match2Comment>, StoreError> {
        Ok(self
            .state
            .read()
            .match2_comments
            .values()
            .filter(|c| &c.match2 == match2)
            .cloned()
            .collect())
    }

    async fn insert_transaction(&self, transaction: Transaction) -> Result<(), StoreError> {
        let mut state = self.state.write();
        insert_new(&mut state.transactions, "transaction", transaction.id, transaction)
    }

    async fn get_transaction(&self, id: &Uuid) -> Result<Option<Transaction>, StoreError> {
        Ok(self.state.read().transactions.get(id).cloned())
    }

    /// Terminal states are never left; such updates are ignored.
    async fn update_transaction_state(
        &self,
        id: &Uuid,
        state: TransactionState,
    ) -> Result<(), StoreError> {
        let mut guard = self.state.write();
        let transaction = existing(&mut guard.transactions, "transaction", id)?;
        if !transaction.state.is_terminal() {
            transaction.state = state;
            transaction.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn commit_block(&self, commit: BlockCommit) -> Result<(), StoreError> {
        if Self::take_failure(&self.commit_failures) {
            return Err(StoreError::Database("Injected commit failure".to_string()));
        }

        let mut guard = self.state.write();
        let block = commit.block;
        let already_processed = guard.processed_hashes.contains_key(&block.hash)
            || guard
                .processed
                .last_key_value()
                .is_some_and(|(height, _)| *height >= block.height);
        if already_processed {
            return Err(StoreError::Conflict {
                kind: "processed_block",
                id: hash_hex(&block.hash),
            });
        }

        let mut next = guard.clone();
        if let Some(anchor) = commit.anchor {
            if !next.processed.contains_key(&anchor.height) {
                next.mark_processed(anchor);
            }
        }
        next.mark_processed(block);
        for write in commit.writes {
            next.apply(write)?;
        }

        *guard = next;
        Ok(())
    }
}

#[async_trait]
impl AttachmentStore for InMemoryStore {
    async fn insert_attachment(
        &self,
        integrity_hash: &str,
        owner_address: &Address,
    ) -> Result<Attachment, StoreError> {
        let attachment = Attachment {
            id: Uuid::new_v4(),
            integrity_hash: integrity_hash.to_string(),
            owner_address: owner_address.clone(),
            filename: None,
            size: None,
            created_at: Utc::now(),
        };
        self.state
            .write()
            .attachments
            .insert(attachment.id, attachment.clone());
        Ok(attachment)
    }

    async fn delete_attachment(&self, id: &Uuid) -> Result<(), StoreError> {
        if Self::take_failure(&self.delete_failures) {
            return Err(StoreError::Database("Injected delete failure".to_string()));
        }
        self.state
            .write()
            .attachments
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found("attachment", id))
    }

    async fn get_attachment(&self, id: &Uuid) -> Result<Option<Attachment>, StoreError> {
        Ok(self.state.read().attachments.get(id).cloned())
    }
}
