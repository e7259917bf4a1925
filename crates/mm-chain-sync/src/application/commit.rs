//! # Block Commit
//!
//! Turns a block's change set into one atomic store write.
//!
//! Attachments go through the attachment service, outside the store
//! transaction. They are inserted first so the real ids exist, and deleted
//! again if the store commit fails. Cleanup is best effort: a failed delete
//! is logged and never replaces the commit error.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use mm_telemetry::ATTACHMENT_CLEANUPS;
use mm_types::{
    hash_hex, Demand, DemandComment, Match2, Match2Comment, ProcessedBlock,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{
    ChangeOp, ChangeSet, DemandCommentRecord, DemandRecord, Match2CommentRecord, Match2Record,
    SyncError,
};
use crate::ports::{AttachmentStore, BlockCommit, EntityWrite, Store};

pub struct BlockCommitter<S: Store, A: AttachmentStore> {
    store: Arc<S>,
    attachments: Arc<A>,
}

impl<S: Store, A: AttachmentStore> BlockCommitter<S, A> {
    pub fn new(store: Arc<S>, attachments: Arc<A>) -> Self {
        Self { store, attachments }
    }

    /// Mark `block` processed and apply `change_set`, all or nothing.
    pub async fn commit(
        &self,
        block: ProcessedBlock,
        mut change_set: ChangeSet,
    ) -> Result<(), SyncError> {
        let now = Utc::now();

        // Validate every record before any side effect.
        let pending_attachments = change_set
            .attachments
            .take()
            .unwrap_or_default()
            .into_values()
            .map(|record| -> Result<_, SyncError> {
                let id = record.id;
                Ok((
                    id,
                    required("attachment", id, "integrity_hash", record.integrity_hash)?,
                    required("attachment", id, "owner_address", record.owner_address)?,
                ))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut writes = entity_writes(change_set, now)?;

        let mut created = Vec::with_capacity(pending_attachments.len());
        let mut attachment_ids = HashMap::with_capacity(pending_attachments.len());
        for (provisional_id, integrity_hash, owner) in pending_attachments {
            match self.attachments.insert_attachment(&integrity_hash, &owner).await {
                Ok(attachment) => {
                    created.push(attachment.id);
                    attachment_ids.insert(provisional_id, attachment.id);
                }
                Err(err) => {
                    self.cleanup(&block, &created).await;
                    return Err(err.into());
                }
            }
        }

        for write in &mut writes {
            resolve_attachment_id(write, &attachment_ids);
        }

        let commit = BlockCommit {
            block,
            anchor: (block.height == 1).then(|| ProcessedBlock::anchor(block.parent)),
            writes,
        };

        if let Err(err) = self.store.commit_block(commit).await {
            self.cleanup(&block, &created).await;
            return Err(err.into());
        }

        debug!(
            block_height = block.height,
            block_hash = %hash_hex(&block.hash),
            attachments = created.len(),
            "Committed block"
        );
        Ok(())
    }

    async fn cleanup(&self, block: &ProcessedBlock, created: &[Uuid]) {
        if created.is_empty() {
            return;
        }

        let deletes = created.iter().map(|id| self.attachments.delete_attachment(id));
        let results = join_all(deletes).await;
        let mut deleted = 0u64;
        for (id, result) in created.iter().zip(results) {
            match result {
                Ok(()) => deleted += 1,
                Err(err) => warn!(
                    block_height = block.height,
                    attachment_id = %id,
                    error = %err,
                    "Failed to delete attachment after failed commit"
                ),
            }
        }
        ATTACHMENT_CLEANUPS.inc_by(deleted as f64);
    }
}

/// Demand, match and comment writes in commit order.
fn entity_writes(change_set: ChangeSet, now: DateTime<Utc>) -> Result<Vec<EntityWrite>, SyncError> {
    let mut writes = Vec::with_capacity(change_set.len());

    for record in change_set.demands.into_iter().flat_map(|m| m.into_values()) {
        writes.push(match record.op {
            ChangeOp::Insert => EntityWrite::InsertDemand(demand_from(record, now)?),
            ChangeOp::Update => EntityWrite::UpdateDemand(record),
        });
    }
    for record in change_set.matches.into_iter().flat_map(|m| m.into_values()) {
        writes.push(match record.op {
            ChangeOp::Insert => EntityWrite::InsertMatch2(match2_from(record, now)?),
            ChangeOp::Update => EntityWrite::UpdateMatch2(record),
        });
    }
    for record in change_set.demand_comments.into_iter().flat_map(|m| m.into_values()) {
        writes.push(match record.op {
            ChangeOp::Insert => EntityWrite::InsertDemandComment(demand_comment_from(record, now)?),
            ChangeOp::Update => EntityWrite::UpdateDemandComment(record),
        });
    }
    for record in change_set.match2_comments.into_iter().flat_map(|m| m.into_values()) {
        writes.push(match record.op {
            ChangeOp::Insert => EntityWrite::InsertMatch2Comment(match2_comment_from(record, now)?),
            ChangeOp::Update => EntityWrite::UpdateMatch2Comment(record),
        });
    }

    Ok(writes)
}

fn resolve_attachment_id(write: &mut EntityWrite, ids: &HashMap<Uuid, Uuid>) {
    let resolve = |id: &mut Uuid| {
        if let Some(real) = ids.get(id) {
            *id = *real;
        }
    };
    match write {
        EntityWrite::InsertDemand(demand) => resolve(&mut demand.parameters_attachment_id),
        EntityWrite::UpdateDemand(record) => {
            if let Some(id) = record.parameters_attachment_id.as_mut() {
                resolve(id);
            }
        }
        EntityWrite::InsertDemandComment(comment) => resolve(&mut comment.attachment_id),
        EntityWrite::UpdateDemandComment(record) => {
            if let Some(id) = record.attachment_id.as_mut() {
                resolve(id);
            }
        }
        EntityWrite::InsertMatch2Comment(comment) => resolve(&mut comment.attachment_id),
        EntityWrite::UpdateMatch2Comment(record) => {
            if let Some(id) = record.attachment_id.as_mut() {
                resolve(id);
            }
        }
        EntityWrite::InsertMatch2(_) | EntityWrite::UpdateMatch2(_) => {}
    }
}

fn required<T>(
    kind: &'static str,
    id: Uuid,
    field: &'static str,
    value: Option<T>,
) -> Result<T, SyncError> {
    value.ok_or_else(|| SyncError::IncompleteRecord {
        kind,
        id: id.to_string(),
        field,
    })
}

fn demand_from(record: DemandRecord, now: DateTime<Utc>) -> Result<Demand, SyncError> {
    let id = record.id;
    Ok(Demand {
        id,
        owner: required("demand", id, "owner", record.owner)?,
        subtype: required("demand", id, "subtype", record.subtype)?,
        state: required("demand", id, "state", record.state)?,
        parameters_attachment_id: required(
            "demand",
            id,
            "parameters_attachment_id",
            record.parameters_attachment_id,
        )?,
        latest_token_id: record.latest_token_id,
        original_token_id: record.original_token_id,
        created_at: now,
        updated_at: now,
    })
}

fn match2_from(record: Match2Record, now: DateTime<Utc>) -> Result<Match2, SyncError> {
    let id = record.id;
    Ok(Match2 {
        id,
        optimiser: required("match2", id, "optimiser", record.optimiser)?,
        member_a: required("match2", id, "member_a", record.member_a)?,
        member_b: required("match2", id, "member_b", record.member_b)?,
        state: required("match2", id, "state", record.state)?,
        demand_a_id: required("match2", id, "demand_a_id", record.demand_a_id)?,
        demand_b_id: required("match2", id, "demand_b_id", record.demand_b_id)?,
        replaces_id: record.replaces_id,
        latest_token_id: record.latest_token_id,
        original_token_id: record.original_token_id,
        created_at: now,
        updated_at: now,
    })
}

fn demand_comment_from(
    record: DemandCommentRecord,
    now: DateTime<Utc>,
) -> Result<DemandComment, SyncError> {
    let id = record.id;
    Ok(DemandComment {
        id,
        owner: required("demand_comment", id, "owner", record.owner)?,
        state: required("demand_comment", id, "state", record.state)?,
        demand: required("demand_comment", id, "demand", record.demand)?,
        attachment_id: required("demand_comment", id, "attachment_id", record.attachment_id)?,
        transaction_id: record.transaction_id,
        created_at: now,
        updated_at: now,
    })
}

fn match2_comment_from(
    record: Match2CommentRecord,
    now: DateTime<Utc>,
) -> Result<Match2Comment, SyncError> {
    let id = record.id;
    Ok(Match2Comment {
        id,
        owner: required("match2_comment", id, "owner", record.owner)?,
        state: required("match2_comment", id, "state", record.state)?,
        match2: required("match2_comment", id, "match2", record.match2)?,
        attachment_id: required("match2_comment", id, "attachment_id", record.attachment_id)?,
        transaction_id: record.transaction_id,
        created_at: now,
        updated_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryStore;
    use crate::domain::{AttachmentRecord, StoreError};
    use mm_types::{DemandState, DemandSubtype};

    fn block(height: u64) -> ProcessedBlock {
        ProcessedBlock {
            hash: [height as u8; 32],
            parent: [height as u8 - 1; 32],
            height,
        }
    }

    fn new_demand_change_set() -> (ChangeSet, Uuid, Uuid) {
        let attachment_id = Uuid::new_v4();
        let demand_id = Uuid::new_v4();
        let change_set = ChangeSet::new()
            .with_attachment(AttachmentRecord {
                integrity_hash: Some("params".into()),
                owner_address: Some("alice".into()),
                ..AttachmentRecord::insert(attachment_id)
            })
            .with_demand(DemandRecord {
                owner: Some("alice".into()),
                subtype: Some(DemandSubtype::DemandA),
                state: Some(DemandState::Created),
                parameters_attachment_id: Some(attachment_id),
                latest_token_id: Some(1),
                original_token_id: Some(1),
                ..DemandRecord::insert(demand_id)
            });
        (change_set, attachment_id, demand_id)
    }

    #[tokio::test]
    async fn test_commit_anchors_first_block() {
        let store = Arc::new(InMemoryStore::new());
        let committer = BlockCommitter::new(store.clone(), store.clone());

        committer.commit(block(1), ChangeSet::new()).await.unwrap();

        assert_eq!(store.get_last_processed_block().await.unwrap(), Some(block(1)));
        assert_eq!(store.processed_block_count(), 2);
    }

    #[tokio::test]
    async fn test_commit_resolves_attachment_ids() {
        let store = Arc::new(InMemoryStore::new());
        let committer = BlockCommitter::new(store.clone(), store.clone());
        let (change_set, provisional, demand_id) = new_demand_change_set();

        committer.commit(block(1), change_set).await.unwrap();

        let demand = store.get_demand(&demand_id).await.unwrap().unwrap();
        assert_ne!(demand.parameters_attachment_id, provisional);
        let attachment = store
            .get_attachment(&demand.parameters_attachment_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(attachment.integrity_hash, "params");
    }

    #[tokio::test]
    async fn test_failed_commit_deletes_attachments() {
        let store = Arc::new(InMemoryStore::new());
        let committer = BlockCommitter::new(store.clone(), store.clone());
        let (change_set, _, demand_id) = new_demand_change_set();
        store.fail_next_commits(1);

        let err = committer.commit(block(1), change_set).await.unwrap_err();

        assert!(matches!(err, SyncError::Store(StoreError::Database(_))));
        assert_eq!(store.attachment_count(), 0);
        assert_eq!(store.get_demand(&demand_id).await.unwrap(), None);
        assert_eq!(store.get_last_processed_block().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incomplete_insert_has_no_side_effects() {
        let store = Arc::new(InMemoryStore::new());
        let committer = BlockCommitter::new(store.clone(), store.clone());
        let (change_set, _, _) = new_demand_change_set();
        let change_set = change_set.with_match2(Match2Record::insert(Uuid::new_v4()));

        let err = committer.commit(block(1), change_set).await.unwrap_err();

        assert!(matches!(err, SyncError::IncompleteRecord { kind: "match2", .. }));
        assert_eq!(store.attachment_count(), 0);
    }

    #[tokio::test]
    async fn test_update_of_missing_row_rolls_back() {
        let store = Arc::new(InMemoryStore::new());
        let committer = BlockCommitter::new(store.clone(), store.clone());
        let change_set = ChangeSet::new().with_demand(DemandRecord {
            state: Some(DemandState::Allocated),
            ..DemandRecord::update(Uuid::new_v4())
        });

        let err = committer.commit(block(1), change_set).await.unwrap_err();

        assert!(matches!(err, SyncError::Store(StoreError::NotFound { .. })));
        assert_eq!(store.get_last_processed_block().await.unwrap(), None);
    }
}
