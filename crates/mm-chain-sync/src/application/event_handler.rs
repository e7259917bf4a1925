//! # Event Handler
//!
//! Resolves one `ProcessRan` event into a [`ChangeSet`] and folds it into the
//! block's running change set.

use futures::future::try_join_all;
use mm_telemetry::EVENTS_PROCESSED;
use mm_types::{hash_hex, ProcessRanEvent};
use std::sync::Arc;
use tracing::debug;

use crate::domain::{ChangeSet, ProcessName, ResolvedInput, SyncError};
use crate::ports::{ChainClient, Store};

/// Turns chain events into change sets.
pub struct EventHandler<C: ChainClient, S: Store> {
    chain: Arc<C>,
    store: Arc<S>,
}

impl<C: ChainClient, S: Store> EventHandler<C, S> {
    pub fn new(chain: Arc<C>, store: Arc<S>) -> Self {
        Self { chain, store }
    }

    /// Handle `event` on top of `current` and return the merged change set.
    ///
    /// Input tokens are resolved against `current` first, so events that
    /// consume tokens minted earlier in the same block work before anything
    /// is committed. Output tokens are read at the event's block.
    pub async fn handle_event(
        &self,
        event: &ProcessRanEvent,
        current: ChangeSet,
    ) -> Result<ChangeSet, SyncError> {
        let process: ProcessName = event.process.id.parse()?;

        let transaction = self.store.get_transaction_by_hash(&event.call_hash).await?;

        let mut inputs = Vec::with_capacity(event.inputs.len());
        for &token_id in &event.inputs {
            let local_id = match current.find_local_id(token_id) {
                Some(local_id) => local_id,
                None => self
                    .store
                    .find_local_id_for_token(token_id)
                    .await?
                    .ok_or(SyncError::UnknownToken(token_id))?,
            };
            inputs.push(ResolvedInput { local_id, token_id });
        }

        let outputs = try_join_all(
            event
                .outputs
                .iter()
                .map(|&token_id| self.chain.get_token(token_id, &event.block_hash)),
        )
        .await?;

        let processor = process.processor();
        let change_set = processor(
            event.process.version,
            transaction.as_ref(),
            &event.sender,
            &inputs,
            &outputs,
        )?;

        EVENTS_PROCESSED.with_label_values(&[process.as_str()]).inc();
        debug!(
            process = %event.process,
            call_hash = %hash_hex(&event.call_hash),
            known = transaction.is_some(),
            records = change_set.len(),
            "Handled ProcessRan event"
        );

        Ok(current.merge(change_set))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryStore;
    use crate::domain::ChangeOp;
    use crate::ports::MockChainClient;
    use chrono::Utc;
    use mm_types::{
        Demand, DemandState, DemandSubtype, ProcessId, TokenContent, Transaction,
        TransactionApiType, TransactionState, TransactionType,
    };
    use uuid::Uuid;

    fn event(process: &str, inputs: Vec<u64>, outputs: Vec<u64>) -> ProcessRanEvent {
        ProcessRanEvent {
            call_hash: [9; 32],
            block_hash: [1; 32],
            sender: "alice".to_string(),
            process: ProcessId::new(process, 1),
            inputs,
            outputs,
        }
    }

    fn demand_token(id: u64) -> TokenContent {
        let mut token = TokenContent {
            id,
            ..Default::default()
        };
        token.roles.insert("owner".into(), "alice".into());
        token.metadata.insert("subtype".into(), "demand_a".into());
        token.metadata.insert("parameters".into(), "params".into());
        token
    }

    fn stored_demand(token_id: u64) -> Demand {
        Demand {
            id: Uuid::new_v4(),
            owner: "alice".into(),
            subtype: DemandSubtype::DemandA,
            state: DemandState::Created,
            parameters_attachment_id: Uuid::new_v4(),
            latest_token_id: Some(token_id),
            original_token_id: Some(token_id),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    type TestHandler = EventHandler<MockChainClient, InMemoryStore>;

    fn handler() -> (Arc<MockChainClient>, Arc<InMemoryStore>, TestHandler) {
        let chain = Arc::new(MockChainClient::new());
        let store = Arc::new(InMemoryStore::new());
        let handler = EventHandler::new(chain.clone(), store.clone());
        (chain, store, handler)
    }

    #[tokio::test]
    async fn test_unknown_process_is_rejected() {
        let (_, _, handler) = handler();
        let err = handler
            .handle_event(&event("demand_destroy", vec![], vec![]), ChangeSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownProcess(_)));
    }

    #[tokio::test]
    async fn test_unknown_input_token() {
        let (_, _, handler) = handler();
        let err = handler
            .handle_event(&event("demand_comment", vec![42], vec![43]), ChangeSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownToken(42)));
    }

    #[tokio::test]
    async fn test_external_create_inserts_demand() {
        let (chain, _, handler) = handler();
        chain.add_token(demand_token(1));

        let change_set = handler
            .handle_event(&event("demand_create", vec![], vec![1]), ChangeSet::new())
            .await
            .unwrap();

        let demand = change_set.demands.unwrap().into_values().next().unwrap();
        assert_eq!(demand.op, ChangeOp::Insert);
        assert_eq!(demand.latest_token_id, Some(1));
    }

    #[tokio::test]
    async fn test_known_transaction_uses_local_id() {
        let (chain, store, handler) = handler();
        chain.add_token(demand_token(1));
        let local_id = Uuid::new_v4();
        store
            .insert_transaction(Transaction {
                id: Uuid::new_v4(),
                api_type: TransactionApiType::Demand,
                transaction_type: TransactionType::Creation,
                local_id,
                state: TransactionState::InBlock,
                hash: [9; 32],
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let change_set = handler
            .handle_event(&event("demand_create", vec![], vec![1]), ChangeSet::new())
            .await
            .unwrap();

        let demands = change_set.demands.unwrap();
        assert_eq!(demands[&local_id].op, ChangeOp::Update);
        assert_eq!(change_set.attachments, None);
    }

    #[tokio::test]
    async fn test_inputs_resolve_from_store() {
        let (chain, store, handler) = handler();
        let demand = stored_demand(5);
        store.insert_demand(demand.clone()).await.unwrap();
        let mut output = TokenContent {
            id: 6,
            ..Default::default()
        };
        output.metadata.insert("comment".into(), "note".into());
        chain.add_token(output);

        let change_set = handler
            .handle_event(&event("demand_comment", vec![5], vec![6]), ChangeSet::new())
            .await
            .unwrap();

        assert_eq!(
            change_set.demands.unwrap()[&demand.id].latest_token_id,
            Some(6)
        );
    }

    #[tokio::test]
    async fn test_inputs_resolve_from_in_flight_change_set() {
        let (chain, _, handler) = handler();
        chain.add_token(demand_token(1));
        let mut comment = TokenContent {
            id: 2,
            ..Default::default()
        };
        comment.metadata.insert("comment".into(), "note".into());
        chain.add_token(comment);

        let created = handler
            .handle_event(&event("demand_create", vec![], vec![1]), ChangeSet::new())
            .await
            .unwrap();
        let merged = handler
            .handle_event(&event("demand_comment", vec![1], vec![2]), created)
            .await
            .unwrap();

        let demands = merged.demands.unwrap();
        assert_eq!(demands.len(), 1);
        let demand = demands.values().next().unwrap();
        assert_eq!(demand.op, ChangeOp::Insert);
        assert_eq!(demand.latest_token_id, Some(2));
        assert_eq!(demand.original_token_id, Some(1));
        assert_eq!(merged.demand_comments.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_output_token_fails() {
        let (_, _, handler) = handler();
        let err = handler
            .handle_event(&event("demand_create", vec![], vec![77]), ChangeSet::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Chain(crate::domain::ChainError::TokenNotFound { token_id: 77, .. })
        ));
    }
}
