//! Property tests over the transaction engine.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use strand_core::{ExecutionStore, MemoryExecutionStore, NamespaceId, ShardId, WorkflowId, WorkflowKey};
use strand_history::api::lifecycle::SignalWorkflow;
use strand_history::api::start::{StartWorkflowRequest, start_workflow_execution};
use strand_history::callbacks::CallbackPolicy;
use strand_history::events::EventAttributes;
use strand_history::lease::ConsistencyChecker;
use strand_history::metrics::HistoryMetrics;
use strand_history::persistence;
use strand_history::shard::Shard;
use strand_history::state::MutableState;
use strand_history::transaction::{NewRunPolicy, TransactionEngine};

async fn engine() -> (Arc<dyn ExecutionStore>, TransactionEngine) {
    let store: Arc<dyn ExecutionStore> = Arc::new(MemoryExecutionStore::new());
    let shard = Shard::acquire(Arc::clone(&store), ShardId::new(1).unwrap())
        .await
        .unwrap();
    let checker = Arc::new(ConsistencyChecker::new(
        shard,
        Duration::from_secs(1),
        HistoryMetrics::new(),
    ));
    let txn = TransactionEngine::new(checker, Vec::new(), None, HistoryMetrics::new());
    (store, txn)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Signals deduplicate by request ID, and replaying the persisted history
    /// reproduces the live state's event counter.
    #[test]
    fn signals_dedupe_and_history_replays(request_ids in prop::collection::vec(0u8..6, 1..24)) {
        let (live, events) = tokio_test::block_on(async {
            let (store, txn) = engine().await;
            let request = StartWorkflowRequest::new(
                NamespaceId::new("default").unwrap(),
                WorkflowId::new("prop").unwrap(),
                "order",
                "main",
            );
            let started = start_workflow_execution(&txn, &CallbackPolicy::default(), request)
                .await
                .unwrap();
            let key = WorkflowKey::new(
                NamespaceId::new("default").unwrap(),
                WorkflowId::new("prop").unwrap(),
                started.run_id,
            );
            for id in &request_ids {
                let signal = SignalWorkflow {
                    signal_name: "tick".into(),
                    input: None,
                    identity: "prop".into(),
                    request_id: Some(format!("req-{id}")),
                };
                txn.get_and_update_workflow_with_new(&key, signal, NewRunPolicy::Forbid)
                    .await
                    .unwrap();
            }
            let live = txn.read(&key).await.unwrap();
            let blobs = store.read_history(&key, 0).await.unwrap();
            (live, persistence::decode_events(&blobs).unwrap())
        });

        let distinct: HashSet<u8> = request_ids.iter().copied().collect();
        let signaled = events
            .iter()
            .filter(|e| matches!(e.attributes, EventAttributes::WorkflowExecutionSignaled { .. }))
            .count();
        prop_assert_eq!(signaled, distinct.len());

        let ids: Vec<i64> = events.iter().map(|e| e.event_id).collect();
        let expected: Vec<i64> = (1..=i64::try_from(events.len()).unwrap()).collect();
        prop_assert_eq!(ids, expected);

        let replayed = MutableState::replay(live.key().clone(), &events).unwrap();
        prop_assert_eq!(replayed.next_event_id(), live.next_event_id());
        prop_assert_eq!(replayed.status(), live.status());
    }
}
