//! Replication between two hosts: ordered application, duplicate
//! suppression, and quarantine of tasks that arrive ahead of their history.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::sync::Arc;

use strand_core::WorkflowKey;
use strand_history::api::lifecycle::SignalWorkflow;
use strand_history::config::Config;
use strand_history::engine::Engine;
use strand_history::replication::{InboundTask, ReplicationTask};

use common::{TestHost, request};

fn cluster(name: Option<&str>) -> Config {
    let mut config = Config::default();
    config.shard_count = 1;
    config.replication.cluster_name = name.map(str::to_string);
    config
}

fn signal(request_id: &str) -> SignalWorkflow {
    SignalWorkflow {
        signal_name: "payment-received".into(),
        input: Some(serde_json::json!({"amount": 10})),
        identity: "billing".into(),
        request_id: Some(request_id.into()),
    }
}

async fn outbound(engine: &Arc<dyn Engine>, key: &WorkflowKey) -> Vec<InboundTask> {
    engine
        .get_replication_messages(0, 100)
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.task.key() == key)
        .map(|m| InboundTask {
            source_task_id: m.task_id,
            task: m.task,
        })
        .collect()
}

#[tokio::test]
async fn batches_apply_once_in_order() {
    let east = TestHost::start(cluster(Some("east"))).await;
    let west = TestHost::start(cluster(None)).await;

    let key = east.start_workflow(request("order-r1")).await;
    let source = east.engine(&key);
    source
        .signal_workflow_execution(&key, signal("sig-1"))
        .await
        .unwrap();
    let tasks = outbound(&source, &key).await;
    assert_eq!(tasks.len(), 2);
    assert!(
        tasks
            .iter()
            .all(|t| matches!(&t.task, ReplicationTask::HistoryBatch { source_cluster, .. } if source_cluster == "east"))
    );

    let target = west.engine(&key);
    let outcome = target
        .apply_replication_batch("east", tasks.clone())
        .await
        .unwrap();
    assert_eq!(outcome.applied, 2);
    assert_eq!(outcome.quarantined, 0);

    let replayed = target
        .apply_replication_batch("east", tasks)
        .await
        .unwrap();
    assert_eq!(replayed.duplicates, 2);
    assert_eq!(replayed.applied, 0);

    let local = source.get_mutable_state(&key).await.unwrap();
    let remote = target.get_mutable_state(&key).await.unwrap();
    assert_eq!(remote.next_event_id(), local.next_event_id());
    assert_eq!(remote.status(), local.status());

    let status = target.get_replication_status().await.unwrap();
    assert!(status.inbound_watermarks.get("east").is_some_and(|w| *w > 0));

    east.shutdown().await;
    west.shutdown().await;
}

#[tokio::test]
async fn gap_is_quarantined_and_merged_later() {
    let east = TestHost::start(cluster(Some("east"))).await;
    let west = TestHost::start(cluster(None)).await;

    let key = east.start_workflow(request("order-r2")).await;
    let source = east.engine(&key);
    source
        .signal_workflow_execution(&key, signal("sig-2"))
        .await
        .unwrap();
    let mut tasks = outbound(&source, &key).await;
    let signal_batch = tasks.pop().unwrap();
    let start_batch = tasks.pop().unwrap();

    // The signal batch arrives without the start batch before it.
    let target = west.engine(&key);
    let outcome = target
        .apply_replication_batch("east", vec![signal_batch])
        .await
        .unwrap();
    assert_eq!(outcome.quarantined, 1);
    let dlq = target.get_dlq_messages("east", 0, 10).await.unwrap();
    assert_eq!(dlq.len(), 1);
    let parked = target
        .get_dlq_replication_messages("east", 0, 10)
        .await
        .unwrap();
    assert_eq!(parked[0].1.key(), &key);

    let ReplicationTask::HistoryBatch { events, .. } = start_batch.task else {
        panic!("expected a history batch");
    };
    target.replicate_events_v2("east", &key, events).await.unwrap();

    let merged = target
        .merge_dlq_messages("east", parked[0].0)
        .await
        .unwrap();
    assert_eq!(merged.merged, 1);
    assert_eq!(merged.requeued, 0);
    assert!(target.get_dlq_messages("east", 0, 10).await.unwrap().is_empty());

    let local = source.get_mutable_state(&key).await.unwrap();
    let remote = target.get_mutable_state(&key).await.unwrap();
    assert_eq!(remote.next_event_id(), local.next_event_id());

    east.shutdown().await;
    west.shutdown().await;
}

#[tokio::test]
async fn full_history_seeds_a_new_cluster() {
    let east = TestHost::start(cluster(Some("east"))).await;
    let west = TestHost::start(cluster(None)).await;

    let key = east.start_workflow(request("order-r3")).await;
    let source = east.engine(&key);
    source
        .signal_workflow_execution(&key, signal("sig-3"))
        .await
        .unwrap();

    let task_id = source
        .generate_last_history_replication_tasks(&key)
        .await
        .unwrap();
    let message = source
        .get_replication_messages(0, 100)
        .await
        .unwrap()
        .into_iter()
        .find(|m| m.task_id == task_id)
        .unwrap();
    let ReplicationTask::WorkflowState { events, .. } = message.task else {
        panic!("expected a workflow state task");
    };

    let target = west.engine(&key);
    target
        .replicate_workflow_state("east", &key, events)
        .await
        .unwrap();
    let remote = target.get_mutable_state(&key).await.unwrap();
    assert_eq!(
        remote.next_event_id(),
        source.get_mutable_state(&key).await.unwrap().next_event_id()
    );

    let purged = target.purge_dlq_messages("east", u64::MAX).await.unwrap();
    assert_eq!(purged, 0);

    east.shutdown().await;
    west.shutdown().await;
}
