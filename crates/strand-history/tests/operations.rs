//! Operator-facing operations through a running host: reset and activity
//! pause.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use strand_core::ExecutionStore;
use strand_history::api::activity::{RecordActivityTaskHeartbeat, RecordActivityTaskStarted};
use strand_history::api::pause_activity::{ActivitySelector, PauseActivity, UnpauseActivity};
use strand_history::api::reset::ResetWorkflowRequest;
use strand_history::api::workflow_task::Command;
use strand_history::config::Config;
use strand_history::events::EventAttributes;
use strand_history::host::MatchingTask;
use strand_history::persistence;
use strand_history::prelude::*;

use common::{TASK_QUEUE, TestHost, request};

fn schedule(activity_id: &str) -> Command {
    Command::ScheduleActivity {
        activity_id: activity_id.into(),
        activity_type: "Charge".into(),
        task_queue: None,
        max_attempts: 0,
    }
}

#[tokio::test]
async fn reset_terminates_base_and_starts_new_run() {
    let host = TestHost::start(Config::default()).await;
    let key = host.start_workflow(request("order-o1")).await;
    host.run_workflow_task(&key, TASK_QUEUE, vec![schedule("charge")])
        .await;

    let blobs = host.store.read_history(&key, 0).await.unwrap();
    let events = persistence::decode_events(&blobs).unwrap();
    let completed = events
        .iter()
        .find(|e| matches!(e.attributes, EventAttributes::WorkflowTaskCompleted { .. }))
        .map(|e| e.event_id)
        .unwrap();

    let engine = host.engine(&key);
    let reset = ResetWorkflowRequest {
        key: key.clone(),
        reason: "bad deploy".into(),
        workflow_task_finish_event_id: completed,
        request_id: "reset-1".into(),
    };
    let new_run_id = engine
        .reset_workflow_execution(reset.clone())
        .await
        .unwrap();
    assert_ne!(new_run_id, key.run_id);
    assert_eq!(engine.reset_workflow_execution(reset).await.unwrap(), new_run_id);

    let base = engine.get_mutable_state(&key).await.unwrap();
    assert_eq!(base.status(), WorkflowStatus::Terminated);

    let new_key = key.with_run(new_run_id);
    let reset_run = engine.get_mutable_state(&new_key).await.unwrap();
    assert!(reset_run.is_running());
    assert!(reset_run.activities().is_empty());
    assert!(reset_run.workflow_task().is_some());
    host.shutdown().await;
}

#[tokio::test]
async fn paused_activity_is_held_until_unpaused() {
    let host = TestHost::start(Config::default()).await;
    let key = host.start_workflow(request("order-o2")).await;
    host.run_workflow_task(&key, TASK_QUEUE, vec![schedule("charge")])
        .await;
    assert!(matches!(
        host.next_task(TASK_QUEUE).await,
        MatchingTask::Activity { .. }
    ));

    let engine = host.engine(&key);
    let paused = engine
        .pause_activity(
            &key,
            PauseActivity {
                selector: ActivitySelector::Type("Charge".into()),
                identity: "ops".into(),
                reason: "payment provider outage".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(paused, vec!["charge".to_string()]);

    let start = RecordActivityTaskStarted {
        activity_id: "charge".into(),
        identity: "worker-1".into(),
        request_id: "poll-1".into(),
    };
    assert!(
        engine
            .record_activity_task_started(&key, start.clone())
            .await
            .is_err()
    );

    let unpaused = engine
        .unpause_activity(
            &key,
            UnpauseActivity {
                selector: ActivitySelector::Id("charge".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(unpaused, vec!["charge".to_string()]);
    assert!(matches!(
        host.next_task(TASK_QUEUE).await,
        MatchingTask::Activity { .. }
    ));

    let started = engine.record_activity_task_started(&key, start).await.unwrap();
    let still_paused = engine
        .record_activity_task_heartbeat(
            &key,
            RecordActivityTaskHeartbeat {
                activity_id: "charge".into(),
                attempt: started.attempt,
                details: Some(serde_json::json!({"progress": 0.5})),
            },
        )
        .await
        .unwrap();
    assert!(!still_paused);

    let missing = engine
        .pause_activity(
            &key,
            PauseActivity {
                selector: ActivitySelector::Id("refund".into()),
                identity: "ops".into(),
                reason: "typo".into(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(missing, Error::ActivityNotFound { .. }));
    host.shutdown().await;
}
