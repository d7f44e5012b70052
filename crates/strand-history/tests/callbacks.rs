//! Completion callback delivery against a live HTTP target.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};

use strand_core::WorkflowKey;
use strand_history::api::workflow_task::Command;
use strand_history::callbacks::AllowedAddress;
use strand_history::config::Config;
use strand_history::engine::Engine;
use strand_history::events::Failure;
use strand_history::state::{CallbackInfo, CallbackState, CallbackTarget};

use common::{TASK_QUEUE, TestHost, eventually, request};

#[derive(Clone, Copy)]
enum TargetMode {
    FailFirst,
    Reject,
}

#[derive(Clone)]
struct TargetState {
    mode: TargetMode,
    hits: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<Value>>>,
}

async fn completion_handler(
    State(state): State<TargetState>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let hit = state.hits.fetch_add(1, Ordering::SeqCst) + 1;
    state.bodies.lock().unwrap().push(body);
    match state.mode {
        TargetMode::FailFirst if hit == 1 => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"message": "intentional error"})),
        ),
        TargetMode::FailFirst => (StatusCode::OK, Json(json!({}))),
        TargetMode::Reject => (
            StatusCode::BAD_REQUEST,
            Json(json!({"message": "unknown operation"})),
        ),
    }
}

async fn start_target(mode: TargetMode) -> (String, TargetState) {
    let state = TargetState {
        mode,
        hits: Arc::new(AtomicUsize::new(0)),
        bodies: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/complete", post(completion_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr: SocketAddr = listener.local_addr().expect("listener addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve callback target");
    });
    (format!("http://{addr}/complete"), state)
}

fn callback_config() -> Config {
    let mut config = Config::default();
    config.callbacks.enabled = true;
    config.callbacks.allowed_addresses = vec![AllowedAddress::new("127.0.0.1:*", true).unwrap()];
    config.delivery.retry.initial_interval = Duration::from_millis(300);
    config.delivery.request_timeout = Duration::from_secs(2);
    config
}

async fn callback(engine: &Arc<dyn Engine>, key: &WorkflowKey) -> CallbackInfo {
    let description = engine.describe_workflow_execution(key).await.unwrap();
    description.callbacks.into_iter().next().expect("one callback")
}

async fn wait_for_state(
    engine: &Arc<dyn Engine>,
    key: &WorkflowKey,
    state: CallbackState,
) -> CallbackInfo {
    eventually(&format!("callback {state}"), || async {
        let info = callback(engine, key).await;
        (info.state == state).then_some(info)
    })
    .await
}

#[tokio::test]
async fn failed_attempt_backs_off_then_succeeds() {
    let (url, target) = start_target(TargetMode::FailFirst).await;
    let host = TestHost::start(callback_config()).await;
    let key = host
        .start_workflow(
            request("order-cb-1")
                .with_callback(CallbackTarget::new(&url).with_header("x-token", "secret")),
        )
        .await;
    let engine = host.engine(&key);
    assert_eq!(callback(&engine, &key).await.state, CallbackState::Standby);

    host.run_workflow_task(
        &key,
        TASK_QUEUE,
        vec![Command::CompleteWorkflow {
            result: Some(json!({"total": 42})),
        }],
    )
    .await;

    let backing_off = wait_for_state(&engine, &key, CallbackState::BackingOff).await;
    assert_eq!(backing_off.attempt, 1);
    assert_eq!(
        backing_off.last_attempt_failure.as_deref(),
        Some("handler error (INTERNAL): intentional error")
    );
    assert!(backing_off.next_attempt_schedule_time.is_some());

    let succeeded = wait_for_state(&engine, &key, CallbackState::Succeeded).await;
    assert_eq!(succeeded.attempt, 2);
    assert!(succeeded.last_attempt_failure.is_none());
    assert_eq!(target.hits.load(Ordering::SeqCst), 2);

    let bodies = target.bodies.lock().unwrap().clone();
    assert_eq!(bodies[1]["state"], "succeeded");
    assert_eq!(bodies[1]["runId"], key.run_id.to_string());
    assert_eq!(bodies[1]["result"], json!({"total": 42}));
    host.shutdown().await;
}

#[tokio::test]
async fn non_retryable_handler_error_fails_callback() {
    let (url, target) = start_target(TargetMode::Reject).await;
    let host = TestHost::start(callback_config()).await;
    let key = host
        .start_workflow(request("order-cb-2").with_callback(CallbackTarget::new(&url)))
        .await;
    let engine = host.engine(&key);

    host.run_workflow_task(
        &key,
        TASK_QUEUE,
        vec![Command::FailWorkflow {
            failure: Failure::non_retryable("card declined"),
        }],
    )
    .await;

    let failed = wait_for_state(&engine, &key, CallbackState::Failed).await;
    assert_eq!(failed.attempt, 1);
    assert_eq!(
        failed.last_attempt_failure.as_deref(),
        Some("handler error (BAD_REQUEST): unknown operation")
    );
    assert_eq!(target.hits.load(Ordering::SeqCst), 1);
    assert_eq!(target.bodies.lock().unwrap()[0]["state"], "failed");
    host.shutdown().await;
}

#[tokio::test]
async fn continue_as_new_carries_callbacks_to_successor() {
    let (url, target) = start_target(TargetMode::FailFirst).await;
    let mut config = callback_config();
    config.delivery.retry.initial_interval = Duration::from_millis(20);
    let host = TestHost::start(config).await;
    let key = host
        .start_workflow(request("order-cb-3").with_callback(CallbackTarget::new(&url)))
        .await;

    let completion = host
        .run_workflow_task(
            &key,
            TASK_QUEUE,
            vec![Command::ContinueAsNew {
                input: Some(json!({"page": 2})),
            }],
        )
        .await;
    let successor = key.with_run(completion.successor_run_id.expect("successor run"));

    let engine = host.engine(&key);
    let closed = callback(&engine, &key).await;
    assert_eq!(closed.state, CallbackState::Standby);
    let carried = callback(&engine, &successor).await;
    assert_eq!(carried.state, CallbackState::Standby);
    assert_eq!(carried.target.url, url);
    assert_eq!(target.hits.load(Ordering::SeqCst), 0);

    host.run_workflow_task(
        &successor,
        TASK_QUEUE,
        vec![Command::CompleteWorkflow { result: None }],
    )
    .await;
    wait_for_state(&engine, &successor, CallbackState::Succeeded).await;

    let bodies = target.bodies.lock().unwrap().clone();
    assert!(bodies.iter().all(|b| b["runId"] == successor.run_id.to_string()));
    host.shutdown().await;
}
