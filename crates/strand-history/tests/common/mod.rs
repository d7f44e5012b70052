//! Helpers shared by the integration tests.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use strand_core::{MemoryExecutionStore, NamespaceId, WorkflowId, WorkflowKey};
use strand_history::api::start::StartWorkflowRequest;
use strand_history::api::workflow_task::{
    Command, RecordWorkflowTaskStarted, RespondWorkflowTaskCompleted, WorkflowTaskCompletion,
};
use strand_history::config::Config;
use strand_history::engine::Engine;
use strand_history::host::{Collaborators, Host, InMemoryMatching, MatchingTask};

pub const TASK_QUEUE: &str = "orders";

/// Polls `probe` until it yields a value, failing after five seconds.
pub async fn eventually<T, F, Fut>(what: &str, mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = probe().await {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn request(workflow_id: &str) -> StartWorkflowRequest {
    StartWorkflowRequest::new(
        NamespaceId::new("default").unwrap(),
        WorkflowId::new(workflow_id).unwrap(),
        "OrderWorkflow",
        TASK_QUEUE,
    )
}

pub struct TestHost {
    pub host: Host,
    pub matching: Arc<InMemoryMatching>,
    pub store: Arc<MemoryExecutionStore>,
}

impl TestHost {
    pub async fn start(config: Config) -> Self {
        Self::start_with(config, Collaborators::default()).await
    }

    pub async fn start_with(config: Config, mut collaborators: Collaborators) -> Self {
        let matching = Arc::new(InMemoryMatching::new());
        collaborators.matching = matching.clone();
        let store = Arc::new(MemoryExecutionStore::new());
        let host = Host::build(config, store.clone(), collaborators)
            .await
            .expect("build host");
        host.start().await.expect("start host");
        Self {
            host,
            matching,
            store,
        }
    }

    pub fn engine(&self, key: &WorkflowKey) -> Arc<dyn Engine> {
        self.host.engine_for(key).expect("engine for run")
    }

    /// Starts `request` and returns the new run's key.
    pub async fn start_workflow(&self, request: StartWorkflowRequest) -> WorkflowKey {
        let engine = self
            .host
            .engine_for_workflow(&request.namespace_id, &request.workflow_id)
            .unwrap();
        let namespace_id = request.namespace_id.clone();
        let workflow_id = request.workflow_id.clone();
        let response = engine.start_workflow_execution(request).await.unwrap();
        WorkflowKey::new(namespace_id, workflow_id, response.run_id)
    }

    /// Waits for the next task on `queue`.
    pub async fn next_task(&self, queue: &str) -> MatchingTask {
        eventually(&format!("a task on {queue}"), || async {
            self.matching.poll(queue)
        })
        .await
    }

    /// Takes the next workflow task of `key` from matching, starts it, and
    /// completes it with `commands`.
    pub async fn run_workflow_task(
        &self,
        key: &WorkflowKey,
        queue: &str,
        commands: Vec<Command>,
    ) -> WorkflowTaskCompletion {
        let scheduled_event_id = match self.next_task(queue).await {
            MatchingTask::Workflow {
                key: task_key,
                scheduled_event_id,
                ..
            } => {
                assert_eq!(&task_key, key, "workflow task for another run");
                scheduled_event_id
            }
            other => panic!("expected a workflow task, got {other:?}"),
        };
        let engine = self.engine(key);
        engine
            .record_workflow_task_started(
                key,
                RecordWorkflowTaskStarted {
                    scheduled_event_id,
                    identity: "worker-1".into(),
                    request_id: uuid::Uuid::new_v4().to_string(),
                },
            )
            .await
            .unwrap();
        engine
            .respond_workflow_task_completed(
                key,
                RespondWorkflowTaskCompleted {
                    scheduled_event_id,
                    identity: "worker-1".into(),
                    commands,
                    sticky_task_queue: None,
                },
            )
            .await
            .unwrap()
    }

    pub async fn shutdown(self) {
        self.host.shutdown().await;
    }
}
