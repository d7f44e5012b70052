//! Shared fixture for operation tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use strand_core::{ExecutionStore, MemoryExecutionStore, NamespaceId, ShardId, WorkflowId, WorkflowKey};

use crate::callbacks::{AllowedAddress, CallbackPolicy};
use crate::error::Result;
use crate::events::HistoryEvent;
use crate::lease::ConsistencyChecker;
use crate::metrics::HistoryMetrics;
use crate::persistence;
use crate::shard::Shard;
use crate::state::MutableState;
use crate::tasks::{QueuedTask, TaskListener};
use crate::transaction::{NewRunPolicy, TransactionEngine, UpdateOperation};

use super::start::{StartWorkflowRequest, start_workflow_execution};
use super::workflow_task::{
    Command, RecordWorkflowTaskStarted, RespondWorkflowTaskCompleted, WorkflowTaskCompletion,
};

#[derive(Debug, Default)]
pub(crate) struct TaskLog(Mutex<Vec<QueuedTask>>);

impl TaskLog {
    pub(crate) fn taken(&self) -> Vec<QueuedTask> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl TaskListener for TaskLog {
    fn on_tasks(&self, tasks: &[QueuedTask]) {
        self.0.lock().unwrap().extend_from_slice(tasks);
    }
}

pub(crate) struct Fixture {
    pub store: Arc<dyn ExecutionStore>,
    pub txn: Arc<TransactionEngine>,
    pub tasks: Arc<TaskLog>,
    pub key: WorkflowKey,
}

impl Fixture {
    pub(crate) fn request() -> StartWorkflowRequest {
        StartWorkflowRequest::new(
            NamespaceId::new("default").unwrap(),
            WorkflowId::new("order-42").unwrap(),
            "order",
            "main",
        )
    }

    /// A policy that accepts callbacks to any address.
    pub(crate) fn callback_policy() -> CallbackPolicy {
        CallbackPolicy {
            enabled: true,
            allowed_addresses: vec![AllowedAddress::new("*", true).unwrap()],
            ..CallbackPolicy::default()
        }
    }

    pub(crate) async fn engine() -> (Arc<dyn ExecutionStore>, Arc<TransactionEngine>, Arc<TaskLog>) {
        let store: Arc<dyn ExecutionStore> = Arc::new(MemoryExecutionStore::new());
        let shard = Shard::acquire(Arc::clone(&store), ShardId::new(1).unwrap())
            .await
            .unwrap();
        let checker = Arc::new(ConsistencyChecker::new(
            shard,
            Duration::from_secs(1),
            HistoryMetrics::new(),
        ));
        let tasks = Arc::new(TaskLog::default());
        let listener: Arc<dyn TaskListener> = tasks.clone();
        let txn = Arc::new(TransactionEngine::new(
            checker,
            vec![listener],
            None,
            HistoryMetrics::new(),
        ));
        (store, txn, tasks)
    }

    pub(crate) async fn started() -> Self {
        Self::start(Self::request()).await
    }

    pub(crate) async fn start(request: StartWorkflowRequest) -> Self {
        let (store, txn, tasks) = Self::engine().await;
        let namespace_id = request.namespace_id.clone();
        let workflow_id = request.workflow_id.clone();
        let response = start_workflow_execution(&txn, &Self::callback_policy(), request)
            .await
            .unwrap();
        Self {
            store,
            txn,
            tasks,
            key: WorkflowKey::new(namespace_id, workflow_id, response.run_id),
        }
    }

    pub(crate) fn with_key(&self, key: WorkflowKey) -> Self {
        Self {
            store: Arc::clone(&self.store),
            txn: Arc::clone(&self.txn),
            tasks: Arc::clone(&self.tasks),
            key,
        }
    }

    pub(crate) async fn update<O: UpdateOperation>(&self, op: O) -> Result<O::Output> {
        self.txn
            .get_and_update_workflow_with_new(&self.key, op, NewRunPolicy::AllowSuccessor)
            .await
    }

    pub(crate) async fn state(&self) -> MutableState {
        self.txn.read(&self.key).await.unwrap()
    }

    pub(crate) async fn events(&self) -> Vec<HistoryEvent> {
        let blobs = self.store.read_history(&self.key, 0).await.unwrap();
        persistence::decode_events(&blobs).unwrap()
    }

    /// Starts the pending workflow task, returning its scheduled event ID.
    pub(crate) async fn start_workflow_task(&self) -> i64 {
        let scheduled = self
            .state()
            .await
            .workflow_task()
            .map(|wt| wt.scheduled_event_id)
            .unwrap();
        self.update(RecordWorkflowTaskStarted {
            scheduled_event_id: scheduled,
            identity: "worker".into(),
            request_id: uuid::Uuid::new_v4().to_string(),
        })
        .await
        .unwrap();
        scheduled
    }

    pub(crate) async fn complete_workflow_task(
        &self,
        commands: Vec<Command>,
    ) -> Result<WorkflowTaskCompletion> {
        let scheduled = self.start_workflow_task().await;
        self.update(RespondWorkflowTaskCompleted {
            scheduled_event_id: scheduled,
            identity: "worker".into(),
            commands,
            sticky_task_queue: None,
        })
        .await
    }
}
