//! Production [`Engine`] implementation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::Instrument;

use strand_core::observability::{shard_span, workflow_span};
use strand_core::{DlqRecord, NamespaceId, RunId, ShardId, WorkflowId, WorkflowKey};

use super::Engine;
use crate::api::activity::{
    ActivityFailureOutcome, ActivityTaskStarted, RecordActivityTaskHeartbeat,
    RecordActivityTaskStarted, RespondActivityTaskCanceled, RespondActivityTaskCompleted,
    RespondActivityTaskFailed,
};
use crate::api::child::{
    RecordChildExecutionCompleted, verify_child_execution_completion_recorded,
    verify_first_workflow_task_scheduled,
};
use crate::api::describe::{
    MutableStateDescription, WorkflowExecutionDescription, describe_mutable_state,
    describe_workflow_execution, poll_mutable_state,
};
use crate::api::lifecycle::{
    RequestCancelWorkflow, SignalWorkflow, TerminateWorkflow, TimeoutWorkflow,
    delete_workflow_execution,
};
use crate::api::maintenance::{
    RefreshWorkflowTasks, RemoveSignalMutableState, ResetStickyTaskQueue, reapply_events,
    rebuild_mutable_state,
};
use crate::api::pause_activity::{PauseActivity, UnpauseActivity};
use crate::api::query::{QueryDispatcher, WorkflowQuery, query_workflow};
use crate::api::reset::{ResetWorkflowRequest, reset_workflow_execution};
use crate::api::start::{
    SignalWithStartRequest, StartWorkflowRequest, StartWorkflowResponse,
    signal_with_start_workflow_execution, start_workflow_execution,
};
use crate::api::timer::FireTimer;
use crate::api::update::{UpdateAccepted, UpdateWorkflow};
use crate::api::workflow_task::{
    RecordWorkflowTaskStarted, RespondWorkflowTaskCompleted, RespondWorkflowTaskFailed,
    ScheduleWorkflowTask, WorkflowTaskCompletion, WorkflowTaskStarted,
};
use crate::callbacks::CallbackPolicy;
use crate::error::{Error, Result};
use crate::events::{HistoryEvent, Payload};
use crate::replication::{
    BatchOutcome, InboundTask, MergeOutcome, OutboundMessage, ReplicationStatus, ReplicationStream,
    ReplicationTask,
};
use crate::state::MutableState;
use crate::tasks::QueuedTask;
use crate::transaction::{
    HistoryNotification, NewRunPolicy, TransactionEngine, UpdateOperation,
};

/// Page size used when re-offering queued tasks at start.
const RECOVERY_BATCH: usize = 256;

/// The engine of one owned shard.
pub struct HistoryEngine {
    txn: Arc<TransactionEngine>,
    replication: ReplicationStream,
    callback_policy: CallbackPolicy,
    queries: Arc<dyn QueryDispatcher>,
    running: AtomicBool,
}

impl std::fmt::Debug for HistoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryEngine")
            .field("shard", &self.shard_id())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl HistoryEngine {
    /// Creates a stopped engine.
    #[must_use]
    pub fn new(
        txn: Arc<TransactionEngine>,
        replication: ReplicationStream,
        callback_policy: CallbackPolicy,
        queries: Arc<dyn QueryDispatcher>,
    ) -> Self {
        Self {
            txn,
            replication,
            callback_policy,
            queries,
            running: AtomicBool::new(false),
        }
    }

    /// Returns the shard's transaction engine.
    #[must_use]
    pub fn transactions(&self) -> &Arc<TransactionEngine> {
        &self.txn
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::EngineStopped {
                shard_id: self.shard_id().get(),
            })
        }
    }

    async fn update<O: UpdateOperation>(
        &self,
        key: &WorkflowKey,
        op: O,
        policy: NewRunPolicy,
    ) -> Result<O::Output> {
        self.ensure_running()?;
        self.txn
            .get_and_update_workflow_with_new(key, op, policy)
            .instrument(workflow_span(O::NAME, key))
            .await
    }
}

#[async_trait]
impl Engine for HistoryEngine {
    fn shard_id(&self) -> ShardId {
        self.txn.checker().shard().id()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    async fn start(&self) -> Result<()> {
        let shard_id = self.shard_id();
        async {
            self.txn.checker().shard().assert_owned().await?;
            if self.running.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            let recovered = match self.txn.recover_tasks(RECOVERY_BATCH).await {
                Ok(recovered) => recovered,
                Err(err) => {
                    self.running.store(false, Ordering::Release);
                    return Err(err);
                }
            };
            tracing::info!(recovered, "history engine started");
            Ok(())
        }
        .instrument(shard_span("engine.start", shard_id))
        .await
    }

    async fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            self.txn.checker().clear();
            tracing::info!(shard_id = self.shard_id().get(), "history engine stopped");
        }
    }

    async fn sync_shard_status(
        &self,
        source_cluster: &str,
        status_time: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_running()?;
        self.replication
            .sync_shard_status(source_cluster, status_time);
        Ok(())
    }

    async fn start_workflow_execution(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<StartWorkflowResponse> {
        self.ensure_running()?;
        start_workflow_execution(&self.txn, &self.callback_policy, request).await
    }

    async fn signal_workflow_execution(
        &self,
        key: &WorkflowKey,
        signal: SignalWorkflow,
    ) -> Result<()> {
        self.update(key, signal, NewRunPolicy::Forbid).await
    }

    async fn signal_with_start_workflow_execution(
        &self,
        request: SignalWithStartRequest,
    ) -> Result<StartWorkflowResponse> {
        self.ensure_running()?;
        signal_with_start_workflow_execution(&self.txn, &self.callback_policy, request).await
    }

    async fn request_cancel_workflow_execution(
        &self,
        key: &WorkflowKey,
        request: RequestCancelWorkflow,
    ) -> Result<()> {
        self.update(key, request, NewRunPolicy::Forbid).await
    }

    async fn terminate_workflow_execution(
        &self,
        key: &WorkflowKey,
        request: TerminateWorkflow,
    ) -> Result<()> {
        self.update(key, request, NewRunPolicy::Forbid).await
    }

    async fn reset_workflow_execution(&self, request: ResetWorkflowRequest) -> Result<RunId> {
        self.ensure_running()?;
        reset_workflow_execution(&self.txn, request).await
    }

    async fn delete_workflow_execution(&self, key: &WorkflowKey) -> Result<()> {
        self.ensure_running()?;
        delete_workflow_execution(&self.txn, key).await
    }

    async fn update_workflow(
        &self,
        key: &WorkflowKey,
        update: UpdateWorkflow,
    ) -> Result<UpdateAccepted> {
        self.update(key, update, NewRunPolicy::Forbid).await
    }

    async fn pause_activity(
        &self,
        key: &WorkflowKey,
        request: PauseActivity,
    ) -> Result<Vec<String>> {
        self.update(key, request, NewRunPolicy::Forbid).await
    }

    async fn unpause_activity(
        &self,
        key: &WorkflowKey,
        request: UnpauseActivity,
    ) -> Result<Vec<String>> {
        self.update(key, request, NewRunPolicy::Forbid).await
    }

    async fn fire_timer(&self, key: &WorkflowKey, request: FireTimer) -> Result<bool> {
        self.update(key, request, NewRunPolicy::Forbid).await
    }

    async fn timeout_workflow_execution(&self, key: &WorkflowKey) -> Result<bool> {
        self.update(key, TimeoutWorkflow, NewRunPolicy::AllowSuccessor)
            .await
    }

    async fn describe_workflow_execution(
        &self,
        key: &WorkflowKey,
    ) -> Result<WorkflowExecutionDescription> {
        self.ensure_running()?;
        describe_workflow_execution(&self.txn, key).await
    }

    async fn describe_mutable_state(&self, key: &WorkflowKey) -> Result<MutableStateDescription> {
        self.ensure_running()?;
        describe_mutable_state(&self.txn, key).await
    }

    async fn get_mutable_state(&self, key: &WorkflowKey) -> Result<MutableState> {
        self.ensure_running()?;
        self.txn.read(key).await
    }

    async fn poll_mutable_state(
        &self,
        key: &WorkflowKey,
        after_next_event_id: i64,
        timeout: Duration,
    ) -> Result<MutableState> {
        self.ensure_running()?;
        poll_mutable_state(&self.txn, key, after_next_event_id, timeout).await
    }

    async fn query_workflow(
        &self,
        key: &WorkflowKey,
        query: WorkflowQuery,
    ) -> Result<Option<Payload>> {
        self.ensure_running()?;
        query_workflow(&self.txn, &self.queries, key, query).await
    }

    async fn schedule_workflow_task(&self, key: &WorkflowKey) -> Result<Option<i64>> {
        self.update(key, ScheduleWorkflowTask, NewRunPolicy::Forbid)
            .await
    }

    async fn record_workflow_task_started(
        &self,
        key: &WorkflowKey,
        request: RecordWorkflowTaskStarted,
    ) -> Result<WorkflowTaskStarted> {
        self.update(key, request, NewRunPolicy::Forbid).await
    }

    async fn respond_workflow_task_completed(
        &self,
        key: &WorkflowKey,
        request: RespondWorkflowTaskCompleted,
    ) -> Result<WorkflowTaskCompletion> {
        self.update(key, request, NewRunPolicy::AllowSuccessor)
            .await
    }

    async fn respond_workflow_task_failed(
        &self,
        key: &WorkflowKey,
        request: RespondWorkflowTaskFailed,
    ) -> Result<i64> {
        self.update(key, request, NewRunPolicy::Forbid).await
    }

    async fn record_activity_task_started(
        &self,
        key: &WorkflowKey,
        request: RecordActivityTaskStarted,
    ) -> Result<ActivityTaskStarted> {
        self.update(key, request, NewRunPolicy::Forbid).await
    }

    async fn record_activity_task_heartbeat(
        &self,
        key: &WorkflowKey,
        request: RecordActivityTaskHeartbeat,
    ) -> Result<bool> {
        self.update(key, request, NewRunPolicy::Forbid).await
    }

    async fn respond_activity_task_completed(
        &self,
        key: &WorkflowKey,
        request: RespondActivityTaskCompleted,
    ) -> Result<()> {
        self.update(key, request, NewRunPolicy::Forbid).await
    }

    async fn respond_activity_task_failed(
        &self,
        key: &WorkflowKey,
        request: RespondActivityTaskFailed,
    ) -> Result<ActivityFailureOutcome> {
        self.update(key, request, NewRunPolicy::Forbid).await
    }

    async fn respond_activity_task_canceled(
        &self,
        key: &WorkflowKey,
        request: RespondActivityTaskCanceled,
    ) -> Result<()> {
        self.update(key, request, NewRunPolicy::Forbid).await
    }

    async fn record_child_execution_completed(
        &self,
        parent: &WorkflowKey,
        request: RecordChildExecutionCompleted,
    ) -> Result<bool> {
        self.update(parent, request, NewRunPolicy::Forbid).await
    }

    async fn verify_child_execution_completion_recorded(
        &self,
        parent: &WorkflowKey,
        initiated_event_id: i64,
    ) -> Result<()> {
        self.ensure_running()?;
        verify_child_execution_completion_recorded(&self.txn, parent, initiated_event_id).await
    }

    async fn verify_first_workflow_task_scheduled(&self, key: &WorkflowKey) -> Result<()> {
        self.ensure_running()?;
        verify_first_workflow_task_scheduled(&self.txn, key).await
    }

    async fn remove_signal_mutable_state(
        &self,
        key: &WorkflowKey,
        request: RemoveSignalMutableState,
    ) -> Result<bool> {
        self.update(key, request, NewRunPolicy::Forbid).await
    }

    async fn reset_sticky_task_queue(&self, key: &WorkflowKey) -> Result<()> {
        self.update(key, ResetStickyTaskQueue, NewRunPolicy::Forbid)
            .await
    }

    async fn refresh_workflow_tasks(&self, key: &WorkflowKey) -> Result<usize> {
        self.update(key, RefreshWorkflowTasks, NewRunPolicy::Forbid)
            .await
    }

    async fn rebuild_mutable_state(&self, key: &WorkflowKey) -> Result<()> {
        self.ensure_running()?;
        rebuild_mutable_state(&self.txn, key).await
    }

    async fn reapply_events(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        events: Vec<HistoryEvent>,
    ) -> Result<usize> {
        self.ensure_running()?;
        reapply_events(&self.txn, namespace_id, workflow_id, events).await
    }

    async fn apply_replication_batch(
        &self,
        source_cluster: &str,
        tasks: Vec<InboundTask>,
    ) -> Result<BatchOutcome> {
        self.ensure_running()?;
        self.replication.apply_batch(source_cluster, tasks).await
    }

    async fn replicate_events_v2(
        &self,
        source_cluster: &str,
        key: &WorkflowKey,
        events: Vec<HistoryEvent>,
    ) -> Result<()> {
        self.ensure_running()?;
        let task = ReplicationTask::HistoryBatch {
            source_cluster: source_cluster.to_string(),
            key: key.clone(),
            events,
        };
        self.replication.apply_task(&task).await
    }

    async fn replicate_workflow_state(
        &self,
        source_cluster: &str,
        key: &WorkflowKey,
        events: Vec<HistoryEvent>,
    ) -> Result<()> {
        self.ensure_running()?;
        let task = ReplicationTask::WorkflowState {
            source_cluster: source_cluster.to_string(),
            key: key.clone(),
            events,
        };
        self.replication.apply_task(&task).await
    }

    async fn sync_activity(&self, task: ReplicationTask) -> Result<()> {
        self.ensure_running()?;
        if !matches!(task, ReplicationTask::SyncActivity { .. }) {
            return Err(Error::invalid_argument(format!(
                "sync_activity expects a sync activity task for {}",
                task.key()
            )));
        }
        self.replication.apply_task(&task).await
    }

    async fn generate_last_history_replication_tasks(&self, key: &WorkflowKey) -> Result<u64> {
        self.ensure_running()?;
        self.replication
            .generate_last_history_replication_tasks(key)
            .await
    }

    async fn get_replication_messages(
        &self,
        last_acked: u64,
        limit: usize,
    ) -> Result<Vec<OutboundMessage>> {
        self.ensure_running()?;
        self.replication
            .get_replication_messages(last_acked, limit)
            .await
    }

    async fn get_dlq_replication_messages(
        &self,
        source_cluster: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<(u64, ReplicationTask)>> {
        self.ensure_running()?;
        self.replication
            .get_dlq_replication_messages(source_cluster, after, limit)
            .await
    }

    async fn get_replication_status(&self) -> Result<ReplicationStatus> {
        self.ensure_running()?;
        self.replication.get_replication_status().await
    }

    async fn get_dlq_messages(
        &self,
        source_cluster: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<DlqRecord>> {
        self.ensure_running()?;
        self.replication
            .get_dlq_messages(source_cluster, after, limit)
            .await
    }

    async fn purge_dlq_messages(&self, source_cluster: &str, inclusive_end: u64) -> Result<usize> {
        self.ensure_running()?;
        self.replication
            .purge_dlq_messages(source_cluster, inclusive_end)
            .await
    }

    async fn merge_dlq_messages(
        &self,
        source_cluster: &str,
        inclusive_end: u64,
    ) -> Result<MergeOutcome> {
        self.ensure_running()?;
        self.replication
            .merge_dlq_messages(source_cluster, inclusive_end)
            .await
    }

    fn notify_new_history_event(&self, notification: HistoryNotification) {
        self.txn.notify_history(notification);
    }

    fn notify_new_tasks(&self, tasks: &[QueuedTask]) {
        self.txn.notify_tasks(tasks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::query::NoQueryDispatcher;
    use crate::api::testing::Fixture;
    use crate::metrics::HistoryMetrics;
    use crate::replication::SourceSequenceOrdering;
    use crate::tasks::HistoryTask;

    async fn engine() -> (HistoryEngine, Fixture) {
        let f = Fixture::started().await;
        let replication = ReplicationStream::new(
            Arc::clone(&f.txn),
            Arc::new(SourceSequenceOrdering::new()),
            None,
            HistoryMetrics::new(),
        );
        let engine = HistoryEngine::new(
            Arc::clone(&f.txn),
            replication,
            CallbackPolicy::default(),
            Arc::new(NoQueryDispatcher),
        );
        (engine, f)
    }

    #[tokio::test]
    async fn stopped_engine_rejects_operations() {
        let (engine, f) = engine().await;
        let err = engine.get_mutable_state(&f.key).await.unwrap_err();
        assert!(matches!(err, Error::EngineStopped { shard_id: 1 }));

        engine.start().await.unwrap();
        engine.get_mutable_state(&f.key).await.unwrap();

        engine.stop().await;
        assert!(!engine.is_running());
        assert!(engine.get_mutable_state(&f.key).await.is_err());
    }

    #[tokio::test]
    async fn start_reoffers_queued_tasks() {
        let (engine, f) = engine().await;
        f.tasks.taken();
        engine.start().await.unwrap();
        let recovered = f.tasks.taken();
        assert!(
            recovered
                .iter()
                .any(|t| matches!(t.task, HistoryTask::WorkflowTask { .. }))
        );
    }

    #[tokio::test]
    async fn sync_activity_rejects_other_tasks() {
        let (engine, f) = engine().await;
        engine.start().await.unwrap();
        let task = ReplicationTask::HistoryBatch {
            source_cluster: "west".into(),
            key: f.key.clone(),
            events: Vec::new(),
        };
        let err = engine.sync_activity(task).await.unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[tokio::test]
    async fn remote_shard_time_only_moves_forward() {
        let (engine, _f) = engine().await;
        engine.start().await.unwrap();
        let later = Utc::now();
        let earlier = later - chrono::Duration::seconds(30);
        engine.sync_shard_status("west", later).await.unwrap();
        engine.sync_shard_status("west", earlier).await.unwrap();

        let status = engine.get_replication_status().await.unwrap();
        assert_eq!(status.remote_cluster_times["west"], later);
    }
}
