//! Call-recording engine for tests.
//!
//! This module provides [`RecordingEngine`], which forwards every call to an
//! inner [`Engine`] and remembers which operations were invoked, in order.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: the call log grows without bound
//! - **Arguments are not kept**: only the operation name and run key

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use strand_core::{DlqRecord, NamespaceId, RunId, ShardId, WorkflowId, WorkflowKey};

use super::Engine;
use crate::api::activity::{
    ActivityFailureOutcome, ActivityTaskStarted, RecordActivityTaskHeartbeat,
    RecordActivityTaskStarted, RespondActivityTaskCanceled, RespondActivityTaskCompleted,
    RespondActivityTaskFailed,
};
use crate::api::child::RecordChildExecutionCompleted;
use crate::api::describe::{MutableStateDescription, WorkflowExecutionDescription};
use crate::api::lifecycle::{RequestCancelWorkflow, SignalWorkflow, TerminateWorkflow};
use crate::api::maintenance::RemoveSignalMutableState;
use crate::api::pause_activity::{PauseActivity, UnpauseActivity};
use crate::api::query::WorkflowQuery;
use crate::api::reset::ResetWorkflowRequest;
use crate::api::start::{SignalWithStartRequest, StartWorkflowRequest, StartWorkflowResponse};
use crate::api::timer::FireTimer;
use crate::api::update::{UpdateAccepted, UpdateWorkflow};
use crate::api::workflow_task::{
    RecordWorkflowTaskStarted, RespondWorkflowTaskCompleted, RespondWorkflowTaskFailed,
    WorkflowTaskCompletion, WorkflowTaskStarted,
};
use crate::error::Result;
use crate::events::{HistoryEvent, Payload};
use crate::replication::{
    BatchOutcome, InboundTask, MergeOutcome, OutboundMessage, ReplicationStatus, ReplicationTask,
};
use crate::state::MutableState;
use crate::tasks::QueuedTask;
use crate::transaction::HistoryNotification;

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCall {
    /// Operation name, matching the [`Engine`] method.
    pub operation: &'static str,
    /// The run the call targeted, when it targeted one.
    pub key: Option<WorkflowKey>,
}

/// Engine wrapper that records every call before delegating.
pub struct RecordingEngine {
    inner: Arc<dyn Engine>,
    calls: Mutex<Vec<EngineCall>>,
}

impl std::fmt::Debug for RecordingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingEngine")
            .field("shard", &self.inner.shard_id())
            .field("calls", &self.calls().len())
            .finish_non_exhaustive()
    }
}

impl RecordingEngine {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn Engine>) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Returns the calls recorded so far.
    #[must_use]
    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the recorded operation names.
    #[must_use]
    pub fn operations(&self) -> Vec<&'static str> {
        self.calls().into_iter().map(|c| c.operation).collect()
    }

    /// Forgets every recorded call.
    pub fn clear(&self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn record(&self, operation: &'static str, key: Option<&WorkflowKey>) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(EngineCall {
                operation,
                key: key.cloned(),
            });
    }
}

#[async_trait]
impl Engine for RecordingEngine {
    fn shard_id(&self) -> ShardId {
        self.inner.shard_id()
    }

    fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    async fn start(&self) -> Result<()> {
        self.record("start", None);
        self.inner.start().await
    }

    async fn stop(&self) {
        self.record("stop", None);
        self.inner.stop().await;
    }

    async fn sync_shard_status(
        &self,
        source_cluster: &str,
        status_time: DateTime<Utc>,
    ) -> Result<()> {
        self.record("sync_shard_status", None);
        self.inner
            .sync_shard_status(source_cluster, status_time)
            .await
    }

    async fn start_workflow_execution(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<StartWorkflowResponse> {
        self.record("start_workflow_execution", None);
        self.inner.start_workflow_execution(request).await
    }

    async fn signal_workflow_execution(
        &self,
        key: &WorkflowKey,
        signal: SignalWorkflow,
    ) -> Result<()> {
        self.record("signal_workflow_execution", Some(key));
        self.inner.signal_workflow_execution(key, signal).await
    }

    async fn signal_with_start_workflow_execution(
        &self,
        request: SignalWithStartRequest,
    ) -> Result<StartWorkflowResponse> {
        self.record("signal_with_start_workflow_execution", None);
        self.inner
            .signal_with_start_workflow_execution(request)
            .await
    }

    async fn request_cancel_workflow_execution(
        &self,
        key: &WorkflowKey,
        request: RequestCancelWorkflow,
    ) -> Result<()> {
        self.record("request_cancel_workflow_execution", Some(key));
        self.inner
            .request_cancel_workflow_execution(key, request)
            .await
    }

    async fn terminate_workflow_execution(
        &self,
        key: &WorkflowKey,
        request: TerminateWorkflow,
    ) -> Result<()> {
        self.record("terminate_workflow_execution", Some(key));
        self.inner.terminate_workflow_execution(key, request).await
    }

    async fn reset_workflow_execution(&self, request: ResetWorkflowRequest) -> Result<RunId> {
        self.record("reset_workflow_execution", Some(&request.key));
        self.inner.reset_workflow_execution(request).await
    }

    async fn delete_workflow_execution(&self, key: &WorkflowKey) -> Result<()> {
        self.record("delete_workflow_execution", Some(key));
        self.inner.delete_workflow_execution(key).await
    }

    async fn update_workflow(
        &self,
        key: &WorkflowKey,
        update: UpdateWorkflow,
    ) -> Result<UpdateAccepted> {
        self.record("update_workflow", Some(key));
        self.inner.update_workflow(key, update).await
    }

    async fn pause_activity(
        &self,
        key: &WorkflowKey,
        request: PauseActivity,
    ) -> Result<Vec<String>> {
        self.record("pause_activity", Some(key));
        self.inner.pause_activity(key, request).await
    }

    async fn unpause_activity(
        &self,
        key: &WorkflowKey,
        request: UnpauseActivity,
    ) -> Result<Vec<String>> {
        self.record("unpause_activity", Some(key));
        self.inner.unpause_activity(key, request).await
    }

    async fn fire_timer(&self, key: &WorkflowKey, request: FireTimer) -> Result<bool> {
        self.record("fire_timer", Some(key));
        self.inner.fire_timer(key, request).await
    }

    async fn timeout_workflow_execution(&self, key: &WorkflowKey) -> Result<bool> {
        self.record("timeout_workflow_execution", Some(key));
        self.inner.timeout_workflow_execution(key).await
    }

    async fn describe_workflow_execution(
        &self,
        key: &WorkflowKey,
    ) -> Result<WorkflowExecutionDescription> {
        self.record("describe_workflow_execution", Some(key));
        self.inner.describe_workflow_execution(key).await
    }

    async fn describe_mutable_state(&self, key: &WorkflowKey) -> Result<MutableStateDescription> {
        self.record("describe_mutable_state", Some(key));
        self.inner.describe_mutable_state(key).await
    }

    async fn get_mutable_state(&self, key: &WorkflowKey) -> Result<MutableState> {
        self.record("get_mutable_state", Some(key));
        self.inner.get_mutable_state(key).await
    }

    async fn poll_mutable_state(
        &self,
        key: &WorkflowKey,
        after_next_event_id: i64,
        timeout: Duration,
    ) -> Result<MutableState> {
        self.record("poll_mutable_state", Some(key));
        self.inner
            .poll_mutable_state(key, after_next_event_id, timeout)
            .await
    }

    async fn query_workflow(
        &self,
        key: &WorkflowKey,
        query: WorkflowQuery,
    ) -> Result<Option<Payload>> {
        self.record("query_workflow", Some(key));
        self.inner.query_workflow(key, query).await
    }

    async fn schedule_workflow_task(&self, key: &WorkflowKey) -> Result<Option<i64>> {
        self.record("schedule_workflow_task", Some(key));
        self.inner.schedule_workflow_task(key).await
    }

    async fn record_workflow_task_started(
        &self,
        key: &WorkflowKey,
        request: RecordWorkflowTaskStarted,
    ) -> Result<WorkflowTaskStarted> {
        self.record("record_workflow_task_started", Some(key));
        self.inner.record_workflow_task_started(key, request).await
    }

    async fn respond_workflow_task_completed(
        &self,
        key: &WorkflowKey,
        request: RespondWorkflowTaskCompleted,
    ) -> Result<WorkflowTaskCompletion> {
        self.record("respond_workflow_task_completed", Some(key));
        self.inner
            .respond_workflow_task_completed(key, request)
            .await
    }

    async fn respond_workflow_task_failed(
        &self,
        key: &WorkflowKey,
        request: RespondWorkflowTaskFailed,
    ) -> Result<i64> {
        self.record("respond_workflow_task_failed", Some(key));
        self.inner.respond_workflow_task_failed(key, request).await
    }

    async fn record_activity_task_started(
        &self,
        key: &WorkflowKey,
        request: RecordActivityTaskStarted,
    ) -> Result<ActivityTaskStarted> {
        self.record("record_activity_task_started", Some(key));
        self.inner.record_activity_task_started(key, request).await
    }

    async fn record_activity_task_heartbeat(
        &self,
        key: &WorkflowKey,
        request: RecordActivityTaskHeartbeat,
    ) -> Result<bool> {
        self.record("record_activity_task_heartbeat", Some(key));
        self.inner
            .record_activity_task_heartbeat(key, request)
            .await
    }

    async fn respond_activity_task_completed(
        &self,
        key: &WorkflowKey,
        request: RespondActivityTaskCompleted,
    ) -> Result<()> {
        self.record("respond_activity_task_completed", Some(key));
        self.inner
            .respond_activity_task_completed(key, request)
            .await
    }

    async fn respond_activity_task_failed(
        &self,
        key: &WorkflowKey,
        request: RespondActivityTaskFailed,
    ) -> Result<ActivityFailureOutcome> {
        self.record("respond_activity_task_failed", Some(key));
        self.inner.respond_activity_task_failed(key, request).await
    }

    async fn respond_activity_task_canceled(
        &self,
        key: &WorkflowKey,
        request: RespondActivityTaskCanceled,
    ) -> Result<()> {
        self.record("respond_activity_task_canceled", Some(key));
        self.inner
            .respond_activity_task_canceled(key, request)
            .await
    }

    async fn record_child_execution_completed(
        &self,
        parent: &WorkflowKey,
        request: RecordChildExecutionCompleted,
    ) -> Result<bool> {
        self.record("record_child_execution_completed", Some(parent));
        self.inner
            .record_child_execution_completed(parent, request)
            .await
    }

    async fn verify_child_execution_completion_recorded(
        &self,
        parent: &WorkflowKey,
        initiated_event_id: i64,
    ) -> Result<()> {
        self.record("verify_child_execution_completion_recorded", Some(parent));
        self.inner
            .verify_child_execution_completion_recorded(parent, initiated_event_id)
            .await
    }

    async fn verify_first_workflow_task_scheduled(&self, key: &WorkflowKey) -> Result<()> {
        self.record("verify_first_workflow_task_scheduled", Some(key));
        self.inner.verify_first_workflow_task_scheduled(key).await
    }

    async fn remove_signal_mutable_state(
        &self,
        key: &WorkflowKey,
        request: RemoveSignalMutableState,
    ) -> Result<bool> {
        self.record("remove_signal_mutable_state", Some(key));
        self.inner.remove_signal_mutable_state(key, request).await
    }

    async fn reset_sticky_task_queue(&self, key: &WorkflowKey) -> Result<()> {
        self.record("reset_sticky_task_queue", Some(key));
        self.inner.reset_sticky_task_queue(key).await
    }

    async fn refresh_workflow_tasks(&self, key: &WorkflowKey) -> Result<usize> {
        self.record("refresh_workflow_tasks", Some(key));
        self.inner.refresh_workflow_tasks(key).await
    }

    async fn rebuild_mutable_state(&self, key: &WorkflowKey) -> Result<()> {
        self.record("rebuild_mutable_state", Some(key));
        self.inner.rebuild_mutable_state(key).await
    }

    async fn reapply_events(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        events: Vec<HistoryEvent>,
    ) -> Result<usize> {
        self.record("reapply_events", None);
        self.inner
            .reapply_events(namespace_id, workflow_id, events)
            .await
    }

    async fn apply_replication_batch(
        &self,
        source_cluster: &str,
        tasks: Vec<InboundTask>,
    ) -> Result<BatchOutcome> {
        self.record("apply_replication_batch", None);
        self.inner
            .apply_replication_batch(source_cluster, tasks)
            .await
    }

    async fn replicate_events_v2(
        &self,
        source_cluster: &str,
        key: &WorkflowKey,
        events: Vec<HistoryEvent>,
    ) -> Result<()> {
        self.record("replicate_events_v2", Some(key));
        self.inner
            .replicate_events_v2(source_cluster, key, events)
            .await
    }

    async fn replicate_workflow_state(
        &self,
        source_cluster: &str,
        key: &WorkflowKey,
        events: Vec<HistoryEvent>,
    ) -> Result<()> {
        self.record("replicate_workflow_state", Some(key));
        self.inner
            .replicate_workflow_state(source_cluster, key, events)
            .await
    }

    async fn sync_activity(&self, task: ReplicationTask) -> Result<()> {
        self.record("sync_activity", Some(task.key()));
        self.inner.sync_activity(task).await
    }

    async fn generate_last_history_replication_tasks(&self, key: &WorkflowKey) -> Result<u64> {
        self.record("generate_last_history_replication_tasks", Some(key));
        self.inner
            .generate_last_history_replication_tasks(key)
            .await
    }

    async fn get_replication_messages(
        &self,
        last_acked: u64,
        limit: usize,
    ) -> Result<Vec<OutboundMessage>> {
        self.record("get_replication_messages", None);
        self.inner.get_replication_messages(last_acked, limit).await
    }

    async fn get_dlq_replication_messages(
        &self,
        source_cluster: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<(u64, ReplicationTask)>> {
        self.record("get_dlq_replication_messages", None);
        self.inner
            .get_dlq_replication_messages(source_cluster, after, limit)
            .await
    }

    async fn get_replication_status(&self) -> Result<ReplicationStatus> {
        self.record("get_replication_status", None);
        self.inner.get_replication_status().await
    }

    async fn get_dlq_messages(
        &self,
        source_cluster: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<DlqRecord>> {
        self.record("get_dlq_messages", None);
        self.inner
            .get_dlq_messages(source_cluster, after, limit)
            .await
    }

    async fn purge_dlq_messages(&self, source_cluster: &str, inclusive_end: u64) -> Result<usize> {
        self.record("purge_dlq_messages", None);
        self.inner
            .purge_dlq_messages(source_cluster, inclusive_end)
            .await
    }

    async fn merge_dlq_messages(
        &self,
        source_cluster: &str,
        inclusive_end: u64,
    ) -> Result<MergeOutcome> {
        self.record("merge_dlq_messages", None);
        self.inner
            .merge_dlq_messages(source_cluster, inclusive_end)
            .await
    }

    fn notify_new_history_event(&self, notification: HistoryNotification) {
        self.record("notify_new_history_event", Some(&notification.key));
        self.inner.notify_new_history_event(notification);
    }

    fn notify_new_tasks(&self, tasks: &[QueuedTask]) {
        self.record("notify_new_tasks", None);
        self.inner.notify_new_tasks(tasks);
    }
}
