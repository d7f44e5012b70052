//! Per-shard engine façade.
//!
//! [`Engine`] is the complete operation surface of one history shard. The
//! transport layer (out of scope here) maps each RPC onto one method; the
//! [`Host`](crate::host::Host) routes a request to the engine owning the
//! workflow's shard.
//!
//! - [`HistoryEngine`]: the production implementation, delegating to
//!   [`crate::api`] and [`crate::replication`]
//! - `RecordingEngine` (feature `test-utils`): wraps another engine and
//!   records every call
//!
//! Every operation except [`Engine::start`] fails with `EngineStopped` while
//! the engine is not running.

mod history_engine;
#[cfg(any(test, feature = "test-utils"))]
mod recording;

pub use history_engine::HistoryEngine;
#[cfg(any(test, feature = "test-utils"))]
pub use recording::{EngineCall, RecordingEngine};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use strand_core::{DlqRecord, NamespaceId, RunId, ShardId, WorkflowId, WorkflowKey};

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

/// The operation surface of one history shard.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Returns the shard this engine serves.
    fn shard_id(&self) -> ShardId;

    /// Returns true between a successful [`Engine::start`] and [`Engine::stop`].
    fn is_running(&self) -> bool;

    // --- Operational ---

    /// Starts serving: checks shard ownership and re-offers unacknowledged
    /// transfer tasks to listeners.
    async fn start(&self) -> Result<()>;

    /// Stops serving and drops cached state. Idempotent.
    async fn stop(&self);

    /// Records the shard time reported by a remote cluster.
    async fn sync_shard_status(&self, source_cluster: &str, status_time: DateTime<Utc>)
    -> Result<()>;

    // --- Lifecycle ---

    /// Starts a run, or returns the open run for a repeated request ID.
    async fn start_workflow_execution(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<StartWorkflowResponse>;

    /// Records a signal on a running run.
    async fn signal_workflow_execution(&self, key: &WorkflowKey, signal: SignalWorkflow)
    -> Result<()>;

    /// Signals the open run or starts a new one carrying the signal.
    async fn signal_with_start_workflow_execution(
        &self,
        request: SignalWithStartRequest,
    ) -> Result<StartWorkflowResponse>;

    /// Requests cancellation of a running run.
    async fn request_cancel_workflow_execution(
        &self,
        key: &WorkflowKey,
        request: RequestCancelWorkflow,
    ) -> Result<()>;

    /// Terminates a running run.
    async fn terminate_workflow_execution(
        &self,
        key: &WorkflowKey,
        request: TerminateWorkflow,
    ) -> Result<()>;

    /// Resets a run to a workflow task boundary, returning the new run ID.
    async fn reset_workflow_execution(&self, request: ResetWorkflowRequest) -> Result<RunId>;

    /// Deletes a run, terminating it first if it is running.
    async fn delete_workflow_execution(&self, key: &WorkflowKey) -> Result<()>;

    /// Accepts a workflow update.
    async fn update_workflow(&self, key: &WorkflowKey, update: UpdateWorkflow)
    -> Result<UpdateAccepted>;

    /// Pauses matching activities, returning their IDs.
    async fn pause_activity(&self, key: &WorkflowKey, request: PauseActivity)
    -> Result<Vec<String>>;

    /// Unpauses matching activities, returning their IDs.
    async fn unpause_activity(
        &self,
        key: &WorkflowKey,
        request: UnpauseActivity,
    ) -> Result<Vec<String>>;

    /// Fires a user timer. Returns false if the timer no longer exists.
    async fn fire_timer(&self, key: &WorkflowKey, request: FireTimer) -> Result<bool>;

    /// Enforces the run timeout. Returns false if the run already closed.
    async fn timeout_workflow_execution(&self, key: &WorkflowKey) -> Result<bool>;

    // --- Query and describe ---

    /// Describes a run.
    async fn describe_workflow_execution(
        &self,
        key: &WorkflowKey,
    ) -> Result<WorkflowExecutionDescription>;

    /// Returns cached and persisted views of a run.
    async fn describe_mutable_state(&self, key: &WorkflowKey) -> Result<MutableStateDescription>;

    /// Returns a run's mutable state.
    async fn get_mutable_state(&self, key: &WorkflowKey) -> Result<MutableState>;

    /// Long-polls until the run's next event ID passes `after_next_event_id`.
    async fn poll_mutable_state(
        &self,
        key: &WorkflowKey,
        after_next_event_id: i64,
        timeout: Duration,
    ) -> Result<MutableState>;

    /// Answers a query through the configured dispatcher.
    async fn query_workflow(&self, key: &WorkflowKey, query: WorkflowQuery)
    -> Result<Option<Payload>>;

    // --- Task lifecycle ---

    /// Schedules a workflow task if none is pending.
    async fn schedule_workflow_task(&self, key: &WorkflowKey) -> Result<Option<i64>>;

    /// Records that a worker picked up the pending workflow task.
    async fn record_workflow_task_started(
        &self,
        key: &WorkflowKey,
        request: RecordWorkflowTaskStarted,
    ) -> Result<WorkflowTaskStarted>;

    /// Completes the started workflow task and applies its commands.
    async fn respond_workflow_task_completed(
        &self,
        key: &WorkflowKey,
        request: RespondWorkflowTaskCompleted,
    ) -> Result<WorkflowTaskCompletion>;

    /// Fails the started workflow task and schedules the next attempt.
    async fn respond_workflow_task_failed(
        &self,
        key: &WorkflowKey,
        request: RespondWorkflowTaskFailed,
    ) -> Result<i64>;

    /// Records that a worker picked up an activity.
    async fn record_activity_task_started(
        &self,
        key: &WorkflowKey,
        request: RecordActivityTaskStarted,
    ) -> Result<ActivityTaskStarted>;

    /// Records an activity heartbeat. Returns true if the activity is paused.
    async fn record_activity_task_heartbeat(
        &self,
        key: &WorkflowKey,
        request: RecordActivityTaskHeartbeat,
    ) -> Result<bool>;

    /// Completes a started activity.
    async fn respond_activity_task_completed(
        &self,
        key: &WorkflowKey,
        request: RespondActivityTaskCompleted,
    ) -> Result<()>;

    /// Fails a started activity, retrying it within its attempt budget.
    async fn respond_activity_task_failed(
        &self,
        key: &WorkflowKey,
        request: RespondActivityTaskFailed,
    ) -> Result<ActivityFailureOutcome>;

    /// Records that a started activity acknowledged cancellation.
    async fn respond_activity_task_canceled(
        &self,
        key: &WorkflowKey,
        request: RespondActivityTaskCanceled,
    ) -> Result<()>;

    /// Records a child's completion on its parent. Returns false for a
    /// duplicate report.
    async fn record_child_execution_completed(
        &self,
        parent: &WorkflowKey,
        request: RecordChildExecutionCompleted,
    ) -> Result<bool>;

    /// Fails with `NotFound` while a child's completion is still outstanding.
    async fn verify_child_execution_completion_recorded(
        &self,
        parent: &WorkflowKey,
        initiated_event_id: i64,
    ) -> Result<()>;

    /// Fails with `NotFound` if a running run never scheduled a workflow task.
    async fn verify_first_workflow_task_scheduled(&self, key: &WorkflowKey) -> Result<()>;

    // --- Maintenance ---

    /// Forgets a signal request ID. Returns false if it was not recorded.
    async fn remove_signal_mutable_state(
        &self,
        key: &WorkflowKey,
        request: RemoveSignalMutableState,
    ) -> Result<bool>;

    /// Clears the sticky task queue.
    async fn reset_sticky_task_queue(&self, key: &WorkflowKey) -> Result<()>;

    /// Re-queues every task implied by the run's state.
    async fn refresh_workflow_tasks(&self, key: &WorkflowKey) -> Result<usize>;

    /// Rebuilds the run's snapshot from its history.
    async fn rebuild_mutable_state(&self, key: &WorkflowKey) -> Result<()>;

    /// Re-applies signals and updates to the workflow's current run.
    async fn reapply_events(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        events: Vec<HistoryEvent>,
    ) -> Result<usize>;

    // --- Replication ---

    /// Applies an ordered batch of inbound tasks from one source cluster.
    async fn apply_replication_batch(
        &self,
        source_cluster: &str,
        tasks: Vec<InboundTask>,
    ) -> Result<BatchOutcome>;

    /// Appends replicated events to a run, creating it on event 1.
    async fn replicate_events_v2(
        &self,
        source_cluster: &str,
        key: &WorkflowKey,
        events: Vec<HistoryEvent>,
    ) -> Result<()>;

    /// Seeds a run from its complete remote history.
    async fn replicate_workflow_state(
        &self,
        source_cluster: &str,
        key: &WorkflowKey,
        events: Vec<HistoryEvent>,
    ) -> Result<()>;

    /// Applies remote activity progress. `task` must be a `SyncActivity` task.
    async fn sync_activity(&self, task: ReplicationTask) -> Result<()>;

    /// Publishes a run's complete history as one outbound task.
    async fn generate_last_history_replication_tasks(&self, key: &WorkflowKey) -> Result<u64>;

    /// Acknowledges outbound tasks up to `last_acked` and returns the next page.
    async fn get_replication_messages(
        &self,
        last_acked: u64,
        limit: usize,
    ) -> Result<Vec<OutboundMessage>>;

    /// Reads quarantined tasks decoded as replication tasks.
    async fn get_dlq_replication_messages(
        &self,
        source_cluster: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<(u64, ReplicationTask)>>;

    /// Returns the shard's replication progress.
    async fn get_replication_status(&self) -> Result<ReplicationStatus>;

    /// Reads raw quarantined items.
    async fn get_dlq_messages(
        &self,
        source_cluster: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<DlqRecord>>;

    /// Deletes quarantined items up to and including `inclusive_end`.
    async fn purge_dlq_messages(&self, source_cluster: &str, inclusive_end: u64) -> Result<usize>;

    /// Re-applies quarantined items up to and including `inclusive_end`.
    async fn merge_dlq_messages(
        &self,
        source_cluster: &str,
        inclusive_end: u64,
    ) -> Result<MergeOutcome>;

    // --- Notifications ---

    /// Wakes long pollers waiting on a run.
    fn notify_new_history_event(&self, notification: HistoryNotification);

    /// Offers tasks to the engine's task listeners.
    fn notify_new_tasks(&self, tasks: &[QueuedTask]);
}
