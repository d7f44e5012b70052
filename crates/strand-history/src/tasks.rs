//! Transfer tasks and task listeners.
//!
//! Tasks are written to the shard's transfer queue in the same commit as
//! the state change that produced them. After the commit the transaction
//! engine hands them to every registered [`TaskListener`] for immediate
//! dispatch; a listener acknowledges a task by completing it in the store
//! once processed. Unacknowledged tasks are re-offered when the engine
//! starts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use strand_core::{ShardId, WorkflowKey};

use crate::events::{ParentExecution, Payload, WorkflowOutcome};

/// A unit of asynchronous work produced by a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HistoryTask {
    /// Dispatch a workflow task to matching.
    WorkflowTask {
        /// The run.
        key: WorkflowKey,
        /// Event ID of `WorkflowTaskScheduled`.
        scheduled_event_id: i64,
        /// Destination queue.
        task_queue: String,
    },
    /// Dispatch an activity task to matching.
    ActivityTask {
        /// The run.
        key: WorkflowKey,
        /// The activity.
        activity_id: String,
        /// Event ID of `ActivityTaskScheduled`.
        scheduled_event_id: i64,
        /// Attempt being dispatched.
        attempt: u32,
        /// Destination queue.
        task_queue: String,
    },
    /// Deliver a completion callback.
    CallbackInvocation {
        /// The run owning the callback.
        key: WorkflowKey,
        /// The callback.
        callback_id: u32,
        /// Earliest time to attempt delivery.
        fire_at: DateTime<Utc>,
    },
    /// Start a child workflow.
    StartChildExecution {
        /// The parent run.
        key: WorkflowKey,
        /// Event ID of `StartChildWorkflowExecutionInitiated`.
        initiated_event_id: i64,
        /// Child workflow ID.
        workflow_id: String,
        /// Child workflow type.
        workflow_type: String,
        /// Child task queue.
        task_queue: String,
        /// Child input.
        input: Option<Payload>,
    },
    /// Report a closed child back to its parent.
    RecordChildCompletion {
        /// The closed child run.
        child: WorkflowKey,
        /// The parent to notify.
        parent: ParentExecution,
        /// How the child ended.
        outcome: WorkflowOutcome,
    },
    /// Fire a user timer.
    UserTimer {
        /// The run.
        key: WorkflowKey,
        /// The timer.
        timer_id: String,
        /// When it fires.
        fire_at: DateTime<Utc>,
    },
    /// Enforce the run timeout.
    RunTimeout {
        /// The run.
        key: WorkflowKey,
        /// When the run times out.
        fire_at: DateTime<Utc>,
    },
}

impl HistoryTask {
    /// Returns the run this task belongs to.
    #[must_use]
    pub const fn key(&self) -> &WorkflowKey {
        match self {
            Self::WorkflowTask { key, .. }
            | Self::ActivityTask { key, .. }
            | Self::CallbackInvocation { key, .. }
            | Self::StartChildExecution { key, .. }
            | Self::UserTimer { key, .. }
            | Self::RunTimeout { key, .. } => key,
            Self::RecordChildCompletion { child, .. } => child,
        }
    }

    /// Returns the task kind for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::WorkflowTask { .. } => "workflow_task",
            Self::ActivityTask { .. } => "activity_task",
            Self::CallbackInvocation { .. } => "callback_invocation",
            Self::StartChildExecution { .. } => "start_child_execution",
            Self::RecordChildCompletion { .. } => "record_child_completion",
            Self::UserTimer { .. } => "user_timer",
            Self::RunTimeout { .. } => "run_timeout",
        }
    }

    /// Returns the earliest time the task may run; `None` means now.
    #[must_use]
    pub const fn fire_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::CallbackInvocation { fire_at, .. }
            | Self::UserTimer { fire_at, .. }
            | Self::RunTimeout { fire_at, .. } => Some(*fire_at),
            _ => None,
        }
    }
}

/// A task with its shard-assigned queue ID.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedTask {
    /// Shard owning the queue.
    pub shard_id: ShardId,
    /// Queue-assigned ID, used to acknowledge the task.
    pub task_id: u64,
    /// The task.
    pub task: HistoryTask,
}

/// Receives newly committed tasks.
///
/// Called after the lease is released, from the committing task. Must not
/// block; implementations hand the tasks to their own workers.
pub trait TaskListener: Send + Sync {
    /// Offers newly committed (or recovered) tasks.
    fn on_tasks(&self, tasks: &[QueuedTask]);
}
