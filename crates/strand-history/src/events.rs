//! History events.
//!
//! A run's history is an append-only sequence of [`HistoryEvent`]s with
//! contiguous event IDs starting at 1. The mutable state is a projection of
//! these events (see [`MutableState::apply_event`](crate::state::MutableState::apply_event)).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use strand_core::{RunId, WorkflowKey};

use crate::state::CallbackTarget;

/// Opaque user payload.
pub type Payload = serde_json::Value;

/// The first event ID of every run.
pub const FIRST_EVENT_ID: i64 = 1;

/// A failure reported by a workflow, activity, or handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    /// Human-readable message.
    pub message: String,
    /// Retry policies must not retry this failure.
    #[serde(default)]
    pub non_retryable: bool,
}

impl Failure {
    /// Creates a retryable failure.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            non_retryable: false,
        }
    }

    /// Creates a non-retryable failure.
    #[must_use]
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            non_retryable: true,
        }
    }
}

/// Workflow-level retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first (0 = unlimited).
    pub maximum_attempts: u32,
    /// Delay before the first retry.
    #[serde(default)]
    pub initial_interval: Duration,
}

impl RetryPolicy {
    /// Returns true if a run on `attempt` may be retried.
    #[must_use]
    pub const fn allows_retry_after(&self, attempt: u32) -> bool {
        self.maximum_attempts == 0 || attempt < self.maximum_attempts
    }
}

/// Link from a child run to the parent that started it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentExecution {
    /// The parent run.
    pub key: WorkflowKey,
    /// Event ID of `StartChildWorkflowExecutionInitiated` in the parent.
    pub initiated_event_id: i64,
}

/// Why a workflow task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowTaskFailedCause {
    /// The worker reported a failure.
    WorkerFailure,
    /// The run was reset and the in-flight task abandoned.
    ResetWorkflow,
    /// The worker's commands were rejected.
    BadCommand,
}

/// How a closed run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WorkflowOutcome {
    /// Completed successfully.
    Completed {
        /// Result payload.
        result: Option<Payload>,
    },
    /// Failed.
    Failed {
        /// The failure.
        failure: Failure,
    },
    /// Canceled on request.
    Canceled {
        /// Cancellation details.
        details: Option<Payload>,
    },
    /// Terminated by an operator or a reset.
    Terminated {
        /// Termination reason.
        reason: String,
    },
    /// Exceeded its run timeout.
    TimedOut,
    /// Continued as a new run.
    ContinuedAsNew {
        /// The successor run.
        new_run_id: RunId,
    },
}

/// A single history event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEvent {
    /// Contiguous, 1-based event ID.
    pub event_id: i64,
    /// When the event was recorded.
    pub event_time: DateTime<Utc>,
    /// Event payload.
    pub attributes: EventAttributes,
}

impl HistoryEvent {
    /// Returns the event type name.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        self.attributes.event_type()
    }
}

/// Event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "eventType",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
#[allow(missing_docs)]
pub enum EventAttributes {
    WorkflowExecutionStarted {
        workflow_type: String,
        task_queue: String,
        input: Option<Payload>,
        #[serde(default)]
        callbacks: Vec<CallbackTarget>,
        first_run_id: RunId,
        original_run_id: RunId,
        continued_from_run_id: Option<RunId>,
        attempt: u32,
        retry_policy: Option<RetryPolicy>,
        run_timeout: Option<Duration>,
        parent: Option<ParentExecution>,
        request_id: String,
    },
    WorkflowTaskScheduled {
        task_queue: String,
        attempt: u32,
    },
    WorkflowTaskStarted {
        scheduled_event_id: i64,
        identity: String,
        request_id: String,
    },
    WorkflowTaskCompleted {
        scheduled_event_id: i64,
        started_event_id: i64,
        identity: String,
    },
    WorkflowTaskFailed {
        scheduled_event_id: i64,
        started_event_id: Option<i64>,
        cause: WorkflowTaskFailedCause,
        failure: Option<Failure>,
    },
    ActivityTaskScheduled {
        activity_id: String,
        activity_type: String,
        task_queue: String,
        max_attempts: u32,
    },
    ActivityTaskStarted {
        activity_id: String,
        attempt: u32,
        identity: String,
        request_id: String,
    },
    ActivityTaskCompleted {
        activity_id: String,
        result: Option<Payload>,
        identity: String,
    },
    ActivityTaskFailed {
        activity_id: String,
        failure: Failure,
        identity: String,
    },
    ActivityTaskCanceled {
        activity_id: String,
        details: Option<Payload>,
        identity: String,
    },
    TimerStarted {
        timer_id: String,
        fire_at: DateTime<Utc>,
    },
    TimerFired {
        timer_id: String,
        started_event_id: i64,
    },
    TimerCanceled {
        timer_id: String,
        started_event_id: i64,
    },
    WorkflowExecutionSignaled {
        signal_name: String,
        input: Option<Payload>,
        identity: String,
    },
    WorkflowExecutionCancelRequested {
        reason: String,
        identity: String,
    },
    WorkflowExecutionUpdateAccepted {
        update_id: String,
        name: String,
        args: Option<Payload>,
    },
    WorkflowExecutionUpdateCompleted {
        update_id: String,
        result: Option<Payload>,
        failure: Option<Failure>,
    },
    StartChildWorkflowExecutionInitiated {
        workflow_id: String,
        workflow_type: String,
        task_queue: String,
        input: Option<Payload>,
    },
    ChildWorkflowExecutionCompleted {
        initiated_event_id: i64,
        child_run_id: RunId,
        outcome: WorkflowOutcome,
    },
    WorkflowExecutionCompleted {
        result: Option<Payload>,
        new_execution_run_id: Option<RunId>,
    },
    WorkflowExecutionFailed {
        failure: Failure,
        new_execution_run_id: Option<RunId>,
    },
    WorkflowExecutionCanceled {
        details: Option<Payload>,
    },
    WorkflowExecutionTerminated {
        reason: String,
        identity: String,
    },
    WorkflowExecutionTimedOut {
        new_execution_run_id: Option<RunId>,
    },
    WorkflowExecutionContinuedAsNew {
        new_execution_run_id: RunId,
        input: Option<Payload>,
    },
}

impl EventAttributes {
    /// Returns the event type name.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::WorkflowExecutionStarted { .. } => "WorkflowExecutionStarted",
            Self::WorkflowTaskScheduled { .. } => "WorkflowTaskScheduled",
            Self::WorkflowTaskStarted { .. } => "WorkflowTaskStarted",
            Self::WorkflowTaskCompleted { .. } => "WorkflowTaskCompleted",
            Self::WorkflowTaskFailed { .. } => "WorkflowTaskFailed",
            Self::ActivityTaskScheduled { .. } => "ActivityTaskScheduled",
            Self::ActivityTaskStarted { .. } => "ActivityTaskStarted",
            Self::ActivityTaskCompleted { .. } => "ActivityTaskCompleted",
            Self::ActivityTaskFailed { .. } => "ActivityTaskFailed",
            Self::ActivityTaskCanceled { .. } => "ActivityTaskCanceled",
            Self::TimerStarted { .. } => "TimerStarted",
            Self::TimerFired { .. } => "TimerFired",
            Self::TimerCanceled { .. } => "TimerCanceled",
            Self::WorkflowExecutionSignaled { .. } => "WorkflowExecutionSignaled",
            Self::WorkflowExecutionCancelRequested { .. } => "WorkflowExecutionCancelRequested",
            Self::WorkflowExecutionUpdateAccepted { .. } => "WorkflowExecutionUpdateAccepted",
            Self::WorkflowExecutionUpdateCompleted { .. } => "WorkflowExecutionUpdateCompleted",
            Self::StartChildWorkflowExecutionInitiated { .. } => {
                "StartChildWorkflowExecutionInitiated"
            }
            Self::ChildWorkflowExecutionCompleted { .. } => "ChildWorkflowExecutionCompleted",
            Self::WorkflowExecutionCompleted { .. } => "WorkflowExecutionCompleted",
            Self::WorkflowExecutionFailed { .. } => "WorkflowExecutionFailed",
            Self::WorkflowExecutionCanceled { .. } => "WorkflowExecutionCanceled",
            Self::WorkflowExecutionTerminated { .. } => "WorkflowExecutionTerminated",
            Self::WorkflowExecutionTimedOut { .. } => "WorkflowExecutionTimedOut",
            Self::WorkflowExecutionContinuedAsNew { .. } => "WorkflowExecutionContinuedAsNew",
        }
    }

    /// Returns true for events that close the run.
    #[must_use]
    pub const fn is_close_event(&self) -> bool {
        matches!(
            self,
            Self::WorkflowExecutionCompleted { .. }
                | Self::WorkflowExecutionFailed { .. }
                | Self::WorkflowExecutionCanceled { .. }
                | Self::WorkflowExecutionTerminated { .. }
                | Self::WorkflowExecutionTimedOut { .. }
                | Self::WorkflowExecutionContinuedAsNew { .. }
        )
    }

    /// Returns true for events a running workflow task must be told about.
    ///
    /// Such events arriving while a workflow task is started force another
    /// workflow task once the current one completes.
    #[must_use]
    pub const fn needs_workflow_attention(&self) -> bool {
        matches!(
            self,
            Self::ActivityTaskCompleted { .. }
                | Self::ActivityTaskFailed { .. }
                | Self::ActivityTaskCanceled { .. }
                | Self::TimerFired { .. }
                | Self::WorkflowExecutionSignaled { .. }
                | Self::WorkflowExecutionCancelRequested { .. }
                | Self::WorkflowExecutionUpdateAccepted { .. }
                | Self::ChildWorkflowExecutionCompleted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_type_tag() {
        let event = HistoryEvent {
            event_id: 2,
            event_time: Utc::now(),
            attributes: EventAttributes::WorkflowTaskScheduled {
                task_queue: "main".into(),
                attempt: 1,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["attributes"]["eventType"], "WORKFLOW_TASK_SCHEDULED");
        assert_eq!(json["attributes"]["taskQueue"], "main");
        assert_eq!(json["eventId"], 2);
    }

    #[test]
    fn close_events_classified() {
        assert!(
            EventAttributes::WorkflowExecutionTimedOut {
                new_execution_run_id: None
            }
            .is_close_event()
        );
        assert!(
            !EventAttributes::WorkflowExecutionSignaled {
                signal_name: "go".into(),
                input: None,
                identity: "test".into(),
            }
            .is_close_event()
        );
    }

    #[test]
    fn retry_policy_bounds() {
        let policy = RetryPolicy {
            maximum_attempts: 2,
            initial_interval: Duration::ZERO,
        };
        assert!(policy.allows_retry_after(1));
        assert!(!policy.allows_retry_after(2));

        let unlimited = RetryPolicy {
            maximum_attempts: 0,
            initial_interval: Duration::ZERO,
        };
        assert!(unlimited.allows_retry_after(100));
    }
}
