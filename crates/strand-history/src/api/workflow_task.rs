//! Workflow task lifecycle.
//!
//! A workflow task is scheduled, started by a worker poll, then completed
//! with a list of [`Command`]s or failed. Commands are applied in order in
//! the same transaction as the completion.

use chrono::Duration;

use strand_core::RunId;

use crate::error::{Error, Result};
use crate::events::{EventAttributes, Failure, Payload, WorkflowTaskFailedCause};
use crate::tasks::HistoryTask;
use crate::transaction::{UpdateAction, UpdateContext, UpdateOperation};

use super::{close_workflow, fail_or_retry, successor_draft};

/// Schedules a workflow task unless one is pending.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScheduleWorkflowTask;

impl UpdateOperation for ScheduleWorkflowTask {
    type Output = Option<i64>;
    const NAME: &'static str = "schedule_workflow_task";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, Option<i64>)> {
        let now = ctx.now();
        match ctx.run().schedule_workflow_task(now)? {
            Some(id) => Ok((UpdateAction::UPDATE, Some(id))),
            None => Ok((UpdateAction::NOOP, None)),
        }
    }
}

/// Marks the pending workflow task as picked up by a worker.
///
/// Repeating the call with the same `request_id` returns the original
/// result without recording anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordWorkflowTaskStarted {
    /// Event ID of `WorkflowTaskScheduled`.
    pub scheduled_event_id: i64,
    /// Worker identity.
    pub identity: String,
    /// Poll request ID.
    pub request_id: String,
}

/// Returned to the polling worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowTaskStarted {
    /// Event ID of `WorkflowTaskStarted`.
    pub started_event_id: i64,
    /// Workflow task attempt.
    pub attempt: u32,
    /// Run history length including the started event.
    pub history_length: usize,
}

impl UpdateOperation for RecordWorkflowTaskStarted {
    type Output = WorkflowTaskStarted;
    const NAME: &'static str = "record_workflow_task_started";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, WorkflowTaskStarted)> {
        let state = ctx.state();
        let Some(wt) = state
            .workflow_task()
            .filter(|wt| wt.scheduled_event_id == self.scheduled_event_id)
        else {
            return Err(Error::task_not_found(format!(
                "workflow task {} is not pending on {}",
                self.scheduled_event_id,
                state.key()
            )));
        };
        if let Some(started_event_id) = wt.started_event_id {
            if wt.request_id.as_deref() == Some(self.request_id.as_str()) {
                let started = WorkflowTaskStarted {
                    started_event_id,
                    attempt: wt.attempt,
                    history_length: state.history_length(),
                };
                return Ok((UpdateAction::NOOP, started));
            }
            return Err(Error::task_not_found(format!(
                "workflow task {} already started",
                self.scheduled_event_id
            )));
        }
        let attempt = wt.attempt;

        let started_event_id = ctx.record(EventAttributes::WorkflowTaskStarted {
            scheduled_event_id: self.scheduled_event_id,
            identity: self.identity,
            request_id: self.request_id,
        })?;
        let started = WorkflowTaskStarted {
            started_event_id,
            attempt,
            history_length: ctx.state().history_length(),
        };
        Ok((UpdateAction::UPDATE, started))
    }
}

/// A decision made by a workflow task.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Schedule an activity.
    ScheduleActivity {
        /// Workflow-scoped activity ID.
        activity_id: String,
        /// Activity type name.
        activity_type: String,
        /// Task queue; the workflow's queue when `None`.
        task_queue: Option<String>,
        /// Maximum attempts (0 = unlimited).
        max_attempts: u32,
    },
    /// Request cancellation of an activity.
    RequestCancelActivity {
        /// The activity.
        activity_id: String,
    },
    /// Start a user timer.
    StartTimer {
        /// Workflow-scoped timer ID.
        timer_id: String,
        /// Delay until the timer fires.
        fire_after: std::time::Duration,
    },
    /// Cancel a user timer.
    CancelTimer {
        /// The timer.
        timer_id: String,
    },
    /// Start a child workflow.
    StartChildWorkflow {
        /// Child workflow ID.
        workflow_id: String,
        /// Child workflow type.
        workflow_type: String,
        /// Child task queue; the workflow's queue when `None`.
        task_queue: Option<String>,
        /// Child input.
        input: Option<Payload>,
    },
    /// Complete an accepted update.
    CompleteUpdate {
        /// The update.
        update_id: String,
        /// Success payload.
        result: Option<Payload>,
        /// Failure, if the update handler failed.
        failure: Option<Failure>,
    },
    /// Close the run successfully.
    CompleteWorkflow {
        /// Result payload.
        result: Option<Payload>,
    },
    /// Close the run as failed, retrying if the retry policy allows.
    FailWorkflow {
        /// The failure.
        failure: Failure,
    },
    /// Close the run as canceled.
    CancelWorkflow {
        /// Cancellation details.
        details: Option<Payload>,
    },
    /// Close the run and start a successor.
    ContinueAsNew {
        /// Successor input.
        input: Option<Payload>,
    },
}

impl Command {
    const fn name(&self) -> &'static str {
        match self {
            Self::ScheduleActivity { .. } => "ScheduleActivity",
            Self::RequestCancelActivity { .. } => "RequestCancelActivity",
            Self::StartTimer { .. } => "StartTimer",
            Self::CancelTimer { .. } => "CancelTimer",
            Self::StartChildWorkflow { .. } => "StartChildWorkflow",
            Self::CompleteUpdate { .. } => "CompleteUpdate",
            Self::CompleteWorkflow { .. } => "CompleteWorkflow",
            Self::FailWorkflow { .. } => "FailWorkflow",
            Self::CancelWorkflow { .. } => "CancelWorkflow",
            Self::ContinueAsNew { .. } => "ContinueAsNew",
        }
    }
}

/// Completes the started workflow task and applies its commands.
#[derive(Debug, Clone, PartialEq)]
pub struct RespondWorkflowTaskCompleted {
    /// Event ID of `WorkflowTaskScheduled`.
    pub scheduled_event_id: i64,
    /// Worker identity.
    pub identity: String,
    /// Commands, applied in order.
    pub commands: Vec<Command>,
    /// Worker-specific queue for the next workflow task.
    pub sticky_task_queue: Option<String>,
}

/// Result of completing a workflow task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkflowTaskCompletion {
    /// A new workflow task was scheduled for buffered events.
    pub new_workflow_task: Option<i64>,
    /// The run closed into this successor.
    pub successor_run_id: Option<RunId>,
}

impl UpdateOperation for RespondWorkflowTaskCompleted {
    type Output = WorkflowTaskCompletion;
    const NAME: &'static str = "respond_workflow_task_completed";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, WorkflowTaskCompletion)> {
        let started_event_id = started_task(ctx, self.scheduled_event_id)?;
        ctx.record(EventAttributes::WorkflowTaskCompleted {
            scheduled_event_id: self.scheduled_event_id,
            started_event_id,
            identity: self.identity,
        })?;

        let mut completion = WorkflowTaskCompletion::default();
        for command in self.commands {
            if !ctx.state().is_running() {
                return Err(Error::invalid_argument(format!(
                    "{} after the workflow closed",
                    command.name()
                )));
            }
            if let Some(successor) = apply_command(ctx, command)? {
                completion.successor_run_id = Some(successor);
            }
        }

        if ctx.state().is_running() {
            if self.sticky_task_queue.is_some() {
                ctx.state_mut()
                    .execution_mut()
                    .sticky_task_queue
                    .clone_from(&self.sticky_task_queue);
            }
            if ctx.state().has_buffered_events() {
                let now = ctx.now();
                completion.new_workflow_task = ctx.run().schedule_workflow_task(now)?;
            }
        }
        Ok((UpdateAction::UPDATE, completion))
    }
}

fn started_task(ctx: &UpdateContext, scheduled_event_id: i64) -> Result<i64> {
    ctx.state()
        .workflow_task()
        .filter(|wt| wt.scheduled_event_id == scheduled_event_id)
        .and_then(|wt| wt.started_event_id)
        .ok_or_else(|| {
            Error::task_not_found(format!(
                "workflow task {scheduled_event_id} is not started on {}",
                ctx.state().key()
            ))
        })
}

fn apply_command(ctx: &mut UpdateContext, command: Command) -> Result<Option<RunId>> {
    let key = ctx.state().key().clone();
    match command {
        Command::ScheduleActivity {
            activity_id,
            activity_type,
            task_queue,
            max_attempts,
        } => {
            if ctx.state().activity(&activity_id).is_some() {
                return Err(Error::invalid_argument(format!(
                    "activity {activity_id} already scheduled"
                )));
            }
            let task_queue =
                task_queue.unwrap_or_else(|| ctx.state().execution().task_queue.clone());
            let scheduled_event_id = ctx.record(EventAttributes::ActivityTaskScheduled {
                activity_id: activity_id.clone(),
                activity_type,
                task_queue: task_queue.clone(),
                max_attempts,
            })?;
            ctx.add_task(HistoryTask::ActivityTask {
                key,
                activity_id,
                scheduled_event_id,
                attempt: 1,
                task_queue,
            });
        }
        Command::RequestCancelActivity { activity_id } => {
            let activity = ctx.state().activity(&activity_id).ok_or_else(|| {
                Error::ActivityNotFound {
                    selector: format!("id {activity_id}"),
                }
            })?;
            if !activity.state.is_terminal() {
                ctx.record(EventAttributes::ActivityTaskCanceled {
                    activity_id,
                    details: None,
                    identity: "workflow".to_string(),
                })?;
            }
        }
        Command::StartTimer {
            timer_id,
            fire_after,
        } => {
            if ctx.state().timers().contains_key(&timer_id) {
                return Err(Error::invalid_argument(format!(
                    "timer {timer_id} already started"
                )));
            }
            let delay = Duration::from_std(fire_after)
                .map_err(|_| Error::invalid_argument(format!("timer {timer_id} delay out of range")))?;
            let fire_at = ctx.now() + delay;
            ctx.record(EventAttributes::TimerStarted {
                timer_id: timer_id.clone(),
                fire_at,
            })?;
            ctx.add_task(HistoryTask::UserTimer {
                key,
                timer_id,
                fire_at,
            });
        }
        Command::CancelTimer { timer_id } => {
            let started_event_id = ctx
                .state()
                .timers()
                .get(&timer_id)
                .map(|t| t.started_event_id)
                .ok_or_else(|| Error::not_found("timer", &timer_id))?;
            ctx.record(EventAttributes::TimerCanceled {
                timer_id,
                started_event_id,
            })?;
        }
        Command::StartChildWorkflow {
            workflow_id,
            workflow_type,
            task_queue,
            input,
        } => {
            let task_queue =
                task_queue.unwrap_or_else(|| ctx.state().execution().task_queue.clone());
            let initiated_event_id =
                ctx.record(EventAttributes::StartChildWorkflowExecutionInitiated {
                    workflow_id: workflow_id.clone(),
                    workflow_type: workflow_type.clone(),
                    task_queue: task_queue.clone(),
                    input: input.clone(),
                })?;
            ctx.add_task(HistoryTask::StartChildExecution {
                key,
                initiated_event_id,
                workflow_id,
                workflow_type,
                task_queue,
                input,
            });
        }
        Command::CompleteUpdate {
            update_id,
            result,
            failure,
        } => {
            let update = ctx
                .state()
                .updates()
                .get(&update_id)
                .ok_or_else(|| Error::not_found("workflow update", &update_id))?;
            if !update.completed {
                ctx.record(EventAttributes::WorkflowExecutionUpdateCompleted {
                    update_id,
                    result,
                    failure,
                })?;
            }
        }
        Command::CompleteWorkflow { result } => {
            close_workflow(
                ctx,
                EventAttributes::WorkflowExecutionCompleted {
                    result,
                    new_execution_run_id: None,
                },
            )?;
        }
        Command::FailWorkflow { failure } => return fail_or_retry(ctx, Some(failure)),
        Command::CancelWorkflow { details } => {
            close_workflow(ctx, EventAttributes::WorkflowExecutionCanceled { details })?;
        }
        Command::ContinueAsNew { input } => {
            let new_run_id = RunId::generate();
            let draft = successor_draft(ctx.state(), new_run_id, input.clone(), 1, ctx.now())?;
            close_workflow(
                ctx,
                EventAttributes::WorkflowExecutionContinuedAsNew {
                    new_execution_run_id: new_run_id,
                    input,
                },
            )?;
            ctx.continue_as(draft);
            return Ok(Some(new_run_id));
        }
    }
    Ok(None)
}

/// Fails the pending workflow task and schedules the next attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RespondWorkflowTaskFailed {
    /// Event ID of `WorkflowTaskScheduled`.
    pub scheduled_event_id: i64,
    /// Why the task failed.
    pub cause: WorkflowTaskFailedCause,
    /// Failure details.
    pub failure: Option<Failure>,
}

impl UpdateOperation for RespondWorkflowTaskFailed {
    type Output = i64;
    const NAME: &'static str = "respond_workflow_task_failed";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, i64)> {
        let started_event_id = started_task(ctx, self.scheduled_event_id)?;
        let attempt = ctx
            .state()
            .workflow_task()
            .map_or(1, |wt| wt.attempt.saturating_add(1));
        ctx.record(EventAttributes::WorkflowTaskFailed {
            scheduled_event_id: self.scheduled_event_id,
            started_event_id: Some(started_event_id),
            cause: self.cause,
            failure: self.failure,
        })?;
        let now = ctx.now();
        let next = ctx
            .run()
            .schedule_workflow_task_attempt(attempt, now)?
            .ok_or_else(|| Error::internal("workflow task not rescheduled after failure"))?;
        Ok((UpdateAction::UPDATE, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::Fixture;
    use crate::events::RetryPolicy;
    use crate::state::{ActivityState, WorkflowStatus};

    #[tokio::test]
    async fn started_is_idempotent_per_request() {
        let f = Fixture::started().await;
        let scheduled = f.state().await.workflow_task().unwrap().scheduled_event_id;
        let record = |request_id: &str| RecordWorkflowTaskStarted {
            scheduled_event_id: scheduled,
            identity: "worker".into(),
            request_id: request_id.into(),
        };
        let first = f.update(record("poll-1")).await.unwrap();
        let again = f.update(record("poll-1")).await.unwrap();
        assert_eq!(first, again);

        let err = f.update(record("poll-2")).await.unwrap_err();
        assert!(matches!(err, Error::TaskNotFound { .. }));
    }

    #[tokio::test]
    async fn completion_schedules_activity_and_timer() {
        let f = Fixture::started().await;
        f.complete_workflow_task(vec![
            Command::ScheduleActivity {
                activity_id: "A1".into(),
                activity_type: "charge".into(),
                task_queue: None,
                max_attempts: 3,
            },
            Command::StartTimer {
                timer_id: "t1".into(),
                fire_after: std::time::Duration::from_secs(60),
            },
        ])
        .await
        .unwrap();

        let state = f.state().await;
        assert_eq!(state.activity("A1").unwrap().state, ActivityState::Scheduled);
        assert!(state.timers().contains_key("t1"));
        assert!(state.workflow_task().is_none());
        let kinds: Vec<_> = f.tasks.taken().iter().map(|t| t.task.kind()).collect();
        assert!(kinds.contains(&"activity_task"));
        assert!(kinds.contains(&"user_timer"));
    }

    #[tokio::test]
    async fn command_after_close_is_rejected() {
        let f = Fixture::started().await;
        let err = f
            .complete_workflow_task(vec![
                Command::CompleteWorkflow { result: None },
                Command::StartTimer {
                    timer_id: "late".into(),
                    fire_after: std::time::Duration::from_secs(1),
                },
            ])
            .await
            .unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(f.state().await.is_running());
    }

    #[tokio::test]
    async fn failed_task_is_rescheduled_with_next_attempt() {
        let f = Fixture::started().await;
        let scheduled = f.start_workflow_task().await;
        let next = f
            .update(RespondWorkflowTaskFailed {
                scheduled_event_id: scheduled,
                cause: WorkflowTaskFailedCause::WorkerFailure,
                failure: Some(Failure::new("panic")),
            })
            .await
            .unwrap();
        let wt = f.state().await.workflow_task().cloned().unwrap();
        assert_eq!(wt.scheduled_event_id, next);
        assert_eq!(wt.attempt, 2);
    }

    #[tokio::test]
    async fn continue_as_new_starts_successor() {
        let f = Fixture::started().await;
        let completion = f
            .complete_workflow_task(vec![Command::ContinueAsNew {
                input: Some(serde_json::json!({"page": 2})),
            }])
            .await
            .unwrap();
        let successor = completion.successor_run_id.unwrap();

        let closed = f.state().await;
        assert_eq!(closed.status(), WorkflowStatus::ContinuedAsNew);
        let next = f.txn.read(&f.key.with_run(successor)).await.unwrap();
        assert!(next.is_running());
        assert_eq!(next.execution().continued_from_run_id, Some(f.key.run_id));
        assert_eq!(next.execution().first_run_id, f.key.run_id);
        assert!(next.workflow_task().is_some());
    }

    #[tokio::test]
    async fn retryable_failure_retries_into_new_run() {
        let f = Fixture::start(
            Fixture::request().with_retry_policy(RetryPolicy {
                maximum_attempts: 2,
                initial_interval: std::time::Duration::ZERO,
            }),
        )
        .await;
        let completion = f
            .complete_workflow_task(vec![Command::FailWorkflow {
                failure: Failure::new("boom"),
            }])
            .await
            .unwrap();
        let retry = f.txn.read(&f.key.with_run(completion.successor_run_id.unwrap())).await.unwrap();
        assert_eq!(retry.execution().attempt, 2);
        assert_eq!(f.state().await.status(), WorkflowStatus::Failed);

        // The second attempt exhausts the policy.
        let g = f.with_key(retry.key().clone());
        let completion = g
            .complete_workflow_task(vec![Command::FailWorkflow {
                failure: Failure::new("boom"),
            }])
            .await
            .unwrap();
        assert!(completion.successor_run_id.is_none());
    }
}
