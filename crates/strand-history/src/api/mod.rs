//! History service operations.
//!
//! Each operation is one [`UpdateOperation`](crate::transaction::UpdateOperation)
//! run through the transaction engine, plus, where the operation needs I/O
//! before the transaction (current-run lookup, history reads), a thin
//! async handler. The [`Engine`](crate::engine::Engine) façade delegates here.

pub mod activity;
pub mod child;
pub mod describe;
pub mod lifecycle;
pub mod maintenance;
pub mod pause_activity;
pub mod query;
pub mod reset;
pub mod start;
pub mod timer;
pub mod update;
pub mod workflow_task;

#[cfg(test)]
pub(crate) mod testing;

use chrono::{DateTime, Utc};

use strand_core::RunId;

use crate::callbacks::operations::trigger_closed_callbacks;
use crate::error::{Error, Result};
use crate::events::{EventAttributes, Failure};
use crate::state::{ActivityState, CallbackState, MutableState};
use crate::tasks::HistoryTask;
use crate::transaction::{RunDraft, UpdateContext};

use self::start::StartSpec;

/// Records a close event on the run in `ctx`.
///
/// A run that closes without a successor fires its callbacks and, if it is
/// a child, reports to its parent, all in the same commit. A run that
/// closes into a successor does neither; the successor inherits both.
pub(crate) fn close_workflow(ctx: &mut UpdateContext, attributes: EventAttributes) -> Result<i64> {
    if !attributes.is_close_event() {
        return Err(Error::internal(format!(
            "{} is not a close event",
            attributes.event_type()
        )));
    }
    let event_id = ctx.record(attributes)?;

    let execution = ctx.state().execution();
    if execution.successor_run_id.is_none() {
        let parent = execution.parent.clone();
        let outcome = execution.outcome.clone();
        trigger_closed_callbacks(ctx)?;
        if let (Some(parent), Some(outcome)) = (parent, outcome) {
            let child = ctx.state().key().clone();
            ctx.add_task(HistoryTask::RecordChildCompletion {
                child,
                parent,
                outcome,
            });
        }
    }
    Ok(event_id)
}

/// Builds the start of a successor run of `state`.
///
/// The successor keeps the chain's first and original run IDs, the parent
/// link, the retry policy and the run timeout, and receives every callback
/// target as a fresh registration.
pub(crate) fn successor_draft(
    state: &MutableState,
    new_run_id: RunId,
    input: Option<crate::events::Payload>,
    attempt: u32,
    now: DateTime<Utc>,
) -> Result<RunDraft> {
    let execution = state.execution();
    let spec = StartSpec {
        workflow_type: execution.workflow_type.clone(),
        task_queue: execution.task_queue.clone(),
        input,
        callbacks: state.callbacks().iter().map(|c| c.target.clone()).collect(),
        retry_policy: execution.retry_policy.clone(),
        run_timeout: execution.run_timeout,
        parent: execution.parent.clone(),
        request_id: uuid::Uuid::new_v4().to_string(),
        first_run_id: Some(execution.first_run_id),
        original_run_id: Some(execution.original_run_id),
        continued_from_run_id: Some(execution.key.run_id),
        attempt,
    };
    let mut draft = spec.begin(state.key().with_run(new_run_id), now)?;
    draft.schedule_workflow_task(now)?;
    Ok(draft)
}

/// Closes the run as failed or timed out, retrying into a successor when
/// the workflow retry policy allows it.
///
/// Returns the successor's run ID when one was staged.
pub(crate) fn fail_or_retry(
    ctx: &mut UpdateContext,
    failure: Option<Failure>,
) -> Result<Option<RunId>> {
    let execution = ctx.state().execution();
    let retryable = failure.as_ref().is_none_or(|f| !f.non_retryable);
    let retry = retryable
        && execution
            .retry_policy
            .as_ref()
            .is_some_and(|p| p.allows_retry_after(execution.attempt));

    let successor = if retry {
        let new_run_id = RunId::generate();
        let input = execution.input.clone();
        let attempt = execution.attempt + 1;
        Some(successor_draft(ctx.state(), new_run_id, input, attempt, ctx.now())?)
    } else {
        None
    };
    let new_execution_run_id = successor.as_ref().map(|d| d.key().run_id);

    let attributes = match failure {
        Some(failure) => EventAttributes::WorkflowExecutionFailed {
            failure,
            new_execution_run_id,
        },
        None => EventAttributes::WorkflowExecutionTimedOut {
            new_execution_run_id,
        },
    };
    close_workflow(ctx, attributes)?;
    if let Some(draft) = successor {
        ctx.continue_as(draft);
    }
    Ok(new_execution_run_id)
}

/// Regenerates the transfer tasks implied by `state`.
///
/// Used after a reset and by `refresh_workflow_tasks`; duplicates of tasks
/// already queued are harmless because every task handler checks state.
pub(crate) fn outstanding_tasks(state: &MutableState, now: DateTime<Utc>) -> Vec<HistoryTask> {
    let key = state.key();
    let mut tasks = Vec::new();
    if !state.is_running() {
        for callback in state.callbacks() {
            if matches!(
                callback.state,
                CallbackState::Scheduled | CallbackState::BackingOff
            ) {
                tasks.push(HistoryTask::CallbackInvocation {
                    key: key.clone(),
                    callback_id: callback.id,
                    fire_at: callback.next_attempt_schedule_time.unwrap_or(now),
                });
            }
        }
        return tasks;
    }

    if let Some(wt) = state.workflow_task() {
        tasks.push(HistoryTask::WorkflowTask {
            key: key.clone(),
            scheduled_event_id: wt.scheduled_event_id,
            task_queue: wt.task_queue.clone(),
        });
    }
    for activity in state.activities().values() {
        if activity.state == ActivityState::Scheduled {
            tasks.push(HistoryTask::ActivityTask {
                key: key.clone(),
                activity_id: activity.activity_id.clone(),
                scheduled_event_id: activity.scheduled_event_id,
                attempt: activity.attempt,
                task_queue: activity.task_queue.clone(),
            });
        }
    }
    for timer in state.timers().values() {
        tasks.push(HistoryTask::UserTimer {
            key: key.clone(),
            timer_id: timer.timer_id.clone(),
            fire_at: timer.fire_at,
        });
    }
    if let Some(timeout) = state.execution().run_timeout {
        if let Ok(timeout) = chrono::Duration::from_std(timeout) {
            tasks.push(HistoryTask::RunTimeout {
                key: key.clone(),
                fire_at: state.execution().start_time + timeout,
            });
        }
    }
    tasks
}
