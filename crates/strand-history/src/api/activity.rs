//! Activity task lifecycle.
//!
//! Retries are recorded in mutable state only: a failed attempt with
//! retries left moves the activity back to `Scheduled` and bumps its
//! attempt without writing an event. History sees the final outcome.

use crate::error::{Error, Result};
use crate::events::{EventAttributes, Failure, Payload};
use crate::state::{ActivityInfo, ActivityState};
use crate::tasks::HistoryTask;
use crate::transaction::{UpdateAction, UpdateContext, UpdateOperation};

fn started_activity<'a>(
    ctx: &'a UpdateContext,
    activity_id: &str,
    attempt: u32,
) -> Result<&'a ActivityInfo> {
    let activity = ctx
        .state()
        .activity(activity_id)
        .ok_or_else(|| Error::ActivityNotFound {
            selector: format!("id {activity_id}"),
        })?;
    let started = activity.state == ActivityState::Started
        || activity
            .pause
            .as_ref()
            .is_some_and(|p| p.resume_state == ActivityState::Started);
    if !started || activity.attempt != attempt {
        return Err(Error::task_not_found(format!(
            "activity {activity_id} attempt {attempt} is not running (state {}, attempt {})",
            activity.state, activity.attempt
        )));
    }
    Ok(activity)
}

/// Marks a scheduled activity as picked up by a worker.
///
/// Paused activities cannot be started. A repeated call with the same
/// `request_id` returns the original result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordActivityTaskStarted {
    /// The activity.
    pub activity_id: String,
    /// Worker identity.
    pub identity: String,
    /// Poll request ID.
    pub request_id: String,
}

/// Returned to the polling worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityTaskStarted {
    /// Event ID of `ActivityTaskStarted`.
    pub started_event_id: i64,
    /// The attempt being run.
    pub attempt: u32,
    /// Details from the last heartbeat of a previous attempt.
    pub heartbeat_details: Option<Payload>,
}

impl UpdateOperation for RecordActivityTaskStarted {
    type Output = ActivityTaskStarted;
    const NAME: &'static str = "record_activity_task_started";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, ActivityTaskStarted)> {
        let activity = ctx
            .state()
            .activity(&self.activity_id)
            .ok_or_else(|| Error::ActivityNotFound {
                selector: format!("id {}", self.activity_id),
            })?;
        match activity.state {
            ActivityState::Started
                if activity.request_id.as_deref() == Some(self.request_id.as_str()) =>
            {
                let started = ActivityTaskStarted {
                    started_event_id: activity.started_event_id.unwrap_or_default(),
                    attempt: activity.attempt,
                    heartbeat_details: activity.heartbeat_details.clone(),
                };
                return Ok((UpdateAction::NOOP, started));
            }
            ActivityState::Scheduled => {}
            ActivityState::Paused => {
                return Err(Error::invalid_argument(format!(
                    "activity {} is paused",
                    self.activity_id
                )));
            }
            state => {
                return Err(Error::task_not_found(format!(
                    "activity {} is {state}",
                    self.activity_id
                )));
            }
        }
        let attempt = activity.attempt;
        let heartbeat_details = activity.heartbeat_details.clone();

        let started_event_id = ctx.record(EventAttributes::ActivityTaskStarted {
            activity_id: self.activity_id,
            attempt,
            identity: self.identity,
            request_id: self.request_id,
        })?;
        Ok((
            UpdateAction::UPDATE,
            ActivityTaskStarted {
                started_event_id,
                attempt,
                heartbeat_details,
            },
        ))
    }
}

/// Records heartbeat details for a running activity.
///
/// Returns true if the activity is paused, so the worker can stop early.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordActivityTaskHeartbeat {
    /// The activity.
    pub activity_id: String,
    /// The attempt the heartbeat belongs to.
    pub attempt: u32,
    /// Progress details.
    pub details: Option<Payload>,
}

impl UpdateOperation for RecordActivityTaskHeartbeat {
    type Output = bool;
    const NAME: &'static str = "record_activity_task_heartbeat";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, bool)> {
        started_activity(ctx, &self.activity_id, self.attempt)?;
        let now = ctx.now();
        let activity = ctx
            .state_mut()
            .activity_mut(&self.activity_id)
            .ok_or_else(|| Error::internal("activity vanished inside a transaction"))?;
        activity.heartbeat_details = self.details;
        activity.last_heartbeat_time = Some(now);
        Ok((UpdateAction::UPDATE, activity.is_paused()))
    }
}

/// Completes a running activity.
#[derive(Debug, Clone, PartialEq)]
pub struct RespondActivityTaskCompleted {
    /// The activity.
    pub activity_id: String,
    /// The attempt that completed.
    pub attempt: u32,
    /// Result payload.
    pub result: Option<Payload>,
    /// Worker identity.
    pub identity: String,
}

impl UpdateOperation for RespondActivityTaskCompleted {
    type Output = ();
    const NAME: &'static str = "respond_activity_task_completed";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, ())> {
        started_activity(ctx, &self.activity_id, self.attempt)?;
        ctx.record(EventAttributes::ActivityTaskCompleted {
            activity_id: self.activity_id,
            result: self.result,
            identity: self.identity,
        })?;
        Ok((UpdateAction::UPDATE_WITH_WORKFLOW_TASK, ()))
    }
}

/// What happened to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityFailureOutcome {
    /// Another attempt was scheduled (or will be, once unpaused).
    Retrying {
        /// The next attempt.
        attempt: u32,
    },
    /// No retries left; the failure was recorded.
    Failed,
}

/// Fails a running activity, retrying it if its budget allows.
#[derive(Debug, Clone, PartialEq)]
pub struct RespondActivityTaskFailed {
    /// The activity.
    pub activity_id: String,
    /// The attempt that failed.
    pub attempt: u32,
    /// The failure.
    pub failure: Failure,
    /// Worker identity.
    pub identity: String,
}

impl UpdateOperation for RespondActivityTaskFailed {
    type Output = ActivityFailureOutcome;
    const NAME: &'static str = "respond_activity_task_failed";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, ActivityFailureOutcome)> {
        let activity = started_activity(ctx, &self.activity_id, self.attempt)?;
        if self.failure.non_retryable || !activity.has_retries_left() {
            ctx.record(EventAttributes::ActivityTaskFailed {
                activity_id: self.activity_id,
                failure: self.failure,
                identity: self.identity,
            })?;
            return Ok((
                UpdateAction::UPDATE_WITH_WORKFLOW_TASK,
                ActivityFailureOutcome::Failed,
            ));
        }

        let key = ctx.state().key().clone();
        let activity = ctx
            .state_mut()
            .activity_mut(&self.activity_id)
            .ok_or_else(|| Error::internal("activity vanished inside a transaction"))?;
        activity.attempt += 1;
        activity.started_event_id = None;
        activity.request_id = None;
        activity.last_failure = Some(self.failure);
        match activity.pause.as_mut() {
            Some(pause) => pause.resume_state = ActivityState::Scheduled,
            None => activity.transition(ActivityState::Scheduled)?,
        }
        let attempt = activity.attempt;
        if !activity.is_paused() {
            let task = HistoryTask::ActivityTask {
                key,
                activity_id: activity.activity_id.clone(),
                scheduled_event_id: activity.scheduled_event_id,
                attempt,
                task_queue: activity.task_queue.clone(),
            };
            ctx.add_task(task);
        }
        tracing::debug!(activity_id = %self.activity_id, attempt, "activity attempt failed; retrying");
        Ok((
            UpdateAction::UPDATE,
            ActivityFailureOutcome::Retrying { attempt },
        ))
    }
}

/// Records that a running activity acknowledged cancellation.
#[derive(Debug, Clone, PartialEq)]
pub struct RespondActivityTaskCanceled {
    /// The activity.
    pub activity_id: String,
    /// The attempt that was canceled.
    pub attempt: u32,
    /// Cancellation details.
    pub details: Option<Payload>,
    /// Worker identity.
    pub identity: String,
}

impl UpdateOperation for RespondActivityTaskCanceled {
    type Output = ();
    const NAME: &'static str = "respond_activity_task_canceled";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, ())> {
        started_activity(ctx, &self.activity_id, self.attempt)?;
        ctx.record(EventAttributes::ActivityTaskCanceled {
            activity_id: self.activity_id,
            details: self.details,
            identity: self.identity,
        })?;
        Ok((UpdateAction::UPDATE_WITH_WORKFLOW_TASK, ()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::pause_activity::{ActivitySelector, PauseActivity};
    use crate::api::testing::Fixture;
    use crate::api::workflow_task::Command;

    async fn with_activity(max_attempts: u32) -> Fixture {
        let f = Fixture::started().await;
        f.complete_workflow_task(vec![Command::ScheduleActivity {
            activity_id: "A1".into(),
            activity_type: "charge".into(),
            task_queue: None,
            max_attempts,
        }])
        .await
        .unwrap();
        f.tasks.taken();
        f
    }

    fn start(request_id: &str) -> RecordActivityTaskStarted {
        RecordActivityTaskStarted {
            activity_id: "A1".into(),
            identity: "worker".into(),
            request_id: request_id.into(),
        }
    }

    fn fail(attempt: u32) -> RespondActivityTaskFailed {
        RespondActivityTaskFailed {
            activity_id: "A1".into(),
            attempt,
            failure: Failure::new("card declined"),
            identity: "worker".into(),
        }
    }

    #[tokio::test]
    async fn start_is_idempotent_per_request() {
        let f = with_activity(1).await;
        let first = f.update(start("p1")).await.unwrap();
        let again = f.update(start("p1")).await.unwrap();
        assert_eq!(first, again);
        assert!(f.update(start("p2")).await.is_err());
    }

    #[tokio::test]
    async fn failure_with_budget_retries_without_event() {
        let f = with_activity(3).await;
        f.update(start("p1")).await.unwrap();
        let len = f.state().await.history_length();

        let outcome = f.update(fail(1)).await.unwrap();
        assert_eq!(outcome, ActivityFailureOutcome::Retrying { attempt: 2 });

        let state = f.state().await;
        assert_eq!(state.history_length(), len);
        let activity = state.activity("A1").unwrap();
        assert_eq!(activity.state, ActivityState::Scheduled);
        assert_eq!(activity.attempt, 2);
        let tasks = f.tasks.taken();
        assert!(matches!(
            tasks.last().map(|t| &t.task),
            Some(HistoryTask::ActivityTask { attempt: 2, .. })
        ));
    }

    #[tokio::test]
    async fn exhausted_budget_records_failure() {
        let f = with_activity(1).await;
        f.update(start("p1")).await.unwrap();
        let outcome = f.update(fail(1)).await.unwrap();
        assert_eq!(outcome, ActivityFailureOutcome::Failed);

        let state = f.state().await;
        assert_eq!(state.activity("A1").unwrap().state, ActivityState::Failed);
        assert!(state.workflow_task().is_some());
    }

    #[tokio::test]
    async fn paused_activity_cannot_start() {
        let f = with_activity(1).await;
        f.update(PauseActivity {
            selector: ActivitySelector::Id("A1".into()),
            identity: "op".into(),
            reason: "hold".into(),
        })
        .await
        .unwrap();
        let err = f.update(start("p1")).await.unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[tokio::test]
    async fn stale_attempt_is_rejected() {
        let f = with_activity(3).await;
        f.update(start("p1")).await.unwrap();
        f.update(fail(1)).await.unwrap();
        let err = f
            .update(RespondActivityTaskCompleted {
                activity_id: "A1".into(),
                attempt: 1,
                result: None,
                identity: "worker".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TaskNotFound { .. }));
    }
}
