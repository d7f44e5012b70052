//! Callback state transitions, each one update transaction.
//!
//! A delivery is split around the network call so no lease is held while
//! waiting on the target: [`StartCallbackAttempt`] counts the attempt and
//! returns what to send, [`CompleteCallbackAttempt`] records the outcome.
//! A crash between the two leaves the attempt counted and the transfer task
//! unacknowledged, so the next dispatch starts a new attempt.

use strand_core::WorkflowKey;

use super::client::{CompletionRequest, DeliveryError};
use crate::config::CallbackRetryPolicy;
use crate::error::{Error, Result};
use crate::state::{CallbackState, CallbackTarget, RetryDecision};
use crate::tasks::HistoryTask;
use crate::transaction::{UpdateAction, UpdateContext, UpdateOperation};

/// Everything needed to perform one delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackAttempt {
    /// The callback.
    pub callback_id: u32,
    /// Attempt number, already persisted.
    pub attempt: u32,
    /// Where to send.
    pub target: CallbackTarget,
    /// What to send.
    pub request: CompletionRequest,
}

/// Moves `Standby` callbacks of a closing run to `Scheduled` and queues
/// their delivery in the same commit.
///
/// Only called when the run closes without a successor; a successor
/// receives the targets in its own start event instead.
pub(crate) fn trigger_closed_callbacks(ctx: &mut UpdateContext) -> Result<usize> {
    let key = ctx.state().key().clone();
    let now = ctx.now();
    let pending: Vec<u32> = ctx
        .state()
        .callbacks()
        .iter()
        .filter(|c| c.state == CallbackState::Standby)
        .map(|c| c.id)
        .collect();
    for &callback_id in &pending {
        if let Some(callback) = ctx.state_mut().callback_mut(callback_id) {
            callback.schedule()?;
        }
        ctx.add_task(HistoryTask::CallbackInvocation {
            key: key.clone(),
            callback_id,
            fire_at: now,
        });
    }
    Ok(pending.len())
}

/// Counts a new delivery attempt.
///
/// Returns `None` when the callback no longer needs delivery (already
/// terminal, or never triggered), which makes a duplicate or stale
/// invocation task harmless.
#[derive(Debug, Clone, Copy)]
pub struct StartCallbackAttempt {
    /// The callback.
    pub callback_id: u32,
}

impl UpdateOperation for StartCallbackAttempt {
    type Output = Option<CallbackAttempt>;
    const NAME: &'static str = "start_callback_attempt";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, Self::Output)> {
        let key: WorkflowKey = ctx.state().key().clone();
        let execution = ctx.state().execution();
        let (Some(outcome), Some(close_time)) = (execution.outcome.clone(), execution.close_time)
        else {
            return Err(Error::internal(format!(
                "callback {} of {key} invoked while the run is open",
                self.callback_id
            )));
        };

        let callback = ctx
            .state_mut()
            .callback_mut(self.callback_id)
            .ok_or_else(|| Error::not_found("callback", self.callback_id))?;
        if callback.state.is_terminal() || callback.state == CallbackState::Standby {
            return Ok((UpdateAction::NOOP, None));
        }

        let attempt = callback.begin_attempt()?;
        let target = callback.target.clone();
        Ok((
            UpdateAction::UPDATE,
            Some(CallbackAttempt {
                callback_id: self.callback_id,
                attempt,
                target,
                request: CompletionRequest::from_outcome(&key, &outcome, close_time),
            }),
        ))
    }
}

/// Records the outcome of a delivery attempt.
///
/// A result for an attempt other than the one in flight is ignored.
#[derive(Debug, Clone)]
pub struct CompleteCallbackAttempt {
    /// The callback.
    pub callback_id: u32,
    /// The attempt this result belongs to.
    pub attempt: u32,
    /// Delivery result.
    pub result: std::result::Result<(), DeliveryError>,
    /// Backoff and attempt budget.
    pub retry: CallbackRetryPolicy,
}

impl UpdateOperation for CompleteCallbackAttempt {
    type Output = CallbackState;
    const NAME: &'static str = "complete_callback_attempt";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, CallbackState)> {
        let key = ctx.state().key().clone();
        let now = ctx.now();
        let callback = ctx
            .state_mut()
            .callback_mut(self.callback_id)
            .ok_or_else(|| Error::not_found("callback", self.callback_id))?;
        if callback.attempt != self.attempt || callback.state != CallbackState::Scheduled {
            return Ok((UpdateAction::NOOP, callback.state));
        }

        let retry_at = match self.result {
            Ok(()) => {
                callback.record_success(now)?;
                None
            }
            Err(err) => {
                let decision = self.retry.decide(self.attempt, err.is_retryable(), now);
                callback.record_failure(now, err.to_string(), decision)?;
                match decision {
                    RetryDecision::RetryAt(fire_at) => Some(fire_at),
                    RetryDecision::GiveUp => None,
                }
            }
        };
        let state = callback.state;
        if let Some(fire_at) = retry_at {
            ctx.add_task(HistoryTask::CallbackInvocation {
                key,
                callback_id: self.callback_id,
                fire_at,
            });
        }
        Ok((UpdateAction::UPDATE, state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::Fixture;
    use crate::api::workflow_task::Command;

    async fn closed_with_callback() -> (Fixture, u32) {
        let f = Fixture::start(
            Fixture::request().with_callback(CallbackTarget::new("http://localhost/cb")),
        )
        .await;
        f.complete_workflow_task(vec![Command::CompleteWorkflow { result: None }])
            .await
            .unwrap();
        f.tasks.taken();
        let callback_id = f.state().await.callbacks()[0].id;
        (f, callback_id)
    }

    async fn begin(f: &Fixture, callback_id: u32) -> u32 {
        f.update(StartCallbackAttempt { callback_id })
            .await
            .unwrap()
            .expect("callback needs delivery")
            .attempt
    }

    fn complete(
        callback_id: u32,
        attempt: u32,
        result: std::result::Result<(), DeliveryError>,
    ) -> CompleteCallbackAttempt {
        CompleteCallbackAttempt {
            callback_id,
            attempt,
            result,
            retry: CallbackRetryPolicy::default(),
        }
    }

    #[tokio::test]
    async fn transient_failure_backs_off_and_queues_retry() {
        let (f, id) = closed_with_callback().await;
        let attempt = begin(&f, id).await;
        assert_eq!(attempt, 1);

        let state = f
            .update(complete(
                id,
                attempt,
                Err(DeliveryError::Transport {
                    message: "connection refused".into(),
                }),
            ))
            .await
            .unwrap();
        assert_eq!(state, CallbackState::BackingOff);

        let callback = f.state().await.callbacks()[0].clone();
        assert_eq!(callback.state, CallbackState::BackingOff);
        let tasks = f.tasks.taken();
        assert_eq!(tasks.len(), 1);
        assert!(matches!(
            tasks[0].task,
            HistoryTask::CallbackInvocation { callback_id, fire_at, .. }
                if callback_id == id && Some(fire_at) == callback.next_attempt_schedule_time
        ));

        let attempt = begin(&f, id).await;
        assert_eq!(attempt, 2);
        let state = f.update(complete(id, attempt, Ok(()))).await.unwrap();
        assert_eq!(state, CallbackState::Succeeded);
        assert!(f.tasks.taken().is_empty());
    }

    #[tokio::test]
    async fn permanent_failure_fails_without_retry() {
        let (f, id) = closed_with_callback().await;
        let attempt = begin(&f, id).await;
        let state = f
            .update(complete(
                id,
                attempt,
                Err(DeliveryError::InvalidRequest {
                    message: "bad header".into(),
                }),
            ))
            .await
            .unwrap();
        assert_eq!(state, CallbackState::Failed);
        assert!(f.tasks.taken().is_empty());
        assert!(f.update(StartCallbackAttempt { callback_id: id }).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_attempt_result_is_ignored() {
        let (f, id) = closed_with_callback().await;
        let attempt = begin(&f, id).await;
        f.update(complete(id, attempt, Ok(()))).await.unwrap();

        let state = f
            .update(complete(id, attempt, Err(DeliveryError::Timeout)))
            .await
            .unwrap();
        assert_eq!(state, CallbackState::Succeeded);
        assert_eq!(f.state().await.callbacks()[0].attempt, 1);
    }
}
