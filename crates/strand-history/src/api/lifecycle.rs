//! Signal, cancel, terminate, delete and run timeout.

use strand_core::WorkflowKey;

use crate::error::{Error, Result};
use crate::events::{EventAttributes, Payload};
use crate::lease::LeaseMode;
use crate::transaction::{
    NewRunPolicy, TransactionEngine, UpdateAction, UpdateContext, UpdateOperation,
};

use super::{close_workflow, fail_or_retry};

/// Records a signal and schedules a workflow task.
///
/// A repeated `request_id` is a no-op.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalWorkflow {
    /// Signal name.
    pub signal_name: String,
    /// Signal payload.
    pub input: Option<Payload>,
    /// Caller identity.
    pub identity: String,
    /// Deduplication ID.
    pub request_id: Option<String>,
}

impl UpdateOperation for SignalWorkflow {
    type Output = ();
    const NAME: &'static str = "signal_workflow_execution";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, ())> {
        if let Some(request_id) = &self.request_id {
            if ctx.state().has_signal_request(request_id) {
                return Ok((UpdateAction::NOOP, ()));
            }
        }
        ctx.record(EventAttributes::WorkflowExecutionSignaled {
            signal_name: self.signal_name,
            input: self.input,
            identity: self.identity,
        })?;
        if let Some(request_id) = self.request_id {
            ctx.state_mut().add_signal_request(request_id);
        }
        Ok((UpdateAction::UPDATE_WITH_WORKFLOW_TASK, ()))
    }
}

/// Records a cancellation request. Repeated requests are no-ops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestCancelWorkflow {
    /// Why cancellation was requested.
    pub reason: String,
    /// Caller identity.
    pub identity: String,
}

impl UpdateOperation for RequestCancelWorkflow {
    type Output = ();
    const NAME: &'static str = "request_cancel_workflow_execution";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, ())> {
        if !ctx.state().is_running() {
            return Err(Error::WorkflowNotRunning {
                key: ctx.state().key().clone(),
            });
        }
        if ctx.state().execution().cancel_requested {
            return Ok((UpdateAction::NOOP, ()));
        }
        ctx.record(EventAttributes::WorkflowExecutionCancelRequested {
            reason: self.reason,
            identity: self.identity,
        })?;
        Ok((UpdateAction::UPDATE_WITH_WORKFLOW_TASK, ()))
    }
}

/// Closes the run as terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminateWorkflow {
    /// Termination reason.
    pub reason: String,
    /// Caller identity.
    pub identity: String,
}

impl UpdateOperation for TerminateWorkflow {
    type Output = ();
    const NAME: &'static str = "terminate_workflow_execution";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, ())> {
        close_workflow(
            ctx,
            EventAttributes::WorkflowExecutionTerminated {
                reason: self.reason,
                identity: self.identity,
            },
        )?;
        Ok((UpdateAction::UPDATE, ()))
    }
}

/// Fired by the run timeout task. A closed run ignores it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutWorkflow;

impl UpdateOperation for TimeoutWorkflow {
    type Output = bool;
    const NAME: &'static str = "timeout_workflow_execution";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, bool)> {
        if !ctx.state().is_running() {
            return Ok((UpdateAction::NOOP, false));
        }
        fail_or_retry(ctx, None)?;
        Ok((UpdateAction::UPDATE, true))
    }
}

/// Deletes a run, terminating it first if it is still running.
///
/// # Errors
///
/// `NotFound` for unknown runs, plus transaction and store errors.
#[tracing::instrument(skip(txn), fields(run = %key))]
pub async fn delete_workflow_execution(txn: &TransactionEngine, key: &WorkflowKey) -> Result<()> {
    let state = txn.read(key).await?;
    if state.is_running() {
        let terminate = TerminateWorkflow {
            reason: "deleted".to_string(),
            identity: "history-service".to_string(),
        };
        match txn
            .get_and_update_workflow_with_new(key, terminate, NewRunPolicy::Forbid)
            .await
        {
            Ok(()) | Err(Error::WorkflowNotRunning { .. }) => {}
            Err(err) => return Err(err),
        }
    }

    let mut lease = txn.checker().acquire(key, LeaseMode::MustExist).await?;
    let shard = txn.checker().shard();
    shard.assert_owned().await?;
    let result = shard.store().delete_run(shard.id(), shard.token(), key).await;
    lease.invalidate();
    result?;
    tracing::info!("workflow execution deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::Fixture;
    use crate::state::WorkflowStatus;

    fn signal(request_id: Option<&str>) -> SignalWorkflow {
        SignalWorkflow {
            signal_name: "go".into(),
            input: None,
            identity: "client".into(),
            request_id: request_id.map(String::from),
        }
    }

    #[tokio::test]
    async fn duplicate_signal_request_is_noop() {
        let f = Fixture::started().await;
        f.update(signal(Some("s-1"))).await.unwrap();
        let after_first = f.state().await.history_length();
        f.update(signal(Some("s-1"))).await.unwrap();
        assert_eq!(f.state().await.history_length(), after_first);
    }

    #[tokio::test]
    async fn cancel_request_is_recorded_once() {
        let f = Fixture::started().await;
        let cancel = || RequestCancelWorkflow {
            reason: "stop".into(),
            identity: "client".into(),
        };
        f.update(cancel()).await.unwrap();
        let len = f.state().await.history_length();
        f.update(cancel()).await.unwrap();
        let state = f.state().await;
        assert!(state.execution().cancel_requested);
        assert_eq!(state.history_length(), len);
    }

    #[tokio::test]
    async fn terminate_closes_run_and_rejects_signals() {
        let f = Fixture::started().await;
        f.update(TerminateWorkflow {
            reason: "ops".into(),
            identity: "admin".into(),
        })
        .await
        .unwrap();
        assert_eq!(f.state().await.status(), WorkflowStatus::Terminated);

        let err = f.update(signal(None)).await.unwrap_err();
        assert!(matches!(err, Error::WorkflowNotRunning { .. }));
    }

    #[tokio::test]
    async fn delete_removes_run() {
        let f = Fixture::started().await;
        delete_workflow_execution(&f.txn, &f.key).await.unwrap();
        let err = f.txn.read(&f.key).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
