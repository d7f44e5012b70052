//! Parent-side bookkeeping for child workflows.

use strand_core::{RunId, WorkflowKey};

use crate::error::{Error, Result};
use crate::events::{EventAttributes, WorkflowOutcome};
use crate::persistence;
use crate::transaction::{TransactionEngine, UpdateAction, UpdateContext, UpdateOperation};

/// Records a child's outcome on its parent.
///
/// A completion already recorded, or one arriving after the parent closed,
/// is ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordChildExecutionCompleted {
    /// Event ID of `StartChildWorkflowExecutionInitiated` in the parent.
    pub initiated_event_id: i64,
    /// The child run that closed.
    pub child_run_id: RunId,
    /// How the child ended.
    pub outcome: WorkflowOutcome,
}

impl UpdateOperation for RecordChildExecutionCompleted {
    type Output = bool;
    const NAME: &'static str = "record_child_execution_completed";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, bool)> {
        if !ctx.state().is_running() {
            return Ok((UpdateAction::NOOP, false));
        }
        let child = ctx
            .state()
            .children()
            .get(&self.initiated_event_id)
            .ok_or_else(|| Error::not_found("child execution", self.initiated_event_id))?;
        if child.outcome.is_some() {
            return Ok((UpdateAction::NOOP, false));
        }
        ctx.record(EventAttributes::ChildWorkflowExecutionCompleted {
            initiated_event_id: self.initiated_event_id,
            child_run_id: self.child_run_id,
            outcome: self.outcome,
        })?;
        Ok((UpdateAction::UPDATE_WITH_WORKFLOW_TASK, true))
    }
}

/// Checks that a child's completion reached its parent.
///
/// Succeeds when the completion is recorded or the parent has closed.
///
/// # Errors
///
/// `NotFound` while the completion is still outstanding, or for an unknown
/// child.
pub async fn verify_child_execution_completion_recorded(
    txn: &TransactionEngine,
    parent: &WorkflowKey,
    initiated_event_id: i64,
) -> Result<()> {
    let state = txn.read(parent).await?;
    let child = state
        .children()
        .get(&initiated_event_id)
        .ok_or_else(|| Error::not_found("child execution", initiated_event_id))?;
    if child.outcome.is_some() || !state.is_running() {
        return Ok(());
    }
    Err(Error::not_found(
        "child completion",
        format!("{parent}#{initiated_event_id}"),
    ))
}

/// Checks that a run has had its first workflow task scheduled.
///
/// # Errors
///
/// `NotFound` if no workflow task was ever scheduled on a running run.
pub async fn verify_first_workflow_task_scheduled(
    txn: &TransactionEngine,
    key: &WorkflowKey,
) -> Result<()> {
    let state = txn.read(key).await?;
    if !state.is_running() || state.workflow_task().is_some() {
        return Ok(());
    }
    let store = txn.checker().shard().store();
    let events = persistence::decode_events(&store.read_history(key, 0).await?)?;
    if events
        .iter()
        .any(|e| matches!(e.attributes, EventAttributes::WorkflowTaskScheduled { .. }))
    {
        return Ok(());
    }
    Err(Error::not_found("first workflow task", key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::Fixture;
    use crate::api::workflow_task::Command;

    async fn with_child() -> (Fixture, i64) {
        let f = Fixture::started().await;
        f.complete_workflow_task(vec![Command::StartChildWorkflow {
            workflow_id: "child-1".into(),
            workflow_type: "ship".into(),
            task_queue: None,
            input: None,
        }])
        .await
        .unwrap();
        let initiated = *f.state().await.children().keys().next().unwrap();
        (f, initiated)
    }

    #[tokio::test]
    async fn completion_recorded_once() {
        let (f, initiated) = with_child().await;
        assert!(
            verify_child_execution_completion_recorded(&f.txn, &f.key, initiated)
                .await
                .unwrap_err()
                .is_not_found()
        );

        let record = || RecordChildExecutionCompleted {
            initiated_event_id: initiated,
            child_run_id: RunId::generate(),
            outcome: WorkflowOutcome::Completed { result: None },
        };
        assert!(f.update(record()).await.unwrap());
        assert!(!f.update(record()).await.unwrap());
        verify_child_execution_completion_recorded(&f.txn, &f.key, initiated)
            .await
            .unwrap();
        assert!(f.state().await.workflow_task().is_some());
    }

    #[tokio::test]
    async fn started_run_has_first_workflow_task() {
        let f = Fixture::started().await;
        verify_first_workflow_task_scheduled(&f.txn, &f.key)
            .await
            .unwrap();
    }
}
