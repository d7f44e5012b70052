//! Operator and repair operations.

use strand_core::{NamespaceId, WorkflowId, WorkflowKey};

use crate::error::{Error, Result};
use crate::events::{EventAttributes, HistoryEvent};
use crate::persistence;
use crate::state::MutableState;
use crate::transaction::{
    NewRunPolicy, TransactionEngine, UpdateAction, UpdateContext, UpdateOperation,
};

use super::outstanding_tasks;

/// Forgets a signal request ID so the same request can be delivered again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveSignalMutableState {
    /// The request ID to forget.
    pub request_id: String,
}

impl UpdateOperation for RemoveSignalMutableState {
    type Output = bool;
    const NAME: &'static str = "remove_signal_mutable_state";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, bool)> {
        if ctx.state_mut().remove_signal_request(&self.request_id) {
            Ok((UpdateAction::UPDATE, true))
        } else {
            Ok((UpdateAction::NOOP, false))
        }
    }
}

/// Clears the sticky task queue so the next workflow task goes to the
/// run's normal queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResetStickyTaskQueue;

impl UpdateOperation for ResetStickyTaskQueue {
    type Output = ();
    const NAME: &'static str = "reset_sticky_task_queue";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, ())> {
        match ctx.state_mut().execution_mut().sticky_task_queue.take() {
            Some(_) => Ok((UpdateAction::UPDATE, ())),
            None => Ok((UpdateAction::NOOP, ())),
        }
    }
}

/// Re-queues every task implied by the run's state.
///
/// Returns the number of tasks queued.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshWorkflowTasks;

impl UpdateOperation for RefreshWorkflowTasks {
    type Output = usize;
    const NAME: &'static str = "refresh_workflow_tasks";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, usize)> {
        let tasks = outstanding_tasks(ctx.state(), ctx.now());
        let count = tasks.len();
        if count == 0 {
            return Ok((UpdateAction::NOOP, 0));
        }
        for task in tasks {
            ctx.add_task(task);
        }
        Ok((UpdateAction::UPDATE, count))
    }
}

struct RebuildMutableState {
    events: Vec<HistoryEvent>,
}

impl UpdateOperation for RebuildMutableState {
    type Output = ();
    const NAME: &'static str = "rebuild_mutable_state";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, ())> {
        let mut rebuilt = MutableState::replay(ctx.state().key().clone(), &self.events)?;
        if rebuilt.next_event_id() != ctx.state().next_event_id() {
            return Err(Error::concurrent_update(format!(
                "history of {} moved during rebuild ({} != {})",
                ctx.state().key(),
                rebuilt.next_event_id(),
                ctx.state().next_event_id()
            )));
        }
        rebuilt.carry_runtime_from(ctx.state());
        *ctx.state_mut() = rebuilt;
        Ok((UpdateAction::UPDATE, ()))
    }
}

/// Replaces a run's snapshot with a projection rebuilt from its history.
///
/// Fields that are not derived from events (pauses, heartbeats, callback
/// progress, sticky queue, signal and reset bookkeeping) are carried over.
///
/// # Errors
///
/// `ConcurrentUpdate` if history grew while it was read, projection
/// errors for a corrupt history, plus transaction errors.
#[tracing::instrument(skip(txn), fields(run = %key))]
pub async fn rebuild_mutable_state(txn: &TransactionEngine, key: &WorkflowKey) -> Result<()> {
    let store = txn.checker().shard().store();
    let events = persistence::decode_events(&store.read_history(key, 0).await?)?;
    txn.get_and_update_workflow_with_new(key, RebuildMutableState { events }, NewRunPolicy::Forbid)
        .await?;
    tracing::info!("mutable state rebuilt");
    Ok(())
}

struct ReapplyEvents {
    events: Vec<HistoryEvent>,
}

impl UpdateOperation for ReapplyEvents {
    type Output = usize;
    const NAME: &'static str = "reapply_events";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, usize)> {
        let mut applied = 0;
        for event in self.events {
            match event.attributes {
                attributes @ EventAttributes::WorkflowExecutionSignaled { .. } => {
                    ctx.record(attributes)?;
                    applied += 1;
                }
                EventAttributes::WorkflowExecutionUpdateAccepted {
                    update_id,
                    name,
                    args,
                } if !ctx.state().updates().contains_key(&update_id) => {
                    ctx.record(EventAttributes::WorkflowExecutionUpdateAccepted {
                        update_id,
                        name,
                        args,
                    })?;
                    applied += 1;
                }
                _ => {}
            }
        }
        if applied == 0 {
            return Ok((UpdateAction::NOOP, 0));
        }
        Ok((UpdateAction::UPDATE_WITH_WORKFLOW_TASK, applied))
    }
}

/// Re-applies the signals and updates among `events` to the workflow's
/// current run. Other event types are ignored.
///
/// Returns the number of events applied.
///
/// # Errors
///
/// `NotFound` when the workflow has no current run; `WorkflowNotRunning`
/// when the current run is closed.
#[tracing::instrument(skip(txn, events), fields(%namespace_id, %workflow_id, count = events.len()))]
pub async fn reapply_events(
    txn: &TransactionEngine,
    namespace_id: &NamespaceId,
    workflow_id: &WorkflowId,
    events: Vec<HistoryEvent>,
) -> Result<usize> {
    let store = txn.checker().shard().store();
    let run_id = store
        .current_run(namespace_id, workflow_id)
        .await?
        .ok_or_else(|| Error::not_found("workflow", format!("{namespace_id}/{workflow_id}")))?;
    let key = WorkflowKey::new(namespace_id.clone(), workflow_id.clone(), run_id);
    txn.get_and_update_workflow_with_new(&key, ReapplyEvents { events }, NewRunPolicy::Forbid)
        .await
}
