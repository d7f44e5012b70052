//! Workflow reset.
//!
//! A reset creates a new run whose history is a prefix of the base run's
//! history, ending just before a workflow task finish event. The workflow
//! task that was in flight at that point is failed with cause
//! `ResetWorkflow` and a fresh one is scheduled. The base run, if still
//! running, is terminated in the same commit without firing its callbacks;
//! the new run carries the callbacks in `Standby` and fires them when it
//! closes on its own.

use strand_core::{RunId, WorkflowKey};

use crate::error::{Error, Result};
use crate::events::{EventAttributes, HistoryEvent, WorkflowTaskFailedCause};
use crate::persistence;
use crate::state::ResetRecord;
use crate::transaction::{
    NewRunPolicy, RunDraft, TransactionEngine, UpdateAction, UpdateContext, UpdateOperation,
};

use super::outstanding_tasks;

/// Request to reset a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetWorkflowRequest {
    /// The base run.
    pub key: WorkflowKey,
    /// Why the run is reset; recorded on the base run's termination.
    pub reason: String,
    /// A `WorkflowTaskStarted`, `WorkflowTaskCompleted` or
    /// `WorkflowTaskFailed` event of the base run. History before it is kept.
    pub workflow_task_finish_event_id: i64,
    /// Client request ID; repeating it returns the run created first.
    pub request_id: String,
}

/// Resets a run, returning the new run's ID.
///
/// # Errors
///
/// `InvalidArgument` for a bad finish event or when a newer run of the
/// workflow is running, plus transaction errors.
#[tracing::instrument(
    skip(txn, request),
    fields(
        base = %request.key,
        finish_event_id = request.workflow_task_finish_event_id,
        new_run_id = tracing::field::Empty,
    )
)]
pub async fn reset_workflow_execution(
    txn: &TransactionEngine,
    request: ResetWorkflowRequest,
) -> Result<RunId> {
    let key = &request.key;
    let base = txn.read(key).await?;
    if let Some(record) = base.resets().iter().find(|r| r.request_id == request.request_id) {
        return Ok(record.new_run_id);
    }

    let store = txn.checker().shard().store();
    let history = persistence::decode_events(&store.read_history(key, 0).await?)?;
    let finish = request.workflow_task_finish_event_id;
    let prefix = reset_prefix(&history, finish)?;

    let current = store.current_run(&key.namespace_id, &key.workflow_id).await?;
    if let Some(current_run) = current.filter(|r| *r != key.run_id) {
        let current_key = key.with_run(current_run);
        match txn.read(&current_key).await {
            Ok(state) if state.is_running() => {
                return Err(Error::invalid_argument(format!(
                    "cannot reset {key}: run {current_run} of the workflow is running"
                )));
            }
            Ok(_) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
    }

    let new_key = key.with_run(RunId::generate());
    let draft = reset_draft(new_key.clone(), prefix, chrono::Utc::now())?;
    tracing::Span::current().record("new_run_id", tracing::field::display(new_key.run_id));

    let op = ResetBaseRun {
        reason: request.reason,
        request_id: request.request_id,
        draft,
        expected_current: current,
    };
    let new_run_id = txn
        .get_and_update_workflow_with_new(key, op, NewRunPolicy::AllowSuccessor)
        .await?;
    tracing::info!(%new_run_id, "workflow reset");
    Ok(new_run_id)
}

fn reset_prefix(history: &[HistoryEvent], finish: i64) -> Result<Vec<HistoryEvent>> {
    let finish_event = history
        .iter()
        .find(|e| e.event_id == finish)
        .ok_or_else(|| {
            Error::invalid_argument(format!("reset event {finish} is not in the run's history"))
        })?;
    if !matches!(
        finish_event.attributes,
        EventAttributes::WorkflowTaskStarted { .. }
            | EventAttributes::WorkflowTaskCompleted { .. }
            | EventAttributes::WorkflowTaskFailed { .. }
    ) {
        return Err(Error::invalid_argument(format!(
            "reset event {finish} is {}, not a workflow task finish event",
            finish_event.attributes.event_type()
        )));
    }
    Ok(history
        .iter()
        .take_while(|e| e.event_id < finish)
        .cloned()
        .collect())
}

fn reset_draft(
    key: WorkflowKey,
    prefix: Vec<HistoryEvent>,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<RunDraft> {
    let mut draft = RunDraft::from_history(key, prefix)?;
    let Some(wt) = draft.state().workflow_task().cloned() else {
        return Err(Error::invalid_argument(
            "reset point has no workflow task in flight",
        ));
    };
    draft.record(
        EventAttributes::WorkflowTaskFailed {
            scheduled_event_id: wt.scheduled_event_id,
            started_event_id: wt.started_event_id,
            cause: WorkflowTaskFailedCause::ResetWorkflow,
            failure: None,
        },
        now,
    )?;
    for task in outstanding_tasks(draft.state(), now) {
        draft.add_task(task);
    }
    draft.schedule_workflow_task(now)?;
    Ok(draft)
}

struct ResetBaseRun {
    reason: String,
    request_id: String,
    draft: RunDraft,
    expected_current: Option<RunId>,
}

impl UpdateOperation for ResetBaseRun {
    type Output = RunId;
    const NAME: &'static str = "reset_workflow_execution";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, RunId)> {
        if let Some(record) = ctx
            .state()
            .resets()
            .iter()
            .find(|r| r.request_id == self.request_id)
        {
            return Ok((UpdateAction::NOOP, record.new_run_id));
        }
        let new_run_id = self.draft.key().run_id;
        if ctx.state().is_running() {
            ctx.record(EventAttributes::WorkflowExecutionTerminated {
                reason: self.reason,
                identity: "history-service".to_string(),
            })?;
            ctx.state_mut().execution_mut().successor_run_id = Some(new_run_id);
        }
        ctx.state_mut().add_reset(ResetRecord {
            request_id: self.request_id,
            new_run_id,
        });
        ctx.start_successor(self.draft, self.expected_current);
        Ok((UpdateAction::UPDATE, new_run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::Fixture;
    use crate::api::workflow_task::Command;
    use crate::state::{CallbackState, CallbackTarget, WorkflowStatus};

    async fn completed_run() -> (Fixture, i64) {
        let f = Fixture::start(
            Fixture::request().with_callback(CallbackTarget::new("http://localhost/cb")),
        )
        .await;
        let scheduled = f.start_workflow_task().await;
        f.update(crate::api::workflow_task::RespondWorkflowTaskCompleted {
            scheduled_event_id: scheduled,
            identity: "worker".into(),
            commands: vec![Command::CompleteWorkflow { result: None }],
            sticky_task_queue: None,
        })
        .await
        .unwrap();
        // Events: 1 started, 2 scheduled, 3 started, 4 completed (task), 5 closed.
        (f, 4)
    }

    fn request(f: &Fixture, finish: i64, request_id: &str) -> ResetWorkflowRequest {
        ResetWorkflowRequest {
            key: f.key.clone(),
            reason: "bad deploy".into(),
            workflow_task_finish_event_id: finish,
            request_id: request_id.into(),
        }
    }

    #[tokio::test]
    async fn reset_before_close_leaves_callbacks_independent() {
        let (f, finish) = completed_run().await;
        let base = f.state().await;
        assert_eq!(base.callbacks()[0].state, CallbackState::Scheduled);

        let new_run = reset_workflow_execution(&f.txn, request(&f, finish, "r1"))
            .await
            .unwrap();

        // The base run's callback entry is untouched by the reset.
        let base_after = f.state().await;
        assert_eq!(base_after.callbacks(), base.callbacks());

        let reset = f.txn.read(&f.key.with_run(new_run)).await.unwrap();
        assert!(reset.is_running());
        assert_eq!(reset.callbacks()[0].state, CallbackState::Standby);
        assert_eq!(reset.callbacks()[0].attempt, 0);
        let wt = reset.workflow_task().unwrap();
        assert!(!wt.is_started());
    }

    #[tokio::test]
    async fn repeated_request_id_returns_same_run() {
        let (f, finish) = completed_run().await;
        let first = reset_workflow_execution(&f.txn, request(&f, finish, "r1"))
            .await
            .unwrap();
        let second = reset_workflow_execution(&f.txn, request(&f, finish, "r1"))
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn running_base_is_terminated() {
        let f = Fixture::started().await;
        f.start_workflow_task().await;
        let new_run = reset_workflow_execution(&f.txn, request(&f, 3, "r1"))
            .await
            .unwrap();
        let base = f.state().await;
        assert_eq!(base.status(), WorkflowStatus::Terminated);
        assert_eq!(base.execution().successor_run_id, Some(new_run));
        assert_eq!(base.callbacks().len(), 0);
    }

    #[tokio::test]
    async fn running_base_with_callback_does_not_fire_it() {
        let f = Fixture::start(
            Fixture::request().with_callback(CallbackTarget::new("http://localhost/cb")),
        )
        .await;
        f.start_workflow_task().await;
        f.tasks.taken();

        // Events: 1 started, 2 scheduled, 3 started (task).
        let new_run = reset_workflow_execution(&f.txn, request(&f, 3, "r1"))
            .await
            .unwrap();

        let base = f.state().await;
        assert_eq!(base.status(), WorkflowStatus::Terminated);
        assert_eq!(base.callbacks()[0].state, CallbackState::Standby);
        assert_eq!(base.callbacks()[0].attempt, 0);
        assert!(matches!(
            f.events().await.last().map(|e| &e.attributes),
            Some(EventAttributes::WorkflowExecutionTerminated { .. })
        ));

        let reset = f.txn.read(&f.key.with_run(new_run)).await.unwrap();
        assert_eq!(reset.status(), WorkflowStatus::Running);
        assert_eq!(reset.callbacks()[0].state, CallbackState::Standby);
        assert_eq!(reset.callbacks()[0].attempt, 0);
        assert!(
            f.tasks
                .taken()
                .iter()
                .all(|t| !matches!(t.task, crate::tasks::HistoryTask::CallbackInvocation { .. }))
        );
    }

    #[tokio::test]
    async fn non_workflow_task_event_is_rejected() {
        let (f, _) = completed_run().await;
        let err = reset_workflow_execution(&f.txn, request(&f, 1, "r1"))
            .await
            .unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[tokio::test]
    async fn newer_running_run_blocks_reset() {
        let (f, finish) = completed_run().await;
        let newer = reset_workflow_execution(&f.txn, request(&f, finish, "r1"))
            .await
            .unwrap();
        assert_ne!(newer, f.key.run_id);
        let err = reset_workflow_execution(&f.txn, request(&f, finish, "r2"))
            .await
            .unwrap_err();
        assert!(err.is_invalid_argument());
    }
}
