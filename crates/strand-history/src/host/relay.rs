//! Cross-run and timer task execution.
//!
//! The relay processes the transfer tasks that act on a run other than the
//! one that produced them (child start, child completion) and the timer
//! tasks that act on their own run once their fire time passes.

use std::sync::Arc;

use async_trait::async_trait;

use strand_core::{ExecutionStore, RunId, WorkflowId, WorkflowKey};

use super::EngineRouter;
use super::pump::TaskHandler;
use crate::api::child::RecordChildExecutionCompleted;
use crate::api::start::StartWorkflowRequest;
use crate::api::timer::FireTimer;
use crate::error::{Error, Result};
use crate::events::{Failure, ParentExecution, Payload, WorkflowOutcome};
use crate::tasks::{HistoryTask, QueuedTask};

/// Executes child, completion and timer tasks against the owning engines.
pub(crate) struct ExecutionRelay {
    router: EngineRouter,
    store: Arc<dyn ExecutionStore>,
}

impl ExecutionRelay {
    pub(crate) fn new(router: EngineRouter, store: Arc<dyn ExecutionStore>) -> Self {
        Self { router, store }
    }

    #[tracing::instrument(skip(self, parent, input), fields(parent = %parent))]
    async fn start_child(
        &self,
        parent: &WorkflowKey,
        initiated_event_id: i64,
        workflow_id: &str,
        workflow_type: &str,
        task_queue: &str,
        input: Option<Payload>,
    ) -> Result<()> {
        let request_id = format!("{}:{initiated_event_id}", parent.run_id);
        let workflow_id = match WorkflowId::new(workflow_id) {
            Ok(id) => id,
            Err(err) => {
                let failure = Failure::non_retryable(format!("invalid child workflow ID: {err}"));
                return self
                    .fail_child(parent, initiated_event_id, RunId::generate(), failure)
                    .await;
            }
        };
        if self
            .already_started(parent, &workflow_id, &request_id)
            .await?
        {
            return Ok(());
        }

        let mut request = StartWorkflowRequest::new(
            parent.namespace_id.clone(),
            workflow_id,
            workflow_type,
            task_queue,
        )
        .with_request_id(request_id);
        request.input = input;
        request.parent = Some(ParentExecution {
            key: parent.clone(),
            initiated_event_id,
        });

        let engine = self
            .router
            .engine_for(&request.namespace_id, &request.workflow_id)?;
        match engine.start_workflow_execution(request).await {
            Ok(response) => {
                tracing::debug!(child_run_id = %response.run_id, "child started");
                Ok(())
            }
            Err(Error::WorkflowAlreadyStarted {
                workflow_id,
                run_id,
            }) => {
                let running: RunId = run_id.parse()?;
                let failure = Failure::non_retryable(format!(
                    "child workflow {workflow_id} is already running as {run_id}"
                ));
                self.fail_child(parent, initiated_event_id, running, failure)
                    .await
            }
            Err(err) => Err(err),
        }
    }

    /// Returns true if a previous attempt of this start already created the child.
    async fn already_started(
        &self,
        parent: &WorkflowKey,
        workflow_id: &WorkflowId,
        request_id: &str,
    ) -> Result<bool> {
        let Some(run_id) = self
            .store
            .current_run(&parent.namespace_id, workflow_id)
            .await?
        else {
            return Ok(false);
        };
        let key = WorkflowKey::new(parent.namespace_id.clone(), workflow_id.clone(), run_id);
        let engine = self.router.engine_for_key(&key)?;
        match engine.get_mutable_state(&key).await {
            Ok(state) => Ok(state.execution().start_request_id == request_id),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn fail_child(
        &self,
        parent: &WorkflowKey,
        initiated_event_id: i64,
        child_run_id: RunId,
        failure: Failure,
    ) -> Result<()> {
        tracing::warn!(initiated_event_id, reason = %failure.message, "child start failed");
        self.record_completion(
            parent,
            RecordChildExecutionCompleted {
                initiated_event_id,
                child_run_id,
                outcome: WorkflowOutcome::Failed { failure },
            },
        )
        .await
    }

    async fn record_completion(
        &self,
        parent: &WorkflowKey,
        request: RecordChildExecutionCompleted,
    ) -> Result<()> {
        let engine = self.router.engine_for_key(parent)?;
        match engine.record_child_execution_completed(parent, request).await {
            Ok(recorded) => {
                tracing::debug!(%parent, recorded, "child completion delivered");
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                tracing::debug!(%parent, "parent is gone; child completion dropped");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl TaskHandler for ExecutionRelay {
    const NAME: &'static str = "execution_relay";

    fn accepts(task: &HistoryTask) -> bool {
        matches!(
            task,
            HistoryTask::StartChildExecution { .. }
                | HistoryTask::RecordChildCompletion { .. }
                | HistoryTask::UserTimer { .. }
                | HistoryTask::RunTimeout { .. }
        )
    }

    async fn handle(&self, task: &QueuedTask) -> Result<()> {
        match &task.task {
            HistoryTask::StartChildExecution {
                key,
                initiated_event_id,
                workflow_id,
                workflow_type,
                task_queue,
                input,
            } => {
                self.start_child(
                    key,
                    *initiated_event_id,
                    workflow_id,
                    workflow_type,
                    task_queue,
                    input.clone(),
                )
                .await
            }
            HistoryTask::RecordChildCompletion {
                child,
                parent,
                outcome,
            } => {
                let request = RecordChildExecutionCompleted {
                    initiated_event_id: parent.initiated_event_id,
                    child_run_id: child.run_id,
                    outcome: outcome.clone(),
                };
                self.record_completion(&parent.key, request).await
            }
            HistoryTask::UserTimer { key, timer_id, .. } => {
                let engine = self.router.engine_for_key(key)?;
                let request = FireTimer {
                    timer_id: timer_id.clone(),
                };
                match engine.fire_timer(key, request).await {
                    Ok(_) => Ok(()),
                    Err(err) if err.is_not_found() => Ok(()),
                    Err(err) => Err(err),
                }
            }
            HistoryTask::RunTimeout { key, .. } => {
                let engine = self.router.engine_for_key(key)?;
                match engine.timeout_workflow_execution(key).await {
                    Ok(timed_out) => {
                        if timed_out {
                            tracing::info!(run = %key, "run timed out");
                        }
                        Ok(())
                    }
                    Err(err) if err.is_not_found() => Ok(()),
                    Err(err) => Err(err),
                }
            }
            other => Err(Error::internal(format!(
                "{} is not a relay task",
                other.kind()
            ))),
        }
    }
}
