//! Starting runs.

use std::time::Duration;

use chrono::{DateTime, Utc};

use strand_core::{NamespaceId, RunId, WorkflowId, WorkflowKey};

use crate::callbacks::CallbackPolicy;
use crate::error::{Error, Result};
use crate::events::{EventAttributes, ParentExecution, Payload, RetryPolicy};
use crate::state::CallbackTarget;
use crate::tasks::HistoryTask;
use crate::transaction::{RunDraft, TransactionEngine};

use super::lifecycle::SignalWorkflow;

/// Everything recorded in a run's `WorkflowExecutionStarted` event.
#[derive(Debug, Clone, PartialEq)]
pub struct StartSpec {
    /// Workflow type name.
    pub workflow_type: String,
    /// Task queue for workflow tasks.
    pub task_queue: String,
    /// Start input.
    pub input: Option<Payload>,
    /// Callbacks, registered in order with IDs `0..n`.
    pub callbacks: Vec<CallbackTarget>,
    /// Workflow retry policy.
    pub retry_policy: Option<RetryPolicy>,
    /// Run timeout.
    pub run_timeout: Option<Duration>,
    /// Parent, for child workflows.
    pub parent: Option<ParentExecution>,
    /// Client request ID, for idempotent starts.
    pub request_id: String,
    /// First run of the chain; the new run itself when `None`.
    pub first_run_id: Option<RunId>,
    /// Original run of the chain; the new run itself when `None`.
    pub original_run_id: Option<RunId>,
    /// Predecessor run.
    pub continued_from_run_id: Option<RunId>,
    /// Workflow retry attempt.
    pub attempt: u32,
}

impl StartSpec {
    /// Creates a draft for `key` holding the started event and, when the run
    /// has a timeout, its timeout task. The first workflow task is left to
    /// the caller so other events can be recorded before it.
    ///
    /// # Errors
    ///
    /// Propagates projection errors.
    pub fn begin(self, key: WorkflowKey, now: DateTime<Utc>) -> Result<RunDraft> {
        let run_id = key.run_id;
        let run_timeout = self.run_timeout;
        let mut draft = RunDraft::new_run(key.clone());
        draft.record(
            EventAttributes::WorkflowExecutionStarted {
                workflow_type: self.workflow_type,
                task_queue: self.task_queue,
                input: self.input,
                callbacks: self.callbacks,
                first_run_id: self.first_run_id.unwrap_or(run_id),
                original_run_id: self.original_run_id.unwrap_or(run_id),
                continued_from_run_id: self.continued_from_run_id,
                attempt: self.attempt,
                retry_policy: self.retry_policy,
                run_timeout,
                parent: self.parent,
                request_id: self.request_id,
            },
            now,
        )?;
        if let Some(timeout) = run_timeout.and_then(|t| chrono::Duration::from_std(t).ok()) {
            draft.add_task(HistoryTask::RunTimeout {
                key,
                fire_at: now + timeout,
            });
        }
        Ok(draft)
    }
}

/// Request to start a workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct StartWorkflowRequest {
    /// Namespace.
    pub namespace_id: NamespaceId,
    /// Workflow ID.
    pub workflow_id: WorkflowId,
    /// Workflow type name.
    pub workflow_type: String,
    /// Task queue for workflow tasks.
    pub task_queue: String,
    /// Start input.
    pub input: Option<Payload>,
    /// Completion callbacks.
    pub callbacks: Vec<CallbackTarget>,
    /// Client request ID; repeating it returns the run it started.
    pub request_id: String,
    /// Workflow retry policy.
    pub retry_policy: Option<RetryPolicy>,
    /// Run timeout.
    pub run_timeout: Option<Duration>,
    /// Parent, for child workflows.
    pub parent: Option<ParentExecution>,
}

impl StartWorkflowRequest {
    /// Creates a request with a fresh request ID.
    #[must_use]
    pub fn new(
        namespace_id: NamespaceId,
        workflow_id: WorkflowId,
        workflow_type: impl Into<String>,
        task_queue: impl Into<String>,
    ) -> Self {
        Self {
            namespace_id,
            workflow_id,
            workflow_type: workflow_type.into(),
            task_queue: task_queue.into(),
            input: None,
            callbacks: Vec::new(),
            request_id: uuid::Uuid::new_v4().to_string(),
            retry_policy: None,
            run_timeout: None,
            parent: None,
        }
    }

    /// Sets the input.
    #[must_use]
    pub fn with_input(mut self, input: Payload) -> Self {
        self.input = Some(input);
        self
    }

    /// Adds a completion callback.
    #[must_use]
    pub fn with_callback(mut self, target: CallbackTarget) -> Self {
        self.callbacks.push(target);
        self
    }

    /// Sets the request ID.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Sets the workflow retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Sets the run timeout.
    #[must_use]
    pub const fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    fn into_spec(self) -> StartSpec {
        StartSpec {
            workflow_type: self.workflow_type,
            task_queue: self.task_queue,
            input: self.input,
            callbacks: self.callbacks,
            retry_policy: self.retry_policy,
            run_timeout: self.run_timeout,
            parent: self.parent,
            request_id: self.request_id,
            first_run_id: None,
            original_run_id: None,
            continued_from_run_id: None,
            attempt: 1,
        }
    }
}

/// Result of a start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartWorkflowResponse {
    /// The running run.
    pub run_id: RunId,
    /// False when the request matched an existing run.
    pub started: bool,
}

/// Request to signal a workflow, starting it if no run is open.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalWithStartRequest {
    /// Start parameters, used only if a new run is needed.
    pub start: StartWorkflowRequest,
    /// Signal name.
    pub signal_name: String,
    /// Signal payload.
    pub signal_input: Option<Payload>,
    /// Caller identity.
    pub identity: String,
}

/// Starts a run.
///
/// Callbacks are validated before anything else. A start whose request ID
/// matches the open run returns that run; any other start while a run is
/// open fails with `WorkflowAlreadyStarted`.
///
/// # Errors
///
/// `InvalidArgument` for callback policy violations, `WorkflowAlreadyStarted`,
/// and transaction errors.
#[tracing::instrument(
    skip(txn, policy, request),
    fields(namespace_id = %request.namespace_id, workflow_id = %request.workflow_id)
)]
pub async fn start_workflow_execution(
    txn: &TransactionEngine,
    policy: &CallbackPolicy,
    request: StartWorkflowRequest,
) -> Result<StartWorkflowResponse> {
    policy.validate(&request.callbacks)?;
    let current = open_run(txn, &request.namespace_id, &request.workflow_id).await?;
    match current {
        CurrentRun::Open { run_id, request_id } if request_id == request.request_id => {
            Ok(StartWorkflowResponse {
                run_id,
                started: false,
            })
        }
        CurrentRun::Open { run_id, .. } => Err(Error::WorkflowAlreadyStarted {
            workflow_id: request.workflow_id.to_string(),
            run_id: run_id.to_string(),
        }),
        CurrentRun::Closed(previous) => start_new(txn, request, previous, None).await,
    }
}

/// Signals the open run, or starts one with the signal as its first input.
///
/// # Errors
///
/// As [`start_workflow_execution`], plus signal errors.
#[tracing::instrument(
    skip(txn, policy, request),
    fields(namespace_id = %request.start.namespace_id, workflow_id = %request.start.workflow_id)
)]
pub async fn signal_with_start_workflow_execution(
    txn: &TransactionEngine,
    policy: &CallbackPolicy,
    request: SignalWithStartRequest,
) -> Result<StartWorkflowResponse> {
    let start = &request.start;
    let current = open_run(txn, &start.namespace_id, &start.workflow_id).await?;
    if let CurrentRun::Open { run_id, .. } = current {
        let key = WorkflowKey::new(start.namespace_id.clone(), start.workflow_id.clone(), run_id);
        let op = SignalWorkflow {
            signal_name: request.signal_name.clone(),
            input: request.signal_input.clone(),
            identity: request.identity.clone(),
            request_id: None,
        };
        match txn
            .get_and_update_workflow_with_new(&key, op, crate::transaction::NewRunPolicy::Forbid)
            .await
        {
            Ok(_) => {
                return Ok(StartWorkflowResponse {
                    run_id,
                    started: false,
                });
            }
            // Closed between the lookup and the signal: start a new run.
            Err(Error::WorkflowNotRunning { .. }) => {}
            Err(err) => return Err(err),
        }
    }

    policy.validate(&request.start.callbacks)?;
    let previous = match current {
        CurrentRun::Open { run_id, .. } => Some(run_id),
        CurrentRun::Closed(previous) => previous,
    };
    let signal = EventAttributes::WorkflowExecutionSignaled {
        signal_name: request.signal_name,
        input: request.signal_input,
        identity: request.identity,
    };
    start_new(txn, request.start, previous, Some(signal)).await
}

enum CurrentRun {
    Open { run_id: RunId, request_id: String },
    Closed(Option<RunId>),
}

async fn open_run(
    txn: &TransactionEngine,
    namespace_id: &NamespaceId,
    workflow_id: &WorkflowId,
) -> Result<CurrentRun> {
    let store = txn.checker().shard().store();
    let Some(run_id) = store.current_run(namespace_id, workflow_id).await? else {
        return Ok(CurrentRun::Closed(None));
    };
    let key = WorkflowKey::new(namespace_id.clone(), workflow_id.clone(), run_id);
    match txn.read(&key).await {
        Ok(state) if state.is_running() => Ok(CurrentRun::Open {
            run_id,
            request_id: state.execution().start_request_id.clone(),
        }),
        Ok(_) => Ok(CurrentRun::Closed(Some(run_id))),
        Err(err) if err.is_not_found() => Ok(CurrentRun::Closed(Some(run_id))),
        Err(err) => Err(err),
    }
}

async fn start_new(
    txn: &TransactionEngine,
    request: StartWorkflowRequest,
    previous: Option<RunId>,
    first_event: Option<EventAttributes>,
) -> Result<StartWorkflowResponse> {
    let now = Utc::now();
    let key = WorkflowKey::new(
        request.namespace_id.clone(),
        request.workflow_id.clone(),
        RunId::generate(),
    );
    let mut draft = request.into_spec().begin(key.clone(), now)?;
    if let Some(event) = first_event {
        draft.record(event, now)?;
    }
    draft.schedule_workflow_task(now)?;
    txn.create_workflow_execution(draft, previous).await?;
    tracing::info!(run_id = %key.run_id, "workflow started");
    Ok(StartWorkflowResponse {
        run_id: key.run_id,
        started: true,
    })
}
