//! Update transaction engine.
//!
//! [`TransactionEngine::get_and_update_workflow_with_new`] is the single
//! primitive through which run state changes:
//!
//! 1. Acquire the run's lease (errors propagate unchanged).
//! 2. Run the [`UpdateOperation`] against a working copy of the state. The
//!    operation is pure: it records events, adds tasks and may stage a
//!    successor run, but performs no I/O.
//! 3. On error, release the lease; nothing is persisted.
//! 4. On [`UpdateAction::NOOP`], release the lease without writing.
//! 5. Otherwise persist with the version captured at lease acquisition as
//!    precondition. A failed precondition is [`ConcurrentUpdate`]; the
//!    engine never retries.
//! 6. If requested, a workflow task is scheduled in the same commit.
//! 7. A staged successor run is written in the same commit as the
//!    predecessor's close event.
//! 8. Release the lease, then hand committed tasks to listeners.
//!
//! Shard ownership is re-validated immediately before the write.
//!
//! [`ConcurrentUpdate`]: strand_core::Error::ConcurrentUpdate

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use strand_core::{
    CommitBatch, CurrentRunPrecondition, QueueCategory, RunId, RunWrite, WorkflowKey,
    WritePrecondition, WriteResult,
};

use crate::error::{Error, Result};
use crate::events::{EventAttributes, HistoryEvent};
use crate::lease::{ConsistencyChecker, Lease, LeaseMode};
use crate::metrics::{HistoryMetrics, TimingGuard};
use crate::persistence;
use crate::replication::ReplicationTask;
use crate::state::MutableState;
use crate::tasks::{HistoryTask, QueuedTask, TaskListener};

/// What the engine should do with an operation's mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateAction {
    /// Skip persistence entirely.
    pub noop: bool,
    /// Schedule a workflow task in the same commit.
    pub create_workflow_task: bool,
}

impl UpdateAction {
    /// Nothing changed.
    pub const NOOP: Self = Self {
        noop: true,
        create_workflow_task: false,
    };
    /// Persist without scheduling a workflow task.
    pub const UPDATE: Self = Self {
        noop: false,
        create_workflow_task: false,
    };
    /// Persist and schedule a workflow task.
    pub const UPDATE_WITH_WORKFLOW_TASK: Self = Self {
        noop: false,
        create_workflow_task: true,
    };
}

/// Whether an operation may close its run into a successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewRunPolicy {
    /// Staging a successor is a programming error.
    Forbid,
    /// Continue-as-new, retry and reset may stage a successor.
    AllowSuccessor,
}

/// A typed mutation executed under a lease.
pub trait UpdateOperation: Send {
    /// Value returned to the caller on success.
    type Output: Send;

    /// Operation name for metrics and logs.
    const NAME: &'static str;

    /// Applies the mutation to the working copy in `ctx`.
    ///
    /// # Errors
    ///
    /// Any error aborts the transaction with nothing persisted.
    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, Self::Output)>;
}

/// Working copy of one run plus its pending writes.
#[derive(Debug, Clone)]
pub struct RunDraft {
    state: MutableState,
    events: Vec<HistoryEvent>,
    tasks: Vec<HistoryTask>,
}

impl RunDraft {
    /// Creates a draft for a brand-new run.
    #[must_use]
    pub fn new_run(key: WorkflowKey) -> Self {
        Self::from_state(MutableState::new(key))
    }

    /// Creates a draft over an existing state.
    #[must_use]
    pub const fn from_state(state: MutableState) -> Self {
        Self {
            state,
            events: Vec::new(),
            tasks: Vec::new(),
        }
    }

    /// Creates a draft for a brand-new run whose history starts with
    /// `events`, all of which are written with the run.
    ///
    /// # Errors
    ///
    /// Returns projection errors for events the state machine rejects.
    pub fn from_history(key: WorkflowKey, events: Vec<HistoryEvent>) -> Result<Self> {
        let mut state = MutableState::new(key);
        for event in &events {
            state.apply_event(event)?;
        }
        Ok(Self {
            state,
            events,
            tasks: Vec::new(),
        })
    }

    /// Returns the working state.
    #[must_use]
    pub const fn state(&self) -> &MutableState {
        &self.state
    }

    /// Returns the working state for non-event mutation.
    pub fn state_mut(&mut self) -> &mut MutableState {
        &mut self.state
    }

    /// Returns the run's key.
    #[must_use]
    pub const fn key(&self) -> &WorkflowKey {
        self.state.key()
    }

    /// Records an event, applying it to the working state.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowNotRunning` once the run is closed, or the
    /// projection's error if the event contradicts the state.
    pub fn record(&mut self, attributes: EventAttributes, now: DateTime<Utc>) -> Result<i64> {
        if !self.state.is_running() {
            return Err(Error::WorkflowNotRunning {
                key: self.state.key().clone(),
            });
        }
        let event = HistoryEvent {
            event_id: self.state.next_event_id(),
            event_time: now,
            attributes,
        };
        self.state.apply_event(&event)?;
        let id = event.event_id;
        self.events.push(event);
        Ok(id)
    }

    /// Adds a transfer task to the commit.
    pub fn add_task(&mut self, task: HistoryTask) {
        self.tasks.push(task);
    }

    /// Schedules a workflow task unless one is pending or the run is closed.
    ///
    /// Returns the scheduled event ID when a task was created.
    ///
    /// # Errors
    ///
    /// Propagates projection errors.
    pub fn schedule_workflow_task(&mut self, now: DateTime<Utc>) -> Result<Option<i64>> {
        self.schedule_workflow_task_attempt(1, now)
    }

    pub(crate) fn schedule_workflow_task_attempt(
        &mut self,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        if !self.state.is_running() || self.state.workflow_task().is_some() {
            return Ok(None);
        }
        let info = self.state.execution();
        let task_queue = info
            .sticky_task_queue
            .clone()
            .unwrap_or_else(|| info.task_queue.clone());
        let id = self.record(
            EventAttributes::WorkflowTaskScheduled {
                task_queue: task_queue.clone(),
                attempt,
            },
            now,
        )?;
        let key = self.key().clone();
        self.add_task(HistoryTask::WorkflowTask {
            key,
            scheduled_event_id: id,
            task_queue,
        });
        Ok(Some(id))
    }

    /// Returns events recorded in this draft.
    #[must_use]
    pub fn events(&self) -> &[HistoryEvent] {
        &self.events
    }

    /// Returns tasks added in this draft.
    #[must_use]
    pub fn tasks(&self) -> &[HistoryTask] {
        &self.tasks
    }
}

#[derive(Debug)]
struct StagedSuccessor {
    draft: RunDraft,
    expected_current: Option<RunId>,
}

/// Mutable view handed to an [`UpdateOperation`].
#[derive(Debug)]
pub struct UpdateContext {
    run: RunDraft,
    successor: Option<StagedSuccessor>,
    now: DateTime<Utc>,
}

impl UpdateContext {
    fn new(run: RunDraft, now: DateTime<Utc>) -> Self {
        Self {
            run,
            successor: None,
            now,
        }
    }

    /// Returns the transaction timestamp.
    #[must_use]
    pub const fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Returns the working state.
    #[must_use]
    pub const fn state(&self) -> &MutableState {
        self.run.state()
    }

    /// Returns the working state for non-event mutation.
    pub fn state_mut(&mut self) -> &mut MutableState {
        self.run.state_mut()
    }

    /// Returns the run draft.
    pub fn run(&mut self) -> &mut RunDraft {
        &mut self.run
    }

    /// Records an event at the transaction timestamp.
    ///
    /// # Errors
    ///
    /// See [`RunDraft::record`].
    pub fn record(&mut self, attributes: EventAttributes) -> Result<i64> {
        self.run.record(attributes, self.now)
    }

    /// Adds a transfer task.
    pub fn add_task(&mut self, task: HistoryTask) {
        self.run.add_task(task);
    }

    /// Stages a successor that replaces this run as the workflow's current run.
    pub fn continue_as(&mut self, successor: RunDraft) {
        let expected_current = Some(self.state().key().run_id);
        self.start_successor(successor, expected_current);
    }

    /// Stages a successor, requiring the workflow's current run to be
    /// `expected_current` at commit time.
    pub fn start_successor(&mut self, successor: RunDraft, expected_current: Option<RunId>) {
        self.successor = Some(StagedSuccessor {
            draft: successor,
            expected_current,
        });
    }

    /// Returns the staged successor.
    #[must_use]
    pub fn successor(&self) -> Option<&RunDraft> {
        self.successor.as_ref().map(|s| &s.draft)
    }
}

/// Broadcast after every commit, for long polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryNotification {
    /// The run that changed.
    pub key: WorkflowKey,
    /// The run's next event ID after the commit.
    pub next_event_id: i64,
    /// Whether the run is still running.
    pub is_running: bool,
}

struct PreparedRun {
    state: MutableState,
    events: Vec<HistoryEvent>,
    precondition: WritePrecondition,
    make_current: bool,
    current_run: CurrentRunPrecondition,
}

/// Runs update transactions for one shard.
pub struct TransactionEngine {
    checker: Arc<ConsistencyChecker>,
    listeners: Vec<Arc<dyn TaskListener>>,
    notifications: broadcast::Sender<HistoryNotification>,
    replication_source: Option<String>,
    metrics: HistoryMetrics,
}

impl std::fmt::Debug for TransactionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionEngine")
            .field("shard", self.checker.shard())
            .field("listeners", &self.listeners.len())
            .field("replication_source", &self.replication_source)
            .finish_non_exhaustive()
    }
}

impl TransactionEngine {
    /// Creates an engine over `checker`.
    ///
    /// When `replication_source` is set, every commit also publishes a
    /// replication task tagged with that cluster name.
    #[must_use]
    pub fn new(
        checker: Arc<ConsistencyChecker>,
        listeners: Vec<Arc<dyn TaskListener>>,
        replication_source: Option<String>,
        metrics: HistoryMetrics,
    ) -> Self {
        let (notifications, _) = broadcast::channel(1024);
        Self {
            checker,
            listeners,
            notifications,
            replication_source,
            metrics,
        }
    }

    /// Returns the consistency checker.
    #[must_use]
    pub fn checker(&self) -> &Arc<ConsistencyChecker> {
        &self.checker
    }

    /// Subscribes to commit notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HistoryNotification> {
        self.notifications.subscribe()
    }

    /// Loads the committed state of a run without mutating it.
    ///
    /// # Errors
    ///
    /// Returns lease errors (`NotFound`, `ShardOwnershipLost`, `LeaseTimeout`).
    pub async fn read(&self, key: &WorkflowKey) -> Result<MutableState> {
        let lease = self.checker.acquire(key, LeaseMode::MustExist).await?;
        Ok(lease.existing()?.state.clone())
    }

    /// Runs `op` against the run `key` and persists its effects.
    ///
    /// # Errors
    ///
    /// Propagates lease errors and the operation's own error unchanged;
    /// returns `ConcurrentUpdate` when another writer won the race and
    /// `ShardOwnershipLost` when the shard moved.
    #[tracing::instrument(
        skip(self, op),
        fields(
            op = O::NAME,
            namespace_id = %key.namespace_id,
            workflow_id = %key.workflow_id,
            run_id = %key.run_id,
        )
    )]
    pub async fn get_and_update_workflow_with_new<O: UpdateOperation>(
        &self,
        key: &WorkflowKey,
        op: O,
        policy: NewRunPolicy,
    ) -> Result<O::Output> {
        let _timer = TimingGuard::new(|d| self.metrics.observe_transaction_duration(O::NAME, d));

        let lease = self.checker.acquire(key, LeaseMode::MustExist).await?;
        let committed = lease.existing()?;
        let version = committed.version;
        let mut ctx = UpdateContext::new(RunDraft::from_state(committed.state.clone()), Utc::now());

        let (action, output) = match op.apply(&mut ctx) {
            Ok(result) => result,
            Err(err) => {
                self.metrics.record_transaction(O::NAME, "rejected");
                tracing::debug!(error = %err, "update operation rejected");
                return Err(err);
            }
        };

        if action.noop {
            self.metrics.record_transaction(O::NAME, "noop");
            return Ok(output);
        }
        if ctx.successor.is_some() && policy == NewRunPolicy::Forbid {
            self.metrics.record_transaction(O::NAME, "rejected");
            return Err(Error::internal(format!(
                "{} staged a successor run under NewRunPolicy::Forbid",
                O::NAME
            )));
        }

        let UpdateContext {
            mut run,
            successor,
            now,
        } = ctx;
        if action.create_workflow_task {
            run.schedule_workflow_task(now)?;
        }

        let mut tasks = run.tasks;
        let current = PreparedRun {
            state: run.state,
            events: run.events,
            precondition: WritePrecondition::MatchesVersion(version),
            make_current: false,
            current_run: CurrentRunPrecondition::Unchecked,
        };
        let successor = successor.map(|staged| {
            tasks.extend(staged.draft.tasks);
            PreparedRun {
                state: staged.draft.state,
                events: staged.draft.events,
                precondition: WritePrecondition::DoesNotExist,
                make_current: true,
                current_run: CurrentRunPrecondition::Expect(staged.expected_current),
            }
        });

        self.persist(O::NAME, lease, current, successor, tasks).await?;
        Ok(output)
    }

    /// Persists a brand-new run as the workflow's current run.
    ///
    /// `expected_current` is the current run observed by the caller; a
    /// different value at commit time yields `ConcurrentUpdate`.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowAlreadyStarted` if the run ID is taken, plus the
    /// errors of [`TransactionEngine::get_and_update_workflow_with_new`].
    #[tracing::instrument(
        skip(self, draft),
        fields(
            namespace_id = %draft.key().namespace_id,
            workflow_id = %draft.key().workflow_id,
            run_id = %draft.key().run_id,
        )
    )]
    pub async fn create_workflow_execution(
        &self,
        draft: RunDraft,
        expected_current: Option<RunId>,
    ) -> Result<()> {
        const NAME: &str = "create_workflow_execution";
        let _timer = TimingGuard::new(|d| self.metrics.observe_transaction_duration(NAME, d));

        let key = draft.key().clone();
        let lease = self.checker.acquire(&key, LeaseMode::AllowCreate).await?;
        if lease.current().is_some() {
            return Err(Error::WorkflowAlreadyStarted {
                workflow_id: key.workflow_id.to_string(),
                run_id: key.run_id.to_string(),
            });
        }
        let prepared = PreparedRun {
            state: draft.state,
            events: draft.events,
            precondition: WritePrecondition::DoesNotExist,
            make_current: true,
            current_run: CurrentRunPrecondition::Expect(expected_current),
        };
        self.persist(NAME, lease, prepared, None, draft.tasks).await
    }

    /// Applies replicated events to a run, creating it if needed.
    ///
    /// Events already present are skipped; a batch starting past the
    /// run's next event ID is rejected as a gap.
    ///
    /// # Errors
    ///
    /// Returns an internal error for gaps and projection errors for events
    /// the state machine rejects, plus commit errors.
    pub(crate) async fn apply_replicated_events(
        &self,
        key: &WorkflowKey,
        events: Vec<HistoryEvent>,
    ) -> Result<ReplicatedOutcome> {
        const NAME: &str = "apply_replicated_events";

        let lease = self.checker.acquire(key, LeaseMode::AllowCreate).await?;
        let (mut state, precondition, make_current) = match lease.current() {
            Some(existing) => (
                existing.state.clone(),
                WritePrecondition::MatchesVersion(existing.version),
                false,
            ),
            None => (MutableState::new(key.clone()), WritePrecondition::DoesNotExist, true),
        };

        let next = state.next_event_id();
        let Some(first) = events.first().map(|e| e.event_id) else {
            return Ok(ReplicatedOutcome::AlreadyApplied);
        };
        if first > next {
            return Err(Error::internal(format!(
                "replication gap on {key}: expected event {next}, batch starts at {first}"
            )));
        }
        let fresh: Vec<HistoryEvent> = events.into_iter().filter(|e| e.event_id >= next).collect();
        if fresh.is_empty() {
            return Ok(ReplicatedOutcome::AlreadyApplied);
        }
        for event in &fresh {
            state.apply_event(event)?;
        }
        let applied = fresh.len();

        let prepared = PreparedRun {
            state,
            events: fresh,
            precondition,
            make_current,
            current_run: CurrentRunPrecondition::Unchecked,
        };
        self.persist(NAME, lease, prepared, None, Vec::new()).await?;
        Ok(ReplicatedOutcome::Applied { events: applied })
    }

    async fn persist(
        &self,
        name: &'static str,
        mut lease: Lease,
        current: PreparedRun,
        successor: Option<PreparedRun>,
        tasks: Vec<HistoryTask>,
    ) -> Result<()> {
        let shard = self.checker.shard();
        if let Err(err) = shard.assert_owned().await {
            self.checker.clear();
            self.metrics.record_transaction(name, "shard_lost");
            return Err(err);
        }

        let batch = self.build_batch(&current, successor.as_ref(), &tasks)?;
        let result = shard.store().commit(shard.id(), shard.token(), batch).await;

        let outcome = match result {
            Ok(WriteResult::Committed(outcome)) => outcome,
            Ok(WriteResult::PreconditionFailed {
                key,
                current_version,
            }) => {
                lease.invalidate();
                self.metrics.record_transaction(name, "conflict");
                return Err(Error::concurrent_update(format!(
                    "run {key} changed concurrently (store version {current_version:?})"
                )));
            }
            Ok(WriteResult::CurrentRunMismatch { key, current_run }) => {
                lease.invalidate();
                self.metrics.record_transaction(name, "conflict");
                let current_run = current_run.map_or_else(|| "none".to_string(), |r| r.to_string());
                return Err(Error::concurrent_update(format!(
                    "current run of {}/{} is {current_run}",
                    key.namespace_id, key.workflow_id
                )));
            }
            Err(err) if matches!(err, strand_core::Error::ShardOwnershipLost { .. }) => {
                shard.mark_lost();
                self.checker.clear();
                self.metrics.record_transaction(name, "shard_lost");
                return Err(err.into());
            }
            Err(err) => {
                // The write may or may not have landed.
                lease.invalidate();
                self.metrics.record_transaction(name, "error");
                return Err(err.into());
            }
        };

        let notification = HistoryNotification {
            key: current.state.key().clone(),
            next_event_id: current.state.next_event_id(),
            is_running: current.state.is_running(),
        };
        let successor_notification = successor.as_ref().map(|s| HistoryNotification {
            key: s.state.key().clone(),
            next_event_id: s.state.next_event_id(),
            is_running: s.state.is_running(),
        });

        match outcome.versions.first() {
            Some(&version) if current.state.is_running() => lease.install(current.state, version),
            _ => lease.invalidate(),
        }
        drop(lease);
        self.metrics.record_transaction(name, "committed");

        let queued: Vec<QueuedTask> = outcome
            .transfer_task_ids
            .iter()
            .zip(tasks)
            .map(|(&task_id, task)| QueuedTask {
                shard_id: shard.id(),
                task_id,
                task,
            })
            .collect();
        self.notify_tasks(&queued);

        let _ = self.notifications.send(notification);
        if let Some(n) = successor_notification {
            let _ = self.notifications.send(n);
        }
        Ok(())
    }

    fn build_batch(
        &self,
        current: &PreparedRun,
        successor: Option<&PreparedRun>,
        tasks: &[HistoryTask],
    ) -> Result<CommitBatch> {
        let mut batch = CommitBatch::default();
        for run in std::iter::once(current).chain(successor) {
            batch.runs.push(RunWrite {
                key: run.state.key().clone(),
                precondition: run.precondition,
                snapshot: persistence::encode_snapshot(&run.state)?,
                append_events: persistence::encode_events(&run.events)?,
                replace_history: false,
                make_current: run.make_current,
                current_run: run.current_run,
            });
            if let (Some(source), false) = (&self.replication_source, run.events.is_empty()) {
                let task = ReplicationTask::HistoryBatch {
                    source_cluster: source.clone(),
                    key: run.state.key().clone(),
                    events: run.events.clone(),
                };
                batch
                    .replication_tasks
                    .push(persistence::encode_replication_task(&task)?);
            }
        }
        for task in tasks {
            batch.transfer_tasks.push(persistence::encode_task(task)?);
        }
        Ok(batch)
    }

    /// Hands tasks to every listener.
    pub fn notify_tasks(&self, tasks: &[QueuedTask]) {
        if tasks.is_empty() {
            return;
        }
        for listener in &self.listeners {
            listener.on_tasks(tasks);
        }
    }

    /// Broadcasts a history notification outside a commit.
    pub fn notify_history(&self, notification: HistoryNotification) {
        let _ = self.notifications.send(notification);
    }

    /// Re-offers every unacknowledged transfer task to listeners.
    ///
    /// # Errors
    ///
    /// Returns store or decoding errors.
    pub async fn recover_tasks(&self, batch_size: usize) -> Result<usize> {
        let shard = self.checker.shard();
        let store = shard.store();
        let mut after = 0;
        let mut recovered = 0;
        loop {
            let records = store
                .read_queue(shard.id(), QueueCategory::Transfer, after, batch_size)
                .await?;
            let Some(last) = records.last() else {
                break;
            };
            after = last.task_id;
            let queued = records
                .iter()
                .map(|r| {
                    Ok(QueuedTask {
                        shard_id: shard.id(),
                        task_id: r.task_id,
                        task: persistence::decode_task(&r.payload)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            recovered += queued.len();
            self.notify_tasks(&queued);
        }
        Ok(recovered)
    }
}

/// Result of applying replicated events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatedOutcome {
    /// New events were appended.
    Applied {
        /// Number of events appended.
        events: usize,
    },
    /// Every event was already present.
    AlreadyApplied,
}
