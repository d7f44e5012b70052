//! Mutable state projection.
//!
//! [`MutableState`] is the in-memory view of one run. Every event-derived
//! field is produced by [`MutableState::apply_event`], which is used both
//! when a live transaction records a new event and when the state is
//! rebuilt from history with [`MutableState::replay`]. The two paths can
//! therefore never disagree.
//!
//! A few fields are not derivable from events (activity pause records,
//! heartbeats, callback delivery progress, the sticky task queue). They are
//! persisted in the snapshot and carried across rebuilds with
//! [`MutableState::carry_runtime_from`].

mod activity;
mod callback;

pub use activity::{ActivityInfo, ActivityState, PauseInfo};
pub use callback::{CallbackInfo, CallbackState, CallbackTarget, CallbackTrigger, RetryDecision};

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use strand_core::{RunId, WorkflowKey};

use crate::error::{Error, Result};
use crate::events::{
    EventAttributes, FIRST_EVENT_ID, HistoryEvent, ParentExecution, Payload, RetryPolicy,
    WorkflowOutcome,
};

/// Run status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    /// Accepting events.
    #[default]
    Running,
    /// Completed successfully.
    Completed,
    /// Failed.
    Failed,
    /// Canceled.
    Canceled,
    /// Terminated.
    Terminated,
    /// Timed out.
    TimedOut,
    /// Continued as a new run.
    ContinuedAsNew,
}

/// Run-level metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionInfo {
    /// The run.
    pub key: WorkflowKey,
    /// Workflow type name.
    pub workflow_type: String,
    /// Task queue for workflow tasks.
    pub task_queue: String,
    /// Worker-specific queue, cleared by `reset_sticky_task_queue`.
    pub sticky_task_queue: Option<String>,
    /// Run status.
    pub status: WorkflowStatus,
    /// When the run started.
    pub start_time: DateTime<Utc>,
    /// When the run closed.
    pub close_time: Option<DateTime<Utc>>,
    /// First run of the chain (continue-as-new, retry, reset).
    pub first_run_id: RunId,
    /// Run this chain originally started from.
    pub original_run_id: RunId,
    /// Predecessor run, if any.
    pub continued_from_run_id: Option<RunId>,
    /// Successor run, set when the run closed into one.
    pub successor_run_id: Option<RunId>,
    /// Workflow retry attempt, starting at 1.
    pub attempt: u32,
    /// Workflow retry policy.
    pub retry_policy: Option<RetryPolicy>,
    /// Run timeout.
    pub run_timeout: Option<Duration>,
    /// Parent run, for child workflows.
    pub parent: Option<ParentExecution>,
    /// Start input.
    pub input: Option<Payload>,
    /// Request ID of the start call.
    pub start_request_id: String,
    /// Outcome once closed.
    pub outcome: Option<WorkflowOutcome>,
    /// Cancellation was requested.
    pub cancel_requested: bool,
}

/// The pending workflow task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTaskInfo {
    /// Event ID of `WorkflowTaskScheduled`.
    pub scheduled_event_id: i64,
    /// Event ID of `WorkflowTaskStarted`, once started.
    pub started_event_id: Option<i64>,
    /// Attempt, starting at 1.
    pub attempt: u32,
    /// Queue the task was dispatched to.
    pub task_queue: String,
    /// Request ID of the poll that started the task.
    pub request_id: Option<String>,
}

impl WorkflowTaskInfo {
    /// Returns true once a worker picked up the task.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.started_event_id.is_some()
    }
}

/// A started user timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerInfo {
    /// Workflow-scoped timer ID.
    pub timer_id: String,
    /// Event ID of `TimerStarted`.
    pub started_event_id: i64,
    /// When the timer fires.
    pub fire_at: DateTime<Utc>,
}

/// A child workflow started by this run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildExecutionInfo {
    /// Event ID of `StartChildWorkflowExecutionInitiated`.
    pub initiated_event_id: i64,
    /// Child workflow ID.
    pub workflow_id: String,
    /// Child workflow type.
    pub workflow_type: String,
    /// Child run, once its completion was recorded.
    pub run_id: Option<RunId>,
    /// Child outcome, once recorded.
    pub outcome: Option<WorkflowOutcome>,
}

/// A workflow update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    /// Caller-supplied update ID.
    pub update_id: String,
    /// Update handler name.
    pub name: String,
    /// Event ID of `WorkflowExecutionUpdateAccepted`.
    pub accepted_event_id: i64,
    /// Set once `WorkflowExecutionUpdateCompleted` is recorded.
    pub completed: bool,
}

/// A reset that used this run as its base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRecord {
    /// Client request ID of the reset call.
    pub request_id: String,
    /// The run created by the reset.
    pub new_run_id: RunId,
}

/// In-memory projection of one run's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutableState {
    execution: ExecutionInfo,
    next_event_id: i64,
    last_event_time: Option<DateTime<Utc>>,
    workflow_task: Option<WorkflowTaskInfo>,
    activities: BTreeMap<String, ActivityInfo>,
    timers: BTreeMap<String, TimerInfo>,
    children: BTreeMap<i64, ChildExecutionInfo>,
    callbacks: Vec<CallbackInfo>,
    updates: BTreeMap<String, UpdateInfo>,
    signal_request_ids: BTreeSet<String>,
    has_buffered_events: bool,
    resets: Vec<ResetRecord>,
}

impl MutableState {
    /// Creates an empty projection for `key`, ready for its first event.
    #[must_use]
    pub fn new(key: WorkflowKey) -> Self {
        let run_id = key.run_id;
        Self {
            execution: ExecutionInfo {
                key,
                workflow_type: String::new(),
                task_queue: String::new(),
                sticky_task_queue: None,
                status: WorkflowStatus::Running,
                start_time: DateTime::<Utc>::UNIX_EPOCH,
                close_time: None,
                first_run_id: run_id,
                original_run_id: run_id,
                continued_from_run_id: None,
                successor_run_id: None,
                attempt: 1,
                retry_policy: None,
                run_timeout: None,
                parent: None,
                input: None,
                start_request_id: String::new(),
                outcome: None,
                cancel_requested: false,
            },
            next_event_id: FIRST_EVENT_ID,
            last_event_time: None,
            workflow_task: None,
            activities: BTreeMap::new(),
            timers: BTreeMap::new(),
            children: BTreeMap::new(),
            callbacks: Vec::new(),
            updates: BTreeMap::new(),
            signal_request_ids: BTreeSet::new(),
            has_buffered_events: false,
            resets: Vec::new(),
        }
    }

    /// Rebuilds a projection from a complete history.
    ///
    /// # Errors
    ///
    /// Returns an error if the history is empty, has gaps, or contains an
    /// event the state machine rejects.
    pub fn replay(key: WorkflowKey, events: &[HistoryEvent]) -> Result<Self> {
        if events.is_empty() {
            return Err(Error::internal(format!("cannot replay empty history of {key}")));
        }
        let mut state = Self::new(key);
        for event in events {
            state.apply_event(event)?;
        }
        Ok(state)
    }

    /// Applies one event to the projection.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the event ID is not the next expected
    /// one, and an invalid transition error if the event contradicts the
    /// current state.
    #[allow(clippy::too_many_lines)]
    pub fn apply_event(&mut self, event: &HistoryEvent) -> Result<()> {
        if event.event_id != self.next_event_id {
            return Err(Error::internal(format!(
                "history gap on {}: expected event {}, got {}",
                self.execution.key, self.next_event_id, event.event_id
            )));
        }
        let id = event.event_id;
        let now = event.event_time;

        match &event.attributes {
            EventAttributes::WorkflowExecutionStarted {
                workflow_type,
                task_queue,
                input,
                callbacks,
                first_run_id,
                original_run_id,
                continued_from_run_id,
                attempt,
                retry_policy,
                run_timeout,
                parent,
                request_id,
            } => {
                let info = &mut self.execution;
                info.workflow_type.clone_from(workflow_type);
                info.task_queue.clone_from(task_queue);
                info.input.clone_from(input);
                info.first_run_id = *first_run_id;
                info.original_run_id = *original_run_id;
                info.continued_from_run_id = *continued_from_run_id;
                info.attempt = *attempt;
                info.retry_policy.clone_from(retry_policy);
                info.run_timeout = *run_timeout;
                info.parent.clone_from(parent);
                info.start_request_id.clone_from(request_id);
                info.start_time = now;
                info.status = WorkflowStatus::Running;
                self.callbacks = callbacks
                    .iter()
                    .zip(0_u32..)
                    .map(|(target, idx)| CallbackInfo::new(idx, target.clone(), now))
                    .collect();
            }
            EventAttributes::WorkflowTaskScheduled {
                task_queue,
                attempt,
            } => {
                self.workflow_task = Some(WorkflowTaskInfo {
                    scheduled_event_id: id,
                    started_event_id: None,
                    attempt: *attempt,
                    task_queue: task_queue.clone(),
                    request_id: None,
                });
            }
            EventAttributes::WorkflowTaskStarted {
                scheduled_event_id,
                request_id,
                ..
            } => {
                let wt = self.pending_workflow_task(*scheduled_event_id)?;
                wt.started_event_id = Some(id);
                wt.request_id = Some(request_id.clone());
                self.has_buffered_events = false;
            }
            EventAttributes::WorkflowTaskCompleted {
                scheduled_event_id, ..
            } => {
                self.pending_workflow_task(*scheduled_event_id)?;
                self.workflow_task = None;
                self.activities.retain(|_, a| !a.state.is_terminal());
            }
            EventAttributes::WorkflowTaskFailed {
                scheduled_event_id, ..
            } => {
                self.pending_workflow_task(*scheduled_event_id)?;
                self.workflow_task = None;
            }
            EventAttributes::ActivityTaskScheduled {
                activity_id,
                activity_type,
                task_queue,
                max_attempts,
            } => {
                self.activities.insert(
                    activity_id.clone(),
                    ActivityInfo {
                        activity_id: activity_id.clone(),
                        activity_type: activity_type.clone(),
                        task_queue: task_queue.clone(),
                        scheduled_event_id: id,
                        started_event_id: None,
                        request_id: None,
                        attempt: 1,
                        max_attempts: *max_attempts,
                        state: ActivityState::Scheduled,
                        heartbeat_details: None,
                        last_heartbeat_time: None,
                        last_failure: None,
                        pause: None,
                    },
                );
            }
            EventAttributes::ActivityTaskStarted {
                activity_id,
                attempt,
                request_id,
                ..
            } => {
                let activity = self.activity_entry(activity_id)?;
                activity.transition(ActivityState::Started)?;
                activity.started_event_id = Some(id);
                activity.request_id = Some(request_id.clone());
                activity.attempt = *attempt;
            }
            EventAttributes::ActivityTaskCompleted { activity_id, .. } => {
                self.activity_entry(activity_id)?
                    .transition(ActivityState::Completed)?;
            }
            EventAttributes::ActivityTaskFailed {
                activity_id,
                failure,
                ..
            } => {
                let activity = self.activity_entry(activity_id)?;
                activity.transition(ActivityState::Failed)?;
                activity.last_failure = Some(failure.clone());
            }
            EventAttributes::ActivityTaskCanceled { activity_id, .. } => {
                self.activity_entry(activity_id)?
                    .transition(ActivityState::Canceled)?;
            }
            EventAttributes::TimerStarted { timer_id, fire_at } => {
                self.timers.insert(
                    timer_id.clone(),
                    TimerInfo {
                        timer_id: timer_id.clone(),
                        started_event_id: id,
                        fire_at: *fire_at,
                    },
                );
            }
            EventAttributes::TimerFired { timer_id, .. }
            | EventAttributes::TimerCanceled { timer_id, .. } => {
                if self.timers.remove(timer_id).is_none() {
                    return Err(Error::not_found("timer", timer_id));
                }
            }
            EventAttributes::WorkflowExecutionSignaled { .. } => {}
            EventAttributes::WorkflowExecutionCancelRequested { .. } => {
                self.execution.cancel_requested = true;
            }
            EventAttributes::WorkflowExecutionUpdateAccepted { update_id, name, .. } => {
                self.updates.insert(
                    update_id.clone(),
                    UpdateInfo {
                        update_id: update_id.clone(),
                        name: name.clone(),
                        accepted_event_id: id,
                        completed: false,
                    },
                );
            }
            EventAttributes::WorkflowExecutionUpdateCompleted { update_id, .. } => {
                self.updates
                    .get_mut(update_id)
                    .ok_or_else(|| Error::not_found("workflow update", update_id))?
                    .completed = true;
            }
            EventAttributes::StartChildWorkflowExecutionInitiated {
                workflow_id,
                workflow_type,
                ..
            } => {
                self.children.insert(
                    id,
                    ChildExecutionInfo {
                        initiated_event_id: id,
                        workflow_id: workflow_id.clone(),
                        workflow_type: workflow_type.clone(),
                        run_id: None,
                        outcome: None,
                    },
                );
            }
            EventAttributes::ChildWorkflowExecutionCompleted {
                initiated_event_id,
                child_run_id,
                outcome,
            } => {
                let child = self
                    .children
                    .get_mut(initiated_event_id)
                    .ok_or_else(|| Error::not_found("child execution", initiated_event_id))?;
                child.run_id = Some(*child_run_id);
                child.outcome = Some(outcome.clone());
            }
            EventAttributes::WorkflowExecutionCompleted {
                result,
                new_execution_run_id,
            } => self.close(
                now,
                WorkflowStatus::Completed,
                WorkflowOutcome::Completed {
                    result: result.clone(),
                },
                *new_execution_run_id,
            ),
            EventAttributes::WorkflowExecutionFailed {
                failure,
                new_execution_run_id,
            } => self.close(
                now,
                WorkflowStatus::Failed,
                WorkflowOutcome::Failed {
                    failure: failure.clone(),
                },
                *new_execution_run_id,
            ),
            EventAttributes::WorkflowExecutionCanceled { details } => self.close(
                now,
                WorkflowStatus::Canceled,
                WorkflowOutcome::Canceled {
                    details: details.clone(),
                },
                None,
            ),
            EventAttributes::WorkflowExecutionTerminated { reason, .. } => self.close(
                now,
                WorkflowStatus::Terminated,
                WorkflowOutcome::Terminated {
                    reason: reason.clone(),
                },
                None,
            ),
            EventAttributes::WorkflowExecutionTimedOut {
                new_execution_run_id,
            } => self.close(
                now,
                WorkflowStatus::TimedOut,
                WorkflowOutcome::TimedOut,
                *new_execution_run_id,
            ),
            EventAttributes::WorkflowExecutionContinuedAsNew {
                new_execution_run_id,
                ..
            } => self.close(
                now,
                WorkflowStatus::ContinuedAsNew,
                WorkflowOutcome::ContinuedAsNew {
                    new_run_id: *new_execution_run_id,
                },
                Some(*new_execution_run_id),
            ),
        }

        if event.attributes.needs_workflow_attention()
            && self.workflow_task.as_ref().is_some_and(WorkflowTaskInfo::is_started)
        {
            self.has_buffered_events = true;
        }
        self.next_event_id += 1;
        self.last_event_time = Some(now);
        Ok(())
    }

    fn close(
        &mut self,
        now: DateTime<Utc>,
        status: WorkflowStatus,
        outcome: WorkflowOutcome,
        successor: Option<RunId>,
    ) {
        self.execution.status = status;
        self.execution.close_time = Some(now);
        self.execution.outcome = Some(outcome);
        self.execution.successor_run_id = successor;
        self.workflow_task = None;
        self.timers.clear();
    }

    fn pending_workflow_task(&mut self, scheduled_event_id: i64) -> Result<&mut WorkflowTaskInfo> {
        match self.workflow_task.as_mut() {
            Some(wt) if wt.scheduled_event_id == scheduled_event_id => Ok(wt),
            _ => Err(Error::task_not_found(format!(
                "workflow task {scheduled_event_id} is not pending"
            ))),
        }
    }

    fn activity_entry(&mut self, activity_id: &str) -> Result<&mut ActivityInfo> {
        self.activities
            .get_mut(activity_id)
            .ok_or_else(|| Error::ActivityNotFound {
                selector: format!("id {activity_id}"),
            })
    }

    /// Copies non-event fields from a previous projection of the same run.
    ///
    /// Used after a rebuild so pause records, heartbeats, callback delivery
    /// progress and reset bookkeeping survive.
    pub fn carry_runtime_from(&mut self, previous: &Self) {
        for (id, activity) in &mut self.activities {
            let Some(old) = previous.activities.get(id) else {
                continue;
            };
            if old.scheduled_event_id != activity.scheduled_event_id {
                continue;
            }
            activity.heartbeat_details.clone_from(&old.heartbeat_details);
            activity.last_heartbeat_time = old.last_heartbeat_time;
            // Retries move a started activity back to scheduled without an event.
            if old.attempt > activity.attempt && activity.state == ActivityState::Started {
                activity.state = ActivityState::Scheduled;
                activity.started_event_id = None;
                activity.request_id = None;
                activity.last_failure.clone_from(&old.last_failure);
            }
            activity.attempt = activity.attempt.max(old.attempt);
            if old.is_paused() && !activity.state.is_terminal() {
                activity.state = ActivityState::Paused;
                activity.pause.clone_from(&old.pause);
            }
        }
        for callback in &mut self.callbacks {
            if let Some(old) = previous.callbacks.iter().find(|c| c.id == callback.id) {
                *callback = old.clone();
            }
        }
        self.execution
            .sticky_task_queue
            .clone_from(&previous.execution.sticky_task_queue);
        self.signal_request_ids
            .clone_from(&previous.signal_request_ids);
        self.resets.clone_from(&previous.resets);
    }

    /// Returns the run's key.
    #[must_use]
    pub const fn key(&self) -> &WorkflowKey {
        &self.execution.key
    }

    /// Returns run-level metadata.
    #[must_use]
    pub const fn execution(&self) -> &ExecutionInfo {
        &self.execution
    }

    /// Returns run-level metadata for mutation inside a transaction.
    pub fn execution_mut(&mut self) -> &mut ExecutionInfo {
        &mut self.execution
    }

    /// Returns true while the run accepts events.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.execution.status == WorkflowStatus::Running
    }

    /// Returns the run status.
    #[must_use]
    pub const fn status(&self) -> WorkflowStatus {
        self.execution.status
    }

    /// Returns the ID the next recorded event will get.
    #[must_use]
    pub const fn next_event_id(&self) -> i64 {
        self.next_event_id
    }

    /// Returns the number of events in the run's history.
    #[must_use]
    #[allow(clippy::cast_sign_loss)] // next_event_id starts at 1
    pub const fn history_length(&self) -> usize {
        (self.next_event_id - FIRST_EVENT_ID) as usize
    }

    /// Returns when the last event was recorded.
    #[must_use]
    pub const fn last_event_time(&self) -> Option<DateTime<Utc>> {
        self.last_event_time
    }

    /// Returns the pending workflow task.
    #[must_use]
    pub const fn workflow_task(&self) -> Option<&WorkflowTaskInfo> {
        self.workflow_task.as_ref()
    }

    /// Returns true if events arrived while a workflow task was started.
    #[must_use]
    pub const fn has_buffered_events(&self) -> bool {
        self.has_buffered_events
    }

    /// Returns tracked activities, including terminal ones not yet
    /// acknowledged by a completed workflow task.
    #[must_use]
    pub const fn activities(&self) -> &BTreeMap<String, ActivityInfo> {
        &self.activities
    }

    /// Returns one activity.
    #[must_use]
    pub fn activity(&self, activity_id: &str) -> Option<&ActivityInfo> {
        self.activities.get(activity_id)
    }

    /// Returns one activity for mutation inside a transaction.
    pub fn activity_mut(&mut self, activity_id: &str) -> Option<&mut ActivityInfo> {
        self.activities.get_mut(activity_id)
    }

    /// Returns the IDs of the pending activities of `activity_type`.
    /// Terminal entries awaiting a workflow task are skipped.
    #[must_use]
    pub fn pending_activity_ids_by_type(&self, activity_type: &str) -> Vec<String> {
        self.activities
            .values()
            .filter(|a| a.activity_type == activity_type && !a.state.is_terminal())
            .map(|a| a.activity_id.clone())
            .collect()
    }

    /// Returns started user timers.
    #[must_use]
    pub const fn timers(&self) -> &BTreeMap<String, TimerInfo> {
        &self.timers
    }

    /// Returns child executions keyed by initiated event ID.
    #[must_use]
    pub const fn children(&self) -> &BTreeMap<i64, ChildExecutionInfo> {
        &self.children
    }

    /// Returns callbacks in registration order.
    #[must_use]
    pub fn callbacks(&self) -> &[CallbackInfo] {
        &self.callbacks
    }

    /// Returns one callback for mutation inside a transaction.
    pub fn callback_mut(&mut self, callback_id: u32) -> Option<&mut CallbackInfo> {
        self.callbacks.iter_mut().find(|c| c.id == callback_id)
    }

    /// Returns workflow updates.
    #[must_use]
    pub const fn updates(&self) -> &BTreeMap<String, UpdateInfo> {
        &self.updates
    }

    /// Returns true if a signal with this request ID was already applied.
    #[must_use]
    pub fn has_signal_request(&self, request_id: &str) -> bool {
        self.signal_request_ids.contains(request_id)
    }

    /// Remembers a signal request ID for deduplication.
    pub fn add_signal_request(&mut self, request_id: impl Into<String>) {
        self.signal_request_ids.insert(request_id.into());
    }

    /// Forgets a signal request ID.
    pub fn remove_signal_request(&mut self, request_id: &str) -> bool {
        self.signal_request_ids.remove(request_id)
    }

    /// Returns the resets that used this run as their base.
    #[must_use]
    pub fn resets(&self) -> &[ResetRecord] {
        &self.resets
    }

    /// Records a reset that used this run as its base.
    pub fn add_reset(&mut self, record: ResetRecord) {
        self.resets.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::{NamespaceId, WorkflowId};

    fn key() -> WorkflowKey {
        WorkflowKey::new(
            NamespaceId::new("default").unwrap(),
            WorkflowId::new("wf").unwrap(),
            RunId::generate(),
        )
    }

    fn ev(id: i64, attributes: EventAttributes) -> HistoryEvent {
        HistoryEvent {
            event_id: id,
            event_time: Utc::now(),
            attributes,
        }
    }

    fn started(key: &WorkflowKey) -> EventAttributes {
        EventAttributes::WorkflowExecutionStarted {
            workflow_type: "order".into(),
            task_queue: "main".into(),
            input: None,
            callbacks: vec![CallbackTarget::new("http://localhost/cb")],
            first_run_id: key.run_id,
            original_run_id: key.run_id,
            continued_from_run_id: None,
            attempt: 1,
            retry_policy: None,
            run_timeout: None,
            parent: None,
            request_id: "req".into(),
        }
    }

    fn scheduled(activity_id: &str) -> EventAttributes {
        EventAttributes::ActivityTaskScheduled {
            activity_id: activity_id.into(),
            activity_type: "charge".into(),
            task_queue: "main".into(),
            max_attempts: 1,
        }
    }

    #[test]
    fn replay_builds_projection() {
        let key = key();
        let events = vec![
            ev(1, started(&key)),
            ev(
                2,
                EventAttributes::WorkflowTaskScheduled {
                    task_queue: "main".into(),
                    attempt: 1,
                },
            ),
            ev(
                3,
                EventAttributes::WorkflowTaskStarted {
                    scheduled_event_id: 2,
                    identity: "w".into(),
                    request_id: "p1".into(),
                },
            ),
            ev(
                4,
                EventAttributes::WorkflowTaskCompleted {
                    scheduled_event_id: 2,
                    started_event_id: 3,
                    identity: "w".into(),
                },
            ),
            ev(5, scheduled("A1")),
            ev(6, scheduled("A2")),
        ];
        let state = MutableState::replay(key.clone(), &events).unwrap();
        assert!(state.is_running());
        assert_eq!(state.next_event_id(), 7);
        assert_eq!(state.history_length(), 6);
        assert_eq!(state.callbacks().len(), 1);
        assert_eq!(state.callbacks()[0].state, CallbackState::Standby);
        assert_eq!(state.pending_activity_ids_by_type("charge"), vec!["A1", "A2"]);
        assert!(state.workflow_task().is_none());
    }

    #[test]
    fn gap_is_rejected() {
        let key = key();
        let mut state = MutableState::new(key.clone());
        state.apply_event(&ev(1, started(&key))).unwrap();
        let err = state.apply_event(&ev(3, scheduled("A1"))).unwrap_err();
        assert!(err.to_string().contains("expected event 2"));
    }

    #[test]
    fn terminal_activities_pruned_on_workflow_task_completion() {
        let key = key();
        let mut state = MutableState::new(key.clone());
        state.apply_event(&ev(1, started(&key))).unwrap();
        state.apply_event(&ev(2, scheduled("A1"))).unwrap();
        state
            .apply_event(&ev(
                3,
                EventAttributes::ActivityTaskCanceled {
                    activity_id: "A1".into(),
                    details: None,
                    identity: "w".into(),
                },
            ))
            .unwrap();
        assert!(state.activity("A1").is_some());

        state
            .apply_event(&ev(
                4,
                EventAttributes::WorkflowTaskScheduled {
                    task_queue: "main".into(),
                    attempt: 1,
                },
            ))
            .unwrap();
        state
            .apply_event(&ev(
                5,
                EventAttributes::WorkflowTaskStarted {
                    scheduled_event_id: 4,
                    identity: "w".into(),
                    request_id: "p".into(),
                },
            ))
            .unwrap();
        state
            .apply_event(&ev(
                6,
                EventAttributes::WorkflowTaskCompleted {
                    scheduled_event_id: 4,
                    started_event_id: 5,
                    identity: "w".into(),
                },
            ))
            .unwrap();
        assert!(state.activity("A1").is_none());
    }

    #[test]
    fn signal_during_started_task_is_buffered() {
        let key = key();
        let mut state = MutableState::new(key.clone());
        state.apply_event(&ev(1, started(&key))).unwrap();
        state
            .apply_event(&ev(
                2,
                EventAttributes::WorkflowTaskScheduled {
                    task_queue: "main".into(),
                    attempt: 1,
                },
            ))
            .unwrap();
        state
            .apply_event(&ev(
                3,
                EventAttributes::WorkflowTaskStarted {
                    scheduled_event_id: 2,
                    identity: "w".into(),
                    request_id: "p".into(),
                },
            ))
            .unwrap();
        assert!(!state.has_buffered_events());
        state
            .apply_event(&ev(
                4,
                EventAttributes::WorkflowExecutionSignaled {
                    signal_name: "go".into(),
                    input: None,
                    identity: "c".into(),
                },
            ))
            .unwrap();
        assert!(state.has_buffered_events());
    }

    #[test]
    fn close_records_successor() {
        let key = key();
        let next = RunId::generate();
        let mut state = MutableState::new(key.clone());
        state.apply_event(&ev(1, started(&key))).unwrap();
        state
            .apply_event(&ev(
                2,
                EventAttributes::WorkflowExecutionContinuedAsNew {
                    new_execution_run_id: next,
                    input: None,
                },
            ))
            .unwrap();
        assert_eq!(state.status(), WorkflowStatus::ContinuedAsNew);
        assert_eq!(state.execution().successor_run_id, Some(next));
        assert!(!state.is_running());
    }

    #[test]
    fn runtime_fields_survive_rebuild() {
        let key = key();
        let events = vec![ev(1, started(&key)), ev(2, scheduled("A1"))];
        let mut live = MutableState::replay(key.clone(), &events).unwrap();
        live.activity_mut("A1")
            .unwrap()
            .pause("op", "hold", Utc::now())
            .unwrap();
        live.callback_mut(0).unwrap().schedule().unwrap();
        live.add_signal_request("sig-1");

        let mut rebuilt = MutableState::replay(key, &events).unwrap();
        rebuilt.carry_runtime_from(&live);
        assert_eq!(rebuilt, live);
    }
}
