//! Activity bookkeeping and state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::events::{Failure, Payload};

/// Lifecycle state of an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    /// Waiting for a worker.
    Scheduled,
    /// A worker picked it up.
    Started,
    /// Paused by an operator; not dispatched until unpaused.
    Paused,
    /// Finished successfully (terminal).
    Completed,
    /// Failed with no retries left (terminal).
    Failed,
    /// Canceled (terminal).
    Canceled,
}

impl ActivityState {
    /// Returns true for terminal states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Returns true if the state machine allows moving to `next`.
    ///
    /// `Paused -> Paused` is allowed so that re-pausing is idempotent.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ActivityState::{Canceled, Completed, Failed, Paused, Scheduled, Started};
        match self {
            Scheduled => matches!(next, Started | Paused | Canceled),
            Started => matches!(next, Scheduled | Completed | Failed | Canceled | Paused),
            Paused => matches!(
                next,
                Paused | Scheduled | Started | Completed | Failed | Canceled
            ),
            Completed | Failed | Canceled => false,
        }
    }
}

impl fmt::Display for ActivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Scheduled => "Scheduled",
            Self::Started => "Started",
            Self::Paused => "Paused",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Canceled => "Canceled",
        };
        f.write_str(s)
    }
}

/// Operator pause record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseInfo {
    /// When the activity was paused.
    pub paused_at: DateTime<Utc>,
    /// Who paused it.
    pub identity: String,
    /// Why.
    pub reason: String,
    /// State to restore on unpause (`Scheduled` or `Started`).
    pub resume_state: ActivityState,
}

/// A pending or recently finished activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityInfo {
    /// Workflow-scoped activity ID.
    pub activity_id: String,
    /// Activity type name.
    pub activity_type: String,
    /// Task queue the activity is dispatched to.
    pub task_queue: String,
    /// Event ID of `ActivityTaskScheduled`.
    pub scheduled_event_id: i64,
    /// Event ID of the current `ActivityTaskStarted`, if started.
    pub started_event_id: Option<i64>,
    /// Poll request ID of the current start.
    #[serde(default)]
    pub request_id: Option<String>,
    /// Current attempt, starting at 1.
    pub attempt: u32,
    /// Attempt budget (0 = unlimited).
    pub max_attempts: u32,
    /// Lifecycle state.
    pub state: ActivityState,
    /// Latest heartbeat payload.
    pub heartbeat_details: Option<Payload>,
    /// When the last heartbeat arrived.
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    /// Failure from the previous attempt.
    pub last_failure: Option<Failure>,
    /// Set while paused.
    pub pause: Option<PauseInfo>,
}

impl ActivityInfo {
    /// Moves to `next`, enforcing the state machine.
    ///
    /// # Errors
    ///
    /// Returns an invalid transition error when the move is not allowed.
    pub fn transition(&mut self, next: ActivityState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::invalid_transition(
                "activity",
                self.activity_id.clone(),
                self.state,
                next,
            ));
        }
        self.state = next;
        Ok(())
    }

    /// Pauses the activity. Pausing a paused activity refreshes the record.
    ///
    /// # Errors
    ///
    /// Returns an invalid transition error for terminal activities.
    pub fn pause(
        &mut self,
        identity: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let resume_state = match &self.pause {
            Some(existing) => existing.resume_state,
            None => self.state,
        };
        self.transition(ActivityState::Paused)?;
        self.pause = Some(PauseInfo {
            paused_at: now,
            identity: identity.to_string(),
            reason: reason.to_string(),
            resume_state,
        });
        Ok(())
    }

    /// Unpauses the activity, returning the restored state.
    ///
    /// # Errors
    ///
    /// Returns an invalid transition error unless the activity is paused.
    pub fn unpause(&mut self) -> Result<ActivityState> {
        let Some(pause) = self.pause.take() else {
            return Err(Error::invalid_transition(
                "activity",
                self.activity_id.clone(),
                self.state,
                ActivityState::Scheduled,
            ));
        };
        self.transition(pause.resume_state)?;
        Ok(pause.resume_state)
    }

    /// Returns true while the activity is paused.
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        matches!(self.state, ActivityState::Paused)
    }

    /// Returns true if another attempt is allowed after the current one.
    #[must_use]
    pub const fn has_retries_left(&self) -> bool {
        self.max_attempts == 0 || self.attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activity(state: ActivityState) -> ActivityInfo {
        ActivityInfo {
            activity_id: "A1".into(),
            activity_type: "charge".into(),
            task_queue: "main".into(),
            scheduled_event_id: 5,
            started_event_id: None,
            request_id: None,
            attempt: 1,
            max_attempts: 3,
            state,
            heartbeat_details: None,
            last_heartbeat_time: None,
            last_failure: None,
            pause: None,
        }
    }

    #[test]
    fn terminal_states_allow_nothing() {
        for terminal in [
            ActivityState::Completed,
            ActivityState::Failed,
            ActivityState::Canceled,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(ActivityState::Paused));
            assert!(!terminal.can_transition_to(ActivityState::Scheduled));
        }
    }

    #[test]
    fn pause_completed_activity_fails() {
        let mut a = activity(ActivityState::Completed);
        let err = a.pause("op", "why", Utc::now()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid state transition for activity A1: Completed -> Paused"
        );
        assert!(a.pause.is_none());
    }

    #[test]
    fn pause_and_unpause_restores_started() {
        let mut a = activity(ActivityState::Started);
        a.pause("op", "maintenance", Utc::now()).unwrap();
        assert!(a.is_paused());

        a.pause("op2", "again", Utc::now()).unwrap();
        assert_eq!(
            a.pause.as_ref().map(|p| p.resume_state),
            Some(ActivityState::Started)
        );

        assert_eq!(a.unpause().unwrap(), ActivityState::Started);
        assert_eq!(a.state, ActivityState::Started);
        assert!(a.pause.is_none());
    }

    #[test]
    fn unpause_requires_pause() {
        let mut a = activity(ActivityState::Scheduled);
        assert!(a.unpause().is_err());
    }

    #[test]
    fn retry_budget() {
        let mut a = activity(ActivityState::Started);
        assert!(a.has_retries_left());
        a.attempt = 3;
        assert!(!a.has_retries_left());
        a.max_attempts = 0;
        assert!(a.has_retries_left());
    }
}
