//! Completion callback bookkeeping.
//!
//! ## State Machine
//!
//! ```text
//! Standby ──trigger──▶ Scheduled ──ok──▶ Succeeded
//!                        │   ▲
//!                 failed │   │ retry timer
//!                        ▼   │
//!                     BackingOff
//!
//! Scheduled ──permanent error or budget exhausted──▶ Failed
//! ```
//!
//! The attempt counter is bumped by [`CallbackInfo::begin_attempt`], which
//! is persisted before the network call. A crash mid-flight therefore can
//! only over-count.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Where and how to deliver a completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackTarget {
    /// Completion endpoint.
    pub url: String,
    /// Headers sent with every delivery.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl CallbackTarget {
    /// Creates a target without headers.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
        }
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// When a callback becomes deliverable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallbackTrigger {
    /// The run closed without a successor.
    #[default]
    WorkflowClosed,
}

/// Delivery state of a callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallbackState {
    /// Registered, trigger not yet met.
    #[default]
    Standby,
    /// Trigger met; an attempt is queued or in flight.
    Scheduled,
    /// Last attempt failed; the next one is scheduled.
    BackingOff,
    /// Delivered (terminal).
    Succeeded,
    /// Gave up (terminal).
    Failed,
}

impl CallbackState {
    /// Returns true for terminal states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for CallbackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Standby => "STANDBY",
            Self::Scheduled => "SCHEDULED",
            Self::BackingOff => "BACKING_OFF",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again at the given time.
    RetryAt(DateTime<Utc>),
    /// Stop retrying.
    GiveUp,
}

/// A callback registered on a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackInfo {
    /// Run-scoped ID, equal to the registration index.
    pub id: u32,
    /// Delivery target.
    pub target: CallbackTarget,
    /// Trigger condition.
    pub trigger: CallbackTrigger,
    /// When the callback was registered on this run.
    pub registration_time: DateTime<Utc>,
    /// Current delivery state.
    pub state: CallbackState,
    /// Attempts started so far.
    pub attempt: u32,
    /// When the last attempt finished.
    pub last_attempt_complete_time: Option<DateTime<Utc>>,
    /// Failure message of the last attempt, cleared on success.
    pub last_attempt_failure: Option<String>,
    /// When the next attempt is due (backing off only).
    pub next_attempt_schedule_time: Option<DateTime<Utc>>,
}

impl CallbackInfo {
    /// Creates a callback in [`CallbackState::Standby`] with zero attempts.
    #[must_use]
    pub fn new(id: u32, target: CallbackTarget, now: DateTime<Utc>) -> Self {
        Self {
            id,
            target,
            trigger: CallbackTrigger::WorkflowClosed,
            registration_time: now,
            state: CallbackState::Standby,
            attempt: 0,
            last_attempt_complete_time: None,
            last_attempt_failure: None,
            next_attempt_schedule_time: None,
        }
    }

    /// Fires the trigger: `Standby -> Scheduled`.
    ///
    /// # Errors
    ///
    /// Returns an invalid transition error from any other state.
    pub fn schedule(&mut self) -> Result<()> {
        self.check(CallbackState::Standby, CallbackState::Scheduled)?;
        self.state = CallbackState::Scheduled;
        Ok(())
    }

    /// Starts a dispatch attempt and returns its number.
    ///
    /// Valid from `Scheduled` (first attempt or a retry that was not yet
    /// started) and `BackingOff` (retry timer fired).
    ///
    /// # Errors
    ///
    /// Returns an invalid transition error from `Standby` or a terminal state.
    pub fn begin_attempt(&mut self) -> Result<u32> {
        if !matches!(
            self.state,
            CallbackState::Scheduled | CallbackState::BackingOff
        ) {
            return Err(self.transition_error(CallbackState::Scheduled));
        }
        self.state = CallbackState::Scheduled;
        self.attempt += 1;
        self.next_attempt_schedule_time = None;
        Ok(self.attempt)
    }

    /// Records a delivered completion.
    ///
    /// # Errors
    ///
    /// Returns an invalid transition error unless an attempt is in flight.
    pub fn record_success(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.check(CallbackState::Scheduled, CallbackState::Succeeded)?;
        self.state = CallbackState::Succeeded;
        self.last_attempt_complete_time = Some(now);
        self.last_attempt_failure = None;
        self.next_attempt_schedule_time = None;
        Ok(())
    }

    /// Records a failed attempt.
    ///
    /// # Errors
    ///
    /// Returns an invalid transition error unless an attempt is in flight.
    pub fn record_failure(
        &mut self,
        now: DateTime<Utc>,
        message: impl Into<String>,
        decision: RetryDecision,
    ) -> Result<()> {
        let next = match decision {
            RetryDecision::RetryAt(_) => CallbackState::BackingOff,
            RetryDecision::GiveUp => CallbackState::Failed,
        };
        self.check(CallbackState::Scheduled, next)?;
        self.state = next;
        self.last_attempt_complete_time = Some(now);
        self.last_attempt_failure = Some(message.into());
        self.next_attempt_schedule_time = match decision {
            RetryDecision::RetryAt(at) => Some(at),
            RetryDecision::GiveUp => None,
        };
        Ok(())
    }

    fn check(&self, expected: CallbackState, to: CallbackState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.transition_error(to))
        }
    }

    fn transition_error(&self, to: CallbackState) -> Error {
        Error::invalid_transition("callback", self.id.to_string(), self.state, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn callback() -> CallbackInfo {
        CallbackInfo::new(0, CallbackTarget::new("http://localhost/cb"), Utc::now())
    }

    #[test]
    fn fail_then_succeed() {
        let mut cb = callback();
        assert_eq!(cb.state, CallbackState::Standby);
        assert_eq!(cb.attempt, 0);

        cb.schedule().unwrap();
        assert_eq!(cb.begin_attempt().unwrap(), 1);
        let retry_at = Utc::now() + chrono::Duration::seconds(1);
        cb.record_failure(
            Utc::now(),
            "handler error (INTERNAL): intentional error",
            RetryDecision::RetryAt(retry_at),
        )
        .unwrap();
        assert_eq!(cb.state, CallbackState::BackingOff);
        assert_eq!(cb.attempt, 1);
        assert_eq!(cb.next_attempt_schedule_time, Some(retry_at));

        assert_eq!(cb.begin_attempt().unwrap(), 2);
        cb.record_success(Utc::now()).unwrap();
        assert_eq!(cb.state, CallbackState::Succeeded);
        assert_eq!(cb.attempt, 2);
        assert!(cb.last_attempt_failure.is_none());
    }

    #[test]
    fn standby_cannot_attempt() {
        let mut cb = callback();
        let err = cb.begin_attempt().unwrap_err();
        assert!(err.to_string().contains("STANDBY -> SCHEDULED"));
        assert_eq!(cb.attempt, 0);
    }

    #[test]
    fn terminal_states_reject_everything() {
        let mut cb = callback();
        cb.schedule().unwrap();
        cb.begin_attempt().unwrap();
        cb.record_failure(Utc::now(), "boom", RetryDecision::GiveUp)
            .unwrap();
        assert_eq!(cb.state, CallbackState::Failed);
        assert!(cb.begin_attempt().is_err());
        assert!(cb.record_success(Utc::now()).is_err());
        assert!(cb.schedule().is_err());
    }

    proptest! {
        #[test]
        fn attempts_never_decrease(outcomes in proptest::collection::vec(any::<bool>(), 1..20)) {
            let mut cb = callback();
            cb.schedule().unwrap();
            let mut last = cb.attempt;
            for ok in outcomes {
                if cb.state.is_terminal() {
                    break;
                }
                let n = cb.begin_attempt().unwrap();
                prop_assert_eq!(n, last + 1);
                last = n;
                if ok {
                    cb.record_success(Utc::now()).unwrap();
                } else {
                    cb.record_failure(Utc::now(), "x", RetryDecision::RetryAt(Utc::now())).unwrap();
                }
                prop_assert!(cb.attempt >= last);
            }
        }
    }
}
