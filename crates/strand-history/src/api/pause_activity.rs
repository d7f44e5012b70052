//! Operator pause and unpause of activities.
//!
//! Both operations resolve a selector to a set of activity IDs and then
//! transition every one of them. A single illegal transition fails the
//! whole request; the working copy is discarded so no activity is left
//! half-paused.

use std::fmt;

use crate::error::{Error, Result};
use crate::state::ActivityState;
use crate::tasks::HistoryTask;
use crate::transaction::{UpdateAction, UpdateContext, UpdateOperation};

/// Which activities an operator request targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivitySelector {
    /// One activity by ID.
    Id(String),
    /// Every pending activity of a type.
    Type(String),
}

impl fmt::Display for ActivitySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id {id}"),
            Self::Type(activity_type) => write!(f, "type {activity_type}"),
        }
    }
}

impl ActivitySelector {
    fn resolve(&self, ctx: &UpdateContext) -> Result<Vec<String>> {
        let ids = match self {
            Self::Id(id) => ctx
                .state()
                .activity(id)
                .map(|a| vec![a.activity_id.clone()])
                .unwrap_or_default(),
            Self::Type(activity_type) => ctx.state().pending_activity_ids_by_type(activity_type),
        };
        if ids.is_empty() {
            return Err(Error::ActivityNotFound {
                selector: self.to_string(),
            });
        }
        Ok(ids)
    }
}

/// Pauses the selected activities.
///
/// Returns the paused activity IDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PauseActivity {
    /// Target activities.
    pub selector: ActivitySelector,
    /// Operator identity.
    pub identity: String,
    /// Why the activities are paused.
    pub reason: String,
}

impl UpdateOperation for PauseActivity {
    type Output = Vec<String>;
    const NAME: &'static str = "pause_activity";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, Vec<String>)> {
        let ids = self.selector.resolve(ctx)?;
        let now = ctx.now();
        for id in &ids {
            let activity = ctx
                .state_mut()
                .activity_mut(id)
                .ok_or_else(|| Error::internal("activity vanished inside a transaction"))?;
            activity.pause(&self.identity, &self.reason, now)?;
        }
        tracing::info!(selector = %self.selector, count = ids.len(), "activities paused");
        Ok((UpdateAction::UPDATE, ids))
    }
}

/// Unpauses the selected activities, restoring the state each had when it
/// was paused. Activities resuming to `Scheduled` are dispatched again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpauseActivity {
    /// Target activities.
    pub selector: ActivitySelector,
}

impl UpdateOperation for UnpauseActivity {
    type Output = Vec<String>;
    const NAME: &'static str = "unpause_activity";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, Vec<String>)> {
        let ids = self.selector.resolve(ctx)?;
        let key = ctx.state().key().clone();
        for id in &ids {
            let activity = ctx
                .state_mut()
                .activity_mut(id)
                .ok_or_else(|| Error::internal("activity vanished inside a transaction"))?;
            if activity.unpause()? == ActivityState::Scheduled {
                let task = HistoryTask::ActivityTask {
                    key: key.clone(),
                    activity_id: activity.activity_id.clone(),
                    scheduled_event_id: activity.scheduled_event_id,
                    attempt: activity.attempt,
                    task_queue: activity.task_queue.clone(),
                };
                ctx.add_task(task);
            }
        }
        Ok((UpdateAction::UPDATE, ids))
    }
}
