//! User timers.

use crate::error::Result;
use crate::events::EventAttributes;
use crate::transaction::{UpdateAction, UpdateContext, UpdateOperation};

/// Fires a user timer. A timer that was canceled, already fired, or whose
/// run closed is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FireTimer {
    /// The timer.
    pub timer_id: String,
}

impl UpdateOperation for FireTimer {
    type Output = bool;
    const NAME: &'static str = "fire_timer";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, bool)> {
        let Some(started_event_id) = ctx
            .state()
            .timers()
            .get(&self.timer_id)
            .map(|t| t.started_event_id)
        else {
            return Ok((UpdateAction::NOOP, false));
        };
        ctx.record(EventAttributes::TimerFired {
            timer_id: self.timer_id,
            started_event_id,
        })?;
        Ok((UpdateAction::UPDATE_WITH_WORKFLOW_TASK, true))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::api::testing::Fixture;
    use crate::api::workflow_task::Command;

    #[tokio::test]
    async fn fires_once() {
        let f = Fixture::started().await;
        f.complete_workflow_task(vec![Command::StartTimer {
            timer_id: "t1".into(),
            fire_after: Duration::from_secs(30),
        }])
        .await
        .unwrap();

        let fire = || FireTimer {
            timer_id: "t1".into(),
        };
        assert!(f.update(fire()).await.unwrap());
        assert!(!f.update(fire()).await.unwrap());

        let state = f.state().await;
        assert!(state.timers().is_empty());
        assert!(state.workflow_task().is_some());
    }
}
