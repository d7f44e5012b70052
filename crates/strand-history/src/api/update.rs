//! Workflow updates.

use crate::error::{Error, Result};
use crate::events::{EventAttributes, Payload};
use crate::transaction::{UpdateAction, UpdateContext, UpdateOperation};

/// Accepts a workflow update and schedules a workflow task to run its
/// handler. A repeated `update_id` returns the original acceptance.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateWorkflow {
    /// Caller-supplied update ID.
    pub update_id: String,
    /// Update handler name.
    pub name: String,
    /// Handler arguments.
    pub args: Option<Payload>,
}

/// Acceptance of a workflow update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateAccepted {
    /// Event ID of `WorkflowExecutionUpdateAccepted`.
    pub accepted_event_id: i64,
    /// The update's handler already completed.
    pub completed: bool,
}

impl UpdateOperation for UpdateWorkflow {
    type Output = UpdateAccepted;
    const NAME: &'static str = "update_workflow";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, UpdateAccepted)> {
        if self.update_id.trim().is_empty() {
            return Err(Error::invalid_argument("update id must not be empty"));
        }
        if let Some(existing) = ctx.state().updates().get(&self.update_id) {
            let accepted = UpdateAccepted {
                accepted_event_id: existing.accepted_event_id,
                completed: existing.completed,
            };
            return Ok((UpdateAction::NOOP, accepted));
        }
        let accepted_event_id = ctx.record(EventAttributes::WorkflowExecutionUpdateAccepted {
            update_id: self.update_id,
            name: self.name,
            args: self.args,
        })?;
        Ok((
            UpdateAction::UPDATE_WITH_WORKFLOW_TASK,
            UpdateAccepted {
                accepted_event_id,
                completed: false,
            },
        ))
    }
}
