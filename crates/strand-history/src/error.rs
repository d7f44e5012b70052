//! Error types for the history service.

use strand_core::WorkflowKey;

use crate::callbacks::DeliveryError;

/// The result type used throughout strand-history.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in history operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A pause/unpause selector matched no activity.
    #[error("activity not found: {selector}")]
    ActivityNotFound {
        /// Description of the selector that matched nothing.
        selector: String,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition for {entity} {id}: {from} -> {to}")]
    InvalidStateTransition {
        /// Kind of entity (activity, callback, workflow task).
        entity: &'static str,
        /// Identifier of the entity.
        id: String,
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
    },

    /// The run is closed and cannot accept the operation.
    #[error("workflow execution already completed: {key}")]
    WorkflowNotRunning {
        /// The closed run.
        key: WorkflowKey,
    },

    /// A run with the same workflow ID is already running.
    #[error("workflow execution already started: {workflow_id} (run {run_id})")]
    WorkflowAlreadyStarted {
        /// The workflow ID.
        workflow_id: String,
        /// The running run.
        run_id: String,
    },

    /// A task referenced by a task-lifecycle call does not match the run's state.
    #[error("task not found: {message}")]
    TaskNotFound {
        /// Description of the mismatch.
        message: String,
    },

    /// The lease could not be acquired before the timeout elapsed.
    #[error("timed out after {waited_ms}ms waiting for workflow lease on {key}")]
    LeaseTimeout {
        /// The run whose lease was contended.
        key: WorkflowKey,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The shard engine is not running.
    #[error("history engine for shard {shard_id} is not running")]
    EngineStopped {
        /// The stopped shard.
        shard_id: u32,
    },

    /// A query could not be answered.
    #[error("query failed: {message}")]
    QueryFailed {
        /// Description of the failure.
        message: String,
    },

    /// A callback delivery failed.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// An error from strand-core.
    #[error(transparent)]
    Core(#[from] strand_core::Error),
}

impl Error {
    /// Creates a new not found error.
    #[must_use]
    pub fn not_found(resource_type: &'static str, id: impl std::fmt::Display) -> Self {
        Self::Core(strand_core::Error::not_found(resource_type, id))
    }

    /// Creates a new invalid argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::Core(strand_core::Error::invalid_argument(message))
    }

    /// Creates a new concurrent update error.
    #[must_use]
    pub fn concurrent_update(message: impl Into<String>) -> Self {
        Self::Core(strand_core::Error::concurrent_update(message))
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Core(strand_core::Error::internal(message))
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Core(strand_core::Error::Serialization {
            message: message.into(),
        })
    }

    /// Creates a new task-not-found error.
    #[must_use]
    pub fn task_not_found(message: impl Into<String>) -> Self {
        Self::TaskNotFound {
            message: message.into(),
        }
    }

    /// Creates a new invalid state transition error.
    #[must_use]
    pub fn invalid_transition(
        entity: &'static str,
        id: impl Into<String>,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidStateTransition {
            entity,
            id: id.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Returns true if the run or resource does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Core(strand_core::Error::NotFound { .. }))
    }

    /// Returns true for optimistic-concurrency conflicts.
    #[must_use]
    pub const fn is_concurrent_update(&self) -> bool {
        matches!(self, Self::Core(strand_core::Error::ConcurrentUpdate { .. }))
    }

    /// Returns true when the shard fencing token is stale.
    #[must_use]
    pub const fn is_shard_ownership_lost(&self) -> bool {
        matches!(self, Self::Core(strand_core::Error::ShardOwnershipLost { .. }))
    }

    /// Returns true for policy or input violations.
    #[must_use]
    pub const fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::Core(strand_core::Error::InvalidArgument { .. }))
    }

    /// Returns true if a caller may retry the operation with fresh state.
    ///
    /// Validation errors are never retryable; the engine never retries on
    /// its own.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LeaseTimeout { .. } => true,
            Self::Delivery(err) => err.is_retryable(),
            Self::Core(err) => err.is_retryable(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Core(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_argument_is_verbatim() {
        let err = Error::invalid_argument("attaching workflow callbacks is disabled for this namespace");
        assert_eq!(
            err.to_string(),
            "attaching workflow callbacks is disabled for this namespace"
        );
        assert!(err.is_invalid_argument());
        assert!(!err.is_retryable());
    }

    #[test]
    fn state_transition_error_display() {
        let err = Error::invalid_transition("activity", "A1", "Completed", "Paused");
        assert_eq!(
            err.to_string(),
            "invalid state transition for activity A1: Completed -> Paused"
        );
    }

    #[test]
    fn classification_helpers() {
        assert!(Error::concurrent_update("lost race").is_concurrent_update());
        assert!(Error::concurrent_update("lost race").is_retryable());
        assert!(Error::not_found("workflow run", "x").is_not_found());
        let lost = Error::Core(strand_core::Error::ShardOwnershipLost {
            shard_id: 1,
            held: 1,
            current: Some(2),
        });
        assert!(lost.is_shard_ownership_lost());
        assert!(lost.is_retryable());
    }
}
