//! Hand-off of workflow and activity tasks to matching.
//!
//! Matching (the service that pairs tasks with polling workers) is outside
//! this crate. [`MatchingClient`] is the seam; [`InMemoryMatching`] keeps
//! per-queue FIFO lists for tests and single-process deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use strand_core::WorkflowKey;

use super::pump::TaskHandler;
use crate::error::{Error, Result};
use crate::tasks::{HistoryTask, QueuedTask};

/// A task ready for a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchingTask {
    /// A workflow task.
    Workflow {
        /// The run.
        key: WorkflowKey,
        /// Event ID of `WorkflowTaskScheduled`.
        scheduled_event_id: i64,
        /// Destination queue.
        task_queue: String,
    },
    /// An activity task.
    Activity {
        /// The run.
        key: WorkflowKey,
        /// The activity.
        activity_id: String,
        /// Event ID of `ActivityTaskScheduled`.
        scheduled_event_id: i64,
        /// Attempt being dispatched.
        attempt: u32,
        /// Destination queue.
        task_queue: String,
    },
}

impl MatchingTask {
    /// Converts a transfer task, or returns `None` for tasks matching never sees.
    #[must_use]
    pub fn from_history(task: &HistoryTask) -> Option<Self> {
        match task {
            HistoryTask::WorkflowTask {
                key,
                scheduled_event_id,
                task_queue,
            } => Some(Self::Workflow {
                key: key.clone(),
                scheduled_event_id: *scheduled_event_id,
                task_queue: task_queue.clone(),
            }),
            HistoryTask::ActivityTask {
                key,
                activity_id,
                scheduled_event_id,
                attempt,
                task_queue,
            } => Some(Self::Activity {
                key: key.clone(),
                activity_id: activity_id.clone(),
                scheduled_event_id: *scheduled_event_id,
                attempt: *attempt,
                task_queue: task_queue.clone(),
            }),
            _ => None,
        }
    }

    /// Returns the destination queue.
    #[must_use]
    pub fn task_queue(&self) -> &str {
        match self {
            Self::Workflow { task_queue, .. } | Self::Activity { task_queue, .. } => task_queue,
        }
    }
}

/// Client for the matching service.
#[async_trait]
pub trait MatchingClient: Send + Sync {
    /// Adds a task to its queue.
    async fn add_task(&self, task: MatchingTask) -> Result<()>;
}

/// In-memory matching.
///
/// ## Limitations
///
/// - **Single-process only**: queues are not visible across processes
/// - **No deduplication**: a re-offered task is queued again; workers see
///   the duplicate rejected when they record it started
#[derive(Debug, Default)]
pub struct InMemoryMatching {
    queues: RwLock<HashMap<String, VecDeque<MatchingTask>>>,
}

impl InMemoryMatching {
    /// Creates empty matching queues.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the oldest task from `task_queue`.
    #[must_use]
    pub fn poll(&self, task_queue: &str) -> Option<MatchingTask> {
        self.queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(task_queue)
            .and_then(VecDeque::pop_front)
    }

    /// Returns the number of tasks waiting in `task_queue`.
    #[must_use]
    pub fn len(&self, task_queue: &str) -> usize {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_queue)
            .map_or(0, VecDeque::len)
    }

    /// Returns true when no queue holds a task.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .all(VecDeque::is_empty)
    }
}

#[async_trait]
impl MatchingClient for InMemoryMatching {
    async fn add_task(&self, task: MatchingTask) -> Result<()> {
        self.queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(task.task_queue().to_string())
            .or_default()
            .push_back(task);
        Ok(())
    }
}

/// Forwards committed workflow and activity tasks to a [`MatchingClient`].
pub(crate) struct MatchingForwarder {
    client: Arc<dyn MatchingClient>,
}

impl MatchingForwarder {
    pub(crate) fn new(client: Arc<dyn MatchingClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TaskHandler for MatchingForwarder {
    const NAME: &'static str = "matching_forwarder";

    fn accepts(task: &HistoryTask) -> bool {
        matches!(
            task,
            HistoryTask::WorkflowTask { .. } | HistoryTask::ActivityTask { .. }
        )
    }

    async fn handle(&self, task: &QueuedTask) -> Result<()> {
        let matching = MatchingTask::from_history(&task.task).ok_or_else(|| {
            Error::internal(format!("{} is not a matching task", task.task.kind()))
        })?;
        self.client.add_task(matching).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::{NamespaceId, RunId, WorkflowId};

    fn workflow_task(queue: &str, scheduled_event_id: i64) -> MatchingTask {
        MatchingTask::Workflow {
            key: WorkflowKey::new(
                NamespaceId::new("default").unwrap(),
                WorkflowId::new("wf").unwrap(),
                RunId::generate(),
            ),
            scheduled_event_id,
            task_queue: queue.into(),
        }
    }

    #[tokio::test]
    async fn queues_are_fifo_and_independent() {
        let matching = InMemoryMatching::new();
        matching.add_task(workflow_task("a", 2)).await.unwrap();
        matching.add_task(workflow_task("a", 5)).await.unwrap();
        matching.add_task(workflow_task("b", 9)).await.unwrap();

        assert_eq!(matching.len("a"), 2);
        let first = matching.poll("a").unwrap();
        assert!(matches!(first, MatchingTask::Workflow { scheduled_event_id: 2, .. }));
        assert_eq!(matching.len("b"), 1);
        assert!(matching.poll("missing").is_none());
    }

    #[test]
    fn callback_tasks_are_not_matching_tasks() {
        let task = HistoryTask::CallbackInvocation {
            key: WorkflowKey::new(
                NamespaceId::new("default").unwrap(),
                WorkflowId::new("wf").unwrap(),
                RunId::generate(),
            ),
            callback_id: 1,
            fire_at: chrono::Utc::now(),
        };
        assert!(MatchingTask::from_history(&task).is_none());
        assert!(!MatchingForwarder::accepts(&task));
    }
}
