//! Cross-cluster replication.
//!
//! Outbound: when a cluster name is configured, every commit publishes a
//! [`ReplicationTask`] to the shard's replication queue, which remote
//! clusters poll.
//!
//! Inbound: a [`ReplicationStream`] applies tasks from one source cluster in
//! order. Application is idempotent by event ID. Tasks that cannot be
//! applied are quarantined in the shard's DLQ so the stream keeps moving;
//! the DLQ can later be inspected, purged, or merged back.

mod ordering;
mod stream;

pub use ordering::{Admission, ReplicationOrdering, SourceSequenceOrdering};
pub use stream::{
    BatchOutcome, MergeOutcome, OutboundMessage, ReplicationStatus, ReplicationStream,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use strand_core::WorkflowKey;

use crate::events::{HistoryEvent, Payload};

/// Payload exchanged between clusters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ReplicationTask {
    /// Events appended to a run, contiguous by event ID.
    HistoryBatch {
        /// Cluster that produced the events.
        source_cluster: String,
        /// The run.
        key: WorkflowKey,
        /// The events.
        events: Vec<HistoryEvent>,
    },
    /// Activity progress that produces no events (heartbeats, attempts).
    SyncActivity {
        /// Cluster that produced the update.
        source_cluster: String,
        /// The run.
        key: WorkflowKey,
        /// The activity.
        activity_id: String,
        /// Event ID of `ActivityTaskScheduled` on the source.
        scheduled_event_id: i64,
        /// Current attempt on the source.
        attempt: u32,
        /// Latest heartbeat payload.
        heartbeat_details: Option<Payload>,
        /// When the heartbeat arrived.
        last_heartbeat_time: Option<DateTime<Utc>>,
    },
    /// The complete history of a run, used to seed a cluster that has none of it.
    WorkflowState {
        /// Cluster that produced the history.
        source_cluster: String,
        /// The run.
        key: WorkflowKey,
        /// Every event of the run, starting at event 1.
        events: Vec<HistoryEvent>,
    },
}

impl ReplicationTask {
    /// Returns the run this task targets.
    #[must_use]
    pub const fn key(&self) -> &WorkflowKey {
        match self {
            Self::HistoryBatch { key, .. }
            | Self::SyncActivity { key, .. }
            | Self::WorkflowState { key, .. } => key,
        }
    }

    /// Returns the cluster the task came from.
    #[must_use]
    pub fn source_cluster(&self) -> &str {
        match self {
            Self::HistoryBatch { source_cluster, .. }
            | Self::SyncActivity { source_cluster, .. }
            | Self::WorkflowState { source_cluster, .. } => source_cluster,
        }
    }
}

/// A task received from a remote cluster, with its source-assigned ID.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundTask {
    /// Task ID in the source cluster's replication queue.
    pub source_task_id: u64,
    /// The task.
    pub task: ReplicationTask,
}
