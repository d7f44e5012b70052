//! Execution store contract.
//!
//! The execution store persists, per workflow run, an append-only event
//! history plus a snapshot of the derived mutable state, and per shard a set
//! of ordered task queues and a dead-letter queue. Payloads are opaque
//! [`Bytes`]: encoding is owned by the history service.
//!
//! ## Write Semantics
//!
//! [`ExecutionStore::commit`] is the only mutating call on the hot path and is
//! atomic across every run and queue in the batch:
//!
//! 1. The presented [`FencingToken`] must equal the shard's current token,
//!    otherwise the call fails with [`Error::ShardOwnershipLost`].
//! 2. Every [`RunWrite`] precondition must hold, otherwise nothing is applied
//!    and [`WriteResult::PreconditionFailed`] is returned.
//! 3. Snapshots are replaced, events appended, queue records assigned
//!    monotonically increasing task IDs.
//!
//! [`Error::ShardOwnershipLost`]: crate::error::Error::ShardOwnershipLost

mod memory;

pub use memory::MemoryExecutionStore;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::fencing::FencingToken;
use crate::id::{NamespaceId, RunId, ShardId, WorkflowId, WorkflowKey};

/// Precondition for a run write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePrecondition {
    /// The run must not exist yet.
    DoesNotExist,
    /// The run's stored version must equal this value.
    MatchesVersion(u64),
}

/// A persisted run as returned by [`ExecutionStore::load_run`].
#[derive(Debug, Clone)]
pub struct RunRecord {
    /// Store version, incremented on every committed write of this run.
    pub version: u64,
    /// Encoded mutable-state snapshot.
    pub snapshot: Bytes,
    /// Number of encoded history events stored for this run.
    pub history_len: usize,
}

/// One run's part of a [`CommitBatch`].
#[derive(Debug, Clone)]
pub struct RunWrite {
    /// The run being written.
    pub key: WorkflowKey,
    /// Optimistic-concurrency precondition.
    pub precondition: WritePrecondition,
    /// Replacement snapshot.
    pub snapshot: Bytes,
    /// Encoded events appended to the run's history, in order.
    pub append_events: Vec<Bytes>,
    /// Replaces the run's history instead of appending (rebuild, replication).
    pub replace_history: bool,
    /// Makes this run the current run of its workflow ID.
    pub make_current: bool,
    /// Required value of the workflow's current-run pointer.
    pub current_run: CurrentRunPrecondition,
}

/// Precondition on a workflow's current-run pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CurrentRunPrecondition {
    /// The pointer is not checked.
    #[default]
    Unchecked,
    /// The pointer must equal this value (`None` = no current run).
    Expect(Option<RunId>),
}

/// Per-shard ordered queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueCategory {
    /// Tasks that move work to other services (workflow/activity tasks,
    /// callback invocations, child workflow relays).
    Transfer,
    /// Replication tasks consumed by remote clusters.
    Replication,
}

/// An atomic write against one shard.
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    /// Run writes, applied together or not at all.
    pub runs: Vec<RunWrite>,
    /// Encoded transfer tasks.
    pub transfer_tasks: Vec<Bytes>,
    /// Encoded replication tasks.
    pub replication_tasks: Vec<Bytes>,
}

impl CommitBatch {
    /// Returns true if the batch would change nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty() && self.transfer_tasks.is_empty() && self.replication_tasks.is_empty()
    }
}

/// Outcome of a successful commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// New store versions, in the order of [`CommitBatch::runs`].
    pub versions: Vec<u64>,
    /// Task IDs assigned to [`CommitBatch::transfer_tasks`].
    pub transfer_task_ids: Vec<u64>,
    /// Task IDs assigned to [`CommitBatch::replication_tasks`].
    pub replication_task_ids: Vec<u64>,
}

/// Result of a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Every write was applied.
    Committed(CommitOutcome),
    /// A run precondition failed; nothing was applied.
    PreconditionFailed {
        /// The run whose precondition failed.
        key: WorkflowKey,
        /// The run's current version, or `None` if it does not exist.
        current_version: Option<u64>,
    },
    /// A current-run precondition failed; nothing was applied.
    CurrentRunMismatch {
        /// The run whose write carried the precondition.
        key: WorkflowKey,
        /// The workflow's actual current run.
        current_run: Option<RunId>,
    },
}

impl WriteResult {
    /// Returns true if the commit was applied.
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }
}

/// A queued record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRecord {
    /// Shard-scoped, strictly increasing task ID.
    pub task_id: u64,
    /// Encoded task.
    pub payload: Bytes,
}

/// A quarantined replication item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlqRecord {
    /// DLQ-scoped, strictly increasing message ID.
    pub message_id: u64,
    /// Cluster the item was received from.
    pub source_cluster: String,
    /// Encoded replication task.
    pub payload: Bytes,
    /// Why the item could not be applied.
    pub reason: String,
    /// When the item was quarantined.
    pub enqueued_at: DateTime<Utc>,
}

/// Persistence contract consumed by the history service.
#[async_trait]
pub trait ExecutionStore: Send + Sync + 'static {
    /// Takes ownership of a shard, returning a token newer than any issued before.
    async fn acquire_shard(&self, shard_id: ShardId) -> Result<FencingToken>;

    /// Returns the shard's current token, if it has ever been acquired.
    async fn shard_token(&self, shard_id: ShardId) -> Result<Option<FencingToken>>;

    /// Loads a run's snapshot and version.
    async fn load_run(&self, key: &WorkflowKey) -> Result<Option<RunRecord>>;

    /// Reads a run's encoded history starting at `from_index` (zero-based).
    async fn read_history(&self, key: &WorkflowKey, from_index: usize) -> Result<Vec<Bytes>>;

    /// Returns the current run of a workflow ID.
    async fn current_run(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
    ) -> Result<Option<RunId>>;

    /// Atomically applies a batch of writes for one shard.
    async fn commit(
        &self,
        shard_id: ShardId,
        token: FencingToken,
        batch: CommitBatch,
    ) -> Result<WriteResult>;

    /// Deletes a run's snapshot and history.
    async fn delete_run(&self, shard_id: ShardId, token: FencingToken, key: &WorkflowKey)
    -> Result<()>;

    /// Reads up to `limit` records with task IDs greater than `after`.
    async fn read_queue(
        &self,
        shard_id: ShardId,
        category: QueueCategory,
        after: u64,
        limit: usize,
    ) -> Result<Vec<QueueRecord>>;

    /// Removes a record from a queue. Missing records are ignored.
    async fn complete_queue_task(
        &self,
        shard_id: ShardId,
        category: QueueCategory,
        task_id: u64,
    ) -> Result<()>;

    /// Quarantines a replication item.
    async fn enqueue_dlq(
        &self,
        shard_id: ShardId,
        token: FencingToken,
        source_cluster: &str,
        payload: Bytes,
        reason: &str,
    ) -> Result<u64>;

    /// Reads up to `limit` DLQ records with IDs greater than `after`.
    async fn read_dlq(
        &self,
        shard_id: ShardId,
        source_cluster: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<DlqRecord>>;

    /// Deletes DLQ records with IDs up to and including `inclusive_end`.
    /// Returns how many were removed.
    async fn delete_dlq(
        &self,
        shard_id: ShardId,
        token: FencingToken,
        source_cluster: &str,
        inclusive_end: u64,
    ) -> Result<usize>;
}
