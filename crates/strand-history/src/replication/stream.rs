//! Inbound application, outbound polling and DLQ management.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

use strand_core::{CommitBatch, DlqRecord, QueueCategory, ShardId, WorkflowKey, WriteResult};

use super::{Admission, InboundTask, ReplicationOrdering, ReplicationTask};
use crate::error::{Error, Result};
use crate::events::{FIRST_EVENT_ID, Payload};
use crate::metrics::HistoryMetrics;
use crate::persistence;
use crate::transaction::{
    NewRunPolicy, ReplicatedOutcome, TransactionEngine, UpdateAction, UpdateContext,
    UpdateOperation,
};

/// Page size used when walking queues.
const SCAN_PAGE: usize = 256;

/// Counts for one applied batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Tasks applied.
    pub applied: usize,
    /// Tasks skipped as already processed.
    pub duplicates: usize,
    /// Tasks moved to the DLQ.
    pub quarantined: usize,
}

/// Counts for a DLQ merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Items applied and removed from the DLQ.
    pub merged: usize,
    /// Items that failed again and were re-quarantined.
    pub requeued: usize,
}

/// A task waiting in this shard's outbound replication queue.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Queue-assigned task ID; remote clusters acknowledge up to it.
    pub task_id: u64,
    /// The task.
    pub task: ReplicationTask,
}

/// Replication progress of one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationStatus {
    /// The shard.
    pub shard_id: ShardId,
    /// Highest processed inbound task ID per source cluster.
    pub inbound_watermarks: BTreeMap<String, u64>,
    /// Outbound tasks not yet acknowledged by remote clusters.
    pub outbound_backlog: usize,
    /// Latest shard time reported by each remote cluster.
    pub remote_cluster_times: BTreeMap<String, DateTime<Utc>>,
}

/// Applies replication traffic for one shard.
pub struct ReplicationStream {
    txn: Arc<TransactionEngine>,
    ordering: Arc<dyn ReplicationOrdering>,
    local_cluster: Option<String>,
    remote_times: Mutex<BTreeMap<String, DateTime<Utc>>>,
    metrics: HistoryMetrics,
}

impl std::fmt::Debug for ReplicationStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationStream")
            .field("shard", &self.txn.checker().shard().id())
            .field("local_cluster", &self.local_cluster)
            .finish_non_exhaustive()
    }
}

impl ReplicationStream {
    /// Creates a stream for the shard behind `txn`.
    #[must_use]
    pub fn new(
        txn: Arc<TransactionEngine>,
        ordering: Arc<dyn ReplicationOrdering>,
        local_cluster: Option<String>,
        metrics: HistoryMetrics,
    ) -> Self {
        Self {
            txn,
            ordering,
            local_cluster,
            remote_times: Mutex::new(BTreeMap::new()),
            metrics,
        }
    }

    /// Records the shard time last reported by `source_cluster`.
    ///
    /// Times never move backwards; an older report is ignored.
    pub fn sync_shard_status(&self, source_cluster: &str, status_time: DateTime<Utc>) {
        let mut times = self
            .remote_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = times
            .entry(source_cluster.to_string())
            .or_insert(status_time);
        if status_time > *entry {
            *entry = status_time;
        }
    }

    /// Applies an ordered batch from `source_cluster`.
    ///
    /// Duplicates are skipped. Tasks that cannot be applied are moved to
    /// the DLQ and the batch continues.
    ///
    /// # Errors
    ///
    /// Stops at the first infrastructure failure (shard lost, lease
    /// timeout, storage); tasks from that point on are not acknowledged
    /// and will be admitted again on redelivery.
    #[tracing::instrument(skip(self, tasks), fields(count = tasks.len()))]
    pub async fn apply_batch(
        &self,
        source_cluster: &str,
        tasks: Vec<InboundTask>,
    ) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for inbound in tasks {
            match self.ordering.admit(source_cluster, inbound.source_task_id) {
                Admission::Duplicate => {
                    outcome.duplicates += 1;
                    self.metrics.record_replication(source_cluster, "duplicate");
                    continue;
                }
                Admission::Quarantine(reason) => {
                    self.quarantine(source_cluster, &inbound.task, &reason).await?;
                    outcome.quarantined += 1;
                }
                Admission::Apply => match self.apply_task(&inbound.task).await {
                    Ok(()) => {
                        outcome.applied += 1;
                        self.metrics.record_replication(source_cluster, "applied");
                    }
                    Err(err) if is_infrastructure(&err) => return Err(err),
                    Err(err) => {
                        tracing::warn!(
                            source_task_id = inbound.source_task_id,
                            error = %err,
                            "quarantining replication task"
                        );
                        self.quarantine(source_cluster, &inbound.task, &err.to_string())
                            .await?;
                        outcome.quarantined += 1;
                    }
                },
            }
            self.ordering
                .acknowledge(source_cluster, inbound.source_task_id);
        }
        Ok(outcome)
    }

    /// Applies one task without ordering checks.
    ///
    /// # Errors
    ///
    /// Returns the reason the task cannot be applied.
    pub async fn apply_task(&self, task: &ReplicationTask) -> Result<()> {
        match task {
            ReplicationTask::HistoryBatch { key, events, .. } => {
                self.apply_events(key, events.clone()).await
            }
            ReplicationTask::WorkflowState { key, events, .. } => {
                if events.first().map(|e| e.event_id) != Some(FIRST_EVENT_ID) {
                    return Err(Error::invalid_argument(format!(
                        "workflow state for {key} must start at event {FIRST_EVENT_ID}"
                    )));
                }
                self.apply_events(key, events.clone()).await
            }
            ReplicationTask::SyncActivity {
                key,
                activity_id,
                scheduled_event_id,
                attempt,
                heartbeat_details,
                last_heartbeat_time,
                ..
            } => {
                let op = SyncActivity {
                    activity_id: activity_id.clone(),
                    scheduled_event_id: *scheduled_event_id,
                    attempt: *attempt,
                    heartbeat_details: heartbeat_details.clone(),
                    last_heartbeat_time: *last_heartbeat_time,
                };
                self.txn
                    .get_and_update_workflow_with_new(key, op, NewRunPolicy::Forbid)
                    .await
            }
        }
    }

    async fn apply_events(
        &self,
        key: &WorkflowKey,
        events: Vec<crate::events::HistoryEvent>,
    ) -> Result<()> {
        match self.txn.apply_replicated_events(key, events).await? {
            ReplicatedOutcome::Applied { events } => {
                tracing::debug!(%key, events, "applied replicated events");
            }
            ReplicatedOutcome::AlreadyApplied => {
                tracing::debug!(%key, "replicated events already present");
            }
        }
        Ok(())
    }

    async fn quarantine(&self, source: &str, task: &ReplicationTask, reason: &str) -> Result<u64> {
        let shard = self.txn.checker().shard();
        let payload = persistence::encode_replication_task(task)?;
        let id = shard
            .store()
            .enqueue_dlq(shard.id(), shard.token(), source, payload, reason)
            .await?;
        self.metrics.record_replication(source, "quarantined");
        Ok(id)
    }

    /// Acknowledges outbound tasks up to `last_acked` and returns the next page.
    ///
    /// # Errors
    ///
    /// Returns store or decoding errors.
    pub async fn get_replication_messages(
        &self,
        last_acked: u64,
        limit: usize,
    ) -> Result<Vec<OutboundMessage>> {
        let shard = self.txn.checker().shard();
        let store = shard.store();
        loop {
            let records = store
                .read_queue(shard.id(), QueueCategory::Replication, 0, SCAN_PAGE)
                .await?;
            let acked: Vec<u64> = records
                .iter()
                .map(|r| r.task_id)
                .take_while(|id| *id <= last_acked)
                .collect();
            for task_id in &acked {
                store
                    .complete_queue_task(shard.id(), QueueCategory::Replication, *task_id)
                    .await?;
            }
            if acked.len() < SCAN_PAGE {
                break;
            }
        }

        store
            .read_queue(shard.id(), QueueCategory::Replication, last_acked, limit)
            .await?
            .into_iter()
            .map(|r| {
                Ok(OutboundMessage {
                    task_id: r.task_id,
                    task: persistence::decode_replication_task(&r.payload)?,
                })
            })
            .collect()
    }

    /// Publishes the complete history of `key` as one outbound task.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when no local cluster name is configured,
    /// `NotFound` for unknown runs, and commit errors.
    pub async fn generate_last_history_replication_tasks(&self, key: &WorkflowKey) -> Result<u64> {
        let Some(cluster) = &self.local_cluster else {
            return Err(Error::invalid_argument(
                "replication is not configured on this cluster",
            ));
        };
        let shard = self.txn.checker().shard();
        let blobs = shard.store().read_history(key, 0).await?;
        if blobs.is_empty() {
            return Err(Error::not_found("workflow execution", key));
        }
        let task = ReplicationTask::WorkflowState {
            source_cluster: cluster.clone(),
            key: key.clone(),
            events: persistence::decode_events(&blobs)?,
        };

        shard.assert_owned().await?;
        let batch = CommitBatch {
            replication_tasks: vec![persistence::encode_replication_task(&task)?],
            ..CommitBatch::default()
        };
        match shard.store().commit(shard.id(), shard.token(), batch).await? {
            WriteResult::Committed(outcome) => outcome
                .replication_task_ids
                .first()
                .copied()
                .ok_or_else(|| Error::internal("store assigned no replication task ID")),
            other => Err(Error::internal(format!(
                "queue-only commit reported {other:?}"
            ))),
        }
    }

    /// Returns replication progress for the shard.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn get_replication_status(&self) -> Result<ReplicationStatus> {
        let shard = self.txn.checker().shard();
        let mut backlog = 0;
        let mut after = 0;
        loop {
            let page = shard
                .store()
                .read_queue(shard.id(), QueueCategory::Replication, after, SCAN_PAGE)
                .await?;
            backlog += page.len();
            match page.last() {
                Some(last) if page.len() == SCAN_PAGE => after = last.task_id,
                _ => break,
            }
        }
        Ok(ReplicationStatus {
            shard_id: shard.id(),
            inbound_watermarks: self.ordering.watermarks(),
            outbound_backlog: backlog,
            remote_cluster_times: self
                .remote_times
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        })
    }

    /// Reads quarantined items from `source_cluster`.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn get_dlq_messages(
        &self,
        source_cluster: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<DlqRecord>> {
        let shard = self.txn.checker().shard();
        Ok(shard
            .store()
            .read_dlq(shard.id(), source_cluster, after, limit)
            .await?)
    }

    /// Reads quarantined items decoded as replication tasks.
    ///
    /// # Errors
    ///
    /// Returns store or decoding errors.
    pub async fn get_dlq_replication_messages(
        &self,
        source_cluster: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<(u64, ReplicationTask)>> {
        self.get_dlq_messages(source_cluster, after, limit)
            .await?
            .into_iter()
            .map(|r| Ok((r.message_id, persistence::decode_replication_task(&r.payload)?)))
            .collect()
    }

    /// Deletes quarantined items up to and including `inclusive_end`.
    ///
    /// # Errors
    ///
    /// Returns store errors, including `ShardOwnershipLost`.
    #[tracing::instrument(skip(self))]
    pub async fn purge_dlq_messages(&self, source_cluster: &str, inclusive_end: u64) -> Result<usize> {
        let shard = self.txn.checker().shard();
        let purged = shard
            .store()
            .delete_dlq(shard.id(), shard.token(), source_cluster, inclusive_end)
            .await?;
        self.refresh_dlq_depth(source_cluster).await?;
        Ok(purged)
    }

    /// Re-applies quarantined items up to and including `inclusive_end`.
    ///
    /// Items that fail again are re-quarantined with the new reason.
    ///
    /// # Errors
    ///
    /// Stops at infrastructure failures before touching the DLQ.
    #[tracing::instrument(skip(self))]
    pub async fn merge_dlq_messages(
        &self,
        source_cluster: &str,
        inclusive_end: u64,
    ) -> Result<MergeOutcome> {
        let mut outcome = MergeOutcome::default();
        let mut failures: Vec<(ReplicationTask, String)> = Vec::new();
        let mut after = 0;

        'pages: loop {
            let page = self
                .get_dlq_replication_messages(source_cluster, after, SCAN_PAGE)
                .await?;
            let full = page.len() == SCAN_PAGE;
            for (message_id, task) in page {
                if message_id > inclusive_end {
                    break 'pages;
                }
                after = message_id;
                match self.apply_task(&task).await {
                    Ok(()) => outcome.merged += 1,
                    Err(err) if is_infrastructure(&err) => return Err(err),
                    Err(err) => failures.push((task, err.to_string())),
                }
            }
            if !full {
                break;
            }
        }

        let shard = self.txn.checker().shard();
        shard
            .store()
            .delete_dlq(shard.id(), shard.token(), source_cluster, after)
            .await?;
        for (task, reason) in &failures {
            self.quarantine(source_cluster, task, reason).await?;
        }
        outcome.requeued = failures.len();
        self.refresh_dlq_depth(source_cluster).await?;
        Ok(outcome)
    }

    async fn refresh_dlq_depth(&self, source_cluster: &str) -> Result<()> {
        let depth = self
            .get_dlq_messages(source_cluster, 0, usize::MAX)
            .await?
            .len();
        self.metrics.set_dlq_depth(source_cluster, depth);
        Ok(())
    }
}

/// Errors that say nothing about the task itself.
fn is_infrastructure(err: &Error) -> bool {
    matches!(
        err,
        Error::LeaseTimeout { .. }
            | Error::Core(
                strand_core::Error::ShardOwnershipLost { .. }
                    | strand_core::Error::Storage { .. }
                    | strand_core::Error::ConcurrentUpdate { .. }
            )
    )
}

/// Copies activity progress from the source cluster.
struct SyncActivity {
    activity_id: String,
    scheduled_event_id: i64,
    attempt: u32,
    heartbeat_details: Option<Payload>,
    last_heartbeat_time: Option<DateTime<Utc>>,
}

impl UpdateOperation for SyncActivity {
    type Output = ();
    const NAME: &'static str = "sync_activity";

    fn apply(self, ctx: &mut UpdateContext) -> Result<(UpdateAction, ())> {
        let Some(activity) = ctx.state_mut().activity_mut(&self.activity_id) else {
            // Already finished and pruned locally.
            return Ok((UpdateAction::NOOP, ()));
        };
        if activity.scheduled_event_id != self.scheduled_event_id || self.attempt < activity.attempt {
            return Ok((UpdateAction::NOOP, ()));
        }
        activity.attempt = self.attempt;
        activity.heartbeat_details = self.heartbeat_details;
        activity.last_heartbeat_time = self.last_heartbeat_time;
        Ok((UpdateAction::UPDATE, ()))
    }
}
