//! In-memory execution store.
//!
//! ## Limitations
//!
//! - Not durable: everything is lost when the process exits.
//! - A single `RwLock` serializes all writers across shards.
//!
//! Not suitable for production. Used by tests, local development, and the
//! default server wiring.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;

use super::{
    CommitBatch, CommitOutcome, CurrentRunPrecondition, DlqRecord, ExecutionStore, QueueCategory, QueueRecord, RunRecord,
    WritePrecondition, WriteResult,
};
use crate::error::{Error, Result};
use crate::fencing::FencingToken;
use crate::id::{NamespaceId, RunId, ShardId, WorkflowId, WorkflowKey};

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::internal("execution store lock poisoned")
}

#[derive(Debug, Clone)]
struct StoredRun {
    version: u64,
    snapshot: Bytes,
    events: Vec<Bytes>,
}

#[derive(Debug, Default)]
struct Queue {
    next_task_id: u64,
    records: BTreeMap<u64, Bytes>,
}

impl Queue {
    fn push(&mut self, payload: Bytes) -> u64 {
        self.next_task_id += 1;
        self.records.insert(self.next_task_id, payload);
        self.next_task_id
    }
}

#[derive(Debug, Default)]
struct Dlq {
    next_message_id: u64,
    records: BTreeMap<u64, DlqRecord>,
}

#[derive(Debug, Default)]
struct Inner {
    shard_tokens: HashMap<ShardId, u64>,
    runs: HashMap<WorkflowKey, StoredRun>,
    current: HashMap<(NamespaceId, WorkflowId), RunId>,
    queues: HashMap<(ShardId, QueueCategory), Queue>,
    dlqs: HashMap<(ShardId, String), Dlq>,
}

impl Inner {
    fn check_token(&self, shard_id: ShardId, token: FencingToken) -> Result<()> {
        let current = self.shard_tokens.get(&shard_id).copied();
        if current == Some(token.sequence()) {
            Ok(())
        } else {
            Err(Error::ShardOwnershipLost {
                shard_id: shard_id.get(),
                held: token.sequence(),
                current,
            })
        }
    }
}

/// Thread-safe in-memory [`ExecutionStore`].
#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    inner: RwLock<Inner>,
}

impl MemoryExecutionStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records in a shard queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn queue_depth(&self, shard_id: ShardId, category: QueueCategory) -> Result<usize> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .queues
            .get(&(shard_id, category))
            .map_or(0, |q| q.records.len()))
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn acquire_shard(&self, shard_id: ShardId) -> Result<FencingToken> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let token = inner.shard_tokens.entry(shard_id).or_insert(0);
        *token += 1;
        Ok(FencingToken::new(*token))
    }

    async fn shard_token(&self, shard_id: ShardId) -> Result<Option<FencingToken>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.shard_tokens.get(&shard_id).copied().map(FencingToken::new))
    }

    async fn load_run(&self, key: &WorkflowKey) -> Result<Option<RunRecord>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.runs.get(key).map(|run| RunRecord {
            version: run.version,
            snapshot: run.snapshot.clone(),
            history_len: run.events.len(),
        }))
    }

    async fn read_history(&self, key: &WorkflowKey, from_index: usize) -> Result<Vec<Bytes>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let run = inner
            .runs
            .get(key)
            .ok_or_else(|| Error::not_found("workflow run", key))?;
        Ok(run.events.iter().skip(from_index).cloned().collect())
    }

    async fn current_run(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
    ) -> Result<Option<RunId>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .current
            .get(&(namespace_id.clone(), workflow_id.clone()))
            .copied())
    }

    async fn commit(
        &self,
        shard_id: ShardId,
        token: FencingToken,
        batch: CommitBatch,
    ) -> Result<WriteResult> {
        let mut guard = self.inner.write().map_err(poison_err)?;
        let inner = &mut *guard;
        inner.check_token(shard_id, token)?;

        for write in &batch.runs {
            let current_version = inner.runs.get(&write.key).map(|r| r.version);
            let holds = match write.precondition {
                WritePrecondition::DoesNotExist => current_version.is_none(),
                WritePrecondition::MatchesVersion(expected) => current_version == Some(expected),
            };
            if !holds {
                return Ok(WriteResult::PreconditionFailed {
                    key: write.key.clone(),
                    current_version,
                });
            }
            if let CurrentRunPrecondition::Expect(expected) = write.current_run {
                let actual = inner
                    .current
                    .get(&(write.key.namespace_id.clone(), write.key.workflow_id.clone()))
                    .copied();
                if actual != expected {
                    return Ok(WriteResult::CurrentRunMismatch {
                        key: write.key.clone(),
                        current_run: actual,
                    });
                }
            }
        }

        let mut outcome = CommitOutcome::default();
        for write in batch.runs {
            let run = inner.runs.entry(write.key.clone()).or_insert_with(|| StoredRun {
                version: 0,
                snapshot: Bytes::new(),
                events: Vec::new(),
            });
            run.version += 1;
            run.snapshot = write.snapshot;
            if write.replace_history {
                run.events = write.append_events;
            } else {
                run.events.extend(write.append_events);
            }
            outcome.versions.push(run.version);

            if write.make_current {
                inner.current.insert(
                    (write.key.namespace_id.clone(), write.key.workflow_id.clone()),
                    write.key.run_id,
                );
            }
        }

        let transfer = inner
            .queues
            .entry((shard_id, QueueCategory::Transfer))
            .or_default();
        for payload in batch.transfer_tasks {
            outcome.transfer_task_ids.push(transfer.push(payload));
        }
        let replication = inner
            .queues
            .entry((shard_id, QueueCategory::Replication))
            .or_default();
        for payload in batch.replication_tasks {
            outcome.replication_task_ids.push(replication.push(payload));
        }

        Ok(WriteResult::Committed(outcome))
    }

    async fn delete_run(
        &self,
        shard_id: ShardId,
        token: FencingToken,
        key: &WorkflowKey,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.check_token(shard_id, token)?;
        inner.runs.remove(key);
        let pointer = (key.namespace_id.clone(), key.workflow_id.clone());
        if inner.current.get(&pointer) == Some(&key.run_id) {
            inner.current.remove(&pointer);
        }
        Ok(())
    }

    async fn read_queue(
        &self,
        shard_id: ShardId,
        category: QueueCategory,
        after: u64,
        limit: usize,
    ) -> Result<Vec<QueueRecord>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let Some(queue) = inner.queues.get(&(shard_id, category)) else {
            return Ok(Vec::new());
        };
        Ok(queue
            .records
            .range(after.saturating_add(1)..)
            .take(limit)
            .map(|(task_id, payload)| QueueRecord {
                task_id: *task_id,
                payload: payload.clone(),
            })
            .collect())
    }

    async fn complete_queue_task(
        &self,
        shard_id: ShardId,
        category: QueueCategory,
        task_id: u64,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if let Some(queue) = inner.queues.get_mut(&(shard_id, category)) {
            queue.records.remove(&task_id);
        }
        Ok(())
    }

    async fn enqueue_dlq(
        &self,
        shard_id: ShardId,
        token: FencingToken,
        source_cluster: &str,
        payload: Bytes,
        reason: &str,
    ) -> Result<u64> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.check_token(shard_id, token)?;
        let dlq = inner
            .dlqs
            .entry((shard_id, source_cluster.to_string()))
            .or_default();
        dlq.next_message_id += 1;
        let message_id = dlq.next_message_id;
        dlq.records.insert(
            message_id,
            DlqRecord {
                message_id,
                source_cluster: source_cluster.to_string(),
                payload,
                reason: reason.to_string(),
                enqueued_at: Utc::now(),
            },
        );
        Ok(message_id)
    }

    async fn read_dlq(
        &self,
        shard_id: ShardId,
        source_cluster: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<DlqRecord>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let Some(dlq) = inner.dlqs.get(&(shard_id, source_cluster.to_string())) else {
            return Ok(Vec::new());
        };
        Ok(dlq
            .records
            .range(after.saturating_add(1)..)
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn delete_dlq(
        &self,
        shard_id: ShardId,
        token: FencingToken,
        source_cluster: &str,
        inclusive_end: u64,
    ) -> Result<usize> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.check_token(shard_id, token)?;
        let Some(dlq) = inner.dlqs.get_mut(&(shard_id, source_cluster.to_string())) else {
            return Ok(0);
        };
        let keep = dlq.records.split_off(&inclusive_end.saturating_add(1));
        let removed = dlq.records.len();
        dlq.records = keep;
        Ok(removed)
    }
}
