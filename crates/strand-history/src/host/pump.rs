//! Listener-to-worker plumbing shared by the matching forwarder and the
//! execution relay.
//!
//! A [`TaskChannel`] is registered on every shard's transaction engine and
//! forwards the task kinds it accepts to a background worker. The worker
//! waits for each task's fire time, runs its [`TaskHandler`], and
//! acknowledges the task in the transfer queue on success. Failed tasks
//! stay queued and are re-offered when the engine next starts.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use strand_core::{ExecutionStore, QueueCategory, ShardId};

use crate::error::Result;
use crate::tasks::{HistoryTask, QueuedTask, TaskListener};

/// How often a retryable handler failure is retried before the task is
/// left for recovery.
const HANDLER_RETRIES: u32 = 3;

/// Processes one kind of transfer task.
#[async_trait]
pub(crate) trait TaskHandler: Send + Sync + 'static {
    /// Name used in logs.
    const NAME: &'static str;

    /// Returns true for the task kinds this handler processes.
    fn accepts(task: &HistoryTask) -> bool;

    /// Processes `task`. Success acknowledges it.
    async fn handle(&self, task: &QueuedTask) -> Result<()>;
}

/// Listener half.
#[derive(Debug, Clone)]
pub(crate) struct TaskChannel {
    tx: mpsc::UnboundedSender<QueuedTask>,
    accepts: fn(&HistoryTask) -> bool,
}

impl TaskChannel {
    pub(crate) fn new<H: TaskHandler>() -> (Self, mpsc::UnboundedReceiver<QueuedTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                accepts: H::accepts,
            },
            rx,
        )
    }
}

impl TaskListener for TaskChannel {
    fn on_tasks(&self, tasks: &[QueuedTask]) {
        for task in tasks.iter().filter(|t| (self.accepts)(&t.task)) {
            if self.tx.send(task.clone()).is_err() {
                tracing::debug!(task_id = task.task_id, "task worker stopped; task left queued");
            }
        }
    }
}

/// Spawns the worker draining `rx` into `handler`.
pub(crate) fn spawn_worker<H: TaskHandler>(
    handler: Arc<H>,
    store: Arc<dyn ExecutionStore>,
    rx: mpsc::UnboundedReceiver<QueuedTask>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    let worker = Arc::new(Worker {
        handler,
        store,
        in_flight: Mutex::new(HashSet::new()),
    });
    tokio::spawn(worker.run(rx, stop))
}

struct Worker<H> {
    handler: Arc<H>,
    store: Arc<dyn ExecutionStore>,
    in_flight: Mutex<HashSet<(ShardId, u64)>>,
}

impl<H: TaskHandler> Worker<H> {
    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<QueuedTask>, stop: CancellationToken) {
        let mut tasks: JoinSet<()> = JoinSet::new();
        tracing::info!(worker = H::NAME, "task worker started");

        loop {
            tokio::select! {
                biased;

                () = stop.cancelled() => break,

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!(worker = H::NAME, error = %e, "task handler panicked");
                        }
                    }
                }

                next = rx.recv() => {
                    let Some(task) = next else { break };
                    if !self.claim(&task) {
                        continue;
                    }
                    let this = Arc::clone(&self);
                    let stop = stop.clone();
                    tasks.spawn(async move {
                        this.process(task, stop).await;
                    });
                }
            }
        }

        // In-flight handlers finish; tasks still waiting on their timer stop.
        while tasks.join_next().await.is_some() {}
        tracing::info!(worker = H::NAME, "task worker stopped");
    }

    async fn process(&self, task: QueuedTask, stop: CancellationToken) {
        if let Some(fire_at) = task.task.fire_at() {
            if let Ok(delay) = (fire_at - Utc::now()).to_std() {
                tokio::select! {
                    () = stop.cancelled() => {
                        self.release(&task);
                        return;
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.handler.handle(&task).await {
                Ok(()) => {
                    if let Err(err) = self
                        .store
                        .complete_queue_task(task.shard_id, QueueCategory::Transfer, task.task_id)
                        .await
                    {
                        tracing::warn!(task_id = task.task_id, error = %err, "failed to acknowledge task");
                    }
                    break;
                }
                Err(err) if err.is_retryable() && attempt < HANDLER_RETRIES => {
                    tracing::debug!(
                        worker = H::NAME,
                        task_id = task.task_id,
                        attempt,
                        error = %err,
                        "retrying task"
                    );
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
                Err(err) => {
                    tracing::warn!(
                        worker = H::NAME,
                        shard_id = %task.shard_id,
                        task_id = task.task_id,
                        kind = task.task.kind(),
                        error = %err,
                        "task failed; left queued"
                    );
                    break;
                }
            }
        }
        self.release(&task);
    }

    fn claim(&self, task: &QueuedTask) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((task.shard_id, task.task_id))
    }

    fn release(&self, task: &QueuedTask) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(task.shard_id, task.task_id));
    }
}
