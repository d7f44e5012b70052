//! Asynchronous callback delivery.
//!
//! [`CallbackQueue`] is registered as a [`TaskListener`] on every shard's
//! transaction engine and forwards committed `CallbackInvocation` tasks to
//! the [`CallbackDispatcher`]. The dispatcher runs each task on its own
//! tokio task: wait for `fire_at`, take a delivery permit, then run the
//! two-transaction delivery protocol. The permit count is the ceiling on
//! simultaneous HTTP requests.
//!
//! A task is acknowledged in the transfer queue only after its outcome has
//! been committed (or the callback no longer needs delivery). Anything
//! interrupted stays in the queue and is re-offered on the next start.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use strand_core::{QueueCategory, ShardId};

use super::client::{CompletionClient, DeliveryError};
use super::operations::{CompleteCallbackAttempt, StartCallbackAttempt};
use crate::config::{DeliveryConfig, ShutdownMode};
use crate::error::Result;
use crate::metrics::HistoryMetrics;
use crate::state::CallbackState;
use crate::tasks::{HistoryTask, QueuedTask, TaskListener};
use crate::transaction::{NewRunPolicy, TransactionEngine};

/// Listener half: forwards callback tasks to the dispatcher.
#[derive(Debug, Clone)]
pub struct CallbackQueue {
    tx: mpsc::UnboundedSender<QueuedTask>,
}

/// Receiver half, consumed by [`CallbackDispatcher::spawn`].
#[derive(Debug)]
pub struct CallbackReceiver {
    rx: mpsc::UnboundedReceiver<QueuedTask>,
}

impl CallbackQueue {
    /// Creates a connected queue and receiver.
    #[must_use]
    pub fn channel() -> (Self, CallbackReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, CallbackReceiver { rx })
    }
}

impl TaskListener for CallbackQueue {
    fn on_tasks(&self, tasks: &[QueuedTask]) {
        for task in tasks {
            if matches!(task.task, HistoryTask::CallbackInvocation { .. })
                && self.tx.send(task.clone()).is_err()
            {
                tracing::debug!(task_id = task.task_id, "callback dispatcher stopped; task left queued");
            }
        }
    }
}

/// Result of processing one invocation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// An attempt was made and its outcome committed.
    Attempted {
        /// The attempt number.
        attempt: u32,
        /// Callback state after the outcome was recorded.
        state: CallbackState,
    },
    /// The callback needed no delivery; the task was acknowledged.
    Skipped,
    /// The attempt was canceled before completing; the task stays queued.
    Abandoned,
}

/// Delivers callback completions for a set of shards.
pub struct CallbackDispatcher {
    engines: HashMap<ShardId, Arc<TransactionEngine>>,
    client: Arc<dyn CompletionClient>,
    config: DeliveryConfig,
    metrics: HistoryMetrics,
    in_flight: Mutex<HashSet<(ShardId, u64)>>,
}

impl std::fmt::Debug for CallbackDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackDispatcher")
            .field("shards", &self.engines.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CallbackDispatcher {
    /// Creates a dispatcher over the given shard engines.
    #[must_use]
    pub fn new(
        engines: HashMap<ShardId, Arc<TransactionEngine>>,
        client: Arc<dyn CompletionClient>,
        config: DeliveryConfig,
        metrics: HistoryMetrics,
    ) -> Self {
        Self {
            engines,
            client,
            config,
            metrics,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Starts draining `receiver` on a background task.
    #[must_use]
    pub fn spawn(self, receiver: CallbackReceiver) -> DispatcherHandle {
        let dispatcher = Arc::new(self);
        let stop = CancellationToken::new();
        let abandon = CancellationToken::new();
        let mode = dispatcher.config.shutdown_mode;

        let loop_stop = stop.clone();
        let loop_abandon = abandon.clone();
        let handle = tokio::spawn(async move {
            dispatcher.run(receiver, loop_stop, loop_abandon).await;
        });

        DispatcherHandle {
            handle,
            stop,
            abandon,
            mode,
        }
    }

    async fn run(
        self: Arc<Self>,
        mut receiver: CallbackReceiver,
        stop: CancellationToken,
        abandon: CancellationToken,
    ) {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_deliveries));
        let mut tasks: JoinSet<()> = JoinSet::new();
        tracing::info!(
            max_concurrent = self.config.max_concurrent_deliveries,
            "callback dispatcher started"
        );

        loop {
            tokio::select! {
                biased;

                () = stop.cancelled() => break,

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!(error = %e, "callback delivery panicked");
                        }
                    }
                }

                next = receiver.rx.recv() => {
                    let Some(task) = next else { break };
                    if !self.claim(&task) {
                        continue;
                    }
                    let this = Arc::clone(&self);
                    let permits = Arc::clone(&permits);
                    let stop = stop.clone();
                    let cancel = abandon.child_token();
                    tasks.spawn(async move {
                        this.schedule(task, permits, stop, cancel).await;
                    });
                }
            }
        }

        while tasks.join_next().await.is_some() {}
        tracing::info!("callback dispatcher stopped");
    }

    async fn schedule(
        &self,
        task: QueuedTask,
        permits: Arc<Semaphore>,
        stop: CancellationToken,
        cancel: CancellationToken,
    ) {
        if let HistoryTask::CallbackInvocation { fire_at, .. } = &task.task {
            if let Ok(delay) = (*fire_at - Utc::now()).to_std() {
                tokio::select! {
                    () = stop.cancelled() => {
                        self.release(&task);
                        return;
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }

        let permit = tokio::select! {
            () = stop.cancelled() => None,
            permit = permits.acquire_owned() => permit.ok(),
        };
        if let Some(_permit) = permit {
            if let Err(err) = self.deliver(&task, &cancel).await {
                tracing::warn!(
                    shard_id = %task.shard_id,
                    task_id = task.task_id,
                    error = %err,
                    "callback delivery failed; task left queued"
                );
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

    /// Processes one invocation task end to end.
    ///
    /// # Errors
    ///
    /// Returns transaction errors; the task is then left in the queue.
    #[tracing::instrument(
        skip(self, task, cancel),
        fields(
            shard_id = %task.shard_id,
            task_id = task.task_id,
            callback_id = tracing::field::Empty,
            attempt = tracing::field::Empty,
        )
    )]
    pub async fn deliver(
        &self,
        task: &QueuedTask,
        cancel: &CancellationToken,
    ) -> Result<DeliveryOutcome> {
        let HistoryTask::CallbackInvocation {
            key, callback_id, ..
        } = &task.task
        else {
            return Ok(DeliveryOutcome::Skipped);
        };
        tracing::Span::current().record("callback_id", *callback_id);
        let Some(engine) = self.engines.get(&task.shard_id) else {
            tracing::warn!("no engine for shard; task left queued");
            return Ok(DeliveryOutcome::Abandoned);
        };

        let start = engine
            .get_and_update_workflow_with_new(
                key,
                StartCallbackAttempt {
                    callback_id: *callback_id,
                },
                NewRunPolicy::Forbid,
            )
            .await;
        let attempt = match start {
            Ok(Some(attempt)) => attempt,
            Ok(None) => {
                self.ack(engine, task).await?;
                return Ok(DeliveryOutcome::Skipped);
            }
            Err(err) if err.is_not_found() => {
                tracing::debug!(error = %err, "callback target run is gone");
                self.ack(engine, task).await?;
                return Ok(DeliveryOutcome::Skipped);
            }
            Err(err) => return Err(err),
        };
        tracing::Span::current().record("attempt", attempt.attempt);

        self.metrics.callbacks_in_flight(1.0);
        let result = tokio::select! {
            () = cancel.cancelled() => Err(DeliveryError::Canceled),
            result = self.client.deliver(&attempt.target, &attempt.request) => result,
        };
        self.metrics.callbacks_in_flight(-1.0);

        if matches!(result, Err(DeliveryError::Canceled)) {
            tracing::info!("delivery abandoned at shutdown");
            return Ok(DeliveryOutcome::Abandoned);
        }
        self.metrics.record_callback_attempt(match &result {
            Ok(()) => "success",
            Err(err) => err.metric_label(),
        });
        if let Err(err) = &result {
            tracing::info!(error = %err, "callback attempt failed");
        }

        let state = self.complete(engine, task, attempt.attempt, result).await?;
        self.ack(engine, task).await?;
        Ok(DeliveryOutcome::Attempted {
            attempt: attempt.attempt,
            state,
        })
    }

    async fn complete(
        &self,
        engine: &TransactionEngine,
        task: &QueuedTask,
        attempt: u32,
        result: std::result::Result<(), DeliveryError>,
    ) -> Result<CallbackState> {
        let HistoryTask::CallbackInvocation {
            key, callback_id, ..
        } = &task.task
        else {
            return Ok(CallbackState::Failed);
        };
        let mut conflicts = 0;
        loop {
            let op = CompleteCallbackAttempt {
                callback_id: *callback_id,
                attempt,
                result: result.clone(),
                retry: self.config.retry.clone(),
            };
            match engine
                .get_and_update_workflow_with_new(key, op, NewRunPolicy::Forbid)
                .await
            {
                Err(err) if err.is_concurrent_update() && conflicts < self.config.conflict_retries => {
                    conflicts += 1;
                    tracing::debug!(conflicts, "retrying callback outcome after conflict");
                }
                other => return other,
            }
        }
    }

    async fn ack(&self, engine: &TransactionEngine, task: &QueuedTask) -> Result<()> {
        let shard = engine.checker().shard();
        shard
            .store()
            .complete_queue_task(task.shard_id, QueueCategory::Transfer, task.task_id)
            .await?;
        Ok(())
    }
}

/// Handle for a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    handle: JoinHandle<()>,
    stop: CancellationToken,
    abandon: CancellationToken,
    mode: ShutdownMode,
}

impl DispatcherHandle {
    /// Stops the dispatcher using the configured shutdown mode.
    pub async fn shutdown(self) {
        let mode = self.mode;
        self.shutdown_with(mode).await;
    }

    /// Stops accepting work, then drains or abandons in-flight deliveries.
    ///
    /// Deliveries still waiting for their fire time are dropped in both
    /// modes; their tasks stay queued.
    pub async fn shutdown_with(self, mode: ShutdownMode) {
        self.stop.cancel();
        if mode == ShutdownMode::Abandon {
            self.abandon.cancel();
        }
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "callback dispatcher task failed");
        }
    }

    /// Returns true while the dispatcher loop runs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Aborts the dispatcher without waiting.
    pub fn abort(&self) {
        self.abandon.cancel();
        self.handle.abort();
    }
}
