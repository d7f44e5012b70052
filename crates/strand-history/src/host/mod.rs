//! Composition root.
//!
//! [`Host::build`] wires one history process: it acquires every shard,
//! builds a transaction engine and a [`HistoryEngine`] per shard, and
//! starts the background workers that consume committed tasks.
//!
//! ```text
//!                     ┌─────────────────────┐
//!   commit ──tasks──▶ │ TransactionEngine   │──▶ CallbackQueue ──▶ CallbackDispatcher
//!                     │ (one per shard)     │──▶ matching channel ──▶ MatchingClient
//!                     └─────────────────────┘──▶ relay channel ──▶ ExecutionRelay ──▶ Engine
//! ```
//!
//! Every task is acknowledged by the worker that processed it. Nothing is
//! acknowledged on shutdown, so interrupted work is re-offered when the
//! engines next start.

mod matching;
mod pump;
mod relay;

pub use matching::{InMemoryMatching, MatchingClient, MatchingTask};

use std::collections::HashMap;
use std::sync::Arc;

use futures::{TryStreamExt, stream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use strand_core::{ExecutionStore, NamespaceId, ShardId, WorkflowId, WorkflowKey};

use crate::api::query::{NoQueryDispatcher, QueryDispatcher};
use crate::callbacks::{
    CallbackDispatcher, CallbackQueue, CompletionClient, DispatcherHandle, HttpCompletionClient,
};
use crate::config::Config;
use crate::engine::{Engine, HistoryEngine};
use crate::error::{Error, Result};
use crate::lease::ConsistencyChecker;
use crate::metrics::HistoryMetrics;
use crate::replication::{ReplicationStream, SourceSequenceOrdering};
use crate::shard::Shard;
use crate::tasks::TaskListener;
use crate::transaction::TransactionEngine;

use self::matching::MatchingForwarder;
use self::pump::{TaskChannel, spawn_worker};
use self::relay::ExecutionRelay;

const MAX_CONCURRENT_SHARD_STARTS: usize = 8;

/// External services the host talks to.
pub struct Collaborators {
    /// Callback delivery client; an HTTP client built from the delivery
    /// config when `None`.
    pub completion_client: Option<Arc<dyn CompletionClient>>,
    /// Destination for workflow and activity tasks.
    pub matching: Arc<dyn MatchingClient>,
    /// Worker transport for queries.
    pub queries: Arc<dyn QueryDispatcher>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            completion_client: None,
            matching: Arc::new(InMemoryMatching::new()),
            queries: Arc::new(NoQueryDispatcher),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("completion_client", &self.completion_client.is_some())
            .finish_non_exhaustive()
    }
}

/// Routes requests to the engine that owns the workflow's shard.
#[derive(Clone)]
pub struct EngineRouter {
    engines: Arc<HashMap<ShardId, Arc<dyn Engine>>>,
    shard_count: u32,
}

impl std::fmt::Debug for EngineRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRouter")
            .field("shard_count", &self.shard_count)
            .finish_non_exhaustive()
    }
}

impl EngineRouter {
    /// Returns the shard owning a workflow.
    #[must_use]
    pub fn shard_for(&self, namespace_id: &NamespaceId, workflow_id: &WorkflowId) -> ShardId {
        ShardId::for_workflow(namespace_id, workflow_id, self.shard_count)
    }

    /// Returns the engine owning a workflow.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the shard has no engine on this host.
    pub fn engine_for(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
    ) -> Result<Arc<dyn Engine>> {
        let shard_id = self.shard_for(namespace_id, workflow_id);
        self.engine(shard_id)
            .ok_or_else(|| Error::internal(format!("shard {shard_id} is not hosted here")))
    }

    /// Returns the engine owning a run.
    ///
    /// # Errors
    ///
    /// See [`EngineRouter::engine_for`].
    pub fn engine_for_key(&self, key: &WorkflowKey) -> Result<Arc<dyn Engine>> {
        self.engine_for(&key.namespace_id, &key.workflow_id)
    }

    /// Returns the engine of `shard_id`, if hosted here.
    #[must_use]
    pub fn engine(&self, shard_id: ShardId) -> Option<Arc<dyn Engine>> {
        self.engines.get(&shard_id).cloned()
    }

    /// Iterates over every hosted engine.
    pub fn engines(&self) -> impl Iterator<Item = &Arc<dyn Engine>> {
        self.engines.values()
    }
}

/// A running history process.
pub struct Host {
    config: Config,
    router: EngineRouter,
    dispatcher: DispatcherHandle,
    workers: Vec<JoinHandle<()>>,
    stop: CancellationToken,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("shard_count", &self.config.shard_count)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl Host {
    /// Builds every shard engine and starts the task workers.
    ///
    /// The engines are built stopped; call [`Host::start`] to begin serving.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an invalid config and store errors
    /// from shard acquisition.
    #[tracing::instrument(skip_all, fields(shard_count = config.shard_count))]
    pub async fn build(
        config: Config,
        store: Arc<dyn ExecutionStore>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = HistoryMetrics::new();

        let (callback_queue, callback_rx) = CallbackQueue::channel();
        let (matching_channel, matching_rx) = TaskChannel::new::<MatchingForwarder>();
        let (relay_channel, relay_rx) = TaskChannel::new::<ExecutionRelay>();
        let listeners: Vec<Arc<dyn TaskListener>> = vec![
            Arc::new(callback_queue),
            Arc::new(matching_channel),
            Arc::new(relay_channel),
        ];

        let mut transactions = HashMap::new();
        let mut engines: HashMap<ShardId, Arc<dyn Engine>> = HashMap::new();
        for id in 1..=config.shard_count {
            let shard_id = ShardId::new(id)?;
            let shard = Shard::acquire(Arc::clone(&store), shard_id).await?;
            let checker = Arc::new(ConsistencyChecker::new(
                shard,
                config.lease_acquire_timeout,
                metrics.clone(),
            ));
            let txn = Arc::new(TransactionEngine::new(
                checker,
                listeners.clone(),
                config.replication.cluster_name.clone(),
                metrics.clone(),
            ));
            let replication = ReplicationStream::new(
                Arc::clone(&txn),
                Arc::new(SourceSequenceOrdering::new()),
                config.replication.cluster_name.clone(),
                metrics.clone(),
            );
            let engine = HistoryEngine::new(
                Arc::clone(&txn),
                replication,
                config.callbacks.clone(),
                Arc::clone(&collaborators.queries),
            );
            transactions.insert(shard_id, txn);
            engines.insert(shard_id, Arc::new(engine));
        }
        let router = EngineRouter {
            engines: Arc::new(engines),
            shard_count: config.shard_count,
        };

        let client = match collaborators.completion_client {
            Some(client) => client,
            None => Arc::new(HttpCompletionClient::new(config.delivery.request_timeout)?),
        };
        let dispatcher =
            CallbackDispatcher::new(transactions, client, config.delivery.clone(), metrics)
                .spawn(callback_rx);

        let stop = CancellationToken::new();
        let workers = vec![
            spawn_worker(
                Arc::new(MatchingForwarder::new(collaborators.matching)),
                Arc::clone(&store),
                matching_rx,
                stop.clone(),
            ),
            spawn_worker(
                Arc::new(ExecutionRelay::new(router.clone(), Arc::clone(&store))),
                store,
                relay_rx,
                stop.clone(),
            ),
        ];

        tracing::info!("history host built");
        Ok(Self {
            config,
            router,
            dispatcher,
            workers,
            stop,
        })
    }

    /// Starts every shard engine.
    ///
    /// # Errors
    ///
    /// Returns the first engine start failure.
    pub async fn start(&self) -> Result<()> {
        stream::iter(self.router.engines().map(Ok))
            .try_for_each_concurrent(MAX_CONCURRENT_SHARD_STARTS, |engine| async move {
                engine.start().await
            })
            .await
    }

    /// Returns the router.
    #[must_use]
    pub fn router(&self) -> &EngineRouter {
        &self.router
    }

    /// Returns the engine owning the run `key`.
    ///
    /// # Errors
    ///
    /// See [`EngineRouter::engine_for`].
    pub fn engine_for(&self, key: &WorkflowKey) -> Result<Arc<dyn Engine>> {
        self.router.engine_for_key(key)
    }

    /// Returns the engine owning a workflow ID.
    ///
    /// # Errors
    ///
    /// See [`EngineRouter::engine_for`].
    pub fn engine_for_workflow(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
    ) -> Result<Arc<dyn Engine>> {
        self.router.engine_for(namespace_id, workflow_id)
    }

    /// Stops the engines, then the task workers, then the callback
    /// dispatcher using the configured shutdown mode.
    pub async fn shutdown(self) {
        for engine in self.router.engines() {
            engine.stop().await;
        }
        self.stop.cancel();
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "task worker failed");
            }
        }
        self.dispatcher.shutdown().await;
        tracing::info!("history host stopped");
    }
}
