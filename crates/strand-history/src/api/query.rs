//! Workflow queries.
//!
//! Queries are answered by workers, never by history. The history service
//! only checks that the run exists and forwards the query to whatever
//! [`QueryDispatcher`] the host wired in.

use std::sync::Arc;

use async_trait::async_trait;

use strand_core::WorkflowKey;

use crate::error::{Error, Result};
use crate::events::Payload;
use crate::transaction::TransactionEngine;

/// A query against a run.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowQuery {
    /// Query handler name.
    pub query_type: String,
    /// Query arguments.
    pub args: Option<Payload>,
}

/// Sends queries to workers of the run's task queue.
#[async_trait]
pub trait QueryDispatcher: Send + Sync {
    /// Dispatches `query` to a worker for `task_queue` and returns its answer.
    async fn dispatch(
        &self,
        key: &WorkflowKey,
        task_queue: &str,
        query: &WorkflowQuery,
    ) -> std::result::Result<Option<Payload>, String>;
}

/// Dispatcher used when no worker transport is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoQueryDispatcher;

#[async_trait]
impl QueryDispatcher for NoQueryDispatcher {
    async fn dispatch(
        &self,
        _key: &WorkflowKey,
        task_queue: &str,
        _query: &WorkflowQuery,
    ) -> std::result::Result<Option<Payload>, String> {
        Err(format!("no query transport configured for task queue {task_queue}"))
    }
}

/// Answers a query through `dispatcher`.
///
/// # Errors
///
/// `NotFound` for unknown runs; `QueryFailed` when the dispatcher fails.
#[tracing::instrument(skip(txn, dispatcher, query), fields(run = %key, query_type = %query.query_type))]
pub async fn query_workflow(
    txn: &TransactionEngine,
    dispatcher: &Arc<dyn QueryDispatcher>,
    key: &WorkflowKey,
    query: WorkflowQuery,
) -> Result<Option<Payload>> {
    let state = txn.read(key).await?;
    let execution = state.execution();
    let task_queue = execution
        .sticky_task_queue
        .as_deref()
        .unwrap_or(&execution.task_queue);
    dispatcher
        .dispatch(key, task_queue, &query)
        .await
        .map_err(|message| Error::QueryFailed { message })
}
