//! Read-only views of a run.
//!
//! Describes are served from the lease cache when the run is cached, so
//! they may lag a concurrent commit by one transaction. None of them
//! mutate state.

use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;

use strand_core::WorkflowKey;

use crate::error::{Error, Result};
use crate::persistence;
use crate::state::{
    ActivityInfo, CallbackInfo, ChildExecutionInfo, ExecutionInfo, MutableState, WorkflowTaskInfo,
};
use crate::transaction::TransactionEngine;

/// Summary of a run for operators and clients.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowExecutionDescription {
    /// Run-level metadata.
    pub execution: ExecutionInfo,
    /// Number of events in history.
    pub history_length: usize,
    /// Activities not yet in a terminal state.
    pub pending_activities: Vec<ActivityInfo>,
    /// Children whose completion has not been recorded.
    pub pending_children: Vec<ChildExecutionInfo>,
    /// The pending workflow task.
    pub pending_workflow_task: Option<WorkflowTaskInfo>,
    /// Every callback with its delivery progress.
    pub callbacks: Vec<CallbackInfo>,
}

impl From<&MutableState> for WorkflowExecutionDescription {
    fn from(state: &MutableState) -> Self {
        Self {
            execution: state.execution().clone(),
            history_length: state.history_length(),
            pending_activities: state
                .activities()
                .values()
                .filter(|a| !a.state.is_terminal())
                .cloned()
                .collect(),
            pending_children: state
                .children()
                .values()
                .filter(|c| c.outcome.is_none())
                .cloned()
                .collect(),
            pending_workflow_task: state.workflow_task().cloned(),
            callbacks: state.callbacks().to_vec(),
        }
    }
}

/// Describes a run.
///
/// # Errors
///
/// `NotFound` for unknown runs, plus lease errors.
pub async fn describe_workflow_execution(
    txn: &TransactionEngine,
    key: &WorkflowKey,
) -> Result<WorkflowExecutionDescription> {
    let state = txn.read(key).await?;
    Ok(WorkflowExecutionDescription::from(&state))
}

/// Cached and persisted views of the same run, for diagnosing cache drift.
#[derive(Debug, Clone, PartialEq)]
pub struct MutableStateDescription {
    /// State held by the lease cache, if any.
    pub cached: Option<MutableState>,
    /// State as persisted in the store.
    pub persisted: MutableState,
    /// Store version of the persisted state.
    pub version: u64,
}

/// Returns both the cached and the persisted state of a run.
///
/// # Errors
///
/// `NotFound` for unknown runs, plus store and lease errors.
pub async fn describe_mutable_state(
    txn: &TransactionEngine,
    key: &WorkflowKey,
) -> Result<MutableStateDescription> {
    let cached = txn.checker().cached(key).await?.map(|c| c.state);
    let record = txn
        .checker()
        .shard()
        .store()
        .load_run(key)
        .await?
        .ok_or_else(|| Error::not_found("workflow execution", key))?;
    Ok(MutableStateDescription {
        cached,
        persisted: persistence::decode_snapshot(&record.snapshot)?,
        version: record.version,
    })
}

/// Returns the run's mutable state.
///
/// # Errors
///
/// `NotFound` for unknown runs, plus lease errors.
pub async fn get_mutable_state(txn: &TransactionEngine, key: &WorkflowKey) -> Result<MutableState> {
    txn.read(key).await
}

/// Waits until the run's next event ID moves past `after_next_event_id`,
/// the run closes, or `timeout` elapses, then returns the current state.
///
/// # Errors
///
/// `NotFound` for unknown runs, plus lease errors.
#[tracing::instrument(skip(txn), fields(run = %key))]
pub async fn poll_mutable_state(
    txn: &TransactionEngine,
    key: &WorkflowKey,
    after_next_event_id: i64,
    timeout: Duration,
) -> Result<MutableState> {
    // Subscribe before reading so a commit in between is not missed.
    let mut notifications = txn.subscribe();
    let state = txn.read(key).await?;
    if state.next_event_id() > after_next_event_id || !state.is_running() {
        return Ok(state);
    }

    let wait = async {
        loop {
            match notifications.recv().await {
                Ok(n) if &n.key == key
                    && (n.next_event_id > after_next_event_id || !n.is_running) =>
                {
                    return;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "history notifications lagged; re-reading");
                    return;
                }
                Err(RecvError::Closed) => return,
            }
        }
    };
    if tokio::time::timeout(timeout, wait).await.is_err() {
        tracing::debug!("poll timed out");
    }
    txn.read(key).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::api::lifecycle::SignalWorkflow;
    use crate::api::testing::Fixture;

    #[tokio::test]
    async fn describe_lists_pending_work() {
        let f = Fixture::started().await;
        let description = describe_workflow_execution(&f.txn, &f.key).await.unwrap();
        assert_eq!(description.history_length, 2);
        assert!(description.pending_workflow_task.is_some());
        assert!(description.pending_activities.is_empty());
    }

    #[tokio::test]
    async fn cached_and_persisted_agree_after_commit() {
        let f = Fixture::started().await;
        let description = describe_mutable_state(&f.txn, &f.key).await.unwrap();
        assert_eq!(description.cached.as_ref(), Some(&description.persisted));
    }

    #[tokio::test]
    async fn poll_returns_after_new_event() {
        let f = Fixture::started().await;
        let next = f.state().await.next_event_id();

        let txn = Arc::clone(&f.txn);
        let key = f.key.clone();
        let poll = tokio::spawn(async move {
            poll_mutable_state(&txn, &key, next, Duration::from_secs(5)).await
        });
        tokio::task::yield_now().await;
        f.update(SignalWorkflow {
            signal_name: "go".into(),
            input: None,
            identity: "client".into(),
            request_id: None,
        })
        .await
        .unwrap();

        let state = poll.await.unwrap().unwrap();
        assert!(state.next_event_id() > next);
    }

    #[tokio::test]
    async fn poll_times_out_with_current_state() {
        let f = Fixture::started().await;
        let next = f.state().await.next_event_id();
        let state = poll_mutable_state(&f.txn, &f.key, next, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(state.next_event_id(), next);
    }
}
