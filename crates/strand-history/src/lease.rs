//! Workflow lease and consistency checker.
//!
//! A [`Lease`] is the exclusive, shard-fenced handle to one run's mutable
//! state. Holding it is the only way to read state for mutation; at most
//! one lease per run exists at a time. It is an owned async mutex guard, so
//! it is released on every exit path, including a caller dropping the
//! future mid-transaction.
//!
//! ## Caching
//!
//! The checker keeps the last committed state of each run inside the run's
//! slot. A write whose outcome is unknown invalidates the slot so the next
//! lease reloads from the store. Closed runs are evicted after their final
//! commit, and the whole cache is dropped when the shard is lost.
//!
//! Dropping the cache never drops a slot that is leased: the holder keeps
//! the run's only mutex, and its cached state is discarded by the next
//! acquire because it belongs to an older cache epoch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use strand_core::WorkflowKey;

use crate::error::{Error, Result};
use crate::metrics::{HistoryMetrics, TimingGuard};
use crate::persistence;
use crate::shard::Shard;
use crate::state::MutableState;

/// Idle slots are pruned once the slot table grows past this size.
const PRUNE_THRESHOLD: usize = 4096;

/// Whether a lease may be taken on a run that does not exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseMode {
    /// The run must exist; otherwise `NotFound`.
    MustExist,
    /// The run may be absent (brand-new runs).
    AllowCreate,
}

/// Committed state of a run with its store version.
#[derive(Debug, Clone)]
pub struct CachedRun {
    /// The projection.
    pub state: MutableState,
    /// Store version the projection corresponds to.
    pub version: u64,
}

#[derive(Debug, Default)]
struct RunSlot {
    cached: Option<CachedRun>,
    epoch: u64,
}

/// Exclusive handle to one run.
#[derive(Debug)]
pub struct Lease {
    key: WorkflowKey,
    guard: OwnedMutexGuard<RunSlot>,
}

impl Lease {
    /// Returns the leased run's key.
    #[must_use]
    pub const fn key(&self) -> &WorkflowKey {
        &self.key
    }

    /// Returns the committed state, or `None` for a run that does not exist.
    #[must_use]
    pub fn current(&self) -> Option<&CachedRun> {
        self.guard.cached.as_ref()
    }

    /// Returns the committed state of a run that must exist.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the run does not exist.
    pub fn existing(&self) -> Result<&CachedRun> {
        self.current()
            .ok_or_else(|| Error::not_found("workflow execution", &self.key))
    }

    /// Installs the state produced by a successful commit.
    pub(crate) fn install(&mut self, state: MutableState, version: u64) {
        self.guard.cached = Some(CachedRun { state, version });
    }

    /// Drops the cached state so the next lease reloads from the store.
    pub(crate) fn invalidate(&mut self) {
        self.guard.cached = None;
    }
}

/// Hands out leases for runs of one shard.
#[derive(Debug)]
pub struct ConsistencyChecker {
    shard: Arc<Shard>,
    slots: Mutex<HashMap<WorkflowKey, Arc<AsyncMutex<RunSlot>>>>,
    epoch: AtomicU64,
    acquire_timeout: Duration,
    metrics: HistoryMetrics,
}

impl ConsistencyChecker {
    /// Creates a checker for `shard`.
    #[must_use]
    pub fn new(shard: Arc<Shard>, acquire_timeout: Duration, metrics: HistoryMetrics) -> Self {
        Self {
            shard,
            slots: Mutex::new(HashMap::new()),
            epoch: AtomicU64::new(0),
            acquire_timeout,
            metrics,
        }
    }

    /// Returns the shard this checker fences against.
    #[must_use]
    pub fn shard(&self) -> &Arc<Shard> {
        &self.shard
    }

    /// Acquires the lease for `key`, waiting at most the configured timeout.
    ///
    /// # Errors
    ///
    /// - `ShardOwnershipLost` if the shard has a newer owner
    /// - `LeaseTimeout` if another transaction held the run for too long
    /// - `NotFound` if the run does not exist and `mode` is
    ///   [`LeaseMode::MustExist`]
    pub async fn acquire(&self, key: &WorkflowKey, mode: LeaseMode) -> Result<Lease> {
        self.acquire_with_timeout(key, mode, self.acquire_timeout)
            .await
    }

    /// Acquires the lease for `key` with an explicit wait bound.
    ///
    /// # Errors
    ///
    /// See [`ConsistencyChecker::acquire`].
    pub async fn acquire_with_timeout(
        &self,
        key: &WorkflowKey,
        mode: LeaseMode,
        timeout: Duration,
    ) -> Result<Lease> {
        self.shard.assert_owned().await.inspect_err(|_| self.clear())?;

        let slot = self.slot(key);
        let wait = TimingGuard::new(|d| self.metrics.observe_lease_wait(d));
        let guard = tokio::time::timeout(timeout, slot.lock_owned())
            .await
            .map_err(|_| Error::LeaseTimeout {
                key: key.clone(),
                waited_ms: u64::try_from(wait.elapsed().as_millis()).unwrap_or(u64::MAX),
            })?;
        drop(wait);

        let mut lease = Lease {
            key: key.clone(),
            guard,
        };
        self.expire_stale(&mut lease.guard);
        if lease.current().is_none() {
            self.load(&mut lease).await?;
        }
        if mode == LeaseMode::MustExist {
            lease.existing()?;
        }
        Ok(lease)
    }

    async fn load(&self, lease: &mut Lease) -> Result<()> {
        let Some(record) = self.shard.store().load_run(&lease.key).await? else {
            return Ok(());
        };
        let state = persistence::decode_snapshot(&record.snapshot)?;
        if state.key() != &lease.key {
            return Err(Error::internal(format!(
                "snapshot for {} belongs to {}",
                lease.key,
                state.key()
            )));
        }
        lease.install(state, record.version);
        Ok(())
    }

    /// Returns the cached state of `key` without loading it from the store.
    ///
    /// # Errors
    ///
    /// Returns `LeaseTimeout` if the run stays leased past the timeout.
    pub async fn cached(&self, key: &WorkflowKey) -> Result<Option<CachedRun>> {
        let slot = self.slot(key);
        let mut guard = tokio::time::timeout(self.acquire_timeout, slot.lock_owned())
            .await
            .map_err(|_| Error::LeaseTimeout {
                key: key.clone(),
                waited_ms: u64::try_from(self.acquire_timeout.as_millis()).unwrap_or(u64::MAX),
            })?;
        self.expire_stale(&mut guard);
        Ok(guard.cached.clone())
    }

    /// Drops every cached state (shard lost).
    ///
    /// Idle slots are removed. Leased slots stay in the table so later
    /// leases on the same run still wait for the holder.
    pub fn clear(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        slots.retain(|_, slot| Arc::strong_count(slot) > 1);
    }

    fn expire_stale(&self, slot: &mut RunSlot) {
        let epoch = self.epoch.load(Ordering::Acquire);
        if slot.epoch != epoch {
            slot.cached = None;
            slot.epoch = epoch;
        }
    }

    /// Returns the number of tracked run slots.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn slot(&self, key: &WorkflowKey) -> Arc<AsyncMutex<RunSlot>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.len() >= PRUNE_THRESHOLD {
            // Only the table holds an idle slot, and cloning requires the
            // table lock, so removing it cannot split a run across mutexes.
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        }
        Arc::clone(slots.entry(key.clone()).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::{ExecutionStore, MemoryExecutionStore, NamespaceId, RunId, ShardId, WorkflowId};

    async fn checker(timeout: Duration) -> (Arc<dyn ExecutionStore>, ConsistencyChecker) {
        let store: Arc<dyn ExecutionStore> = Arc::new(MemoryExecutionStore::new());
        let shard = Shard::acquire(Arc::clone(&store), ShardId::new(1).unwrap())
            .await
            .unwrap();
        (store, ConsistencyChecker::new(shard, timeout, HistoryMetrics::new()))
    }

    fn key() -> WorkflowKey {
        WorkflowKey::new(
            NamespaceId::new("default").unwrap(),
            WorkflowId::new("wf").unwrap(),
            RunId::generate(),
        )
    }

    #[tokio::test]
    async fn missing_run_is_not_found() {
        let (_, checker) = checker(Duration::from_secs(1)).await;
        let err = checker.acquire(&key(), LeaseMode::MustExist).await.unwrap_err();
        assert!(err.is_not_found());

        let lease = checker.acquire(&key(), LeaseMode::AllowCreate).await.unwrap();
        assert!(lease.current().is_none());
    }

    #[tokio::test]
    async fn second_lease_waits_for_release() {
        let (_, checker) = checker(Duration::from_millis(50)).await;
        let key = key();
        let held = checker.acquire(&key, LeaseMode::AllowCreate).await.unwrap();

        let err = checker
            .acquire(&key, LeaseMode::AllowCreate)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LeaseTimeout { .. }));
        assert!(err.is_retryable());

        drop(held);
        checker.acquire(&key, LeaseMode::AllowCreate).await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak_the_lease() {
        let (_, checker) = checker(Duration::from_secs(5)).await;
        let key = key();
        {
            let fut = checker.acquire(&key, LeaseMode::AllowCreate);
            drop(fut);
        }
        let held = checker.acquire(&key, LeaseMode::AllowCreate).await.unwrap();
        drop(held);
        checker.acquire(&key, LeaseMode::AllowCreate).await.unwrap();
    }

    #[tokio::test]
    async fn lost_shard_fails_acquire() {
        let (store, checker) = checker(Duration::from_secs(1)).await;
        store.acquire_shard(ShardId::new(1).unwrap()).await.unwrap();
        let err = checker
            .acquire(&key(), LeaseMode::AllowCreate)
            .await
            .unwrap_err();
        assert!(err.is_shard_ownership_lost());
        assert_eq!(checker.slot_count(), 0);
    }

    #[tokio::test]
    async fn clear_keeps_leased_slot_exclusive() {
        let (_, checker) = checker(Duration::from_millis(50)).await;
        let key = key();
        let held = checker.acquire(&key, LeaseMode::AllowCreate).await.unwrap();
        checker.acquire(&wf_key(), LeaseMode::AllowCreate).await.unwrap();
        assert_eq!(checker.slot_count(), 2);

        checker.clear();
        assert_eq!(checker.slot_count(), 1);
        let err = checker
            .acquire(&key, LeaseMode::AllowCreate)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LeaseTimeout { .. }));

        drop(held);
        checker.acquire(&key, LeaseMode::AllowCreate).await.unwrap();
    }

    #[tokio::test]
    async fn clear_discards_state_cached_by_a_holder() {
        let (_, checker) = checker(Duration::from_secs(1)).await;
        let key = key();
        let mut held = checker.acquire(&key, LeaseMode::AllowCreate).await.unwrap();
        checker.clear();
        // Installed after the clear, so it belongs to the previous epoch.
        held.install(MutableState::new(key.clone()), 7);
        drop(held);

        assert!(checker.cached(&key).await.unwrap().is_none());
        let lease = checker.acquire(&key, LeaseMode::AllowCreate).await.unwrap();
        assert!(lease.current().is_none());
    }

    fn wf_key() -> WorkflowKey {
        WorkflowKey::new(
            NamespaceId::new("default").unwrap(),
            WorkflowId::new("other").unwrap(),
            RunId::generate(),
        )
    }
}
