//! Shard ownership.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use strand_core::{ExecutionStore, FencingToken, ShardId};

use crate::error::{Error, Result};

/// This host's ownership of one shard.
///
/// Holds the fencing token obtained at acquisition. Ownership is
/// re-validated against the store with [`Shard::assert_owned`] before every
/// persist; once a newer owner is observed the shard is marked lost for
/// good and every later call fails fast.
pub struct Shard {
    id: ShardId,
    token: FencingToken,
    store: Arc<dyn ExecutionStore>,
    lost: AtomicBool,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.id)
            .field("token", &self.token)
            .field("lost", &self.lost.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Shard {
    /// Takes ownership of `id`, invalidating any previous owner's token.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot issue a token.
    #[tracing::instrument(skip(store), fields(shard_id = id.get()))]
    pub async fn acquire(store: Arc<dyn ExecutionStore>, id: ShardId) -> Result<Arc<Self>> {
        let token = store.acquire_shard(id).await?;
        tracing::info!(token = token.sequence(), "acquired shard");
        Ok(Arc::new(Self {
            id,
            token,
            store,
            lost: AtomicBool::new(false),
        }))
    }

    /// Returns the shard ID.
    #[must_use]
    pub const fn id(&self) -> ShardId {
        self.id
    }

    /// Returns the token held since acquisition.
    #[must_use]
    pub const fn token(&self) -> FencingToken {
        self.token
    }

    /// Returns the execution store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// Returns false once ownership loss has been observed.
    #[must_use]
    pub fn is_owned(&self) -> bool {
        !self.lost.load(Ordering::Acquire)
    }

    /// Marks the shard as lost.
    pub fn mark_lost(&self) {
        if !self.lost.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                shard_id = self.id.get(),
                token = self.token.sequence(),
                "shard ownership lost"
            );
        }
    }

    /// Verifies against the store that this host still owns the shard.
    ///
    /// # Errors
    ///
    /// Returns `ShardOwnershipLost` if another owner acquired the shard.
    pub async fn assert_owned(&self) -> Result<()> {
        if !self.is_owned() {
            return Err(self.ownership_lost(None));
        }
        let current = self.store.shard_token(self.id).await?;
        if current == Some(self.token) {
            return Ok(());
        }
        self.mark_lost();
        Err(self.ownership_lost(current))
    }

    pub(crate) fn ownership_lost(&self, current: Option<FencingToken>) -> Error {
        Error::Core(strand_core::Error::ShardOwnershipLost {
            shard_id: self.id.get(),
            held: self.token.sequence(),
            current: current.map(FencingToken::sequence),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::MemoryExecutionStore;

    #[tokio::test]
    async fn newer_owner_fences_older() {
        let store: Arc<dyn ExecutionStore> = Arc::new(MemoryExecutionStore::new());
        let id = ShardId::new(1).unwrap();

        let old = Shard::acquire(Arc::clone(&store), id).await.unwrap();
        old.assert_owned().await.unwrap();

        let new = Shard::acquire(Arc::clone(&store), id).await.unwrap();
        assert!(new.token().is_newer_than(old.token()));

        let err = old.assert_owned().await.unwrap_err();
        assert!(err.is_shard_ownership_lost());
        assert!(!old.is_owned());
        new.assert_owned().await.unwrap();
    }
}
