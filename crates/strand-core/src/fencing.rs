//! Shard fencing tokens.
//!
//! A shard is owned by exactly one history host at a time. Each ownership
//! acquisition bumps a per-shard counter in the execution store; the value
//! handed back is the owner's [`FencingToken`]. Every commit presents the
//! token, and the store rejects tokens that are no longer current. A host
//! that was partitioned away therefore cannot write after a new owner took
//! the shard, even if it still believes it owns it.
//!
//! # Private Constructor
//!
//! `FencingToken::new` is `pub(crate)`: tokens are only minted by the
//! execution store in this crate. Store implementations living outside the
//! crate restore persisted values through [`FencingToken::from_persisted`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Monotonic credential proving current shard ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FencingToken(u64);

impl FencingToken {
    #[must_use]
    pub(crate) const fn new(sequence: u64) -> Self {
        Self(sequence)
    }

    /// Restores a token previously issued by a store.
    ///
    /// Only store implementations should call this; application code
    /// obtains tokens from [`ExecutionStore::acquire_shard`](crate::store::ExecutionStore::acquire_shard).
    #[must_use]
    pub const fn from_persisted(sequence: u64) -> Self {
        Self(sequence)
    }

    /// Returns the raw sequence number for logging and persistence.
    #[must_use]
    pub const fn sequence(self) -> u64 {
        self.0
    }

    /// Returns true if `self` was issued after `other`.
    #[must_use]
    pub const fn is_newer_than(self, other: Self) -> bool {
        self.0 > other.0
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FencingToken({})", self.0)
    }
}
