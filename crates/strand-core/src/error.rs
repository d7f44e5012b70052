//! Error types and result aliases for Strand.
//!
//! This module defines the shared error taxonomy used by every Strand
//! component. Variants map onto the conditions callers are expected to
//! handle differently: stale shard ownership, optimistic-concurrency
//! conflicts, missing runs, and invalid input.

use std::fmt;

/// The result type used throughout Strand.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Strand operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// The requested resource was not found.
    #[error("not found: {resource_type} {id}")]
    NotFound {
        /// The type of resource that was not found.
        resource_type: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// Malformed or policy-violating input.
    #[error("{message}")]
    InvalidArgument {
        /// Description of the violation, surfaced verbatim to callers.
        message: String,
    },

    /// The caller's fencing token no longer owns the shard.
    #[error("shard ownership lost: shard {shard_id} held token {held}, current is {current:?}")]
    ShardOwnershipLost {
        /// The shard whose ownership was lost.
        shard_id: u32,
        /// The token presented by the caller.
        held: u64,
        /// The token currently registered for the shard, if any.
        current: Option<u64>,
    },

    /// An optimistic-concurrency precondition failed.
    #[error("concurrent update: {message}")]
    ConcurrentUpdate {
        /// Description of the conflicting write.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new not found error.
    #[must_use]
    pub fn not_found(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a new invalid argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a new concurrent update error.
    #[must_use]
    pub fn concurrent_update(message: impl Into<String>) -> Self {
        Self::ConcurrentUpdate {
            message: message.into(),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if the caller may retry the operation from scratch.
    ///
    /// Storage errors are included because a failed write is indeterminate:
    /// the caller must re-read state before retrying.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ShardOwnershipLost { .. } | Self::ConcurrentUpdate { .. } | Self::Storage { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}
