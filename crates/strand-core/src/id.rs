//! Strongly-typed identifiers for workflow runs and shards.
//!
//! A run is addressed by a [`WorkflowKey`]: the namespace, the
//! caller-chosen workflow ID, and the server-generated [`RunId`]. All runs
//! of one workflow ID map to the same [`ShardId`].
//!
//! # Example
//!
//! ```rust
//! use strand_core::id::{NamespaceId, RunId, ShardId, WorkflowId, WorkflowKey};
//!
//! let key = WorkflowKey::new(
//!     NamespaceId::new("payments").unwrap(),
//!     WorkflowId::new("order-42").unwrap(),
//!     RunId::generate(),
//! );
//! let shard = ShardId::for_workflow(&key.namespace_id, &key.workflow_id, 16);
//! assert!((1..=16).contains(&shard.get()));
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

const MAX_NAMESPACE_LEN: usize = 255;
const MAX_WORKFLOW_ID_LEN: usize = 1000;

fn validate_name(kind: &str, value: &str, max_len: usize) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidId {
            message: format!("{kind} cannot be empty"),
        });
    }
    if value.len() > max_len {
        return Err(Error::InvalidId {
            message: format!("{kind} exceeds {max_len} bytes"),
        });
    }
    Ok(())
}

/// A namespace identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceId(String);

impl NamespaceId {
    /// Creates a namespace ID after validating it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] if the value is empty or too long.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_name("namespace id", &id, MAX_NAMESPACE_LEN)?;
        Ok(Self(id))
    }

    /// Returns the namespace ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A caller-chosen workflow identifier, unique among open runs of a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(String);

impl WorkflowId {
    /// Creates a workflow ID after validating it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] if the value is empty or too long.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_name("workflow id", &id, MAX_WORKFLOW_ID_LEN)?;
        Ok(Self(id))
    }

    /// Returns the workflow ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unique identifier for one run of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Ulid);

impl RunId {
    /// Generates a new unique run ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a run ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid run ID '{s}': {e}"),
            })
    }
}

/// Uniquely identifies one workflow run. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowKey {
    /// Namespace the run belongs to.
    pub namespace_id: NamespaceId,
    /// Workflow ID shared by every run of the workflow.
    pub workflow_id: WorkflowId,
    /// The run within the workflow.
    pub run_id: RunId,
}

impl WorkflowKey {
    /// Creates a new workflow key.
    #[must_use]
    pub const fn new(namespace_id: NamespaceId, workflow_id: WorkflowId, run_id: RunId) -> Self {
        Self {
            namespace_id,
            workflow_id,
            run_id,
        }
    }

    /// Returns a key for another run of the same workflow.
    #[must_use]
    pub fn with_run(&self, run_id: RunId) -> Self {
        Self {
            namespace_id: self.namespace_id.clone(),
            workflow_id: self.workflow_id.clone(),
            run_id,
        }
    }
}

impl fmt::Display for WorkflowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace_id, self.workflow_id, self.run_id)
    }
}

/// A shard number in `1..=shard_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(u32);

impl ShardId {
    /// Creates a shard ID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] for shard zero.
    pub fn new(id: u32) -> Result<Self> {
        if id == 0 {
            return Err(Error::InvalidId {
                message: "shard ids start at 1".into(),
            });
        }
        Ok(Self(id))
    }

    /// Returns the raw shard number.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Maps a workflow onto a shard.
    ///
    /// The mapping hashes namespace and workflow ID with SHA-256, so it is
    /// stable across processes and releases. `shard_count` of zero is treated
    /// as one.
    #[must_use]
    pub fn for_workflow(namespace_id: &NamespaceId, workflow_id: &WorkflowId, shard_count: u32) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(namespace_id.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(workflow_id.as_str().as_bytes());
        let digest = hasher.finalize();
        let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        Self(prefix % shard_count.max(1) + 1)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
