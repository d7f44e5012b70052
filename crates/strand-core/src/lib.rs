//! # strand-core
//!
//! Core abstractions for the Strand durable-execution history service.
//!
//! This crate provides the primitives shared by every Strand component:
//!
//! - **Identifiers**: Strongly-typed namespace, workflow, run and shard IDs
//! - **Fencing**: Monotonic shard ownership tokens
//! - **Execution Store**: The persistence contract with optimistic concurrency
//!   and an in-memory implementation
//! - **Error Types**: Shared error taxonomy and result types
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use strand_core::prelude::*;
//!
//! let key = WorkflowKey::new(
//!     NamespaceId::new("default").unwrap(),
//!     WorkflowId::new("order-7").unwrap(),
//!     RunId::generate(),
//! );
//! assert_eq!(key.workflow_id.as_str(), "order-7");
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod fencing;
pub mod id;
pub mod observability;
pub mod store;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::fencing::FencingToken;
    pub use crate::id::{NamespaceId, RunId, ShardId, WorkflowId, WorkflowKey};
    pub use crate::store::{
        CommitBatch, CommitOutcome, CurrentRunPrecondition, ExecutionStore, MemoryExecutionStore,
        QueueCategory, RunRecord, RunWrite, WritePrecondition, WriteResult,
    };
}

pub use error::{Error, Result};
pub use fencing::FencingToken;
pub use id::{NamespaceId, RunId, ShardId, WorkflowId, WorkflowKey};
pub use store::{
    CommitBatch, CommitOutcome, CurrentRunPrecondition, DlqRecord, ExecutionStore,
    MemoryExecutionStore, QueueCategory, QueueRecord, RunRecord, RunWrite, WritePrecondition,
    WriteResult,
};
