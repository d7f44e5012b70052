//! # strand-history
//!
//! The history service of the Strand durable-execution platform.
//!
//! This crate owns the authoritative record of every workflow run:
//!
//! - **Transactions**: Lease-serialized read-modify-write of a run's
//!   mutable state, with its history events and tasks committed atomically
//! - **Operations**: Start, signal, cancel, terminate, reset, update, and
//!   the workflow, activity, child and timer task lifecycles
//! - **Callbacks**: Completion callbacks delivered with bounded concurrency
//!   and persistent backoff
//! - **Replication**: Ordered, idempotent application of events from remote
//!   clusters, with a DLQ for tasks that cannot be applied
//! - **Host**: One engine per owned shard, plus the workers that hand
//!   committed tasks to matching, timers and child runs
//!
//! ## Guarantees
//!
//! - **Serialized**: At most one transaction per run at a time
//! - **Fenced**: A commit from a stale shard owner is rejected by the store
//! - **At-least-once**: Tasks stay queued until a worker acknowledges them
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use strand_core::{MemoryExecutionStore, NamespaceId, WorkflowId};
//! use strand_history::api::start::StartWorkflowRequest;
//! use strand_history::config::Config;
//! use strand_history::error::Result;
//! use strand_history::host::{Collaborators, Host};
//!
//! # async fn example() -> Result<()> {
//! let host = Host::build(
//!     Config::default(),
//!     Arc::new(MemoryExecutionStore::new()),
//!     Collaborators::default(),
//! )
//! .await?;
//! host.start().await?;
//!
//! let request = StartWorkflowRequest::new(
//!     NamespaceId::new("default")?,
//!     WorkflowId::new("order-7")?,
//!     "OrderWorkflow",
//!     "orders",
//! );
//! let engine = host.engine_for_workflow(&request.namespace_id, &request.workflow_id)?;
//! let started = engine.start_workflow_execution(request).await?;
//! println!("started run {}", started.run_id);
//!
//! host.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod api;
pub mod callbacks;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod host;
pub mod lease;
pub mod metrics;
pub mod persistence;
pub mod replication;
pub mod shard;
pub mod state;
pub mod tasks;
pub mod transaction;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::api::start::{StartWorkflowRequest, StartWorkflowResponse};
    pub use crate::config::Config;
    pub use crate::engine::{Engine, HistoryEngine};
    pub use crate::error::{Error, Result};
    pub use crate::events::{EventAttributes, HistoryEvent, Payload};
    pub use crate::host::{Collaborators, EngineRouter, Host};
    pub use crate::metrics::HistoryMetrics;
    pub use crate::state::{MutableState, WorkflowStatus};
    pub use crate::tasks::{HistoryTask, QueuedTask, TaskListener};
    pub use crate::transaction::{TransactionEngine, UpdateOperation};
}

pub use config::Config;
pub use engine::{Engine, HistoryEngine};
pub use error::{Error, Result};
pub use host::{Collaborators, Host};
