//! Observability infrastructure for Strand.
//!
//! Structured logging with consistent span fields (`namespace_id`,
//! `workflow_id`, `run_id`, `shard_id`) across every component.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::id::{ShardId, WorkflowKey};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(crate::error::Error::invalid_argument(format!(
                "log format must be json or pretty (got {other})"
            ))),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `strand_history=debug`)
///
/// # Example
///
/// ```rust
/// use strand_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for an operation on one workflow run.
///
/// # Example
///
/// ```rust
/// use strand_core::id::{NamespaceId, RunId, WorkflowId, WorkflowKey};
/// use strand_core::observability::workflow_span;
///
/// let key = WorkflowKey::new(
///     NamespaceId::new("default").unwrap(),
///     WorkflowId::new("order-1").unwrap(),
///     RunId::generate(),
/// );
/// let span = workflow_span("pause_activity", &key);
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn workflow_span(operation: &str, key: &WorkflowKey) -> Span {
    tracing::info_span!(
        "workflow",
        op = operation,
        namespace_id = %key.namespace_id,
        workflow_id = %key.workflow_id,
        run_id = %key.run_id,
    )
}

/// Creates a span for shard-scoped operations.
#[must_use]
pub fn shard_span(operation: &str, shard_id: ShardId) -> Span {
    tracing::info_span!("shard", op = operation, shard_id = shard_id.get())
}
