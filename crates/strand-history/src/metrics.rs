//! Observability metrics for the history service.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `strand_history_transactions_total` | Counter | `operation`, `result` | Update transactions by outcome |
//! | `strand_history_transaction_duration_seconds` | Histogram | `operation` | Update transaction latency |
//! | `strand_history_lease_wait_seconds` | Histogram | - | Time spent waiting for a workflow lease |
//! | `strand_history_callback_attempts_total` | Counter | `result` | Callback delivery attempts by outcome |
//! | `strand_history_callbacks_in_flight` | Gauge | - | Deliveries currently on the network |
//! | `strand_history_replication_tasks_total` | Counter | `result` | Replication tasks applied, skipped, quarantined |
//! | `strand_history_dlq_depth` | Gauge | `source` | Quarantined replication items |
//!
//! Metrics go through the `metrics` facade; `strand-server` installs the
//! Prometheus exporter.

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Update transactions by operation and outcome.
    pub const TRANSACTIONS_TOTAL: &str = "strand_history_transactions_total";
    /// Histogram: Update transaction latency in seconds.
    pub const TRANSACTION_DURATION_SECONDS: &str = "strand_history_transaction_duration_seconds";
    /// Histogram: Lease wait time in seconds.
    pub const LEASE_WAIT_SECONDS: &str = "strand_history_lease_wait_seconds";
    /// Counter: Callback delivery attempts.
    pub const CALLBACK_ATTEMPTS_TOTAL: &str = "strand_history_callback_attempts_total";
    /// Gauge: Callback deliveries currently in flight.
    pub const CALLBACKS_IN_FLIGHT: &str = "strand_history_callbacks_in_flight";
    /// Counter: Replication tasks by outcome.
    pub const REPLICATION_TASKS_TOTAL: &str = "strand_history_replication_tasks_total";
    /// Gauge: DLQ depth per source cluster.
    pub const DLQ_DEPTH: &str = "strand_history_dlq_depth";
}

/// Label keys used across metrics.
pub mod labels {
    /// Operation name (`pause_activity`, `signal`, ...).
    pub const OPERATION: &str = "operation";
    /// Result status (committed, noop, conflict, error, ...).
    pub const RESULT: &str = "result";
    /// Source cluster for replication metrics.
    pub const SOURCE: &str = "source";
}

/// High-level interface for recording history metrics.
#[derive(Debug, Clone, Default)]
pub struct HistoryMetrics;

impl HistoryMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records the outcome of an update transaction.
    pub fn record_transaction(&self, operation: &'static str, result: &'static str) {
        counter!(
            names::TRANSACTIONS_TOTAL,
            labels::OPERATION => operation,
            labels::RESULT => result,
        )
        .increment(1);
    }

    /// Records update transaction latency.
    pub fn observe_transaction_duration(&self, operation: &'static str, duration: Duration) {
        histogram!(
            names::TRANSACTION_DURATION_SECONDS,
            labels::OPERATION => operation,
        )
        .record(duration.as_secs_f64());
    }

    /// Records time spent waiting for a lease.
    pub fn observe_lease_wait(&self, duration: Duration) {
        histogram!(names::LEASE_WAIT_SECONDS).record(duration.as_secs_f64());
    }

    /// Records a callback delivery attempt.
    pub fn record_callback_attempt(&self, result: &'static str) {
        counter!(names::CALLBACK_ATTEMPTS_TOTAL, labels::RESULT => result).increment(1);
    }

    /// Adjusts the in-flight delivery gauge.
    pub fn callbacks_in_flight(&self, delta: f64) {
        gauge!(names::CALLBACKS_IN_FLIGHT).increment(delta);
    }

    /// Records a replication task outcome.
    pub fn record_replication(&self, source: &str, result: &'static str) {
        counter!(
            names::REPLICATION_TASKS_TOTAL,
            labels::SOURCE => source.to_string(),
            labels::RESULT => result,
        )
        .increment(1);
    }

    /// Sets the DLQ depth for a source cluster.
    #[allow(clippy::cast_precision_loss)] // DLQ depth is small
    pub fn set_dlq_depth(&self, source: &str, depth: usize) {
        gauge!(names::DLQ_DEPTH, labels::SOURCE => source.to_string()).set(depth as f64);
    }
}

/// Guard that records elapsed time when dropped.
///
/// ```rust
/// use strand_history::metrics::{HistoryMetrics, TimingGuard};
///
/// let metrics = HistoryMetrics::new();
/// {
///     let _guard = TimingGuard::new(|d| metrics.observe_lease_wait(d));
///     // wait for the lease...
/// }
/// ```
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard that will call `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn timing_guard_fires_on_drop() {
        let fired = AtomicBool::new(false);
        {
            let _guard = TimingGuard::new(|_| fired.store(true, Ordering::SeqCst));
        }
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn recording_without_recorder_is_harmless() {
        let metrics = HistoryMetrics::new();
        metrics.record_transaction("pause_activity", "committed");
        metrics.record_callback_attempt("succeeded");
        metrics.callbacks_in_flight(1.0);
        metrics.set_dlq_depth("east", 3);
    }
}
