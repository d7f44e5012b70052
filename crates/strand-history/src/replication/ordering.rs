//! Admission policy for inbound replication streams.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

/// Decision for one inbound replication task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Apply the task.
    Apply,
    /// Already applied; skip silently.
    Duplicate,
    /// Cannot be applied in order; move to the DLQ.
    Quarantine(String),
}

impl Admission {
    /// Returns true if the task should be applied.
    #[must_use]
    pub const fn is_apply(&self) -> bool {
        matches!(self, Self::Apply)
    }
}

/// Orders tasks received from remote clusters.
///
/// Cross-cluster conflict resolution lives behind this trait. The stream
/// only asks whether a task may be applied and reports what it processed.
pub trait ReplicationOrdering: Send + Sync {
    /// Decides whether the task `source_task_id` from `source_cluster` is applied.
    fn admit(&self, source_cluster: &str, source_task_id: u64) -> Admission;

    /// Records that the task was processed (applied or quarantined).
    fn acknowledge(&self, source_cluster: &str, source_task_id: u64);

    /// Returns the highest processed task ID per source cluster.
    fn watermarks(&self) -> BTreeMap<String, u64>;
}

/// Applies each source cluster's stream in task-ID order.
///
/// A task whose ID is not above the source's watermark has already been
/// processed and is reported as a duplicate.
///
/// ## Limitations
///
/// Watermarks live in memory and restart from zero with the process;
/// idempotent application by event ID keeps re-delivery harmless.
#[derive(Debug, Default)]
pub struct SourceSequenceOrdering {
    watermarks: RwLock<BTreeMap<String, u64>>,
}

impl SourceSequenceOrdering {
    /// Creates an ordering with no history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReplicationOrdering for SourceSequenceOrdering {
    fn admit(&self, source_cluster: &str, source_task_id: u64) -> Admission {
        let watermarks = self.watermarks.read().unwrap_or_else(PoisonError::into_inner);
        match watermarks.get(source_cluster) {
            Some(&seen) if source_task_id <= seen => Admission::Duplicate,
            _ => Admission::Apply,
        }
    }

    fn acknowledge(&self, source_cluster: &str, source_task_id: u64) {
        let mut watermarks = self
            .watermarks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let seen = watermarks.entry(source_cluster.to_string()).or_insert(0);
        *seen = (*seen).max(source_task_id);
    }

    fn watermarks(&self) -> BTreeMap<String, u64> {
        self.watermarks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_at_or_below_watermark() {
        let ordering = SourceSequenceOrdering::new();
        assert!(ordering.admit("east", 5).is_apply());
        ordering.acknowledge("east", 5);
        assert_eq!(ordering.admit("east", 5), Admission::Duplicate);
        assert_eq!(ordering.admit("east", 3), Admission::Duplicate);
        assert!(ordering.admit("east", 6).is_apply());
        assert!(ordering.admit("west", 1).is_apply());
    }

    #[test]
    fn watermark_never_moves_back() {
        let ordering = SourceSequenceOrdering::new();
        ordering.acknowledge("east", 9);
        ordering.acknowledge("east", 4);
        assert_eq!(ordering.watermarks().get("east"), Some(&9));
    }
}
