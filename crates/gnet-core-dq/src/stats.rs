//! Engine statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Running counters for the dynamic query engine.
///
/// Incremented from the engine thread, readable from anywhere through
/// [`DqStats::snapshot`].
#[derive(Debug, Default)]
pub struct DqStats {
    /// Queries launched on behalf of a leaf.
    pub leaf_dyn_queries: AtomicU64,
    /// Queries launched for a local search.
    pub local_dyn_queries: AtomicU64,
    /// Leaf queries we OOB-proxied at launch.
    pub oob_proxied_queries: AtomicU64,
    /// Queries that ended with their result target met.
    pub completed_full: AtomicU64,
    /// Queries that ended with some, but not enough, results.
    pub completed_partial: AtomicU64,
    /// Queries that ended without a single result.
    pub completed_zero: AtomicU64,
    /// Full queries that still collected hits while lingering.
    pub linger_extra: AtomicU64,
    /// Queries completed by hits arriving during the linger phase.
    pub linger_completed: AtomicU64,
    /// Queries that collected some lingering hits without completing.
    pub linger_results: AtomicU64,
}

impl DqStats {
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a point-in-time copy of all counters.
    pub fn snapshot(&self) -> DqStatsSnapshot {
        DqStatsSnapshot {
            leaf_dyn_queries: self.leaf_dyn_queries.load(Ordering::Relaxed),
            local_dyn_queries: self.local_dyn_queries.load(Ordering::Relaxed),
            oob_proxied_queries: self.oob_proxied_queries.load(Ordering::Relaxed),
            completed_full: self.completed_full.load(Ordering::Relaxed),
            completed_partial: self.completed_partial.load(Ordering::Relaxed),
            completed_zero: self.completed_zero.load(Ordering::Relaxed),
            linger_extra: self.linger_extra.load(Ordering::Relaxed),
            linger_completed: self.linger_completed.load(Ordering::Relaxed),
            linger_results: self.linger_results.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DqStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DqStatsSnapshot {
    pub leaf_dyn_queries: u64,
    pub local_dyn_queries: u64,
    pub oob_proxied_queries: u64,
    pub completed_full: u64,
    pub completed_partial: u64,
    pub completed_zero: u64,
    pub linger_extra: u64,
    pub linger_completed: u64,
    pub linger_results: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let stats = DqStats::default();
        DqStats::inc(&stats.leaf_dyn_queries);
        DqStats::inc(&stats.leaf_dyn_queries);
        DqStats::inc(&stats.completed_zero);

        let snap = stats.snapshot();
        assert_eq!(snap.leaf_dyn_queries, 2);
        assert_eq!(snap.completed_zero, 1);
        assert_eq!(snap.completed_full, 0);
    }
}
