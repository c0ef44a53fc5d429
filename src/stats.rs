use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time snapshot of coalescing activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoalescerStats {
    /// Total `execute` calls observed.
    pub total_calls: u64,
    /// Calls that started a fresh producer.
    pub launched: u64,
    /// Calls absorbed into an already-running producer.
    pub joined: u64,
    /// Keys currently in flight.
    pub in_flight: usize,
}

impl CoalescerStats {
    /// Fraction of calls that were absorbed by an existing execution.
    pub fn coalescing_ratio(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.joined as f64 / self.total_calls as f64
        }
    }
}

/// Counters bumped on the `execute` fast path. Relaxed ordering: the
/// numbers are diagnostics, not synchronization.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) calls: AtomicU64,
    pub(crate) launched: AtomicU64,
    pub(crate) joined: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn snapshot(&self, in_flight: usize) -> CoalescerStats {
        CoalescerStats {
            total_calls: self.calls.load(Ordering::Relaxed),
            launched: self.launched.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
            in_flight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_of_empty_snapshot_is_zero() {
        let counters = StatsCounters::default();
        let stats = counters.snapshot(0);
        assert_eq!(stats.coalescing_ratio(), 0.0);
    }

    #[test]
    fn ratio_counts_joined_over_total() {
        let counters = StatsCounters::default();
        counters.calls.store(10, Ordering::Relaxed);
        counters.launched.store(2, Ordering::Relaxed);
        counters.joined.store(8, Ordering::Relaxed);

        let stats = counters.snapshot(1);
        assert_eq!(stats.in_flight, 1);
        assert!((stats.coalescing_ratio() - 0.8).abs() < f64::EPSILON);
    }
}
