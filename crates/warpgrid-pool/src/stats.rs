//! Pool statistics.
//!
//! Sizes (`PoolStats`) are read live from the partitions. Counters
//! (`Statistics`) are lock-free atomics bumped on the hot paths and copied
//! into a `StatisticsSnapshot` on demand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Size breakdown of one partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PartitionStats {
    pub index: usize,
    /// Connections handed out and not yet fully released.
    pub leased: usize,
    /// Connections waiting in the free list.
    pub free: usize,
    /// Connections opened and not yet destroyed (including ones being
    /// created, tested, or released).
    pub created: usize,
    pub min: usize,
    pub max: usize,
}

/// Pool-wide size totals plus the per-partition breakdown.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub leased: usize,
    pub free: usize,
    pub created: usize,
    pub partitions: Vec<PartitionStats>,
}

impl PoolStats {
    pub(crate) fn from_partitions(partitions: Vec<PartitionStats>) -> Self {
        Self {
            leased: partitions.iter().map(|p| p.leased).sum(),
            free: partitions.iter().map(|p| p.free).sum(),
            created: partitions.iter().map(|p| p.created).sum(),
            partitions,
        }
    }
}

/// Running counters.
#[derive(Debug, Default)]
pub(crate) struct Statistics {
    pub connections_requested: AtomicU64,
    pub cumulative_wait_micros: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub statements_prepared: AtomicU64,
    pub statements_executed: AtomicU64,
    pub connections_created: AtomicU64,
    pub connections_destroyed: AtomicU64,
    pub recoveries: AtomicU64,
    pub leaks_detected: AtomicU64,
}

impl Statistics {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wait(&self, waited: Duration) {
        self.cumulative_wait_micros
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            connections_requested: self.connections_requested.load(Ordering::Relaxed),
            cumulative_wait_micros: self.cumulative_wait_micros.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            statements_prepared: self.statements_prepared.load(Ordering::Relaxed),
            statements_executed: self.statements_executed.load(Ordering::Relaxed),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_destroyed: self.connections_destroyed.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            leaks_detected: self.leaks_detected.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the pool counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub connections_requested: u64,
    pub cumulative_wait_micros: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub statements_prepared: u64,
    pub statements_executed: u64,
    pub connections_created: u64,
    pub connections_destroyed: u64,
    pub recoveries: u64,
    pub leaks_detected: u64,
}

impl StatisticsSnapshot {
    /// Fraction of prepares served from the statement cache (0.0 to 1.0).
    pub fn cache_hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    /// Mean time an `acquire` spent waiting.
    pub fn average_wait(&self) -> Duration {
        if self.connections_requested == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(self.cumulative_wait_micros / self.connections_requested)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition(index: usize, leased: usize, free: usize) -> PartitionStats {
        PartitionStats {
            index,
            leased,
            free,
            created: leased + free,
            min: 1,
            max: 10,
        }
    }

    #[test]
    fn totals_sum_partitions() {
        let stats = PoolStats::from_partitions(vec![partition(0, 2, 3), partition(1, 1, 4)]);
        assert_eq!(stats.leased, 3);
        assert_eq!(stats.free, 7);
        assert_eq!(stats.created, 10);
    }

    #[test]
    fn hit_ratio_handles_zero() {
        assert_eq!(StatisticsSnapshot::default().cache_hit_ratio(), 0.0);
        let snap = StatisticsSnapshot {
            cache_hits: 3,
            cache_misses: 1,
            ..Default::default()
        };
        assert!((snap.cache_hit_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn average_wait_divides_by_requests() {
        let stats = Statistics::default();
        Statistics::bump(&stats.connections_requested);
        Statistics::bump(&stats.connections_requested);
        stats.record_wait(Duration::from_millis(4));
        assert_eq!(stats.snapshot().average_wait(), Duration::from_millis(2));
    }
}
