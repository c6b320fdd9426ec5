//! Background maintenance: refill, idle testing and leak detection.
//!
//! Per partition, a refill watcher wakes on demand (a claim left the
//! partition at its availability threshold, or a destroy left it below
//! min) and on a slow safety tick, and an idle tester periodically
//! probes or evicts FREE connections. One pool-wide task scans for leaked
//! leases when leak detection is on. All of them stop on the pool's
//! shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::handle::{ConnectionHandle, HandleState};
use crate::pool::PoolInner;
use crate::stats::Statistics;

/// Lower bound on how often the idle tester and leak scan run.
const MIN_TICK: Duration = Duration::from_millis(10);

pub(crate) fn spawn(inner: &Arc<PoolInner>) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();
    let idle_tick = idle_tick(inner);
    for index in 0..inner.partitions.len() {
        let watcher = inner.clone();
        let shutdown = inner.shutdown_signal();
        tasks.push(tokio::spawn(async move {
            run_pool_watch(watcher, index, shutdown).await;
        }));

        if let Some(tick) = idle_tick {
            let tester = inner.clone();
            let shutdown = inner.shutdown_signal();
            tasks.push(tokio::spawn(async move {
                run_idle_tester(tester, index, tick, shutdown).await;
            }));
        }
    }

    if let Some(threshold) = inner.config.leak_detection_threshold {
        let scanner = inner.clone();
        let shutdown = inner.shutdown_signal();
        let tick = (threshold / 2).max(MIN_TICK);
        tasks.push(tokio::spawn(async move {
            run_leak_scan(scanner, threshold, tick, shutdown).await;
        }));
    }
    tasks
}

/// Shortest enabled idle interval, or `None` if nothing needs testing.
fn idle_tick(inner: &PoolInner) -> Option<Duration> {
    let config = &inner.config;
    [
        config.idle_connection_test_period,
        config.idle_max_age,
        config.max_connection_age.unwrap_or(Duration::ZERO),
    ]
    .into_iter()
    .filter(|d| !d.is_zero())
    .min()
    .map(|d| d.max(MIN_TICK))
}

async fn run_pool_watch(inner: Arc<PoolInner>, index: usize, mut shutdown: watch::Receiver<bool>) {
    debug!(partition = index, "pool watcher starting");
    loop {
        let grow = tokio::select! {
            _ = inner.partitions[index].watch().notified() => true,
            _ = tokio::time::sleep(inner.config.pool_watch_interval) => false,
            _ = shutdown.changed() => break,
        };
        if inner.is_closed() {
            break;
        }
        inner.refill(index, grow);
    }
    debug!(partition = index, "pool watcher stopped");
}

async fn run_idle_tester(
    inner: Arc<PoolInner>,
    index: usize,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(partition = index, tick_ms = tick.as_millis() as u64, "idle tester starting");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(tick) => {}
            _ = shutdown.changed() => break,
        }
        if inner.is_closed() {
            break;
        }
        inner.test_idle(index);
    }
    debug!(partition = index, "idle tester stopped");
}

async fn run_leak_scan(
    inner: Arc<PoolInner>,
    threshold: Duration,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(tick) => {}
            _ = shutdown.changed() => break,
        }
        if inner.is_closed() {
            break;
        }
        inner.scan_leaks(threshold);
    }
}

impl PoolInner {
    /// One idle-tester pass over a partition's free list.
    ///
    /// Connections past `idle_max_age` or `max_connection_age` are evicted
    /// without a probe. Connections idle past `idle_connection_test_period`
    /// are probed and destroyed on failure. Either way the partition is
    /// then topped back up to its minimum.
    pub(crate) fn test_idle(&self, index: usize) {
        let config = &self.config;
        let partition = &self.partitions[index];
        let expired = |handle: &ConnectionHandle| {
            (!config.idle_max_age.is_zero() && handle.idle_for() > config.idle_max_age)
                || config
                    .max_connection_age
                    .is_some_and(|max| !max.is_zero() && handle.age() > max)
        };

        let evicted = partition.take_free_where(HandleState::Evicted, expired);
        for handle in &evicted {
            debug!(
                connection_id = handle.id(),
                partition = index,
                idle_ms = handle.idle_for().as_millis() as u64,
                "evicting expired idle connection"
            );
            self.destroy(handle, "expired");
        }

        let test_period = config.idle_connection_test_period;
        let mut failed = 0;
        if !test_period.is_zero() {
            let due = partition
                .take_free_where(HandleState::Testing, |h| h.unchecked_for() > test_period);
            for handle in due {
                if handle.probe(config) {
                    handle.mark_tested();
                    if handle.transition(HandleState::Testing, HandleState::Free) {
                        partition.push_free(handle);
                    }
                } else {
                    warn!(
                        connection_id = handle.id(),
                        partition = index,
                        "idle connection failed its health test"
                    );
                    failed += 1;
                    self.destroy(&handle, "failed idle test");
                }
            }
        }

        if !evicted.is_empty() || failed > 0 {
            info!(
                partition = index,
                evicted = evicted.len(),
                failed,
                "idle maintenance replaced connections"
            );
            self.refill(index, false);
        }
    }

    /// Report leases held past `threshold`, and return them to the pool
    /// when `leak_force_close` is set.
    pub(crate) fn scan_leaks(&self, threshold: Duration) {
        let leaks = self.find_leaks(threshold);
        if self.config.leak_force_close {
            self.force_close_leaks(leaks);
        }
    }

    /// Log every lease held past `threshold` that has not been reported
    /// yet, returning each with the lease number that was seen.
    pub(crate) fn find_leaks(&self, threshold: Duration) -> Vec<(Arc<ConnectionHandle>, u64)> {
        let mut leaks = Vec::new();
        for partition in &self.partitions {
            for handle in partition.handles() {
                if handle.state() != HandleState::Leased {
                    continue;
                }
                let Some((lease, held, trace)) = handle.overdue_lease(threshold) else {
                    continue;
                };
                Statistics::bump(&self.stats.leaks_detected);
                warn!(
                    connection_id = handle.id(),
                    partition = handle.partition(),
                    held_ms = held.as_millis() as u64,
                    acquired_at = %trace,
                    "connection leak detected: leased longer than the detection threshold"
                );
                leaks.push((handle, lease));
            }
        }
        leaks
    }

    /// Release the reported leases. A lease that was closed and handed to
    /// another caller since the scan is left alone.
    pub(crate) fn force_close_leaks(&self, leaks: Vec<(Arc<ConnectionHandle>, u64)>) {
        for (handle, lease) in leaks {
            self.release(&handle, lease);
        }
    }
}
