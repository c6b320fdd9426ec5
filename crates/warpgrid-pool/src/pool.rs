//! Partitioned connection pool.
//!
//! Connections are split across `partition_count` independent partitions,
//! each with its own free list, counters and refill watcher. A caller is
//! routed to a home partition by hashing its thread id; when the home
//! partition has no free connection and no room to grow, the other
//! partitions are scanned round-robin before the caller waits.
//!
//! ```text
//! acquire ─▶ home partition ── free? ──▶ lease
//!                 │ no
//!                 ├── headroom? ──▶ open inline ──▶ lease
//!                 │ no
//!                 ├── other partitions' free lists ──▶ lease
//!                 │ none
//!                 └── wait for a release (connection_timeout), retry
//! ```

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::connection::PooledConnection;
use crate::driver::{Driver, DriverError};
use crate::error::{PoolError, PoolResult};
use crate::handle::{ConnectionHandle, HandleState, initialize_session};
use crate::hooks::ConnectionHook;
use crate::maintenance;
use crate::partition::Partition;
use crate::release;
use crate::statement_cache::{CacheBudget, StatementCache};
use crate::stats::{PoolStats, Statistics, StatisticsSnapshot};

/// A partitioned connection pool. Cheap to clone; all clones share the
/// same connections. Dropping the last clone shuts the pool down.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
    _guard: Arc<ShutdownGuard>,
}

/// Closes the pool when the last `Pool` clone goes away.
struct ShutdownGuard(Arc<PoolInner>);

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        if self.0.begin_shutdown() {
            self.0.close_all();
        }
    }
}

pub(crate) struct PoolInner {
    pub(crate) config: PoolConfig,
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) stats: Statistics,
    pub(crate) partitions: Vec<Partition>,
    hook: Option<Arc<dyn ConnectionHook>>,
    cache_budget: Arc<CacheBudget>,
    /// Signalled whenever a connection becomes free or headroom opens up.
    available: Notify,
    closed: AtomicBool,
    next_handle: AtomicU64,
    shutdown: watch::Sender<bool>,
    release_queues: Vec<mpsc::UnboundedSender<Arc<ConnectionHandle>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    /// Validate `config`, open `min_connections_per_partition` connections
    /// in every partition and start the background tasks.
    ///
    /// Fails with [`PoolError::Configuration`] if the driver rejects the
    /// URL or the initial connections cannot be opened; nothing is left
    /// open in that case.
    pub async fn new(config: PoolConfig, driver: Arc<dyn Driver>) -> PoolResult<Self> {
        Self::with_hook(config, driver, None).await
    }

    /// Like [`Pool::new`], with lifecycle callbacks.
    pub async fn with_hook(
        config: PoolConfig,
        driver: Arc<dyn Driver>,
        hook: Option<Arc<dyn ConnectionHook>>,
    ) -> PoolResult<Self> {
        config.validate()?;
        if !driver.accepts_url(&config.url) {
            return Err(PoolError::Configuration(format!(
                "driver '{}' does not accept URL '{}'",
                driver.name(),
                config.url
            )));
        }

        info!(
            url = %config.url,
            user = %config.credentials.username,
            partitions = config.partition_count,
            min = config.min_connections_per_partition,
            max = config.max_connections_per_partition,
            acquire_increment = config.acquire_increment,
            idle_test_period = ?config.idle_connection_test_period,
            idle_max_age = ?config.idle_max_age,
            release_helper_threads = config.release_helper_threads,
            "starting connection pool"
        );

        let (shutdown, _) = watch::channel(false);
        let (release_queues, receivers) = release::channels(&config);
        let partitions = (0..config.partition_count)
            .map(|index| {
                Partition::new(
                    index,
                    config.min_connections_per_partition,
                    config.max_connections_per_partition,
                )
            })
            .collect();

        let inner = Arc::new(PoolInner {
            cache_budget: Arc::new(CacheBudget::new(config.statements_cache_size)),
            config,
            driver,
            stats: Statistics::default(),
            partitions,
            hook,
            available: Notify::new(),
            closed: AtomicBool::new(false),
            next_handle: AtomicU64::new(1),
            shutdown,
            release_queues,
            tasks: Mutex::new(Vec::new()),
        });

        if let Err(e) = inner.fill_initial() {
            inner.closed.store(true, Ordering::Release);
            inner.close_all();
            return Err(PoolError::Configuration(format!(
                "unable to open initial connections: {e}"
            )));
        }

        let mut tasks = maintenance::spawn(&inner);
        tasks.extend(release::spawn(&inner, receivers));
        *inner.tasks.lock() = tasks;

        Ok(Self {
            _guard: Arc::new(ShutdownGuard(inner.clone())),
            inner,
        })
    }

    /// Lease a connection.
    ///
    /// Each attempt waits up to `connection_timeout` for a connection;
    /// after `acquire_retry_attempts` further attempts, spaced by
    /// `acquire_retry_delay`, this fails with [`PoolError::PoolExhausted`].
    pub async fn acquire(&self) -> PoolResult<PooledConnection> {
        let inner = &self.inner;
        inner.ensure_open()?;
        Statistics::bump(&inner.stats.connections_requested);

        let started = Instant::now();
        let home = inner.home_partition();
        let attempts = inner.config.acquire_retry_attempts.saturating_add(1);
        for attempt in 1..=attempts {
            if let Some(connection) = inner.wait_for_connection(home).await? {
                inner.stats.record_wait(started.elapsed());
                return Ok(connection);
            }
            if attempt < attempts {
                debug!(attempt, attempts, "no connection available, retrying");
                tokio::time::sleep(inner.config.acquire_retry_delay).await;
                inner.ensure_open()?;
            }
        }

        let waited = started.elapsed();
        inner.stats.record_wait(waited);
        warn!(attempts, waited_ms = waited.as_millis() as u64, "connection pool exhausted");
        Err(PoolError::PoolExhausted { attempts, waited })
    }

    /// Stop background tasks, wait for them to finish, then close every
    /// connection. Later `acquire` calls fail with
    /// [`PoolError::PoolClosed`]. Idempotent.
    pub async fn shutdown(&self) {
        if !self.inner.begin_shutdown() {
            return;
        }
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "pool task ended abnormally during shutdown");
            }
        }
        self.inner.close_all();
        info!("connection pool shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Live sizes, pool-wide and per partition.
    pub fn stats(&self) -> PoolStats {
        PoolStats::from_partitions(self.inner.partitions.iter().map(Partition::stats).collect())
    }

    pub fn total_leased(&self) -> usize {
        self.stats().leased
    }

    pub fn total_free(&self) -> usize {
        self.stats().free
    }

    pub fn total_created_connections(&self) -> usize {
        self.inner.partitions.iter().map(Partition::created).sum()
    }

    /// Idle statements cached across every connection.
    pub fn cached_statements(&self) -> usize {
        self.inner.cache_budget.used()
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.inner.stats.snapshot()
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("url", &self.inner.config.url)
            .field("driver", &self.inner.driver.name())
            .field("closed", &self.is_closed())
            .field("stats", &self.stats())
            .finish()
    }
}

impl PoolInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> PoolResult<()> {
        if self.is_closed() {
            Err(PoolError::PoolClosed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn home_partition(&self) -> usize {
        let count = self.partitions.len();
        if count == 1 {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        (hasher.finish() % count as u64) as usize
    }

    // ── Creation ────────────────────────────────────────────────────

    fn fill_initial(&self) -> Result<(), DriverError> {
        let min = self.config.min_connections_per_partition;
        if min == 0 {
            // Still prove the URL and credentials work.
            let mut probe = self.driver.connect(&self.config.url, &self.config.credentials)?;
            let _ = probe.close();
            return Ok(());
        }
        for partition in &self.partitions {
            let reserved = partition.try_reserve(min);
            for opened in 0..reserved {
                match self.open_handle(partition.index()) {
                    Ok(handle) => {
                        partition.register(handle.clone());
                        partition.push_free(handle);
                    }
                    Err(e) => {
                        partition.unreserve(reserved - opened);
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Open one physical connection and wrap it. The caller must already
    /// hold a reservation in `partition`.
    pub(crate) fn open_handle(&self, partition: usize) -> Result<Arc<ConnectionHandle>, DriverError> {
        let config = &self.config;
        let opened = self
            .driver
            .connect(&config.url, &config.credentials)
            .and_then(|mut physical| {
                match initialize_session(physical.as_mut(), config, config.default_auto_commit) {
                    Ok(()) => Ok(physical),
                    Err(e) => {
                        let _ = physical.close();
                        Err(e)
                    }
                }
            });
        let physical = match opened {
            Ok(physical) => physical,
            Err(e) => {
                warn!(partition, error = %e, "failed to open physical connection");
                if let Some(hook) = &self.hook {
                    hook.on_acquire_fail(&e);
                }
                return Err(e);
            }
        };

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let cache = StatementCache::new(
            config.statements_cached_per_connection,
            self.cache_budget.clone(),
        );
        let handle = Arc::new(ConnectionHandle::new(
            id,
            partition,
            physical,
            cache,
            config.default_auto_commit,
        ));
        Statistics::bump(&self.stats.connections_created);
        if let Some(hook) = &self.hook {
            hook.on_acquire(&handle.info());
        }
        debug!(connection_id = id, partition, "opened physical connection");
        Ok(handle)
    }

    /// Top a partition back up to its minimum and, when `grow` is set and
    /// free connections are at or below the availability threshold, add
    /// `acquire_increment` more. Never exceeds the partition max.
    pub(crate) fn refill(&self, index: usize, grow: bool) {
        if self.is_closed() {
            return;
        }
        let partition = &self.partitions[index];
        let deficit = partition.min().saturating_sub(partition.created());
        let growth = if grow && partition.below_threshold(self.config.pool_availability_threshold) {
            self.config.acquire_increment
        } else {
            0
        };
        let reserved = partition.try_reserve(deficit.max(growth));
        if reserved == 0 {
            return;
        }

        let mut opened = 0;
        while opened < reserved {
            match self.open_handle(index) {
                Ok(handle) if self.is_closed() => {
                    handle.close_physical();
                    break;
                }
                Ok(handle) => {
                    partition.register(handle.clone());
                    partition.push_free(handle);
                    opened += 1;
                    self.available.notify_one();
                }
                Err(_) => break,
            }
        }
        partition.unreserve(reserved - opened);
        if opened > 0 {
            debug!(
                partition = index,
                opened,
                created = partition.created(),
                "partition grew"
            );
        }
    }

    // ── Acquire ─────────────────────────────────────────────────────

    async fn wait_for_connection(self: &Arc<Self>, home: usize) -> PoolResult<Option<PooledConnection>> {
        let deadline = self.config.connection_timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_open()?;
            if let Some((handle, lease)) = self.try_claim(home) {
                return Ok(Some(self.lease_out(handle, lease)));
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    fn try_claim(&self, home: usize) -> Option<(Arc<ConnectionHandle>, u64)> {
        let count = self.partitions.len();
        let partition = &self.partitions[home];
        if let Some(claimed) = partition.claim_free() {
            self.after_claim(partition);
            return Some(claimed);
        }
        if let Some(claimed) = self.grow_inline(partition) {
            return Some(claimed);
        }

        // Home partition is drained: borrow from the others.
        for offset in 1..count {
            let other = &self.partitions[(home + offset) % count];
            if let Some(claimed) = other.claim_free() {
                self.after_claim(other);
                return Some(claimed);
            }
        }
        for other in &self.partitions {
            if other.has_headroom() {
                other.watch().notify_one();
            }
        }
        None
    }

    fn grow_inline(&self, partition: &Partition) -> Option<(Arc<ConnectionHandle>, u64)> {
        if partition.try_reserve(1) == 0 {
            return None;
        }
        let handle = match self.open_handle(partition.index()) {
            Ok(handle) => handle,
            Err(_) => {
                partition.unreserve(1);
                return None;
            }
        };
        if self.is_closed() {
            handle.close_physical();
            partition.unreserve(1);
            return None;
        }

        partition.register(handle.clone());
        match handle.claim() {
            Some(lease) => {
                partition.add_leased();
                self.after_claim(partition);
                Some((handle, lease))
            }
            None => {
                partition.push_free(handle);
                None
            }
        }
    }

    fn after_claim(&self, partition: &Partition) {
        if partition.has_headroom()
            && partition.below_threshold(self.config.pool_availability_threshold)
        {
            partition.watch().notify_one();
        }
    }

    fn lease_out(self: &Arc<Self>, handle: Arc<ConnectionHandle>, lease: u64) -> PooledConnection {
        handle.begin_lease(lease, self.config.leak_detection_threshold.is_some());
        if let Some(hook) = &self.hook {
            hook.on_check_out(&handle.info());
        }
        PooledConnection::new(self.clone(), handle, lease)
    }

    // ── Release ─────────────────────────────────────────────────────

    /// Start releasing `lease` of `handle`. A no-op unless that lease is
    /// still current, so repeated or stale releases never double-count.
    pub(crate) fn release(&self, handle: &Arc<ConnectionHandle>, lease: u64) {
        if !handle.transition_lease(lease, HandleState::Leased, HandleState::Releasing) {
            return;
        }
        handle.end_lease();
        if !self.is_closed() {
            if let Some(queue) = self.release_queues.get(handle.partition()) {
                if queue.send(handle.clone()).is_ok() {
                    return;
                }
            }
        }
        self.finish_release(handle);
    }

    /// Close the lease's statements, reset the session and put the handle
    /// back on its free list (or destroy it if it turned out broken).
    pub(crate) fn finish_release(&self, handle: &Arc<ConnectionHandle>) {
        for slot in handle.take_open_statements() {
            slot.close(handle);
        }
        if self.is_closed() {
            self.destroy(handle, "pool closed");
            return;
        }

        if let Err(e) = handle.reset_session(self.config.default_auto_commit) {
            warn!(connection_id = handle.id(), error = %e, "failed to reset session on release");
            handle.mark_possibly_broken();
        }
        if handle.is_possibly_broken() {
            if !handle.probe(&self.config) {
                warn!(
                    connection_id = handle.id(),
                    partition = handle.partition(),
                    "connection failed its release probe"
                );
                self.destroy(handle, "broken");
                return;
            }
            handle.clear_possibly_broken();
        }

        if !handle.transition(HandleState::Releasing, HandleState::Free) {
            return;
        }
        self.partitions[handle.partition()].return_free(handle.clone());
        self.available.notify_one();
        if let Some(hook) = &self.hook {
            hook.on_check_in(&handle.info());
        }
    }

    // ── Destruction ─────────────────────────────────────────────────

    /// Mark a leased handle broken and destroy it.
    pub(crate) fn retire(&self, handle: &ConnectionHandle, cause: DriverError) {
        handle.mark_broken(cause);
        if handle.transition(HandleState::Leased, HandleState::Broken)
            || handle.transition(HandleState::Releasing, HandleState::Broken)
        {
            warn!(
                connection_id = handle.id(),
                partition = handle.partition(),
                "connection confirmed broken, retiring it"
            );
            self.destroy(handle, "broken");
        }
    }

    /// Close the physical connection and drop the handle from its
    /// partition. Idempotent. Signals the refill watcher if the partition
    /// fell below its minimum.
    pub(crate) fn destroy(&self, handle: &ConnectionHandle, reason: &str) {
        let previous = handle.replace_state(HandleState::Destroyed);
        if previous == HandleState::Destroyed {
            return;
        }
        let partition = &self.partitions[handle.partition()];
        if matches!(
            previous,
            HandleState::Leased | HandleState::Releasing | HandleState::Broken
        ) {
            partition.forget_lease();
        }
        partition.unregister(handle.id());
        handle.close_physical();
        Statistics::bump(&self.stats.connections_destroyed);
        if let Some(hook) = &self.hook {
            hook.on_destroy(&handle.info());
        }
        debug!(
            connection_id = handle.id(),
            partition = handle.partition(),
            reason,
            "destroyed connection"
        );

        if !self.is_closed() {
            if partition.created() < partition.min() {
                partition.watch().notify_one();
            }
            // Headroom opened up for a waiting acquirer.
            self.available.notify_one();
        }
    }

    /// Flip to closed and wake everything waiting. `false` if the pool was
    /// already closed.
    fn begin_shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!("shutting down connection pool");
        self.shutdown.send_replace(true);
        self.available.notify_waiters();
        true
    }

    fn close_all(&self) {
        for partition in &self.partitions {
            for handle in partition.drain() {
                if handle.replace_state(HandleState::Destroyed) == HandleState::Destroyed {
                    continue;
                }
                handle.close_physical();
                Statistics::bump(&self.stats.connections_destroyed);
                if let Some(hook) = &self.hook {
                    hook.on_destroy(&handle.info());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::driver::Credentials;
    use crate::mock::MockDriver;

    fn config(partitions: usize, min: usize, max: usize) -> PoolConfig {
        PoolConfig::new("mock:test", Credentials::new("app", "secret"))
            .with_partitions(partitions, min, max)
            .with_release_helper_threads(0)
            .with_connection_timeout(Some(Duration::from_millis(50)))
    }

    async fn pool(config: PoolConfig) -> (Pool, MockDriver) {
        let driver = MockDriver::new();
        let pool = Pool::new(config, Arc::new(driver.clone())).await.unwrap();
        (pool, driver)
    }

    #[tokio::test]
    async fn opens_min_connections_per_partition() {
        let (pool, driver) = pool(config(3, 2, 5)).await;
        assert_eq!(pool.total_created_connections(), 6);
        assert_eq!(pool.total_free(), 6);
        assert_eq!(driver.state().connects(), 6);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn rejected_url_opens_nothing() {
        let driver = MockDriver::new();
        let config = PoolConfig::new("invalid database url", Credentials::default());
        let err = Pool::new(config, Arc::new(driver.clone())).await.unwrap_err();
        assert!(matches!(err, PoolError::Configuration(_)));
        assert_eq!(driver.state().connects(), 0);
    }

    #[tokio::test]
    async fn failed_first_connect_is_configuration_error() {
        let driver = MockDriver::new();
        driver.state().set_fail_connect(true);
        let err = Pool::new(config(1, 1, 2), Arc::new(driver.clone())).await.unwrap_err();
        assert!(matches!(err, PoolError::Configuration(_)));
    }

    #[tokio::test]
    async fn zero_min_still_checks_connectivity() {
        let driver = MockDriver::new();
        let pool = Pool::new(config(1, 0, 2), Arc::new(driver.clone())).await.unwrap();
        assert_eq!(pool.total_created_connections(), 0);
        assert_eq!(driver.state().connects(), 1);
        assert_eq!(driver.state().connections_closed(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn close_returns_connection_and_is_idempotent() {
        let (pool, _driver) = pool(config(1, 2, 2)).await;
        let conn = pool.acquire().await.unwrap();
        assert_eq!(pool.total_leased(), 1);
        conn.close();
        conn.close();
        assert_eq!(pool.total_leased(), 0);
        assert_eq!(pool.total_free(), 2);
        assert!(conn.is_closed());
        assert!(matches!(conn.commit(), Err(PoolError::HandleClosed(_))));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn grows_inline_when_home_is_empty() {
        let (pool, _driver) = pool(config(1, 0, 2)).await;
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.total_created_connections(), 2);
        assert!(matches!(
            pool.acquire().await,
            Err(PoolError::PoolExhausted { attempts: 1, .. })
        ));
        drop((a, b));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn retry_attempts_are_counted() {
        let config = config(1, 1, 1).with_acquire_retry(2, Duration::from_millis(5));
        let (pool, _driver) = pool(config).await;
        let _held = pool.acquire().await.unwrap();
        match pool.acquire().await {
            Err(PoolError::PoolExhausted { attempts, waited }) => {
                assert_eq!(attempts, 3);
                assert!(waited >= Duration::from_millis(150));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn waiter_wakes_on_release() {
        let config = config(1, 1, 1).with_connection_timeout(Some(Duration::from_secs(5)));
        let (pool, _driver) = pool(config).await;
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|c| c.id()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = held.id();
        held.close();
        assert_eq!(waiter.await.unwrap().unwrap(), id);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn leak_close_skips_a_lease_handed_on() {
        let config = config(1, 1, 1).with_leak_detection(Duration::from_secs(600), true);
        let (pool, _driver) = pool(config).await;
        let first = pool.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let leaks = pool.inner.find_leaks(Duration::from_millis(1));
        assert_eq!(leaks.len(), 1);

        // The leaked lease ends and the same handle goes to a new caller
        // before the force close runs.
        first.close();
        let second = pool.acquire().await.unwrap();
        assert_eq!(second.id(), first.id());
        pool.inner.force_close_leaks(leaks);

        assert!(!second.is_closed());
        assert!(second.commit().is_ok());
        assert_eq!(pool.total_leased(), 1);
        second.close();
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_everything_and_is_idempotent() {
        let (pool, driver) = pool(config(2, 2, 4)).await;
        let conn = pool.acquire().await.unwrap();
        pool.shutdown().await;
        pool.shutdown().await;

        assert!(pool.is_closed());
        assert_eq!(driver.state().connections_closed(), 4);
        assert!(matches!(pool.acquire().await, Err(PoolError::PoolClosed)));
        // Releasing after shutdown is harmless.
        conn.close();
        assert_eq!(pool.total_created_connections(), 0);
    }

    #[tokio::test]
    async fn dropping_last_clone_closes_connections() {
        let (pool, driver) = pool(config(1, 3, 3)).await;
        let clone = pool.clone();
        drop(pool);
        assert_eq!(driver.state().connections_closed(), 0);
        drop(clone);
        assert_eq!(driver.state().connections_closed(), 3);
    }
}
