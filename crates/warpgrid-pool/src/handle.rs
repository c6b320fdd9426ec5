//! Pool-side wrapper around one physical connection.
//!
//! A [`ConnectionHandle`] is owned by its partition for its whole life and
//! is lent to callers through [`PooledConnection`](crate::PooledConnection).
//! Its lifecycle is a single atomic word holding both the state and a
//! lease counter:
//!
//! ```text
//!            claim (lease += 1)
//!   FREE ───────────────────────▶ LEASED ──release──▶ RELEASING ──▶ FREE
//!    │  ▲                           │                    │
//!    │  └── probe ok ── TESTING ◀───┼── idle tester      │ probe failed
//!    │                   │          │ broken             ▼
//!    └─ max age ─▶ EVICTED          └────────────────▶ BROKEN
//!                        │                               │
//!                        └───────────▶ DESTROYED ◀───────┘
//! ```
//!
//! Packing the lease into the same word makes "release only the lease I
//! was given" a single compare-and-set, so a stale wrapper can never
//! release a handle that has since been lent to someone else.

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::driver::{DriverError, PhysicalConnection, PhysicalStatement};
use crate::error::{PoolError, PoolResult};
use crate::hooks::ConnectionInfo;
use crate::recovery::{ReplayEntry, ReplayLog};
use crate::statement::StatementSlot;
use crate::statement_cache::{StatementCache, StatementKey, close_quietly};

/// Lifecycle state of a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HandleState {
    Free = 0,
    Leased = 1,
    Releasing = 2,
    Testing = 3,
    Broken = 4,
    Evicted = 5,
    Destroyed = 6,
}

impl HandleState {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => HandleState::Free,
            1 => HandleState::Leased,
            2 => HandleState::Releasing,
            3 => HandleState::Testing,
            4 => HandleState::Broken,
            5 => HandleState::Evicted,
            _ => HandleState::Destroyed,
        }
    }
}

const STATE_BITS: u32 = 8;
const STATE_MASK: u64 = 0xff;

/// State and lease counter packed as `lease << 8 | state`.
#[derive(Debug)]
struct StateWord(AtomicU64);

impl StateWord {
    fn new(state: HandleState) -> Self {
        Self(AtomicU64::new(Self::pack(0, state)))
    }

    fn pack(lease: u64, state: HandleState) -> u64 {
        (lease << STATE_BITS) | state as u64
    }

    fn unpack(word: u64) -> (u64, HandleState) {
        (word >> STATE_BITS, HandleState::from_bits((word & STATE_MASK) as u8))
    }

    fn load(&self) -> (u64, HandleState) {
        Self::unpack(self.0.load(Ordering::Acquire))
    }

    /// `from → to` whatever the current lease.
    fn transition(&self, from: HandleState, to: HandleState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let (lease, state) = Self::unpack(word);
                (state == from).then(|| Self::pack(lease, to))
            })
            .is_ok()
    }

    /// `from → to` only while `lease` is still current.
    fn transition_lease(&self, lease: u64, from: HandleState, to: HandleState) -> bool {
        self.0
            .compare_exchange(
                Self::pack(lease, from),
                Self::pack(lease, to),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// `FREE → LEASED` with a fresh lease number.
    fn claim(&self) -> Option<u64> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let (lease, state) = Self::unpack(word);
                (state == HandleState::Free).then(|| Self::pack(lease + 1, HandleState::Leased))
            })
            .ok()
            .map(|previous| Self::unpack(previous).0 + 1)
    }

    /// Unconditionally move to `to`, returning the previous state.
    fn replace(&self, to: HandleState) -> HandleState {
        let previous = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some(Self::pack(Self::unpack(word).0, to))
            })
            .unwrap_or_else(|word| word);
        Self::unpack(previous).1
    }
}

/// Where and when a caller took a connection, for leak reports.
#[derive(Debug)]
struct LeaseRecord {
    lease: u64,
    leased_at: Instant,
    trace: Backtrace,
    reported: bool,
}

/// Everything guarded by the handle's core lock.
pub(crate) struct HandleCore {
    /// `None` once the physical connection has been closed.
    pub physical: Option<Box<dyn PhysicalConnection>>,
    pub cache: StatementCache,
    /// Statements the current lease has open, by slot id.
    pub open_statements: HashMap<u64, Arc<StatementSlot>>,
    /// Statements rebuilt by transaction replay, waiting for their slot
    /// to pick them up.
    pub rebound: HashMap<u64, Box<dyn PhysicalStatement>>,
}

pub(crate) struct ConnectionHandle {
    id: u64,
    partition: usize,
    created_at: Instant,
    state: StateWord,
    /// Bumped whenever the physical connection is replaced.
    generation: AtomicU64,
    auto_commit: AtomicBool,
    /// Work executed since the last commit/rollback.
    dirty: AtomicBool,
    possibly_broken: AtomicBool,
    broken_cause: Mutex<Option<DriverError>>,
    last_used: Mutex<Instant>,
    /// Last successful idle probe. Never moves `last_used`.
    last_tested: Mutex<Instant>,
    lease_record: Mutex<Option<LeaseRecord>>,
    next_statement: AtomicU64,
    // Lock order: statement slot → core → replay.
    core: Mutex<HandleCore>,
    replay: Mutex<ReplayLog>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: u64,
        partition: usize,
        physical: Box<dyn PhysicalConnection>,
        cache: StatementCache,
        auto_commit: bool,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            partition,
            created_at: now,
            state: StateWord::new(HandleState::Free),
            generation: AtomicU64::new(0),
            auto_commit: AtomicBool::new(auto_commit),
            dirty: AtomicBool::new(false),
            possibly_broken: AtomicBool::new(false),
            broken_cause: Mutex::new(None),
            last_used: Mutex::new(now),
            last_tested: Mutex::new(now),
            lease_record: Mutex::new(None),
            next_statement: AtomicU64::new(1),
            core: Mutex::new(HandleCore {
                physical: Some(physical),
                cache,
                open_statements: HashMap::new(),
                rebound: HashMap::new(),
            }),
            replay: Mutex::new(ReplayLog::default()),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn partition(&self) -> usize {
        self.partition
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            partition: self.partition,
            created_at: self.created_at,
        }
    }

    pub(crate) fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    // ── State ───────────────────────────────────────────────────────

    pub(crate) fn state(&self) -> HandleState {
        self.state.load().1
    }

    #[cfg(test)]
    pub(crate) fn lease(&self) -> u64 {
        self.state.load().0
    }

    pub(crate) fn claim(&self) -> Option<u64> {
        self.state.claim()
    }

    pub(crate) fn transition(&self, from: HandleState, to: HandleState) -> bool {
        self.state.transition(from, to)
    }

    pub(crate) fn transition_lease(&self, lease: u64, from: HandleState, to: HandleState) -> bool {
        self.state.transition_lease(lease, from, to)
    }

    pub(crate) fn replace_state(&self, to: HandleState) -> HandleState {
        self.state.replace(to)
    }

    /// Fail unless `lease` is the handle's current, still-leased lease.
    pub(crate) fn check_lease(&self, lease: u64) -> PoolResult<()> {
        let (current, state) = self.state.load();
        if current == lease && state == HandleState::Leased {
            return Ok(());
        }
        match self.broken_cause.lock().clone() {
            Some(source) if current == lease => Err(PoolError::ConnectionBroken {
                connection_id: self.id,
                source,
            }),
            _ => Err(PoolError::HandleClosed("connection")),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn advance_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn auto_commit(&self) -> bool {
        self.auto_commit.load(Ordering::Acquire)
    }

    pub(crate) fn is_possibly_broken(&self) -> bool {
        self.possibly_broken.load(Ordering::Acquire)
    }

    pub(crate) fn mark_possibly_broken(&self) {
        self.possibly_broken.store(true, Ordering::Release);
    }

    pub(crate) fn clear_possibly_broken(&self) {
        self.possibly_broken.store(false, Ordering::Release);
    }

    pub(crate) fn mark_broken(&self, cause: DriverError) {
        *self.broken_cause.lock() = Some(cause);
    }

    // ── Activity and leases ─────────────────────────────────────────

    pub(crate) fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    /// Time since the connection was last used or last passed a probe.
    pub(crate) fn unchecked_for(&self) -> Duration {
        self.idle_for().min(self.last_tested.lock().elapsed())
    }

    pub(crate) fn mark_tested(&self) {
        *self.last_tested.lock() = Instant::now();
    }

    pub(crate) fn begin_lease(&self, lease: u64, track: bool) {
        self.touch();
        if track {
            *self.lease_record.lock() = Some(LeaseRecord {
                lease,
                leased_at: Instant::now(),
                trace: Backtrace::capture(),
                reported: false,
            });
        }
    }

    pub(crate) fn end_lease(&self) {
        self.lease_record.lock().take();
        self.touch();
    }

    /// Report a lease held longer than `threshold`, once per lease.
    /// Returns the lease, how long it has been held and where it was taken.
    pub(crate) fn overdue_lease(&self, threshold: Duration) -> Option<(u64, Duration, String)> {
        let mut record = self.lease_record.lock();
        let record = record.as_mut()?;
        let held = record.leased_at.elapsed();
        if record.reported || held <= threshold {
            return None;
        }
        record.reported = true;
        Some((record.lease, held, record.trace.to_string()))
    }

    // ── Physical access ─────────────────────────────────────────────

    pub(crate) fn lock_core(&self) -> MutexGuard<'_, HandleCore> {
        self.core.lock()
    }

    pub(crate) fn replay_log(&self) -> MutexGuard<'_, ReplayLog> {
        self.replay.lock()
    }

    pub(crate) fn with_physical<T>(
        &self,
        call: impl FnOnce(&mut dyn PhysicalConnection) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        let mut core = self.core.lock();
        let physical = core
            .physical
            .as_mut()
            .ok_or_else(|| DriverError::connection_lost("physical connection is closed"))?;
        call(physical.as_mut())
    }

    /// Probe liveness with the configured test statement, or the driver's
    /// native check when none is set.
    pub(crate) fn probe(&self, config: &PoolConfig) -> bool {
        let result = self.with_physical(|physical| match &config.connection_test_statement {
            Some(sql) => {
                let mut statement = physical.create_statement()?;
                let outcome = statement.execute(Some(sql));
                close_quietly(statement);
                outcome.map(|_| true)
            }
            None => physical.is_valid(config.validation_timeout),
        });
        match result {
            Ok(alive) => alive,
            Err(e) => {
                debug!(connection_id = self.id, error = %e, "connection probe failed");
                false
            }
        }
    }

    pub(crate) fn commit(&self) -> Result<(), DriverError> {
        self.with_physical(|physical| physical.commit())?;
        self.end_transaction();
        Ok(())
    }

    pub(crate) fn rollback(&self) -> Result<(), DriverError> {
        self.with_physical(|physical| physical.rollback())?;
        self.end_transaction();
        Ok(())
    }

    pub(crate) fn set_auto_commit(&self, auto_commit: bool) -> Result<(), DriverError> {
        self.with_physical(|physical| physical.set_auto_commit(auto_commit))?;
        self.auto_commit.store(auto_commit, Ordering::Release);
        if auto_commit {
            self.end_transaction();
        }
        Ok(())
    }

    fn end_transaction(&self) {
        self.dirty.store(false, Ordering::Release);
        self.replay.lock().clear();
    }

    /// Note that work ran outside auto-commit. `entry` is only built when
    /// the log is kept for recovery.
    pub(crate) fn record_work(&self, keep_log: bool, entry: impl FnOnce() -> ReplayEntry) {
        if self.auto_commit() {
            return;
        }
        self.dirty.store(true, Ordering::Release);
        if keep_log {
            self.replay.lock().push(entry());
        }
    }

    /// Roll back unfinished work and restore the pool's auto-commit mode
    /// before the handle goes back on the free list.
    pub(crate) fn reset_session(&self, default_auto_commit: bool) -> Result<(), DriverError> {
        if self.dirty.load(Ordering::Acquire) {
            self.rollback()?;
        }
        if self.auto_commit() != default_auto_commit {
            self.set_auto_commit(default_auto_commit)?;
        }
        self.end_transaction();
        Ok(())
    }

    // ── Statements ──────────────────────────────────────────────────

    pub(crate) fn next_statement_id(&self) -> u64 {
        self.next_statement.fetch_add(1, Ordering::Relaxed)
    }

    /// Get a physical statement for a new wrapper: from the cache for
    /// prepared keys when caching is on, otherwise from the driver.
    /// Returns the statement, whether it was a cache hit, and the
    /// generation of the connection it belongs to.
    pub(crate) fn checkout_statement(
        &self,
        key: Option<&StatementKey>,
    ) -> Result<(Box<dyn PhysicalStatement>, bool, u64), DriverError> {
        let mut core = self.core.lock();
        let generation = self.generation();
        let HandleCore {
            physical, cache, ..
        } = &mut *core;
        let physical = physical
            .as_mut()
            .ok_or_else(|| DriverError::connection_lost("physical connection is closed"))?;
        match key {
            Some(key) => {
                let (statement, hit) = cache.get_or_create(key, |key| physical.prepare(key))?;
                Ok((statement, hit, generation))
            }
            None => Ok((physical.create_statement()?, false, generation)),
        }
    }

    pub(crate) fn register_statement(&self, slot: Arc<StatementSlot>) {
        self.core.lock().open_statements.insert(slot.id(), slot);
    }

    pub(crate) fn take_open_statements(&self) -> Vec<Arc<StatementSlot>> {
        self.core
            .lock()
            .open_statements
            .drain()
            .map(|(_, slot)| slot)
            .collect()
    }

    /// Accept a logically closed statement back. Prepared statements from
    /// the current lease and connection generation go to the cache;
    /// everything else is physically closed.
    pub(crate) fn return_statement(
        &self,
        slot: u64,
        key: Option<&StatementKey>,
        statement: Option<Box<dyn PhysicalStatement>>,
        generation: u64,
        lease: u64,
    ) {
        let mut core = self.core.lock();
        core.open_statements.remove(&slot);
        if let Some(stale) = core.rebound.remove(&slot) {
            close_quietly(stale);
        }
        let Some(statement) = statement else {
            return;
        };
        let (current_lease, state) = self.state.load();
        let reusable = current_lease == lease
            && matches!(state, HandleState::Leased | HandleState::Releasing)
            && generation == self.generation()
            && core.physical.is_some();
        match key {
            Some(key) if reusable => {
                core.cache.put(key.clone(), statement);
            }
            _ => close_quietly(statement),
        }
    }

    /// A physical statement for a slot whose connection was replaced:
    /// the one transaction replay built for it, or a fresh one.
    pub(crate) fn rebind(
        &self,
        slot: u64,
        key: Option<&StatementKey>,
    ) -> Result<Box<dyn PhysicalStatement>, DriverError> {
        let mut core = self.core.lock();
        if let Some(statement) = core.rebound.remove(&slot) {
            return Ok(statement);
        }
        let physical = core
            .physical
            .as_mut()
            .ok_or_else(|| DriverError::connection_lost("physical connection is closed"))?;
        match key {
            Some(key) => physical.prepare(key),
            None => physical.create_statement(),
        }
    }

    /// Close the cache and the physical connection. Idempotent.
    pub(crate) fn close_physical(&self) {
        let mut core = self.core.lock();
        core.cache.clear();
        core.open_statements.clear();
        for (_, statement) in core.rebound.drain() {
            close_quietly(statement);
        }
        if let Some(mut physical) = core.physical.take() {
            if let Err(e) = physical.close() {
                warn!(connection_id = self.id, error = %e, "failed to close physical connection");
            }
        }
    }
}

/// Put a freshly opened physical connection into the pool's session
/// defaults and run the init SQL.
pub(crate) fn initialize_session(
    physical: &mut dyn PhysicalConnection,
    config: &PoolConfig,
    auto_commit: bool,
) -> Result<(), DriverError> {
    if !auto_commit {
        physical.set_auto_commit(false)?;
    }
    if let Some(sql) = &config.init_sql {
        let mut statement = physical.create_statement()?;
        let outcome = statement.execute(Some(sql));
        close_quietly(statement);
        outcome?;
    }
    Ok(())
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (lease, state) = self.state.load();
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("partition", &self.partition)
            .field("state", &state)
            .field("lease", &lease)
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Credentials, Driver};
    use crate::mock::MockDriver;
    use crate::statement_cache::CacheBudget;

    fn handle(driver: &MockDriver) -> ConnectionHandle {
        let physical = driver.connect("mock:db", &Credentials::default()).unwrap();
        let cache = StatementCache::new(4, Arc::new(CacheBudget::new(10)));
        ConnectionHandle::new(1, 0, physical, cache, true)
    }

    #[test]
    fn claim_bumps_lease_and_only_succeeds_once() {
        let driver = MockDriver::new();
        let handle = handle(&driver);
        assert_eq!(handle.state(), HandleState::Free);

        let lease = handle.claim().unwrap();
        assert_eq!(lease, 1);
        assert_eq!(handle.state(), HandleState::Leased);
        assert!(handle.claim().is_none());
    }

    #[test]
    fn release_requires_current_lease() {
        let driver = MockDriver::new();
        let handle = handle(&driver);

        let first = handle.claim().unwrap();
        assert!(handle.transition_lease(first, HandleState::Leased, HandleState::Releasing));
        assert!(handle.transition(HandleState::Releasing, HandleState::Free));

        let second = handle.claim().unwrap();
        assert_ne!(first, second);
        // A stale wrapper cannot release the new lease.
        assert!(!handle.transition_lease(first, HandleState::Leased, HandleState::Releasing));
        assert!(handle.check_lease(first).is_err());
        assert!(handle.check_lease(second).is_ok());
    }

    #[test]
    fn replace_reports_previous_state() {
        let driver = MockDriver::new();
        let handle = handle(&driver);
        handle.claim().unwrap();
        assert_eq!(handle.replace_state(HandleState::Destroyed), HandleState::Leased);
        assert_eq!(handle.replace_state(HandleState::Destroyed), HandleState::Destroyed);
        // Lease survives the replace.
        assert_eq!(handle.lease(), 1);
    }

    #[test]
    fn broken_cause_surfaces_on_stale_check() {
        let driver = MockDriver::new();
        let handle = handle(&driver);
        let lease = handle.claim().unwrap();
        handle.mark_broken(DriverError::connection_lost("reset"));
        handle.replace_state(HandleState::Destroyed);
        assert!(matches!(
            handle.check_lease(lease),
            Err(PoolError::ConnectionBroken { connection_id: 1, .. })
        ));
    }

    #[test]
    fn probe_uses_native_check_or_test_statement() {
        let driver = MockDriver::new();
        let state = driver.state();
        let handle = handle(&driver);
        let mut config = PoolConfig::new("mock:db", Credentials::default());

        assert!(handle.probe(&config));
        assert_eq!(state.validity_checks(), 1);

        config.connection_test_statement = Some("SELECT 1".into());
        assert!(handle.probe(&config));
        assert_eq!(state.executed_on(1), vec!["SELECT 1".to_string()]);

        state.kill(1);
        assert!(!handle.probe(&config));
    }

    #[test]
    fn overdue_lease_reported_once() {
        let driver = MockDriver::new();
        let handle = handle(&driver);
        let lease = handle.claim().unwrap();
        handle.begin_lease(lease, true);
        std::thread::sleep(Duration::from_millis(5));

        let (reported, _, _) = handle.overdue_lease(Duration::from_millis(1)).unwrap();
        assert_eq!(reported, lease);
        assert!(handle.overdue_lease(Duration::from_millis(1)).is_none());
        handle.end_lease();
        assert!(handle.overdue_lease(Duration::ZERO).is_none());
    }

    #[test]
    fn reset_rolls_back_dirty_session() {
        let driver = MockDriver::new();
        let state = driver.state();
        let handle = handle(&driver);
        handle.set_auto_commit(false).unwrap();
        handle.record_work(false, || unreachable!("log not kept"));

        handle.reset_session(true).unwrap();
        assert!(handle.auto_commit());
        assert_eq!(state.executed_on(1), vec!["ROLLBACK".to_string()]);
    }

    #[test]
    fn close_physical_is_idempotent() {
        let driver = MockDriver::new();
        let state = driver.state();
        let handle = handle(&driver);
        handle.close_physical();
        handle.close_physical();
        assert_eq!(state.connections_closed(), 1);
        assert!(handle.with_physical(|_| Ok(())).is_err());
    }
}
