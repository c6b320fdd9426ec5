//! The connection wrapper handed out by [`Pool::acquire`](crate::Pool::acquire).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::warn;

use crate::driver::{DriverError, PhysicalStatement};
use crate::error::{PoolError, PoolResult};
use crate::handle::ConnectionHandle;
use crate::pool::PoolInner;
use crate::recovery::Disposition;
use crate::statement::{Statement, StatementSlot};
use crate::stats::Statistics;
use crate::statement_cache::StatementKey;

/// A leased connection.
///
/// `close()` (or dropping the value) returns it to its partition; any
/// statements still open are closed first, with prepared ones going back
/// into the statement cache. Every method fails with
/// [`PoolError::HandleClosed`] after close.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    handle: Arc<ConnectionHandle>,
    lease: u64,
    closed: AtomicBool,
}

impl PooledConnection {
    pub(crate) fn new(pool: Arc<PoolInner>, handle: Arc<ConnectionHandle>, lease: u64) -> Self {
        Self {
            pool,
            handle,
            lease,
            closed: AtomicBool::new(false),
        }
    }

    /// Pool-assigned id of the underlying handle. Stable across
    /// transparent recovery.
    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    /// Index of the partition this connection belongs to.
    pub fn partition(&self) -> usize {
        self.handle.partition()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.handle.check_lease(self.lease).is_err()
    }

    /// Prepare `sql`, reusing a cached statement when one is idle.
    pub fn prepare_statement(&self, sql: &str) -> PoolResult<Statement> {
        self.prepare(StatementKey::new(sql))
    }

    /// Prepare a stored-procedure call.
    pub fn prepare_call(&self, sql: &str) -> PoolResult<Statement> {
        self.prepare(StatementKey::callable(sql))
    }

    /// Prepare with explicit options. Keys that differ only in options are
    /// cached separately.
    pub fn prepare(&self, key: StatementKey) -> PoolResult<Statement> {
        let (physical, hit, generation) = self.run(|handle| handle.checkout_statement(Some(&key)))?;
        let stats = &self.pool.stats;
        if hit {
            Statistics::bump(&stats.cache_hits);
        } else {
            Statistics::bump(&stats.cache_misses);
            Statistics::bump(&stats.statements_prepared);
        }
        Ok(self.open(Some(key), physical, generation))
    }

    /// A plain statement for one-off SQL. Never cached.
    pub fn create_statement(&self) -> PoolResult<Statement> {
        let (physical, _, generation) = self.run(|handle| handle.checkout_statement(None))?;
        Ok(self.open(None, physical, generation))
    }

    fn open(
        &self,
        key: Option<StatementKey>,
        physical: Box<dyn PhysicalStatement>,
        generation: u64,
    ) -> Statement {
        let slot = StatementSlot::new(
            self.handle.next_statement_id(),
            key,
            self.lease,
            physical,
            generation,
        );
        self.handle.register_statement(slot.clone());
        Statement::new(self.pool.clone(), self.handle.clone(), slot)
    }

    pub fn auto_commit(&self) -> PoolResult<bool> {
        self.check_open()?;
        Ok(self.handle.auto_commit())
    }

    pub fn set_auto_commit(&self, auto_commit: bool) -> PoolResult<()> {
        self.run(|handle| handle.set_auto_commit(auto_commit))
    }

    pub fn commit(&self) -> PoolResult<()> {
        self.run(|handle| handle.commit())
    }

    pub fn rollback(&self) -> PoolResult<()> {
        self.run(|handle| handle.rollback())
    }

    /// Driver-native liveness check. Errors count as "not valid".
    pub fn is_valid(&self, timeout: Duration) -> PoolResult<bool> {
        self.check_open()?;
        Ok(self
            .handle
            .with_physical(|physical| physical.is_valid(timeout))
            .unwrap_or(false))
    }

    /// Return the connection to the pool. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.release(&self.handle, self.lease);
    }

    fn check_open(&self) -> PoolResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::HandleClosed("connection"));
        }
        self.handle.check_lease(self.lease)
    }

    fn run<T>(
        &self,
        mut call: impl FnMut(&ConnectionHandle) -> Result<T, DriverError>,
    ) -> PoolResult<T> {
        self.check_open()?;
        let generation = self.handle.generation();
        let error = match call(&self.handle) {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        match self.pool.on_driver_error(&self.handle, error, generation) {
            Disposition::Transient(e) => Err(PoolError::Driver(e)),
            Disposition::Failed(e) => Err(e),
            Disposition::Recovered(original) => call(&self.handle)
                .map_err(|e| self.pool.retry_failed(&self.handle, e, original)),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if self.pool.config.close_connection_watch && self.handle.check_lease(self.lease).is_ok() {
            warn!(
                connection_id = self.handle.id(),
                partition = self.handle.partition(),
                "connection dropped without close(), returning it to the pool"
            );
        }
        self.close();
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.handle.id())
            .field("partition", &self.handle.partition())
            .field("closed", &self.is_closed())
            .finish()
    }
}
