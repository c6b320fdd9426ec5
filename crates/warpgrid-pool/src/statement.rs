//! Statement and result-set wrappers handed to callers.
//!
//! A [`Statement`] owns a slot registered with its connection handle. The
//! slot holds the physical statement, the parameters bound so far, and
//! the result sets opened from it. Closing the statement (explicitly, on
//! drop, or when the connection is closed) closes those result sets and
//! offers the physical statement back to the connection's cache.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::driver::{DriverError, FetchDirection, PhysicalResultSet, PhysicalStatement, Value};
use crate::error::{PoolError, PoolResult};
use crate::handle::ConnectionHandle;
use crate::pool::PoolInner;
use crate::recovery::{Disposition, ReplayEntry, ReplayOp};
use crate::stats::Statistics;
use crate::statement_cache::{StatementKey, close_quietly};

pub(crate) struct StatementSlot {
    id: u64,
    key: Option<StatementKey>,
    lease: u64,
    state: Mutex<SlotState>,
}

struct SlotState {
    physical: Option<Box<dyn PhysicalStatement>>,
    /// Connection generation `physical` was built on.
    generation: u64,
    params: BTreeMap<usize, Value>,
    result_sets: Vec<Arc<ResultSetSlot>>,
    closed: bool,
}

impl SlotState {
    fn close_result_sets(&mut self) {
        for rows in self.result_sets.drain(..) {
            rows.close();
        }
    }
}

impl StatementSlot {
    pub(crate) fn new(
        id: u64,
        key: Option<StatementKey>,
        lease: u64,
        physical: Box<dyn PhysicalStatement>,
        generation: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            key,
            lease,
            state: Mutex::new(SlotState {
                physical: Some(physical),
                generation,
                params: BTreeMap::new(),
                result_sets: Vec::new(),
                closed: false,
            }),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Logical close: close tracked result sets and hand the physical
    /// statement back to the connection. Idempotent.
    pub(crate) fn close(&self, handle: &ConnectionHandle) {
        let (physical, generation) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.close_result_sets();
            (state.physical.take(), state.generation)
        };
        handle.return_statement(self.id, self.key.as_ref(), physical, generation, self.lease);
    }
}

/// A statement borrowed from a pooled connection.
///
/// Methods forward to the driver. Driver errors are classified first: a
/// transient failure comes back as [`PoolError::Driver`], a dead
/// connection as [`PoolError::ConnectionBroken`] (or is recovered
/// transparently when transaction recovery is on).
pub struct Statement {
    pool: Arc<PoolInner>,
    handle: Arc<ConnectionHandle>,
    slot: Arc<StatementSlot>,
}

impl Statement {
    pub(crate) fn new(
        pool: Arc<PoolInner>,
        handle: Arc<ConnectionHandle>,
        slot: Arc<StatementSlot>,
    ) -> Self {
        Self { pool, handle, slot }
    }

    /// Prepared SQL, or `None` for a plain statement.
    pub fn sql(&self) -> Option<&str> {
        self.slot.key.as_ref().map(|key| key.sql.as_str())
    }

    pub fn is_closed(&self) -> bool {
        self.slot.state.lock().closed || self.handle.check_lease(self.slot.lease).is_err()
    }

    pub fn close(&self) {
        self.slot.close(&self.handle);
    }

    // ── Parameters ──────────────────────────────────────────────────

    /// Bind `value` to the 1-based parameter `index`.
    pub fn set(&self, index: usize, value: impl Into<Value>) -> PoolResult<()> {
        let value = value.into();
        self.run(None, None, |statement| statement.bind(index, &value))?;
        self.slot.state.lock().params.insert(index, value);
        Ok(())
    }

    pub fn clear_parameters(&self) -> PoolResult<()> {
        self.run(None, None, |statement| statement.clear_parameters())?;
        self.slot.state.lock().params.clear();
        Ok(())
    }

    // ── Execution ───────────────────────────────────────────────────

    pub fn execute(&self) -> PoolResult<bool> {
        self.run(Some(ReplayOp::Execute), None, |statement| statement.execute(None))
    }

    pub fn execute_sql(&self, sql: &str) -> PoolResult<bool> {
        self.run(Some(ReplayOp::Execute), Some(sql), |statement| statement.execute(Some(sql)))
    }

    pub fn execute_query(&self) -> PoolResult<ResultSet> {
        let rows = self.run(Some(ReplayOp::Query), None, |statement| statement.execute_query(None))?;
        self.track(rows)
    }

    pub fn execute_query_sql(&self, sql: &str) -> PoolResult<ResultSet> {
        let rows = self.run(Some(ReplayOp::Query), Some(sql), |statement| {
            statement.execute_query(Some(sql))
        })?;
        self.track(rows)
    }

    pub fn execute_update(&self) -> PoolResult<u64> {
        self.run(Some(ReplayOp::Update), None, |statement| statement.execute_update(None))
    }

    pub fn execute_update_sql(&self, sql: &str) -> PoolResult<u64> {
        self.run(Some(ReplayOp::Update), Some(sql), |statement| {
            statement.execute_update(Some(sql))
        })
    }

    pub fn add_batch(&self) -> PoolResult<()> {
        self.run(Some(ReplayOp::AddBatch), None, |statement| statement.add_batch(None))
    }

    pub fn add_batch_sql(&self, sql: &str) -> PoolResult<()> {
        self.run(Some(ReplayOp::AddBatch), Some(sql), |statement| statement.add_batch(Some(sql)))
    }

    pub fn execute_batch(&self) -> PoolResult<Vec<u64>> {
        self.run(Some(ReplayOp::ExecuteBatch), None, |statement| statement.execute_batch())
    }

    pub fn clear_batch(&self) -> PoolResult<()> {
        self.run(Some(ReplayOp::ClearBatch), None, |statement| statement.clear_batch())
    }

    pub fn generated_keys(&self) -> PoolResult<ResultSet> {
        let rows = self.run(None, None, |statement| statement.generated_keys())?;
        self.track(rows)
    }

    // ── Tuning ──────────────────────────────────────────────────────

    pub fn set_fetch_size(&self, rows: u32) -> PoolResult<()> {
        self.run(None, None, |statement| statement.set_fetch_size(rows))
    }

    pub fn fetch_size(&self) -> PoolResult<u32> {
        self.run(None, None, |statement| statement.fetch_size())
    }

    pub fn set_fetch_direction(&self, direction: FetchDirection) -> PoolResult<()> {
        self.run(None, None, |statement| statement.set_fetch_direction(direction))
    }

    pub fn set_max_rows(&self, rows: u64) -> PoolResult<()> {
        self.run(None, None, |statement| statement.set_max_rows(rows))
    }

    pub fn set_query_timeout(&self, timeout: Duration) -> PoolResult<()> {
        self.run(None, None, |statement| statement.set_query_timeout(timeout))
    }

    pub fn cancel(&self) -> PoolResult<()> {
        self.run(None, None, |statement| statement.cancel())
    }

    // ── Plumbing ────────────────────────────────────────────────────

    /// Run `call` against the physical statement, rebinding it first if
    /// the connection was replaced, and route any error through the
    /// broken-connection policy. After a recovery the call is retried
    /// once.
    fn run<T, F>(&self, op: Option<ReplayOp>, sql: Option<&str>, mut call: F) -> PoolResult<T>
    where
        F: FnMut(&mut dyn PhysicalStatement) -> Result<T, DriverError>,
    {
        self.handle.check_lease(self.slot.lease)?;
        let mut state = self.slot.state.lock();
        if state.closed {
            return Err(PoolError::HandleClosed("statement"));
        }
        let generation = self.bind_current(&mut state)?;

        if self.pool.config.log_statements_enabled {
            if let Some(op) = op {
                debug!(
                    connection_id = self.handle.id(),
                    ?op,
                    sql = sql.or(self.sql()).unwrap_or_default(),
                    params = ?state.params,
                    "executing statement"
                );
            }
        }

        let error = match invoke(&mut state, &mut call) {
            Ok(value) => {
                self.record(&state, op, sql);
                return Ok(value);
            }
            Err(e) => e,
        };

        match self.pool.on_driver_error(&self.handle, error, generation) {
            Disposition::Transient(e) => Err(PoolError::Driver(e)),
            Disposition::Failed(e) => Err(e),
            Disposition::Recovered(original) => {
                self.bind_current(&mut state)?;
                match invoke(&mut state, &mut call) {
                    Ok(value) => {
                        self.record(&state, op, sql);
                        Ok(value)
                    }
                    Err(e) => Err(self.pool.retry_failed(&self.handle, e, original)),
                }
            }
        }
    }

    /// Make sure the slot's physical statement belongs to the handle's
    /// current physical connection. Returns that connection's generation.
    fn bind_current(&self, state: &mut SlotState) -> PoolResult<u64> {
        let current = self.handle.generation();
        if state.generation == current && state.physical.is_some() {
            return Ok(current);
        }

        if let Some(stale) = state.physical.take() {
            close_quietly(stale);
        }
        state.close_result_sets();

        let mut fresh = self.handle.rebind(self.slot.id, self.slot.key.as_ref())?;
        for (index, value) in &state.params {
            fresh.bind(*index, value)?;
        }
        state.physical = Some(fresh);
        state.generation = current;
        Ok(current)
    }

    fn record(&self, state: &SlotState, op: Option<ReplayOp>, sql: Option<&str>) {
        let Some(op) = op else {
            return;
        };
        if op.is_execution() {
            Statistics::bump(&self.pool.stats.statements_executed);
        }
        self.handle
            .record_work(self.pool.config.transaction_recovery_enabled, || ReplayEntry {
                statement: self.slot.id,
                key: self.slot.key.clone(),
                sql: sql.map(str::to_string),
                params: state.params.iter().map(|(i, v)| (*i, v.clone())).collect(),
                op,
            });
    }

    fn track(&self, rows: Box<dyn PhysicalResultSet>) -> PoolResult<ResultSet> {
        let rows = ResultSetSlot::new(rows);
        let mut state = self.slot.state.lock();
        if state.closed {
            drop(state);
            rows.close();
            return Err(PoolError::HandleClosed("statement"));
        }
        state.result_sets.retain(|r| !r.is_closed());
        state.result_sets.push(rows.clone());
        Ok(ResultSet {
            pool: self.pool.clone(),
            handle: self.handle.clone(),
            lease: self.slot.lease,
            slot: rows,
        })
    }
}

fn invoke<T, F>(state: &mut SlotState, call: &mut F) -> Result<T, DriverError>
where
    F: FnMut(&mut dyn PhysicalStatement) -> Result<T, DriverError>,
{
    match state.physical.as_mut() {
        Some(physical) => call(physical.as_mut()),
        None => Err(DriverError::connection_lost("statement has no physical handle")),
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("id", &self.slot.id)
            .field("connection_id", &self.handle.id())
            .field("sql", &self.sql())
            .finish()
    }
}

pub(crate) struct ResultSetSlot {
    inner: Mutex<Option<Box<dyn PhysicalResultSet>>>,
}

impl ResultSetSlot {
    fn new(rows: Box<dyn PhysicalResultSet>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Some(rows)),
        })
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }

    fn close(&self) {
        if let Some(mut rows) = self.inner.lock().take() {
            if let Err(e) = rows.close() {
                debug!(error = %e, "failed to close result set");
            }
        }
    }
}

/// Rows returned by a [`Statement`]. Closed when dropped, when its
/// statement closes, or when its connection is released.
pub struct ResultSet {
    pool: Arc<PoolInner>,
    handle: Arc<ConnectionHandle>,
    lease: u64,
    slot: Arc<ResultSetSlot>,
}

impl ResultSet {
    /// Advance to the next row. `false` once the rows are exhausted.
    pub fn next(&self) -> PoolResult<bool> {
        self.run(|rows| rows.next())
    }

    /// Value of the 1-based `column` in the current row.
    pub fn get(&self, column: usize) -> PoolResult<Value> {
        self.run(|rows| rows.get(column))
    }

    pub fn column_count(&self) -> PoolResult<usize> {
        self.run(|rows| Ok(rows.column_count()))
    }

    pub fn is_closed(&self) -> bool {
        self.slot.is_closed()
    }

    pub fn close(&self) {
        self.slot.close();
    }

    fn run<T>(
        &self,
        call: impl FnOnce(&mut dyn PhysicalResultSet) -> Result<T, DriverError>,
    ) -> PoolResult<T> {
        self.handle.check_lease(self.lease)?;
        let generation = self.handle.generation();
        let outcome = {
            let mut inner = self.slot.inner.lock();
            let rows = inner.as_mut().ok_or(PoolError::HandleClosed("result set"))?;
            call(rows.as_mut())
        };
        // A cursor does not survive recovery, so the original error is
        // reported even when the connection itself was replaced.
        outcome.map_err(|e| match self.pool.on_driver_error(&self.handle, e, generation) {
            Disposition::Transient(e) | Disposition::Recovered(e) => PoolError::Driver(e),
            Disposition::Failed(e) => e,
        })
    }
}

impl Drop for ResultSet {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSet")
            .field("connection_id", &self.handle.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
