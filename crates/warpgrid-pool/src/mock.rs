//! In-memory driver for tests and load generation.
//!
//! Connections accept any SQL, return a configurable number of rows per
//! query, and record every executed statement. Tests can refuse
//! connects, kill individual connections (or all of them), and inject
//! one-shot statement failures.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::driver::{
    Credentials, Driver, DriverError, FetchDirection, PhysicalConnection, PhysicalResultSet,
    PhysicalStatement, Value,
};
use crate::statement_cache::StatementKey;

/// URL scheme accepted by [`MockDriver`].
pub const MOCK_URL_PREFIX: &str = "mock:";

/// One statement execution seen by the mock database.
#[derive(Clone, Debug, PartialEq)]
pub struct Executed {
    pub connection: u64,
    pub sql: String,
    pub params: Vec<Value>,
}

/// Shared counters and knobs behind a [`MockDriver`].
#[derive(Debug, Default)]
pub struct MockState {
    connects: AtomicU64,
    next_connection: AtomicU64,
    fail_connect: AtomicBool,
    connections: Mutex<HashMap<u64, Arc<AtomicBool>>>,
    connections_closed: AtomicU64,
    prepares: AtomicU64,
    statements_closed: AtomicU64,
    result_sets_closed: AtomicU64,
    validity_checks: AtomicU64,
    rows_per_query: AtomicUsize,
    executed: Mutex<Vec<Executed>>,
    injected: Mutex<HashMap<String, DriverError>>,
}

impl MockState {
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> u64 {
        self.connections_closed.load(Ordering::SeqCst)
    }

    pub fn prepares(&self) -> u64 {
        self.prepares.load(Ordering::SeqCst)
    }

    pub fn statements_closed(&self) -> u64 {
        self.statements_closed.load(Ordering::SeqCst)
    }

    pub fn result_sets_closed(&self) -> u64 {
        self.result_sets_closed.load(Ordering::SeqCst)
    }

    pub fn validity_checks(&self) -> u64 {
        self.validity_checks.load(Ordering::SeqCst)
    }

    /// Make subsequent connects fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Rows returned by every query (default 1).
    pub fn set_rows_per_query(&self, rows: usize) {
        self.rows_per_query.store(rows, Ordering::SeqCst);
    }

    /// Simulate the server dropping one physical connection.
    pub fn kill(&self, connection: u64) {
        if let Some(alive) = self.connections.lock().get(&connection) {
            alive.store(false, Ordering::SeqCst);
        }
    }

    /// Simulate a server restart.
    pub fn kill_all(&self) {
        for alive in self.connections.lock().values() {
            alive.store(false, Ordering::SeqCst);
        }
    }

    /// Ids of physical connections that are still alive.
    pub fn live_connections(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .connections
            .lock()
            .iter()
            .filter(|(_, alive)| alive.load(Ordering::SeqCst))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Fail the next execution of `sql` with `error`.
    pub fn fail_next(&self, sql: &str, error: DriverError) {
        self.injected.lock().insert(sql.to_string(), error);
    }

    pub fn executed(&self) -> Vec<Executed> {
        self.executed.lock().clone()
    }

    /// SQL text executed on one physical connection, in order.
    pub fn executed_on(&self, connection: u64) -> Vec<String> {
        self.executed
            .lock()
            .iter()
            .filter(|e| e.connection == connection)
            .map(|e| e.sql.clone())
            .collect()
    }

    fn record(&self, connection: u64, sql: &str, params: Vec<Value>) -> Result<(), DriverError> {
        if let Some(error) = self.injected.lock().remove(sql) {
            return Err(error);
        }
        self.executed.lock().push(Executed {
            connection,
            sql: sql.to_string(),
            params,
        });
        Ok(())
    }
}

/// A driver whose connections live entirely in memory.
#[derive(Clone, Debug)]
pub struct MockDriver {
    state: Arc<MockState>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    pub fn new() -> Self {
        let state = MockState::default();
        state.rows_per_query.store(1, Ordering::SeqCst);
        state.next_connection.store(1, Ordering::SeqCst);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> Arc<MockState> {
        self.state.clone()
    }
}

impl Driver for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    fn accepts_url(&self, url: &str) -> bool {
        url.starts_with(MOCK_URL_PREFIX)
    }

    fn connect(
        &self,
        url: &str,
        _credentials: &Credentials,
    ) -> Result<Box<dyn PhysicalConnection>, DriverError> {
        if !self.accepts_url(url) {
            return Err(DriverError::with_state("08001", format!("no suitable driver for {url}")));
        }
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(DriverError::with_state("08001", "connection refused"));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let id = self.state.next_connection.fetch_add(1, Ordering::SeqCst);
        let alive = Arc::new(AtomicBool::new(true));
        self.state.connections.lock().insert(id, alive.clone());
        Ok(Box::new(MockConnection {
            id,
            alive,
            closed: false,
            state: self.state.clone(),
        }))
    }
}

/// A physical connection backed by [`MockState`].
#[derive(Debug)]
pub struct MockConnection {
    id: u64,
    alive: Arc<AtomicBool>,
    closed: bool,
    state: Arc<MockState>,
}

impl MockConnection {
    fn check(&self) -> Result<(), DriverError> {
        if self.closed || !self.alive.load(Ordering::SeqCst) {
            return Err(DriverError::connection_lost(format!(
                "mock connection {} is gone",
                self.id
            )));
        }
        Ok(())
    }

    fn statement(&self, sql: Option<&str>) -> Box<dyn PhysicalStatement> {
        Box::new(MockStatement {
            state: self.state.clone(),
            connection: self.id,
            alive: self.alive.clone(),
            sql: sql.map(str::to_string),
            params: BTreeMap::new(),
            batch: Vec::new(),
            fetch_size: 0,
            closed: false,
        })
    }
}

impl PhysicalConnection for MockConnection {
    fn prepare(&mut self, key: &StatementKey) -> Result<Box<dyn PhysicalStatement>, DriverError> {
        self.check()?;
        self.state.prepares.fetch_add(1, Ordering::SeqCst);
        Ok(self.statement(Some(&key.sql)))
    }

    fn create_statement(&mut self) -> Result<Box<dyn PhysicalStatement>, DriverError> {
        self.check()?;
        Ok(self.statement(None))
    }

    fn is_valid(&mut self, _timeout: Duration) -> Result<bool, DriverError> {
        self.state.validity_checks.fetch_add(1, Ordering::SeqCst);
        Ok(!self.closed && self.alive.load(Ordering::SeqCst))
    }

    fn set_auto_commit(&mut self, _auto_commit: bool) -> Result<(), DriverError> {
        self.check()
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.check()?;
        self.state.record(self.id, "COMMIT", Vec::new())
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.check()?;
        self.state.record(self.id, "ROLLBACK", Vec::new())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if !self.closed {
            self.closed = true;
            self.state.connections_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// A physical statement backed by [`MockState`].
#[derive(Debug)]
pub struct MockStatement {
    state: Arc<MockState>,
    connection: u64,
    alive: Arc<AtomicBool>,
    sql: Option<String>,
    params: BTreeMap<usize, Value>,
    batch: Vec<(String, Vec<Value>)>,
    fetch_size: u32,
    closed: bool,
}

impl MockStatement {
    /// A statement not tied to any connection.
    pub fn detached(state: Arc<MockState>, sql: &str) -> Self {
        Self {
            state,
            connection: 0,
            alive: Arc::new(AtomicBool::new(true)),
            sql: Some(sql.to_string()),
            params: BTreeMap::new(),
            batch: Vec::new(),
            fetch_size: 0,
            closed: false,
        }
    }

    fn check(&self) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::new("statement is closed"));
        }
        if !self.alive.load(Ordering::SeqCst) {
            return Err(DriverError::connection_lost(format!(
                "mock connection {} is gone",
                self.connection
            )));
        }
        Ok(())
    }

    fn text<'a>(&'a self, sql: Option<&'a str>) -> Result<&'a str, DriverError> {
        self.check()?;
        sql.or(self.sql.as_deref())
            .ok_or_else(|| DriverError::with_state("07003", "no SQL to execute"))
    }

    fn run(&mut self, sql: Option<&str>) -> Result<(), DriverError> {
        let text = self.text(sql)?.to_string();
        let params = self.params.values().cloned().collect();
        self.state.record(self.connection, &text, params)
    }

    fn rows(&self) -> Box<dyn PhysicalResultSet> {
        Box::new(MockResultSet {
            state: self.state.clone(),
            remaining: self.state.rows_per_query.load(Ordering::SeqCst),
            row: 0,
            closed: false,
        })
    }
}

impl PhysicalStatement for MockStatement {
    fn bind(&mut self, index: usize, value: &Value) -> Result<(), DriverError> {
        self.check()?;
        self.params.insert(index, value.clone());
        Ok(())
    }

    fn clear_parameters(&mut self) -> Result<(), DriverError> {
        self.params.clear();
        Ok(())
    }

    fn execute(&mut self, sql: Option<&str>) -> Result<bool, DriverError> {
        self.run(sql)?;
        Ok(true)
    }

    fn execute_query(
        &mut self,
        sql: Option<&str>,
    ) -> Result<Box<dyn PhysicalResultSet>, DriverError> {
        self.run(sql)?;
        Ok(self.rows())
    }

    fn execute_update(&mut self, sql: Option<&str>) -> Result<u64, DriverError> {
        self.run(sql)?;
        Ok(1)
    }

    fn add_batch(&mut self, sql: Option<&str>) -> Result<(), DriverError> {
        let text = self.text(sql)?.to_string();
        let params = self.params.values().cloned().collect();
        self.batch.push((text, params));
        Ok(())
    }

    fn execute_batch(&mut self) -> Result<Vec<u64>, DriverError> {
        self.check()?;
        let batch = std::mem::take(&mut self.batch);
        let mut counts = Vec::with_capacity(batch.len());
        for (sql, params) in batch {
            self.state.record(self.connection, &sql, params)?;
            counts.push(1);
        }
        Ok(counts)
    }

    fn clear_batch(&mut self) -> Result<(), DriverError> {
        self.batch.clear();
        Ok(())
    }

    fn generated_keys(&mut self) -> Result<Box<dyn PhysicalResultSet>, DriverError> {
        Ok(self.rows())
    }

    fn set_fetch_size(&mut self, rows: u32) -> Result<(), DriverError> {
        self.fetch_size = rows;
        Ok(())
    }

    fn fetch_size(&self) -> Result<u32, DriverError> {
        Ok(self.fetch_size)
    }

    fn set_fetch_direction(&mut self, _direction: FetchDirection) -> Result<(), DriverError> {
        Ok(())
    }

    fn set_max_rows(&mut self, _rows: u64) -> Result<(), DriverError> {
        Ok(())
    }

    fn set_query_timeout(&mut self, _timeout: Duration) -> Result<(), DriverError> {
        Ok(())
    }

    fn cancel(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if !self.closed {
            self.closed = true;
            self.state.statements_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Rows are `Int(row_number)` in every column.
#[derive(Debug)]
pub struct MockResultSet {
    state: Arc<MockState>,
    remaining: usize,
    row: i64,
    closed: bool,
}

impl PhysicalResultSet for MockResultSet {
    fn next(&mut self) -> Result<bool, DriverError> {
        if self.closed {
            return Err(DriverError::new("result set is closed"));
        }
        if self.remaining == 0 {
            return Ok(false);
        }
        self.remaining -= 1;
        self.row += 1;
        Ok(true)
    }

    fn get(&self, _column: usize) -> Result<Value, DriverError> {
        Ok(Value::Int(self.row))
    }

    fn column_count(&self) -> usize {
        1
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if !self.closed {
            self.closed = true;
            self.state.result_sets_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
