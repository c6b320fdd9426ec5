//! Per-connection prepared statement cache.
//!
//! Holds physical statements that callers have logically closed so the
//! next `prepare` of the same key skips the server round trip. Only idle
//! statements live here: a hit removes the entry and hands it to the
//! caller, and logical close puts it back at the most-recently-used end.
//!
//! Two bounds apply. Each connection keeps at most
//! `statements_cached_per_connection` entries, and all connections of a
//! pool share a [`CacheBudget`] of `statements_cache_size`. Whatever
//! falls out of either bound is physically closed.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::driver::{DriverError, PhysicalStatement};

/// Scroll behaviour requested for result sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ResultSetType {
    #[default]
    ForwardOnly,
    ScrollInsensitive,
    ScrollSensitive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ResultSetConcurrency {
    #[default]
    ReadOnly,
    Updatable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResultSetHoldability {
    HoldOverCommit,
    CloseAtCommit,
}

/// Whether a key names a plain prepared statement or a stored-procedure call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum StatementKind {
    #[default]
    Prepared,
    Callable,
}

/// Prepare-time options that change the physical statement.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum StatementOptions {
    #[default]
    Default,
    ResultSet {
        kind: ResultSetType,
        concurrency: ResultSetConcurrency,
        holdability: Option<ResultSetHoldability>,
    },
    GeneratedKeys(bool),
    ColumnIndexes(Vec<usize>),
    ColumnNames(Vec<String>),
}

/// Cache key: statement text plus everything passed to prepare.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StatementKey {
    pub sql: String,
    pub kind: StatementKind,
    pub options: StatementOptions,
}

impl StatementKey {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            kind: StatementKind::Prepared,
            options: StatementOptions::Default,
        }
    }

    pub fn callable(sql: impl Into<String>) -> Self {
        Self {
            kind: StatementKind::Callable,
            ..Self::new(sql)
        }
    }

    pub fn with_options(self, options: StatementOptions) -> Self {
        Self { options, ..self }
    }
}

/// Pool-wide count of cached statements.
#[derive(Debug)]
pub struct CacheBudget {
    used: AtomicUsize,
    limit: usize,
}

impl CacheBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            used: AtomicUsize::new(0),
            limit,
        }
    }

    fn try_reserve(&self) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < self.limit).then_some(used + 1)
            })
            .is_ok()
    }

    fn release(&self, n: usize) {
        if n > 0 {
            self.used.fetch_sub(n, Ordering::AcqRel);
        }
    }

    /// Statements currently cached across the pool.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// What happened to a statement offered back to the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// Cached; nothing else was touched.
    Cached,
    /// Cached after physically closing the least-recently-used entry.
    CachedWithEviction,
    /// Not cached; the statement was physically closed.
    Closed,
}

/// LRU cache of idle physical statements for one connection.
pub struct StatementCache {
    entries: IndexMap<StatementKey, Box<dyn PhysicalStatement>>,
    capacity: usize,
    budget: Arc<CacheBudget>,
}

impl StatementCache {
    pub fn new(capacity: usize, budget: Arc<CacheBudget>) -> Self {
        Self {
            entries: IndexMap::new(),
            capacity,
            budget,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &StatementKey) -> bool {
        self.entries.contains_key(key)
    }

    fn enabled(&self) -> bool {
        self.capacity > 0 && self.budget.limit() > 0
    }

    /// Take a cached statement for `key`, resetting it for reuse, or build
    /// one with `factory`. The flag is `true` on a cache hit.
    pub fn get_or_create<F>(
        &mut self,
        key: &StatementKey,
        factory: F,
    ) -> Result<(Box<dyn PhysicalStatement>, bool), DriverError>
    where
        F: FnOnce(&StatementKey) -> Result<Box<dyn PhysicalStatement>, DriverError>,
    {
        if let Some(mut statement) = self.entries.shift_remove(key) {
            self.budget.release(1);
            match reset(statement.as_mut()) {
                Ok(()) => return Ok((statement, true)),
                Err(e) => {
                    debug!(sql = %key.sql, error = %e, "cached statement failed reset, re-preparing");
                    close_quietly(statement);
                }
            }
        }
        factory(key).map(|statement| (statement, false))
    }

    /// Offer a logically closed statement back to the cache.
    pub fn put(&mut self, key: StatementKey, statement: Box<dyn PhysicalStatement>) -> PutOutcome {
        if !self.enabled() || self.entries.contains_key(&key) {
            close_quietly(statement);
            return PutOutcome::Closed;
        }

        let mut evicted = false;
        if self.entries.len() >= self.capacity {
            evicted = self.evict_lru();
        }
        if !self.budget.try_reserve() {
            // Pool-wide budget exhausted: make room from our own entries.
            if self.evict_lru() && self.budget.try_reserve() {
                evicted = true;
            } else {
                close_quietly(statement);
                return PutOutcome::Closed;
            }
        }

        self.entries.insert(key, statement);
        if evicted {
            PutOutcome::CachedWithEviction
        } else {
            PutOutcome::Cached
        }
    }

    fn evict_lru(&mut self) -> bool {
        match self.entries.shift_remove_index(0) {
            Some((key, statement)) => {
                self.budget.release(1);
                debug!(sql = %key.sql, "evicted least-recently-used statement");
                close_quietly(statement);
                true
            }
            None => false,
        }
    }

    /// Physically close every cached statement. Returns how many were closed.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        for (_, statement) in self.entries.drain(..) {
            close_quietly(statement);
        }
        self.budget.release(count);
        count
    }
}

impl Drop for StatementCache {
    fn drop(&mut self) {
        self.clear();
    }
}

fn reset(statement: &mut dyn PhysicalStatement) -> Result<(), DriverError> {
    statement.clear_parameters()?;
    statement.clear_batch()
}

pub(crate) fn close_quietly(mut statement: Box<dyn PhysicalStatement>) {
    if let Err(e) = statement.close() {
        warn!(error = %e, "failed to close statement");
    }
}
