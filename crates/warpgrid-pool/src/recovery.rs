//! Broken-connection handling and transaction replay.
//!
//! Every driver error raised through a wrapper passes through
//! [`PoolInner::on_driver_error`]. Transient errors go straight back to the
//! caller. Errors that may have killed the connection mark the handle
//! possibly broken and, depending on configuration, probe it right away.
//! A confirmed-dead connection is either retired or, with transaction
//! recovery on, replaced: a fresh physical connection is opened, the
//! operations logged since the last commit are replayed onto it, and the
//! failed call is retried once.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use tracing::{info, warn};

use crate::config::{BrokenConnectionProbe, PoolConfig, ReplayGranularity};
use crate::driver::{
    Driver, DriverError, ErrorClass, PhysicalConnection, PhysicalStatement, Value, classify,
};
use crate::error::PoolError;
use crate::handle::{ConnectionHandle, initialize_session};
use crate::pool::PoolInner;
use crate::stats::Statistics;
use crate::statement_cache::{StatementKey, close_quietly};

/// Statement operation recorded for replay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReplayOp {
    Execute,
    Query,
    Update,
    AddBatch,
    ExecuteBatch,
    ClearBatch,
}

impl ReplayOp {
    /// Whether this op sends work to the server (as opposed to staging it).
    pub(crate) fn is_execution(self) -> bool {
        matches!(
            self,
            ReplayOp::Execute | ReplayOp::Query | ReplayOp::Update | ReplayOp::ExecuteBatch
        )
    }

    fn binds_parameters(self) -> bool {
        matches!(
            self,
            ReplayOp::Execute | ReplayOp::Query | ReplayOp::Update | ReplayOp::AddBatch
        )
    }
}

/// One successful statement call made outside auto-commit.
#[derive(Clone, Debug)]
pub(crate) struct ReplayEntry {
    /// Slot id of the statement wrapper that made the call.
    pub statement: u64,
    /// `None` for plain statements.
    pub key: Option<StatementKey>,
    /// Text passed to a plain statement call.
    pub sql: Option<String>,
    pub params: Vec<(usize, Value)>,
    pub op: ReplayOp,
}

/// Operations since the last commit or rollback, oldest first.
#[derive(Debug, Default)]
pub(crate) struct ReplayLog {
    entries: Vec<ReplayEntry>,
}

impl ReplayLog {
    pub(crate) fn push(&mut self, entry: ReplayEntry) {
        self.entries.push(entry);
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entries(&self) -> &[ReplayEntry] {
        &self.entries
    }
}

/// What a wrapper should do after a driver error.
#[derive(Debug)]
pub(crate) enum Disposition {
    /// Surface the driver error; the connection stays usable.
    Transient(DriverError),
    /// The connection was replaced. Rebind and retry once; the original
    /// error is kept for the report if the retry fails too.
    Recovered(DriverError),
    /// The connection is gone. Surface this error.
    Failed(PoolError),
}

impl PoolInner {
    /// Classify `error` raised on `handle` while it was at `generation`
    /// and act on it.
    pub(crate) fn on_driver_error(
        &self,
        handle: &ConnectionHandle,
        error: DriverError,
        generation: u64,
    ) -> Disposition {
        if classify(&error) == ErrorClass::Transient {
            return Disposition::Transient(error);
        }

        handle.mark_possibly_broken();
        warn!(
            connection_id = handle.id(),
            partition = handle.partition(),
            error = %error,
            "driver error, connection possibly broken"
        );

        let recovery = self.config.transaction_recovery_enabled;
        if handle.generation() != generation {
            // Another caller already replaced the connection.
            return if recovery {
                Disposition::Recovered(error)
            } else {
                Disposition::Transient(error)
            };
        }
        if !recovery && self.config.broken_connection_probe == BrokenConnectionProbe::OnRelease {
            return Disposition::Transient(error);
        }
        if handle.probe(&self.config) {
            handle.clear_possibly_broken();
            return Disposition::Transient(error);
        }

        if recovery {
            match self.recover(handle, generation) {
                Ok(()) => return Disposition::Recovered(error),
                Err(e) => {
                    self.retire(handle, error.clone());
                    return Disposition::Failed(PoolError::RecoveryFailed {
                        connection_id: handle.id(),
                        reason: e.to_string(),
                        source: error,
                    });
                }
            }
        }

        self.retire(handle, error.clone());
        Disposition::Failed(PoolError::ConnectionBroken {
            connection_id: handle.id(),
            source: error,
        })
    }

    /// Map the error of the single retry after a successful recovery.
    pub(crate) fn retry_failed(
        &self,
        handle: &ConnectionHandle,
        error: DriverError,
        original: DriverError,
    ) -> PoolError {
        if classify(&error) == ErrorClass::Transient {
            return PoolError::Driver(error);
        }
        self.retire(handle, original.clone());
        PoolError::RecoveryFailed {
            connection_id: handle.id(),
            reason: format!("retry after replay failed: {error}"),
            source: original,
        }
    }

    fn recover(&self, handle: &ConnectionHandle, generation: u64) -> Result<(), DriverError> {
        info!(connection_id = handle.id(), "attempting transaction recovery");
        let replayed = handle.recover(self.driver.as_ref(), &self.config, generation)?;
        Statistics::bump(&self.stats.recoveries);
        info!(
            connection_id = handle.id(),
            replayed,
            "connection recovered onto a new physical connection"
        );
        Ok(())
    }
}

impl ConnectionHandle {
    /// Open a new physical connection, replay the log onto it and swap it
    /// in. Returns the number of replayed operations. A no-op if the
    /// connection already moved past `generation`.
    pub(crate) fn recover(
        &self,
        driver: &dyn Driver,
        config: &PoolConfig,
        generation: u64,
    ) -> Result<usize, DriverError> {
        let mut core = self.lock_core();
        if self.generation() != generation {
            return Ok(0);
        }

        let entries = self.replay_log().entries().to_vec();
        let mut fresh = driver.connect(&config.url, &config.credentials)?;
        let rebuilt = initialize_session(fresh.as_mut(), config, self.auto_commit())
            .and_then(|()| replay(&entries, fresh.as_mut(), config.replay_granularity));
        let rebuilt = match rebuilt {
            Ok(rebuilt) => rebuilt,
            Err(e) => {
                let _ = fresh.close();
                return Err(e);
            }
        };

        // Cached statements belong to the dead connection.
        core.cache.clear();
        for (_, stale) in core.rebound.drain() {
            close_quietly(stale);
        }
        for (slot, statement) in rebuilt {
            if core.open_statements.contains_key(&slot) {
                core.rebound.insert(slot, statement);
            } else {
                close_quietly(statement);
            }
        }
        if let Some(mut old) = core.physical.replace(fresh) {
            let _ = old.close();
        }
        self.advance_generation();
        self.clear_possibly_broken();
        Ok(entries.len())
    }
}

/// Re-run `entries` on `connection`. Returns the statements built along the
/// way, keyed by slot id. On failure every built statement is closed.
pub(crate) fn replay(
    entries: &[ReplayEntry],
    connection: &mut dyn PhysicalConnection,
    granularity: ReplayGranularity,
) -> Result<HashMap<u64, Box<dyn PhysicalStatement>>, DriverError> {
    let mut statements = HashMap::new();
    if let Err(e) = replay_into(entries, connection, granularity, &mut statements) {
        for (_, statement) in statements.drain() {
            close_quietly(statement);
        }
        return Err(e);
    }
    Ok(statements)
}

fn replay_into(
    entries: &[ReplayEntry],
    connection: &mut dyn PhysicalConnection,
    granularity: ReplayGranularity,
    statements: &mut HashMap<u64, Box<dyn PhysicalStatement>>,
) -> Result<(), DriverError> {
    let mut i = 0;
    while i < entries.len() {
        let entry = &entries[i];
        let run = match granularity {
            ReplayGranularity::Batch => batchable_run(&entries[i..]),
            ReplayGranularity::Statement => 1,
        };

        let statement = match statements.entry(entry.statement) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => slot.insert(match &entry.key {
                Some(key) => connection.prepare(key)?,
                None => connection.create_statement()?,
            }),
        };

        if run > 1 {
            for update in &entries[i..i + run] {
                bind_all(statement.as_mut(), &update.params)?;
                statement.add_batch(None)?;
            }
            statement.execute_batch()?;
        } else {
            apply(statement.as_mut(), entry)?;
        }
        i += run;
    }
    Ok(())
}

/// Length of the run of prepared updates on one statement starting at
/// `entries[0]`.
fn batchable_run(entries: &[ReplayEntry]) -> usize {
    let first = &entries[0];
    if first.op != ReplayOp::Update || first.key.is_none() {
        return 1;
    }
    entries
        .iter()
        .take_while(|e| e.op == ReplayOp::Update && e.statement == first.statement)
        .count()
}

fn bind_all(statement: &mut dyn PhysicalStatement, params: &[(usize, Value)]) -> Result<(), DriverError> {
    statement.clear_parameters()?;
    for (index, value) in params {
        statement.bind(*index, value)?;
    }
    Ok(())
}

fn apply(statement: &mut dyn PhysicalStatement, entry: &ReplayEntry) -> Result<(), DriverError> {
    if entry.op.binds_parameters() {
        bind_all(statement, &entry.params)?;
    }
    let sql = entry.sql.as_deref();
    match entry.op {
        ReplayOp::Execute => statement.execute(sql).map(drop),
        ReplayOp::Query => {
            let mut rows = statement.execute_query(sql)?;
            rows.close()
        }
        ReplayOp::Update => statement.execute_update(sql).map(drop),
        ReplayOp::AddBatch => statement.add_batch(sql),
        ReplayOp::ExecuteBatch => statement.execute_batch().map(drop),
        ReplayOp::ClearBatch => statement.clear_batch(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Credentials;
    use crate::mock::MockDriver;

    fn update(statement: u64, value: i64) -> ReplayEntry {
        ReplayEntry {
            statement,
            key: Some(StatementKey::new("UPDATE t SET v = ?")),
            sql: None,
            params: vec![(1, Value::Int(value))],
            op: ReplayOp::Update,
        }
    }

    #[test]
    fn replays_in_order_with_params() {
        let driver = MockDriver::new();
        let state = driver.state();
        let mut conn = driver.connect("mock:db", &Credentials::default()).unwrap();

        let entries = vec![
            update(1, 10),
            ReplayEntry {
                statement: 2,
                key: None,
                sql: Some("DELETE FROM t".into()),
                params: Vec::new(),
                op: ReplayOp::Execute,
            },
            update(1, 20),
        ];
        let built = replay(&entries, conn.as_mut(), ReplayGranularity::Statement).unwrap();
        assert_eq!(built.len(), 2);

        let executed = state.executed();
        let sql: Vec<&str> = executed.iter().map(|e| e.sql.as_str()).collect();
        assert_eq!(sql, vec!["UPDATE t SET v = ?", "DELETE FROM t", "UPDATE t SET v = ?"]);
        assert_eq!(executed[2].params, vec![Value::Int(20)]);
        // One prepare per statement, not per entry.
        assert_eq!(state.prepares(), 1);
    }

    #[test]
    fn batch_granularity_coalesces_runs() {
        let entries = vec![update(1, 1), update(1, 2), update(1, 3), update(2, 4)];
        assert_eq!(batchable_run(&entries), 3);
        assert_eq!(batchable_run(&entries[3..]), 1);

        let driver = MockDriver::new();
        let state = driver.state();
        let mut conn = driver.connect("mock:db", &Credentials::default()).unwrap();
        replay(&entries, conn.as_mut(), ReplayGranularity::Batch).unwrap();
        let params: Vec<Vec<Value>> = state.executed().into_iter().map(|e| e.params).collect();
        assert_eq!(
            params,
            vec![
                vec![Value::Int(1)],
                vec![Value::Int(2)],
                vec![Value::Int(3)],
                vec![Value::Int(4)]
            ]
        );
    }

    #[test]
    fn failed_replay_closes_built_statements() {
        let driver = MockDriver::new();
        let state = driver.state();
        let mut conn = driver.connect("mock:db", &Credentials::default()).unwrap();
        state.fail_next("DELETE FROM t", DriverError::with_state("40001", "conflict"));

        let entries = vec![
            update(1, 1),
            ReplayEntry {
                statement: 2,
                key: None,
                sql: Some("DELETE FROM t".into()),
                params: Vec::new(),
                op: ReplayOp::Execute,
            },
        ];
        assert!(replay(&entries, conn.as_mut(), ReplayGranularity::Statement).is_err());
        assert_eq!(state.statements_closed(), 2);
    }

    #[test]
    fn log_tracks_entries() {
        let mut log = ReplayLog::default();
        assert!(log.is_empty());
        log.push(update(1, 1));
        assert_eq!(log.len(), 1);
        log.clear();
        assert!(log.entries().is_empty());
    }
}
