//! Error types for the connection pool.

use std::time::Duration;

use thiserror::Error;

use crate::driver::DriverError;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced to pool callers.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Invalid driver, URL, credentials, or sizing at construction time.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No connection became available within the acquire budget.
    #[error("connection pool exhausted after {attempts} attempt(s) (waited {waited:?})")]
    PoolExhausted { attempts: u32, waited: Duration },

    #[error("connection pool has been shut down")]
    PoolClosed,

    /// Use of a connection, statement, or result set after logical close.
    #[error("{0} is closed")]
    HandleClosed(&'static str),

    /// The physical connection was confirmed dead and has been retired.
    #[error("connection {connection_id} is broken: {source}")]
    ConnectionBroken {
        connection_id: u64,
        #[source]
        source: DriverError,
    },

    /// Transaction replay onto a fresh physical connection failed.
    #[error("recovery of connection {connection_id} failed: {reason} (original error: {source})")]
    RecoveryFailed {
        connection_id: u64,
        reason: String,
        #[source]
        source: DriverError,
    },

    /// A driver error that did not invalidate the connection.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
}

impl PoolError {
    /// Whether the caller may reasonably retry the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::PoolExhausted { .. } | PoolError::ConnectionBroken { .. }
        )
    }
}
