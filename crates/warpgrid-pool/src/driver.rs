//! Driver capability traits.
//!
//! The pool never speaks a database protocol itself. It wraps whatever the
//! driver hands back from [`Driver::connect`] and forwards statement calls
//! untouched, classifying any error on the way out.
//!
//! ```text
//! Driver::connect(url, credentials)
//!   → PhysicalConnection
//!       ├── prepare(key)        → PhysicalStatement (cacheable)
//!       ├── create_statement()  → PhysicalStatement (never cached)
//!       └── is_valid(timeout)   : native liveness probe
//! PhysicalStatement::execute_query → PhysicalResultSet
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::statement_cache::StatementKey;

/// Username/password pair a pool authenticates with.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A single column or parameter value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// Fetch direction hint forwarded to the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FetchDirection {
    #[default]
    Forward,
    Reverse,
    Unknown,
}

/// An error raised by the driver.
///
/// `sql_state` follows the SQLSTATE convention; the pool only inspects its
/// class to decide whether the connection is still usable.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}{}", state_suffix(.sql_state))]
pub struct DriverError {
    pub sql_state: Option<String>,
    pub message: String,
    /// Set by drivers that know the transport is gone regardless of state.
    pub fatal: bool,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            sql_state: None,
            message: message.into(),
            fatal: false,
        }
    }

    pub fn with_state(sql_state: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sql_state: Some(sql_state.into()),
            message: message.into(),
            fatal: false,
        }
    }

    /// A transport-level failure (SQLSTATE 08006).
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self {
            sql_state: Some("08006".to_string()),
            message: message.into(),
            fatal: true,
        }
    }
}

fn state_suffix(sql_state: &Option<String>) -> String {
    sql_state
        .as_ref()
        .map(|s| format!(" (SQLSTATE {s})"))
        .unwrap_or_default()
}

/// Outcome of classifying a driver error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// The statement failed but the connection is fine.
    Transient,
    /// The connection is possibly dead; a probe decides.
    Broken,
}

/// SQLSTATEs outside class 08 that still mean the session is gone.
const FATAL_SQL_STATES: &[&str] = &["57P01", "57P02", "57P03", "JZ0C0", "JZ0C1"];

/// Decide whether a driver error may have killed the connection.
pub fn classify(error: &DriverError) -> ErrorClass {
    if error.fatal {
        return ErrorClass::Broken;
    }
    match error.sql_state.as_deref() {
        Some(state) if state.starts_with("08") => ErrorClass::Broken,
        Some(state) if FATAL_SQL_STATES.contains(&state) => ErrorClass::Broken,
        _ => ErrorClass::Transient,
    }
}

/// Connection factory for one kind of database.
pub trait Driver: Send + Sync {
    /// Short driver name used in logs and the data-source registry.
    fn name(&self) -> &str;

    /// Whether this driver understands `url`. A pool refuses to start on
    /// a URL its driver does not accept.
    fn accepts_url(&self, url: &str) -> bool;

    /// Open a new physical connection.
    fn connect(
        &self,
        url: &str,
        credentials: &Credentials,
    ) -> Result<Box<dyn PhysicalConnection>, DriverError>;
}

/// A raw driver connection. Owned by exactly one pool handle.
pub trait PhysicalConnection: Send {
    /// Prepare a statement for the given key.
    fn prepare(&mut self, key: &StatementKey) -> Result<Box<dyn PhysicalStatement>, DriverError>;

    /// Create a plain, unprepared statement.
    fn create_statement(&mut self) -> Result<Box<dyn PhysicalStatement>, DriverError>;

    /// Native liveness check.
    fn is_valid(&mut self, timeout: Duration) -> Result<bool, DriverError>;

    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<(), DriverError>;

    fn commit(&mut self) -> Result<(), DriverError>;

    fn rollback(&mut self) -> Result<(), DriverError>;

    fn close(&mut self) -> Result<(), DriverError>;
}

/// A raw driver statement.
///
/// Methods taking `sql: Option<&str>` run the prepared text when `None`
/// and the given text on a plain statement.
pub trait PhysicalStatement: Send {
    fn bind(&mut self, index: usize, value: &Value) -> Result<(), DriverError>;

    fn clear_parameters(&mut self) -> Result<(), DriverError>;

    fn execute(&mut self, sql: Option<&str>) -> Result<bool, DriverError>;

    fn execute_query(&mut self, sql: Option<&str>)
    -> Result<Box<dyn PhysicalResultSet>, DriverError>;

    fn execute_update(&mut self, sql: Option<&str>) -> Result<u64, DriverError>;

    fn add_batch(&mut self, sql: Option<&str>) -> Result<(), DriverError>;

    fn execute_batch(&mut self) -> Result<Vec<u64>, DriverError>;

    fn clear_batch(&mut self) -> Result<(), DriverError>;

    fn generated_keys(&mut self) -> Result<Box<dyn PhysicalResultSet>, DriverError>;

    fn set_fetch_size(&mut self, rows: u32) -> Result<(), DriverError>;

    fn fetch_size(&self) -> Result<u32, DriverError>;

    fn set_fetch_direction(&mut self, direction: FetchDirection) -> Result<(), DriverError>;

    fn set_max_rows(&mut self, rows: u64) -> Result<(), DriverError>;

    fn set_query_timeout(&mut self, timeout: Duration) -> Result<(), DriverError>;

    fn cancel(&mut self) -> Result<(), DriverError>;

    fn close(&mut self) -> Result<(), DriverError>;
}

/// A raw driver cursor.
pub trait PhysicalResultSet: Send {
    fn next(&mut self) -> Result<bool, DriverError>;

    fn get(&self, column: usize) -> Result<Value, DriverError>;

    fn column_count(&self) -> usize;

    fn close(&mut self) -> Result<(), DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_08_is_broken() {
        assert_eq!(classify(&DriverError::with_state("08001", "refused")), ErrorClass::Broken);
        assert_eq!(classify(&DriverError::with_state("08S01", "link failure")), ErrorClass::Broken);
    }

    #[test]
    fn admin_shutdown_is_broken() {
        assert_eq!(classify(&DriverError::with_state("57P01", "terminating")), ErrorClass::Broken);
    }

    #[test]
    fn syntax_error_is_transient() {
        assert_eq!(classify(&DriverError::with_state("42601", "syntax")), ErrorClass::Transient);
        assert_eq!(classify(&DriverError::new("no state")), ErrorClass::Transient);
    }

    #[test]
    fn fatal_flag_wins() {
        let mut err = DriverError::new("socket closed");
        err.fatal = true;
        assert_eq!(classify(&err), ErrorClass::Broken);
    }

    #[test]
    fn driver_error_display_includes_state() {
        let err = DriverError::with_state("08006", "reset");
        assert_eq!(err.to_string(), "reset (SQLSTATE 08006)");
        assert_eq!(DriverError::new("plain").to_string(), "plain");
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let creds = Credentials::new("app", "hunter2");
        let printed = format!("{creds:?}");
        assert!(printed.contains("app"));
        assert!(!printed.contains("hunter2"));
    }
}
