//! warpgrid-pool: partitioned database connection pool.
//!
//! Sits between application code and a database [`Driver`], handing out
//! physical connections without paying connect cost on every request:
//! - **pool**: `Pool`, partitions, acquire routing, sizing, shutdown
//! - **connection / statement**: wrappers handed to callers; logical close
//!   returns connections to the pool and statements to the cache
//! - **statement_cache**: per-connection LRU of prepared statements under a
//!   pool-wide budget
//! - **recovery**: broken-connection classification and transaction replay
//! - **maintenance / release**: background refill, idle testing, leak
//!   detection, and off-path release workers
//! - **mock**: in-memory driver for tests and load generation

pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod hooks;
pub mod mock;
pub mod statement;
pub mod statement_cache;
pub mod stats;

mod handle;
mod maintenance;
mod partition;
mod pool;
mod recovery;
mod release;

pub use config::{BrokenConnectionProbe, PoolConfig, ReplayGranularity};
pub use connection::PooledConnection;
pub use driver::{
    Credentials, Driver, DriverError, ErrorClass, FetchDirection, PhysicalConnection,
    PhysicalResultSet, PhysicalStatement, Value, classify,
};
pub use error::{PoolError, PoolResult};
pub use hooks::{ConnectionHook, ConnectionInfo};
pub use pool::Pool;
pub use statement::{ResultSet, Statement};
pub use statement_cache::{StatementKey, StatementOptions};
pub use stats::{PartitionStats, PoolStats, StatisticsSnapshot};
