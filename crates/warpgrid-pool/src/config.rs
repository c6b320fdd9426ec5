//! Pool configuration.
//!
//! `PoolConfig` is read once by [`Pool::new`](crate::Pool::new) and never
//! mutated afterwards, so it is shared between partitions and background
//! tasks without synchronization.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::Credentials;
use crate::error::{PoolError, PoolResult};

/// How a connection flagged "possibly broken" gets confirmed dead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokenConnectionProbe {
    /// Probe synchronously right after the failing call (default).
    #[default]
    Immediate,
    /// Keep the flag and probe when the caller closes the connection.
    OnRelease,
}

/// Unit of transaction replay after a reconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayGranularity {
    /// Replay every logged operation one call at a time (default).
    #[default]
    Statement,
    /// Coalesce runs of updates on the same prepared statement into a
    /// single driver batch.
    Batch,
}

/// Configuration for a partitioned connection pool.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolConfig {
    /// Connection URL handed to the driver.
    pub url: String,
    /// Credentials for every connection in this pool.
    pub credentials: Credentials,
    /// Number of independent partitions (default: 2).
    pub partition_count: usize,
    /// Connections each partition opens at startup and keeps (default: 10).
    pub min_connections_per_partition: usize,
    /// Hard cap on connections per partition (default: 50).
    pub max_connections_per_partition: usize,
    /// Connections created at once when a partition grows (default: 2).
    pub acquire_increment: usize,
    /// Refill when free connections fall to this percentage of the
    /// partition max (default: 20).
    pub pool_availability_threshold: u8,
    /// Upper bound on idle cached statements across the whole pool
    /// (default: 50). Zero disables caching.
    pub statements_cache_size: usize,
    /// Upper bound on idle cached statements per connection (default: 30).
    /// Zero disables caching.
    pub statements_cached_per_connection: usize,
    /// Background release workers per partition; zero releases inline
    /// (default: 3).
    pub release_helper_threads: usize,
    /// Statement used to probe connections. `None` uses the driver's
    /// native validity check.
    pub connection_test_statement: Option<String>,
    /// Timeout passed to the native validity check (default: 5s).
    pub validation_timeout: Duration,
    /// Free connections idle longer than this are probed (default: 60m).
    /// Zero disables idle testing.
    pub idle_connection_test_period: Duration,
    /// Free connections idle longer than this are closed (default: 240m).
    /// Zero disables idle eviction.
    pub idle_max_age: Duration,
    /// Free connections older than this are closed regardless of use.
    pub max_connection_age: Option<Duration>,
    /// How long one acquire attempt waits for a connection to be
    /// released. `None` waits until shutdown (default: 30s).
    pub connection_timeout: Option<Duration>,
    /// Extra acquire attempts after the first one times out (default: 0).
    pub acquire_retry_attempts: u32,
    /// Pause between acquire attempts (default: 1s).
    pub acquire_retry_delay: Duration,
    /// Report connections leased longer than this.
    pub leak_detection_threshold: Option<Duration>,
    /// Return leaked connections to the pool once reported.
    pub leak_force_close: bool,
    /// Warn when a leased connection is dropped without `close()`.
    pub close_connection_watch: bool,
    /// Log statement SQL at debug level.
    pub log_statements_enabled: bool,
    /// SQL run once on every new physical connection.
    pub init_sql: Option<String>,
    /// Auto-commit mode applied to new connections and restored on release
    /// (default: true).
    pub default_auto_commit: bool,
    /// Replay uncommitted work onto a fresh connection when the current
    /// one dies mid-transaction.
    pub transaction_recovery_enabled: bool,
    pub replay_granularity: ReplayGranularity,
    pub broken_connection_probe: BrokenConnectionProbe,
    /// Interval of the refill watcher's safety tick (default: 1s).
    pub pool_watch_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            credentials: Credentials::default(),
            partition_count: 2,
            min_connections_per_partition: 10,
            max_connections_per_partition: 50,
            acquire_increment: 2,
            pool_availability_threshold: 20,
            statements_cache_size: 50,
            statements_cached_per_connection: 30,
            release_helper_threads: 3,
            connection_test_statement: None,
            validation_timeout: Duration::from_secs(5),
            idle_connection_test_period: Duration::from_secs(60 * 60),
            idle_max_age: Duration::from_secs(240 * 60),
            max_connection_age: None,
            connection_timeout: Some(Duration::from_secs(30)),
            acquire_retry_attempts: 0,
            acquire_retry_delay: Duration::from_secs(1),
            leak_detection_threshold: None,
            leak_force_close: false,
            close_connection_watch: false,
            log_statements_enabled: false,
            init_sql: None,
            default_auto_commit: true,
            transaction_recovery_enabled: false,
            replay_granularity: ReplayGranularity::default(),
            broken_connection_probe: BrokenConnectionProbe::default(),
            pool_watch_interval: Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    /// Start from defaults with the given URL and credentials.
    pub fn new(url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            url: url.into(),
            credentials,
            ..Self::default()
        }
    }

    /// Builder method: partition count and per-partition bounds.
    pub fn with_partitions(self, count: usize, min: usize, max: usize) -> Self {
        Self {
            partition_count: count,
            min_connections_per_partition: min,
            max_connections_per_partition: max,
            ..self
        }
    }

    pub fn with_acquire_increment(self, acquire_increment: usize) -> Self {
        Self {
            acquire_increment,
            ..self
        }
    }

    pub fn with_availability_threshold(self, percent: u8) -> Self {
        Self {
            pool_availability_threshold: percent,
            ..self
        }
    }

    /// Builder method: global and per-connection statement cache bounds.
    pub fn with_statement_cache(self, global: usize, per_connection: usize) -> Self {
        Self {
            statements_cache_size: global,
            statements_cached_per_connection: per_connection,
            ..self
        }
    }

    pub fn with_release_helper_threads(self, release_helper_threads: usize) -> Self {
        Self {
            release_helper_threads,
            ..self
        }
    }

    /// Builder method: idle test period and idle max age.
    pub fn with_idle_policy(self, test_period: Duration, max_age: Duration) -> Self {
        Self {
            idle_connection_test_period: test_period,
            idle_max_age: max_age,
            ..self
        }
    }

    pub fn with_connection_timeout(self, timeout: Option<Duration>) -> Self {
        Self {
            connection_timeout: timeout,
            ..self
        }
    }

    pub fn with_acquire_retry(self, attempts: u32, delay: Duration) -> Self {
        Self {
            acquire_retry_attempts: attempts,
            acquire_retry_delay: delay,
            ..self
        }
    }

    pub fn with_connection_test_statement(self, sql: impl Into<String>) -> Self {
        Self {
            connection_test_statement: Some(sql.into()),
            ..self
        }
    }

    pub fn with_transaction_recovery(self, granularity: ReplayGranularity) -> Self {
        Self {
            transaction_recovery_enabled: true,
            replay_granularity: granularity,
            ..self
        }
    }

    pub fn with_leak_detection(self, threshold: Duration, force_close: bool) -> Self {
        Self {
            leak_detection_threshold: Some(threshold),
            leak_force_close: force_close,
            ..self
        }
    }

    /// Whether statements are cached at all.
    pub fn statement_caching_enabled(&self) -> bool {
        self.statements_cache_size > 0 && self.statements_cached_per_connection > 0
    }

    /// Check the sizing invariants. Called by `Pool::new`.
    pub fn validate(&self) -> PoolResult<()> {
        if self.url.trim().is_empty() {
            return Err(PoolError::Configuration("connection URL is not set".into()));
        }
        if self.partition_count == 0 {
            return Err(PoolError::Configuration(
                "partition_count must be at least 1".into(),
            ));
        }
        if self.max_connections_per_partition == 0 {
            return Err(PoolError::Configuration(
                "max_connections_per_partition must be at least 1".into(),
            ));
        }
        if self.min_connections_per_partition > self.max_connections_per_partition {
            return Err(PoolError::Configuration(format!(
                "min_connections_per_partition ({}) exceeds max_connections_per_partition ({})",
                self.min_connections_per_partition, self.max_connections_per_partition
            )));
        }
        if self.acquire_increment == 0 {
            return Err(PoolError::Configuration(
                "acquire_increment must be at least 1".into(),
            ));
        }
        if self.pool_availability_threshold > 100 {
            return Err(PoolError::Configuration(format!(
                "pool_availability_threshold is a percentage, got {}",
                self.pool_availability_threshold
            )));
        }
        Ok(())
    }
}
