//! Data source configuration.
//!
//! Loaded from TOML. Numeric settings accept either an integer or a
//! string, so values pasted from property files keep working:
//!
//! ```toml
//! url = "mock:orders"
//! driver = "mock"
//! username = "app"
//! password = "secret"
//! partitions = 3
//! min_connections_per_partition = "5"
//! max_connections_per_partition = 20
//! idle_max_age = 30            # minutes
//! ```
//!
//! Values that are missing or do not parse fall back to the defaults in
//! [`defaults`]; [`DataSourceConfig::sanitize`] then clamps whatever is
//! still out of range before a [`PoolConfig`] is built.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use warpgrid_pool::{BrokenConnectionProbe, Credentials, PoolConfig, ReplayGranularity};

use crate::error::{DataSourceError, DataSourceResult};

/// Documented defaults for every numeric setting.
pub mod defaults {
    pub const PARTITIONS: i64 = 2;
    pub const MIN_CONNECTIONS_PER_PARTITION: i64 = 10;
    pub const MAX_CONNECTIONS_PER_PARTITION: i64 = 50;
    pub const ACQUIRE_INCREMENT: i64 = 2;
    pub const POOL_AVAILABILITY_THRESHOLD: i64 = 20;
    pub const STATEMENTS_CACHE_SIZE: i64 = 50;
    pub const STATEMENTS_CACHED_PER_CONNECTION: i64 = 30;
    pub const RELEASE_HELPER_THREADS: i64 = 3;
    /// Minutes.
    pub const IDLE_CONNECTION_TEST_PERIOD: i64 = 60;
    /// Minutes.
    pub const IDLE_MAX_AGE: i64 = 240;
    pub const CONNECTION_TIMEOUT_MS: i64 = 30_000;
    pub const ACQUIRE_RETRY_ATTEMPTS: i64 = 0;
    pub const ACQUIRE_RETRY_DELAY_MS: i64 = 1_000;
    pub const VALIDATION_TIMEOUT_MS: i64 = 5_000;
}

/// A numeric setting as written: an integer or a string.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Int(i64),
    Text(String),
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Int(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::Text(v.to_string())
    }
}

/// Read a numeric setting, using `default` when it is absent or is a
/// string that does not parse as an integer.
pub fn parse_number(value: Option<&ConfigValue>, default: i64) -> i64 {
    match value {
        Some(ConfigValue::Int(n)) => *n,
        Some(ConfigValue::Text(text)) => text.trim().parse().unwrap_or(default),
        None => default,
    }
}

/// A password that stays out of `Debug` output.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Password(pub String);

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSourceConfig {
    pub url: String,
    /// Name the driver was registered under.
    pub driver: String,
    pub username: String,
    pub password: Password,

    pub partitions: Option<ConfigValue>,
    pub min_connections_per_partition: Option<ConfigValue>,
    pub max_connections_per_partition: Option<ConfigValue>,
    pub acquire_increment: Option<ConfigValue>,
    /// Percent of the partition max.
    pub pool_availability_threshold: Option<ConfigValue>,
    pub statements_cache_size: Option<ConfigValue>,
    pub statements_cached_per_connection: Option<ConfigValue>,
    pub release_helper_threads: Option<ConfigValue>,
    /// Minutes; zero disables idle testing.
    pub idle_connection_test_period: Option<ConfigValue>,
    /// Minutes; zero disables idle eviction.
    pub idle_max_age: Option<ConfigValue>,
    /// Minutes; absent or zero means connections never age out.
    pub max_connection_age: Option<ConfigValue>,
    /// Milliseconds; zero waits until shutdown.
    pub connection_timeout_ms: Option<ConfigValue>,
    pub acquire_retry_attempts: Option<ConfigValue>,
    pub acquire_retry_delay_ms: Option<ConfigValue>,
    pub validation_timeout_ms: Option<ConfigValue>,
    /// Milliseconds; absent or zero disables leak detection.
    pub leak_detection_threshold_ms: Option<ConfigValue>,

    pub leak_force_close: bool,
    pub connection_test_statement: Option<String>,
    pub init_sql: Option<String>,
    pub default_auto_commit: bool,
    pub transaction_recovery: bool,
    pub replay_granularity: ReplayGranularity,
    pub broken_connection_probe: BrokenConnectionProbe,
    pub close_connection_watch: bool,
    pub log_statements: bool,
    /// Build the pool on the first `get_connection` rather than in `init`.
    pub lazy_init: bool,
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            driver: String::new(),
            username: String::new(),
            password: Password::default(),
            partitions: None,
            min_connections_per_partition: None,
            max_connections_per_partition: None,
            acquire_increment: None,
            pool_availability_threshold: None,
            statements_cache_size: None,
            statements_cached_per_connection: None,
            release_helper_threads: None,
            idle_connection_test_period: None,
            idle_max_age: None,
            max_connection_age: None,
            connection_timeout_ms: None,
            acquire_retry_attempts: None,
            acquire_retry_delay_ms: None,
            validation_timeout_ms: None,
            leak_detection_threshold_ms: None,
            leak_force_close: false,
            connection_test_statement: None,
            init_sql: None,
            default_auto_commit: true,
            transaction_recovery: false,
            replay_granularity: ReplayGranularity::default(),
            broken_connection_probe: BrokenConnectionProbe::default(),
            close_connection_watch: false,
            log_statements: false,
            lazy_init: true,
        }
    }
}

/// Numeric settings after parsing, defaulting and clamping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sanitized {
    pub partitions: usize,
    pub min_connections_per_partition: usize,
    pub max_connections_per_partition: usize,
    pub acquire_increment: usize,
    pub pool_availability_threshold: u8,
    pub statements_cache_size: usize,
    pub statements_cached_per_connection: usize,
    pub release_helper_threads: usize,
    pub idle_connection_test_period: Duration,
    pub idle_max_age: Duration,
    pub max_connection_age: Option<Duration>,
    pub connection_timeout: Option<Duration>,
    pub acquire_retry_attempts: u32,
    pub acquire_retry_delay: Duration,
    pub validation_timeout: Duration,
    pub leak_detection_threshold: Option<Duration>,
}

impl DataSourceConfig {
    pub fn from_toml_str(content: &str) -> DataSourceResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: &Path) -> DataSourceResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| DataSourceError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// The configured username and password.
    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.username, &self.password.0)
    }

    /// Parse every numeric setting and clamp it into range: negative
    /// values take their default, zero partitions or increment become 1,
    /// a zero max takes the default, min is capped at max, and the
    /// availability threshold is capped at 100.
    pub fn sanitize(&self) -> Sanitized {
        let partitions = count("partitions", self.partitions.as_ref(), defaults::PARTITIONS).max(1);

        let mut max = count(
            "max_connections_per_partition",
            self.max_connections_per_partition.as_ref(),
            defaults::MAX_CONNECTIONS_PER_PARTITION,
        );
        if max == 0 {
            warn!("max_connections_per_partition is zero, using the default");
            max = defaults::MAX_CONNECTIONS_PER_PARTITION as u64;
        }
        let mut min = count(
            "min_connections_per_partition",
            self.min_connections_per_partition.as_ref(),
            defaults::MIN_CONNECTIONS_PER_PARTITION,
        );
        if min > max {
            warn!(min, max, "min_connections_per_partition exceeds the max, lowering it");
            min = max;
        }

        let acquire_increment = count(
            "acquire_increment",
            self.acquire_increment.as_ref(),
            defaults::ACQUIRE_INCREMENT,
        )
        .max(1);
        let threshold = count(
            "pool_availability_threshold",
            self.pool_availability_threshold.as_ref(),
            defaults::POOL_AVAILABILITY_THRESHOLD,
        )
        .min(100);

        Sanitized {
            partitions: partitions as usize,
            min_connections_per_partition: min as usize,
            max_connections_per_partition: max as usize,
            acquire_increment: acquire_increment as usize,
            pool_availability_threshold: threshold as u8,
            statements_cache_size: count(
                "statements_cache_size",
                self.statements_cache_size.as_ref(),
                defaults::STATEMENTS_CACHE_SIZE,
            ) as usize,
            statements_cached_per_connection: count(
                "statements_cached_per_connection",
                self.statements_cached_per_connection.as_ref(),
                defaults::STATEMENTS_CACHED_PER_CONNECTION,
            ) as usize,
            release_helper_threads: count(
                "release_helper_threads",
                self.release_helper_threads.as_ref(),
                defaults::RELEASE_HELPER_THREADS,
            ) as usize,
            idle_connection_test_period: minutes(count(
                "idle_connection_test_period",
                self.idle_connection_test_period.as_ref(),
                defaults::IDLE_CONNECTION_TEST_PERIOD,
            )),
            idle_max_age: minutes(count(
                "idle_max_age",
                self.idle_max_age.as_ref(),
                defaults::IDLE_MAX_AGE,
            )),
            max_connection_age: nonzero(minutes(count(
                "max_connection_age",
                self.max_connection_age.as_ref(),
                0,
            ))),
            connection_timeout: nonzero(Duration::from_millis(count(
                "connection_timeout_ms",
                self.connection_timeout_ms.as_ref(),
                defaults::CONNECTION_TIMEOUT_MS,
            ))),
            acquire_retry_attempts: u32::try_from(count(
                "acquire_retry_attempts",
                self.acquire_retry_attempts.as_ref(),
                defaults::ACQUIRE_RETRY_ATTEMPTS,
            ))
            .unwrap_or(u32::MAX),
            acquire_retry_delay: Duration::from_millis(count(
                "acquire_retry_delay_ms",
                self.acquire_retry_delay_ms.as_ref(),
                defaults::ACQUIRE_RETRY_DELAY_MS,
            )),
            validation_timeout: Duration::from_millis(count(
                "validation_timeout_ms",
                self.validation_timeout_ms.as_ref(),
                defaults::VALIDATION_TIMEOUT_MS,
            )),
            leak_detection_threshold: nonzero(Duration::from_millis(count(
                "leak_detection_threshold_ms",
                self.leak_detection_threshold_ms.as_ref(),
                0,
            ))),
        }
    }

    /// Sanitize and build the pool configuration for one credential pair.
    pub fn to_pool_config(&self, credentials: Credentials) -> PoolConfig {
        let s = self.sanitize();
        PoolConfig {
            url: self.url.clone(),
            credentials,
            partition_count: s.partitions,
            min_connections_per_partition: s.min_connections_per_partition,
            max_connections_per_partition: s.max_connections_per_partition,
            acquire_increment: s.acquire_increment,
            pool_availability_threshold: s.pool_availability_threshold,
            statements_cache_size: s.statements_cache_size,
            statements_cached_per_connection: s.statements_cached_per_connection,
            release_helper_threads: s.release_helper_threads,
            connection_test_statement: self.connection_test_statement.clone(),
            validation_timeout: s.validation_timeout,
            idle_connection_test_period: s.idle_connection_test_period,
            idle_max_age: s.idle_max_age,
            max_connection_age: s.max_connection_age,
            connection_timeout: s.connection_timeout,
            acquire_retry_attempts: s.acquire_retry_attempts,
            acquire_retry_delay: s.acquire_retry_delay,
            leak_detection_threshold: s.leak_detection_threshold,
            leak_force_close: self.leak_force_close,
            close_connection_watch: self.close_connection_watch,
            log_statements_enabled: self.log_statements,
            init_sql: self.init_sql.clone(),
            default_auto_commit: self.default_auto_commit,
            transaction_recovery_enabled: self.transaction_recovery,
            replay_granularity: self.replay_granularity,
            broken_connection_probe: self.broken_connection_probe,
            ..PoolConfig::default()
        }
    }
}

/// A non-negative setting; negative values take the default.
fn count(field: &'static str, value: Option<&ConfigValue>, default: i64) -> u64 {
    let n = parse_number(value, default);
    u64::try_from(n).unwrap_or_else(|_| {
        warn!(field, value = n, default, "negative setting, using the default");
        default.max(0) as u64
    })
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(60))
}

fn nonzero(d: Duration) -> Option<Duration> {
    (!d.is_zero()).then_some(d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_number_accepts_ints_and_strings() {
        assert_eq!(parse_number(Some(&ConfigValue::Int(7)), 1), 7);
        assert_eq!(parse_number(Some(&" 12 ".into()), 1), 12);
        assert_eq!(parse_number(Some(&"twelve".into()), 1), 1);
        assert_eq!(parse_number(Some(&"-3".into()), 1), -3);
        assert_eq!(parse_number(None, 5), 5);
    }

    #[test]
    fn empty_config_uses_documented_defaults() {
        let s = DataSourceConfig::default().sanitize();
        assert_eq!(s.partitions, 2);
        assert_eq!(s.min_connections_per_partition, 10);
        assert_eq!(s.max_connections_per_partition, 50);
        assert_eq!(s.acquire_increment, 2);
        assert_eq!(s.pool_availability_threshold, 20);
        assert_eq!(s.statements_cache_size, 50);
        assert_eq!(s.statements_cached_per_connection, 30);
        assert_eq!(s.release_helper_threads, 3);
        assert_eq!(s.idle_connection_test_period, Duration::from_secs(3600));
        assert_eq!(s.idle_max_age, Duration::from_secs(240 * 60));
        assert_eq!(s.connection_timeout, Some(Duration::from_secs(30)));
        assert_eq!(s.max_connection_age, None);
        assert_eq!(s.leak_detection_threshold, None);
    }

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let config = DataSourceConfig {
            partitions: Some(ConfigValue::Int(0)),
            min_connections_per_partition: Some(ConfigValue::Int(40)),
            max_connections_per_partition: Some("20".into()),
            acquire_increment: Some(ConfigValue::Int(0)),
            pool_availability_threshold: Some(ConfigValue::Int(250)),
            release_helper_threads: Some(ConfigValue::Int(-1)),
            ..DataSourceConfig::default()
        };
        let s = config.sanitize();
        assert_eq!(s.partitions, 1);
        assert_eq!(s.min_connections_per_partition, 20);
        assert_eq!(s.max_connections_per_partition, 20);
        assert_eq!(s.acquire_increment, 1);
        assert_eq!(s.pool_availability_threshold, 100);
        assert_eq!(s.release_helper_threads, 3);
    }

    #[test]
    fn zero_timeout_waits_forever() {
        let config = DataSourceConfig {
            connection_timeout_ms: Some("0".into()),
            ..DataSourceConfig::default()
        };
        assert_eq!(config.sanitize().connection_timeout, None);
    }

    #[test]
    fn toml_accepts_strings_and_integers() {
        let config = DataSourceConfig::from_toml_str(
            r#"
            url = "mock:orders"
            driver = "mock"
            username = "app"
            password = "secret"
            partitions = 3
            min_connections_per_partition = "5"
            max_connections_per_partition = "not a number"
            transaction_recovery = true
            replay_granularity = "batch"
            lazy_init = false
            "#,
        )
        .unwrap();
        assert_eq!(config.partitions, Some(ConfigValue::Int(3)));
        assert!(config.default_auto_commit);
        assert!(!config.lazy_init);

        let pool = config.to_pool_config(config.credentials());
        assert_eq!(pool.partition_count, 3);
        assert_eq!(pool.min_connections_per_partition, 5);
        assert_eq!(pool.max_connections_per_partition, 50);
        assert_eq!(pool.replay_granularity, ReplayGranularity::Batch);
        assert!(pool.transaction_recovery_enabled);
        assert_eq!(pool.credentials.username, "app");
        assert!(pool.validate().is_ok());
    }

    #[test]
    fn malformed_toml_is_a_configuration_error() {
        let err = DataSourceConfig::from_toml_str("partitions = [").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn debug_hides_password() {
        let config = DataSourceConfig {
            password: Password("hunter2".into()),
            ..DataSourceConfig::default()
        };
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
