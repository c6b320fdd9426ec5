//! The data source: configured credentials, lazy pool construction and
//! connection hand-out.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};
use warpgrid_pool::{ConnectionHook, Credentials, Driver, Pool, PooledConnection};

use crate::config::DataSourceConfig;
use crate::error::{DataSourceError, DataSourceResult};
use crate::registry::{DriverRegistry, PoolRegistry};

/// A configured entry point handing out pooled connections.
///
/// The configured credentials get one pool; every other credential pair
/// passed to [`DataSource::get_connection_as`] gets a pool of its own,
/// built on first use with the same settings.
pub struct DataSource {
    config: DataSourceConfig,
    driver: Arc<dyn Driver>,
    hook: Option<Arc<dyn ConnectionHook>>,
    pools: PoolRegistry,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl DataSource {
    /// Resolve the configured driver. Nothing is connected yet.
    pub fn new(config: DataSourceConfig, drivers: &DriverRegistry) -> DataSourceResult<Self> {
        if config.url.trim().is_empty() {
            return Err(DataSourceError::configuration("data source url is empty"));
        }
        let driver = drivers.resolve(&config.driver)?;
        Ok(Self {
            config,
            driver,
            hook: None,
            pools: PoolRegistry::new(),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Attach lifecycle callbacks to every pool this data source builds.
    pub fn with_hook(self, hook: Arc<dyn ConnectionHook>) -> Self {
        Self {
            hook: Some(hook),
            ..self
        }
    }

    pub fn config(&self) -> &DataSourceConfig {
        &self.config
    }

    /// Build the pool for the configured credentials now. Required before
    /// the first `get_connection` when `lazy_init` is off; harmless
    /// otherwise.
    pub async fn init(&self) -> DataSourceResult<()> {
        self.ensure_open()?;
        self.pool_for(&self.config.credentials()).await?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Lease a connection using the configured credentials.
    pub async fn get_connection(&self) -> DataSourceResult<PooledConnection> {
        self.ensure_ready()?;
        let pool = self.pool_for(&self.config.credentials()).await?;
        Ok(pool.acquire().await?)
    }

    /// Lease a connection for another user. Each distinct credential pair
    /// is served by its own pool.
    pub async fn get_connection_as(
        &self,
        username: &str,
        password: &str,
    ) -> DataSourceResult<PooledConnection> {
        self.ensure_ready()?;
        let pool = self.pool_for(&Credentials::new(username, password)).await?;
        Ok(pool.acquire().await?)
    }

    /// Shut down every pool. Later requests fail with
    /// [`DataSourceError::Closed`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pools.shutdown_all().await;
        info!(url = %self.config.url, "data source closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether `other` was built from an identical configuration.
    pub fn has_same_configuration(&self, other: &DataSource) -> bool {
        self.config == other.config
    }

    /// The pool for the configured credentials, once built.
    pub fn pool(&self) -> Option<Pool> {
        self.pools.get(&self.config.credentials())
    }

    /// Number of pools built so far, one per credential pair.
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Connections leased across every pool.
    pub fn total_leased(&self) -> usize {
        self.pools.pools().iter().map(Pool::total_leased).sum()
    }

    fn ensure_open(&self) -> DataSourceResult<()> {
        if self.is_closed() {
            return Err(DataSourceError::Closed);
        }
        Ok(())
    }

    fn ensure_ready(&self) -> DataSourceResult<()> {
        self.ensure_open()?;
        if !self.config.lazy_init && !self.initialized.load(Ordering::Acquire) {
            return Err(DataSourceError::NotInitialized);
        }
        Ok(())
    }

    async fn pool_for(&self, credentials: &Credentials) -> DataSourceResult<Pool> {
        let pool = self
            .pools
            .get_or_build(credentials, || {
                info!(
                    driver = self.driver.name(),
                    user = %credentials.username,
                    "building connection pool"
                );
                let config = self.config.to_pool_config(credentials.clone());
                Pool::with_hook(config, self.driver.clone(), self.hook.clone())
            })
            .await?;

        // A pool finished building while close() was running.
        if self.is_closed() {
            debug!(user = %credentials.username, "data source closed during pool build");
            pool.shutdown().await;
            return Err(DataSourceError::Closed);
        }
        Ok(pool)
    }
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("url", &self.config.url)
            .field("driver", &self.driver.name())
            .field("pools", &self.pools.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use warpgrid_pool::mock::MockDriver;

    use super::*;
    use crate::config::ConfigValue;

    fn drivers() -> (DriverRegistry, MockDriver) {
        let mock = MockDriver::new();
        let drivers = DriverRegistry::new();
        drivers.register("mock", Arc::new(mock.clone()));
        (drivers, mock)
    }

    fn config() -> DataSourceConfig {
        DataSourceConfig {
            url: "mock:orders".into(),
            driver: "mock".into(),
            username: "app".into(),
            password: crate::config::Password("secret".into()),
            partitions: Some(ConfigValue::Int(1)),
            min_connections_per_partition: Some(ConfigValue::Int(1)),
            max_connections_per_partition: Some(ConfigValue::Int(2)),
            release_helper_threads: Some(ConfigValue::Int(0)),
            ..DataSourceConfig::default()
        }
    }

    #[test]
    fn unknown_driver_fails_construction() {
        let (drivers, _) = drivers();
        let config = DataSourceConfig {
            driver: "oracle".into(),
            ..config()
        };
        let err = DataSource::new(config, &drivers).unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn lazy_pool_is_built_on_first_connection() {
        let (drivers, mock) = drivers();
        let source = DataSource::new(config(), &drivers).unwrap();
        assert!(source.pool().is_none());
        assert_eq!(mock.state().connects(), 0);

        let conn = source.get_connection().await.unwrap();
        assert_eq!(source.pool_count(), 1);
        assert_eq!(source.total_leased(), 1);
        conn.close();
        assert_eq!(source.total_leased(), 0);
        source.close().await;
    }

    #[tokio::test]
    async fn eager_source_requires_init() {
        let (drivers, _) = drivers();
        let config = DataSourceConfig {
            lazy_init: false,
            ..config()
        };
        let source = DataSource::new(config, &drivers).unwrap();
        assert!(matches!(
            source.get_connection().await,
            Err(DataSourceError::NotInitialized)
        ));

        source.init().await.unwrap();
        assert!(source.pool().is_some());
        source.get_connection().await.unwrap().close();
        source.close().await;
    }

    #[tokio::test]
    async fn closed_source_refuses_connections() {
        let (drivers, mock) = drivers();
        let source = DataSource::new(config(), &drivers).unwrap();
        source.init().await.unwrap();
        source.close().await;
        source.close().await;

        assert!(source.pool().unwrap().is_closed());
        assert!(matches!(source.get_connection().await, Err(DataSourceError::Closed)));
        assert!(mock.state().live_connections().is_empty());
    }

    #[test]
    fn same_configuration_compares_settings() {
        let (drivers, _) = drivers();
        let a = DataSource::new(config(), &drivers).unwrap();
        let b = DataSource::new(config(), &drivers).unwrap();
        let c = DataSource::new(
            DataSourceConfig {
                max_connections_per_partition: Some("3".into()),
                ..config()
            },
            &drivers,
        )
        .unwrap();
        assert!(a.has_same_configuration(&b));
        assert!(!a.has_same_configuration(&c));
    }
}
