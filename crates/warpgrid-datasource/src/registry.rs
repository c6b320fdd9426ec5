//! Driver and pool registries.
//!
//! A data source resolves its driver by name from a [`DriverRegistry`] and
//! keeps one pool per credential pair in a [`PoolRegistry`]. Pool
//! construction is memoized per key: concurrent first requests for the
//! same credentials build exactly one pool, and a failed build leaves the
//! slot empty so the next request tries again.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use warpgrid_pool::{Credentials, Driver, Pool, PoolResult};

use crate::error::{DataSourceError, DataSourceResult};

/// Named drivers available to data sources.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: DashMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `driver` under `name`, replacing any previous entry.
    pub fn register(&self, name: impl Into<String>, driver: Arc<dyn Driver>) {
        self.drivers.insert(name.into(), driver);
    }

    /// Look up a driver. An unknown name is a configuration error.
    pub fn resolve(&self, name: &str) -> DataSourceResult<Arc<dyn Driver>> {
        self.drivers
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DataSourceError::configuration(format!("unknown driver '{name}'")))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .finish()
    }
}

/// One lazily built pool per credential pair.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    pools: DashMap<Credentials, Arc<OnceCell<Pool>>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pool for `credentials`, building it with `build` if this is the
    /// first request for that pair.
    pub async fn get_or_build<F, Fut>(&self, credentials: &Credentials, build: F) -> DataSourceResult<Pool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PoolResult<Pool>>,
    {
        // Clone the cell out so no map shard stays locked across the await.
        let cell = self.pools.entry(credentials.clone()).or_default().clone();
        let pool = cell.get_or_try_init(build).await?;
        Ok(pool.clone())
    }

    /// The pool for `credentials`, if it has been built.
    pub fn get(&self, credentials: &Credentials) -> Option<Pool> {
        self.pools
            .get(credentials)
            .and_then(|cell| cell.get().cloned())
    }

    /// Every pool built so far.
    pub fn pools(&self) -> Vec<Pool> {
        self.pools
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pools().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut down every pool built so far.
    pub async fn shutdown_all(&self) {
        for pool in self.pools() {
            pool.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use warpgrid_pool::mock::MockDriver;
    use warpgrid_pool::{PoolConfig, PoolError};

    use super::*;

    fn pool_config(credentials: &Credentials) -> PoolConfig {
        PoolConfig::new("mock:registry", credentials.clone())
            .with_partitions(1, 1, 2)
            .with_release_helper_threads(0)
    }

    #[test]
    fn unknown_driver_is_configuration_error() {
        let drivers = DriverRegistry::new();
        drivers.register("mock", Arc::new(MockDriver::new()));
        assert!(drivers.resolve("mock").is_ok());
        let err = drivers.resolve("postgres").err().expect("expected resolve error");
        assert!(err.is_configuration());
        assert_eq!(drivers.names(), vec!["mock".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_requests_build_one_pool() {
        let registry = Arc::new(PoolRegistry::new());
        let driver = MockDriver::new();
        let builds = Arc::new(AtomicUsize::new(0));
        let credentials = Credentials::new("app", "secret");

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let driver = driver.clone();
            let builds = builds.clone();
            let credentials = credentials.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .get_or_build(&credentials, || async {
                        builds.fetch_add(1, Ordering::SeqCst);
                        Pool::new(pool_config(&credentials), Arc::new(driver)).await
                    })
                    .await
                    .map(|_| ())
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(driver.state().connects(), 1);
        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn credentials_get_separate_pools() {
        let registry = PoolRegistry::new();
        let driver = MockDriver::new();
        for user in ["alice", "bob", "alice"] {
            let credentials = Credentials::new(user, "pw");
            registry
                .get_or_build(&credentials, || {
                    Pool::new(pool_config(&credentials), Arc::new(driver.clone()))
                })
                .await
                .unwrap();
        }
        assert_eq!(registry.len(), 2);
        assert!(registry.get(&Credentials::new("bob", "pw")).is_some());
        assert!(registry.get(&Credentials::new("carol", "pw")).is_none());
        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn failed_build_is_retried() {
        let registry = PoolRegistry::new();
        let credentials = Credentials::new("app", "secret");
        let err = registry
            .get_or_build(&credentials, || async {
                Err(PoolError::Configuration("refused".into()))
            })
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(registry.is_empty());

        let driver = MockDriver::new();
        registry
            .get_or_build(&credentials, || {
                Pool::new(pool_config(&credentials), Arc::new(driver.clone()))
            })
            .await
            .unwrap();
        assert_eq!(registry.len(), 1);
        registry.shutdown_all().await;
    }
}
