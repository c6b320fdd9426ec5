//! Pool sizing integration tests.
//!
//! Exercises partition growth, cross-partition borrowing, exhaustion and
//! concurrent churn against the in-memory mock driver.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;
use warpgrid_pool::mock::MockDriver;
use warpgrid_pool::{Credentials, Pool, PoolConfig, PoolError};

fn config(partitions: usize, min: usize, max: usize) -> PoolConfig {
    PoolConfig::new("mock:sizing", Credentials::new("app", "secret"))
        .with_partitions(partitions, min, max)
        .with_release_helper_threads(0)
}

async fn start(config: PoolConfig) -> (Pool, MockDriver) {
    let driver = MockDriver::new();
    let pool = Pool::new(config, Arc::new(driver.clone()))
        .await
        .expect("pool should start");
    (pool, driver)
}

/// Poll `check` every 5ms for up to two seconds.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

#[tokio::test]
async fn threshold_crossing_grows_by_increment() {
    let config = config(1, 30, 100)
        .with_acquire_increment(5)
        .with_availability_threshold(20);
    let (pool, _driver) = start(config).await;
    assert_eq!(pool.total_created_connections(), 30);

    let mut held = Vec::new();
    for _ in 0..10 {
        held.push(pool.acquire().await.unwrap());
    }
    assert_eq!(pool.total_leased(), 10);

    assert!(eventually(|| pool.total_created_connections() == 35).await);
    // One crossing, one increment.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.total_created_connections(), 35);
    assert_eq!(pool.total_free(), 25);

    drop(held);
    pool.shutdown().await;
}

#[tokio::test]
async fn sequential_churn_keeps_minimum() {
    let (pool, driver) = start(config(1, 30, 100)).await;
    for _ in 0..60 {
        let conn = pool.acquire().await.unwrap();
        conn.close();
    }
    assert_eq!(pool.total_leased(), 0);
    assert_eq!(pool.total_free(), 30);
    assert_eq!(pool.total_created_connections(), 30);
    assert_eq!(driver.state().connects(), 30);
    pool.shutdown().await;
}

#[tokio::test]
async fn drains_every_partition_before_exhausting() {
    let config = config(2, 10, 10)
        .with_acquire_increment(1)
        .with_connection_timeout(Some(Duration::from_millis(50)));
    let (pool, _driver) = start(config).await;

    let mut held = Vec::new();
    for _ in 0..20 {
        held.push(pool.acquire().await.unwrap());
    }
    let stats = pool.stats();
    assert_eq!(stats.leased, 20);
    assert_eq!(stats.free, 0);
    assert!(stats.partitions.iter().all(|p| p.leased == 10));

    match pool.acquire().await {
        Err(PoolError::PoolExhausted { attempts, waited }) => {
            assert_eq!(attempts, 1);
            assert!(waited >= Duration::from_millis(50));
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }

    held.pop();
    assert!(pool.acquire().await.is_ok());
    drop(held);
    pool.shutdown().await;
}

#[tokio::test]
async fn invalid_url_is_rejected_before_connecting() {
    let driver = MockDriver::new();
    let config = PoolConfig::new("invalid database url", Credentials::default());
    let err = Pool::new(config, Arc::new(driver.clone())).await.unwrap_err();
    assert!(matches!(err, PoolError::Configuration(_)));
    assert_eq!(driver.state().connects(), 0);
}

#[tokio::test]
async fn min_above_max_is_rejected() {
    let driver = MockDriver::new();
    let err = Pool::new(config(1, 5, 2), Arc::new(driver.clone()))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("exceeds"));
    assert_eq!(driver.state().connects(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_tasks_return_everything() {
    const ITERATIONS: u64 = 20;
    let config = PoolConfig::new("mock:sizing", Credentials::new("app", "secret"))
        .with_partitions(5, 10, 25)
        .with_acquire_increment(5)
        .with_connection_timeout(Some(Duration::from_secs(10)));
    let (pool, _driver) = start(config).await;

    let done = Arc::new(AtomicBool::new(false));
    let sampler = {
        let pool = pool.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let mut violations = 0;
            while !done.load(Ordering::Acquire) {
                for p in pool.stats().partitions {
                    if p.leased + p.free > p.created || p.created > p.max {
                        violations += 1;
                    }
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            violations
        })
    };

    let mut tasks = Vec::new();
    for _ in 0..100 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..ITERATIONS {
                let delay = rand::thread_rng().gen_range(0..5);
                let conn = pool.acquire().await?;
                let statement = conn.prepare_statement("SELECT 1")?;
                statement.execute()?;
                tokio::time::sleep(Duration::from_millis(delay)).await;
                statement.close();
                conn.close();
            }
            Ok::<_, PoolError>(())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    done.store(true, Ordering::Release);
    assert_eq!(sampler.await.unwrap(), 0);

    assert!(eventually(|| pool.total_leased() == 0).await);
    assert!(pool.total_created_connections() <= 125);
    assert_eq!(pool.statistics().connections_requested, 100 * ITERATIONS);
    pool.shutdown().await;
}
