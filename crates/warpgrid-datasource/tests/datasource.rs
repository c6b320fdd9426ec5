//! Data sources loaded from configuration files.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use warpgrid_datasource::{DataSource, DataSourceConfig, DataSourceError, DriverRegistry};
use warpgrid_pool::PoolError;
use warpgrid_pool::mock::MockDriver;

const CONFIG: &str = r#"
url = "mock:inventory"
driver = "mock"
username = "app"
password = "secret"
partitions = "2"
min_connections_per_partition = 1
max_connections_per_partition = "2"
acquire_increment = 1
release_helper_threads = "0"
connection_timeout_ms = 100
init_sql = "SET application_name = 'inventory'"
"#;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

fn registry() -> (DriverRegistry, MockDriver) {
    let mock = MockDriver::new();
    let drivers = DriverRegistry::new();
    drivers.register("mock", Arc::new(mock.clone()));
    (drivers, mock)
}

#[tokio::test]
async fn file_settings_reach_the_pool() {
    let file = write_config(CONFIG);
    let (drivers, mock) = registry();
    let config = DataSourceConfig::from_file(file.path()).unwrap();
    let source = DataSource::new(config, &drivers).unwrap();

    let conn = source.get_connection().await.unwrap();
    let pool = source.pool().unwrap();
    assert_eq!(pool.config().partition_count, 2);
    assert_eq!(pool.config().max_connections_per_partition, 2);
    assert_eq!(pool.config().connection_timeout, Some(Duration::from_millis(100)));

    // At least one connection per partition, each running the init SQL.
    let executed = mock.state().executed();
    assert!(mock.state().connects() >= 2);
    assert_eq!(executed.len() as u64, mock.state().connects());
    assert!(executed.iter().all(|e| e.sql == "SET application_name = 'inventory'"));
    conn.close();
    source.close().await;
}

#[tokio::test]
async fn each_credential_pair_gets_its_own_pool() {
    let file = write_config(CONFIG);
    let (drivers, _mock) = registry();
    let source = DataSource::new(DataSourceConfig::from_file(file.path()).unwrap(), &drivers).unwrap();

    let default = source.get_connection().await.unwrap();
    let reporting = source.get_connection_as("reporting", "r3port").await.unwrap();
    let again = source.get_connection_as("reporting", "r3port").await.unwrap();
    assert_eq!(source.pool_count(), 2);
    assert_eq!(source.total_leased(), 3);

    default.close();
    reporting.close();
    again.close();
    assert_eq!(source.total_leased(), 0);
    source.close().await;
}

#[tokio::test]
async fn exhausted_pool_surfaces_through_the_source() {
    let file = write_config(CONFIG);
    let (drivers, _mock) = registry();
    let source = DataSource::new(DataSourceConfig::from_file(file.path()).unwrap(), &drivers).unwrap();

    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(source.get_connection().await.unwrap());
    }
    match source.get_connection().await {
        Err(DataSourceError::Pool(PoolError::PoolExhausted { .. })) => {}
        other => panic!("expected exhaustion, got {other:?}"),
    }
    for conn in held {
        conn.close();
    }
    source.close().await;
}

#[tokio::test]
async fn unreachable_database_fails_the_first_request() {
    let file = write_config(CONFIG);
    let (drivers, mock) = registry();
    let source = DataSource::new(DataSourceConfig::from_file(file.path()).unwrap(), &drivers).unwrap();

    mock.state().set_fail_connect(true);
    let err = source.get_connection().await.unwrap_err();
    assert!(err.is_configuration());
    assert!(source.pool().is_none());

    // The failed build is not cached.
    mock.state().set_fail_connect(false);
    source.get_connection().await.unwrap().close();
    source.close().await;
}

#[test]
fn missing_file_is_a_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = DataSourceConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, DataSourceError::Read { .. }));
}
