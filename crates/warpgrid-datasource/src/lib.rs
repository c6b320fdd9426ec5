//! Data source layer over `warpgrid-pool`.
//!
//! A [`DataSource`] is built from a [`DataSourceConfig`], usually loaded
//! from TOML, and a [`DriverRegistry`] naming the available drivers. It
//! builds pools lazily, one per credential pair, and hands out
//! [`warpgrid_pool::PooledConnection`]s.
//!
//! ```no_run
//! # async fn run() -> warpgrid_datasource::DataSourceResult<()> {
//! use std::sync::Arc;
//! use warpgrid_datasource::{DataSource, DataSourceConfig, DriverRegistry};
//! use warpgrid_pool::mock::MockDriver;
//!
//! let drivers = DriverRegistry::new();
//! drivers.register("mock", Arc::new(MockDriver::new()));
//!
//! let config = DataSourceConfig::from_file("datasource.toml".as_ref())?;
//! let source = DataSource::new(config, &drivers)?;
//! let conn = source.get_connection().await?;
//! conn.create_statement()?.execute_sql("SELECT 1")?;
//! conn.close();
//! source.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod datasource;
pub mod error;
pub mod registry;

pub use config::{ConfigValue, DataSourceConfig, Password, Sanitized, parse_number};
pub use datasource::DataSource;
pub use error::{DataSourceError, DataSourceResult};
pub use registry::{DriverRegistry, PoolRegistry};
