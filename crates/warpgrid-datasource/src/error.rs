//! Error types for the data source.

use std::path::PathBuf;

use thiserror::Error;
use warpgrid_pool::PoolError;

/// Result type alias for data source operations.
pub type DataSourceResult<T> = Result<T, DataSourceError>;

#[derive(Debug, Error)]
pub enum DataSourceError {
    /// Anything the pool reports, including configuration errors raised
    /// while building a pool.
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid data source configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("data source is not initialized; call init() first")]
    NotInitialized,

    #[error("data source is closed")]
    Closed,
}

impl DataSourceError {
    /// A [`PoolError::Configuration`] wrapped for the data source.
    pub fn configuration(message: impl Into<String>) -> Self {
        DataSourceError::Pool(PoolError::Configuration(message.into()))
    }

    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DataSourceError::Pool(PoolError::Configuration(_)) | DataSourceError::Parse(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_pass_through() {
        let err: DataSourceError = PoolError::PoolClosed.into();
        assert_eq!(err.to_string(), PoolError::PoolClosed.to_string());
    }

    #[test]
    fn configuration_helper_wraps_pool_error() {
        let err = DataSourceError::configuration("unknown driver 'pg'");
        assert!(err.is_configuration());
        assert!(err.to_string().contains("unknown driver"));
        assert!(!DataSourceError::Closed.is_configuration());
    }
}
