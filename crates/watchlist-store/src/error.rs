use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Storage could not be reached. Never retried by the store.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A document (or a symbol handed to `watch`) that does not decode into a watched item.
    #[error("Invalid item: {0}")]
    InvalidItem(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Storage was reached but rejected the request.
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::StorageUnavailable(_))
    }

    pub fn is_invalid_item(&self) -> bool {
        matches!(self, StoreError::InvalidItem(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::StorageUnavailable(err.to_string()),
            sqlx::Error::Configuration(_) => StoreError::InvalidConfig(err.to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
