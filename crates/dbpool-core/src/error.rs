//! Error types for dbpool

use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by a resource pool to its callers
///
/// Failures of the pool's own manager (acquire, refurbish, destroy) never
/// appear here directly; they are retried, logged, or recorded as
/// diagnostics. Only the outcomes a caller must react to are reported.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Timed out after {0:?} waiting for a pooled resource")]
    Timeout(Duration),

    #[error("Resource acquisition failed repeatedly: {0}")]
    AcquisitionExhausted(String),

    #[error("Pool is closed")]
    Closed,

    #[error("Pool is broken: {0}")]
    Broken(String),

    #[error("Wait for a pooled resource was interrupted")]
    Interrupted,

    #[error("Invalid pool configuration: {0}")]
    Configuration(String),
}

impl PoolError {
    /// Whether the pool will never hand out resources again
    pub fn is_terminal(&self) -> bool {
        matches!(self, PoolError::Closed | PoolError::Broken(_))
    }
}

/// Core error type for connection operations
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Driver error: {0}")]
    Driver(String),

    /// The backing database as a whole cannot be reached
    #[error("Database unavailable: {0}")]
    Unavailable(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Already closed: {0}")]
    Closed(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("{0}")]
    Other(String),
}

impl DbError {
    pub fn closed(what: impl Into<String>) -> Self {
        DbError::Closed(what.into())
    }
}

/// Result type alias for dbpool operations
pub type Result<T> = std::result::Result<T, DbError>;
