//! Core error types.

use thiserror::Error;

use crate::config::ConfigError;
use crate::migration::MigrationError;
use crate::monitor::MonitorError;
use crate::rollback::RollbackError;

/// Store access errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite adapter error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// PostgreSQL adapter error.
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// Could not establish or keep a connection.
    #[error("connection error: {0}")]
    Connection(String),

    /// The derived schema has not been created.
    #[error("derived schema {0} does not exist")]
    MissingSchema(&'static str),

    /// A row could not be decoded into a domain value.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// IO error (file-backed adapters).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Lock contention and dropped connections are transient; constraint
    /// violations and decoding failures are not.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            #[cfg(feature = "postgres")]
            StoreError::Postgres(err) => matches!(
                err,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            StoreError::Connection(_) | StoreError::Io(_) => true,
            _ => false,
        }
    }
}

/// Top-level error for callers that drive several components.
#[derive(Debug, Error)]
pub enum Error {
    /// Store error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Migration error.
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// Rollback error.
    #[error(transparent)]
    Rollback(#[from] RollbackError),

    /// Monitoring error.
    #[error(transparent)]
    Monitor(#[from] MonitorError),

    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result alias using the crate-level error.
pub type Result<T, E = Error> = std::result::Result<T, E>;
