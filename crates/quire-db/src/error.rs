//! Error types for the database layer.

use thiserror::Error;

use crate::migrations::MigrationError;
use crate::options::ConfigError;
use crate::pool::PoolError;

/// Errors raised while opening or using a physical connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The embedded SQLite store rejected an operation.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The networked PostgreSQL store rejected an operation.
    #[error("postgresql error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// The networked store did not answer within the configured timeout.
    #[error("timed out after {seconds}s connecting to the database server")]
    Timeout {
        /// The configured connection timeout.
        seconds: u64,
    },

    /// The runtime that drives networked connections could not be started.
    #[error("failed to start database runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

/// Top-level error for startup and connection access.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Configuration could not be resolved.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The pool could not be built or has been closed.
    #[error(transparent)]
    Pool(#[from] PoolError<ConnectionError>),

    /// A schema migration failed.
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// The migrations directory could not be located.
    #[error("could not determine path to database migration files: {0}")]
    MigrationsDir(#[source] std::io::Error),

    /// The process-wide database service was used before `initialize`.
    #[error("database service has not been initialized")]
    NotInitialized,

    /// `initialize` was called while a service was already running.
    #[error("database service is already initialized")]
    AlreadyInitialized,
}
