//! Database layer for the Quire server.
//!
//! Selects a storage provider from configuration, shares a bounded pool of
//! live connections across request-handling threads, and applies versioned
//! schema migrations exactly once, in order, before the server starts
//! serving traffic.
//!
//! # Design decisions
//!
//! - **Two providers, one connection type**: [`ConnectionOptions`] and
//!   [`Connection`] are closed enums. The embedded store is SQLite in WAL
//!   mode; the networked store is PostgreSQL driven by `sqlx` on a private
//!   tokio runtime so callers stay synchronous.
//! - **Own pool, `r2d2` seam**: [`ConnectionPool`] is a fixed-capacity pool
//!   with FIFO waiters and non-polling bounded waits. It opens connections
//!   through [`r2d2::ManageConnection`], which keeps it provider-agnostic and
//!   lets tests substitute a mock manager.
//! - **Migrations on disk**: scripts are read from a directory at startup so
//!   installations ship them alongside the binary. Each script commits
//!   atomically with its `schema_version` row.
//!
//! # Usage
//!
//! ```rust,ignore
//! quire_db::initialize(true)?;
//!
//! let mut conn = quire_db::get_connection()?;
//! conn.execute_batch("DELETE FROM revoked_cookies WHERE expiration < CURRENT_TIMESTAMP")?;
//!
//! if let Some(conn) = quire_db::get_connection_timeout(Duration::from_millis(250))? {
//!     // ...
//! }
//! ```

mod connection;
mod error;
mod migrations;
mod options;
mod pool;
mod service;

pub use connection::{Connection, ConnectionManager, DbRuntimeSettings, PgSession};
pub use error::{ConnectionError, DatabaseError};
pub use migrations::{discover, Migration, MigrationError, SchemaUpdater, BOOKKEEPING_TABLE};
pub use options::{
    check_permissions, resolve_options, resolve_options_with_env, ConfigError, ConfigSource,
    ConnectionOptions, DatabaseSettings, ParseProviderError, PermissionCheck, PostgresOptions,
    Provider, SqliteOptions, CONFIG_DIR_ENV, DATABASE_FILE_NAME, DEFAULT_SQLITE_DIRECTORY,
    SERVER_DATA_DIR_ENV,
};
pub use pool::{ConnectionPool, PoolError, PoolState, PooledConnection};
pub use service::{
    default_pool_size, get_connection, get_connection_timeout, initialize, initialize_from,
    migrations_dir, shutdown, DatabaseService, DbConnection, DbPool, StartupSettings,
    DEFAULT_POOL_SIZE, MIGRATIONS_PATH_ENV,
};
