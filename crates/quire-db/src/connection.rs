//! Physical connections to the configured backing store.

use std::sync::Arc;
use std::time::Duration;

use r2d2::ManageConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection as _;
use tokio::runtime::Runtime;

use crate::error::ConnectionError;
use crate::options::{ConnectionOptions, Provider};

/// Runtime tunables for SQLite connection behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// Busy timeout for SQLite connections, in milliseconds.
    pub busy_timeout_ms: u64,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
        }
    }
}

/// One live session with the backing store.
///
/// Owned by the pool while idle and by exactly one borrower while checked out.
pub enum Connection {
    Sqlite(rusqlite::Connection),
    Postgres(PgSession),
}

impl Connection {
    /// The provider this session talks to.
    pub fn provider(&self) -> Provider {
        match self {
            Connection::Sqlite(_) => Provider::Sqlite,
            Connection::Postgres(_) => Provider::Postgres,
        }
    }

    /// Executes one or more statements that return no rows.
    ///
    /// # Errors
    ///
    /// Returns the store's error if any statement fails.
    pub fn execute_batch(&mut self, sql: &str) -> Result<(), ConnectionError> {
        match self {
            Connection::Sqlite(conn) => Ok(conn.execute_batch(sql)?),
            Connection::Postgres(session) => {
                let (runtime, conn) = session.split();
                runtime.block_on(sqlx::raw_sql(sql).execute(conn))?;
                Ok(())
            }
        }
    }

    /// Round-trips to the store to prove the session is still usable.
    ///
    /// # Errors
    ///
    /// Returns the store's error if the session is no longer usable.
    pub fn ping(&mut self) -> Result<(), ConnectionError> {
        match self {
            Connection::Sqlite(conn) => {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
                Ok(())
            }
            Connection::Postgres(session) => {
                let (runtime, conn) = session.split();
                Ok(runtime.block_on(conn.ping())?)
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Connection").field(&self.provider()).finish()
    }
}

/// A PostgreSQL session driven synchronously on a shared runtime.
///
/// Must not be used from inside an async context.
pub struct PgSession {
    // Dropped before `runtime` so the socket is released while the reactor is alive.
    conn: PgConnection,
    runtime: Arc<Runtime>,
}

impl PgSession {
    /// The runtime and the connection, borrowed together so callers can
    /// `runtime.block_on(...)` against the connection.
    pub fn split(&mut self) -> (&Runtime, &mut PgConnection) {
        (&self.runtime, &mut self.conn)
    }
}

enum Backend {
    Sqlite(SqliteConnectionManager),
    Postgres {
        connect: PgConnectOptions,
        timeout_seconds: u64,
        runtime: Arc<Runtime>,
    },
}

/// Opens [`Connection`]s for the configured provider.
pub struct ConnectionManager {
    options: ConnectionOptions,
    backend: Backend,
}

impl ConnectionManager {
    /// Builds a manager with default runtime settings.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Runtime` if the PostgreSQL driver runtime cannot start.
    pub fn new(options: ConnectionOptions) -> Result<Self, ConnectionError> {
        Self::with_settings(options, DbRuntimeSettings::default())
    }

    /// Builds a manager. Nothing is opened until [`ManageConnection::connect`].
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Runtime` if the PostgreSQL driver runtime cannot start.
    pub fn with_settings(
        options: ConnectionOptions,
        settings: DbRuntimeSettings,
    ) -> Result<Self, ConnectionError> {
        let backend = match &options {
            ConnectionOptions::Sqlite(sqlite) => {
                Backend::Sqlite(sqlite_manager(&sqlite.file, settings))
            }
            ConnectionOptions::Postgres(pg) => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .thread_name("quire-db-pg")
                    .enable_all()
                    .build()
                    .map_err(ConnectionError::Runtime)?;

                Backend::Postgres {
                    connect: PgConnectOptions::new()
                        .host(&pg.host)
                        .port(pg.port)
                        .database(&pg.database)
                        .username(&pg.user)
                        .password(&pg.password),
                    timeout_seconds: pg.connection_timeout_seconds,
                    runtime: Arc::new(runtime),
                }
            }
        };

        Ok(Self { options, backend })
    }

    /// The options this manager connects with.
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }
}

/// SQLite manager with WAL mode, foreign keys and a busy timeout.
fn sqlite_manager(
    path: &std::path::Path,
    settings: DbRuntimeSettings,
) -> SqliteConnectionManager {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

    SqliteConnectionManager::file(path)
        .with_flags(flags)
        .with_init(move |conn| {
            // In-memory databases report "memory", which is acceptable.
            let journal_mode: String =
                conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
            if journal_mode != "wal" && journal_mode != "memory" {
                return Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                    Some(format!(
                        "failed to set WAL journal mode, got: {}",
                        journal_mode
                    )),
                ));
            }
            conn.execute_batch(&format!(
                "PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = {};",
                settings.busy_timeout_ms
            ))
        })
}

impl ManageConnection for ConnectionManager {
    type Connection = Connection;
    type Error = ConnectionError;

    fn connect(&self) -> Result<Connection, ConnectionError> {
        match &self.backend {
            Backend::Sqlite(manager) => Ok(Connection::Sqlite(manager.connect()?)),
            Backend::Postgres {
                connect,
                timeout_seconds,
                runtime,
            } => {
                let conn = runtime
                    .block_on(async {
                        tokio::time::timeout(
                            Duration::from_secs(*timeout_seconds),
                            PgConnection::connect_with(connect),
                        )
                        .await
                    })
                    .map_err(|_| ConnectionError::Timeout {
                        seconds: *timeout_seconds,
                    })??;

                Ok(Connection::Postgres(PgSession {
                    conn,
                    runtime: Arc::clone(runtime),
                }))
            }
        }
    }

    fn is_valid(&self, conn: &mut Connection) -> Result<(), ConnectionError> {
        conn.ping()
    }

    fn has_broken(&self, _conn: &mut Connection) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{PostgresOptions, SqliteOptions};

    #[test]
    fn sqlite_connection_is_configured() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let options = ConnectionOptions::Sqlite(SqliteOptions {
            file: dir.path().join("rstudio.sqlite"),
        });
        let manager = ConnectionManager::with_settings(
            options,
            DbRuntimeSettings {
                busy_timeout_ms: 2_500,
            },
        )
        .expect("manager should build");

        let mut conn = manager.connect().expect("should open sqlite file");
        assert_eq!(conn.provider(), Provider::Sqlite);
        manager.is_valid(&mut conn).expect("fresh connection is valid");

        let Connection::Sqlite(sqlite) = &conn else {
            panic!("expected a sqlite connection");
        };

        let mode: String = sqlite
            .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
            .expect("should query journal_mode");
        assert_eq!(mode, "wal");

        let fk: i32 = sqlite
            .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
            .expect("should query foreign_keys");
        assert_eq!(fk, 1, "foreign keys should be enabled");

        let busy_timeout: i32 = sqlite
            .query_row("PRAGMA busy_timeout;", [], |row| row.get(0))
            .expect("should query busy_timeout");
        assert_eq!(busy_timeout, 2_500, "busy timeout should match settings");
    }

    #[test]
    fn sqlite_ping_round_trips_a_query() {
        let mut conn = Connection::Sqlite(
            rusqlite::Connection::open_in_memory().expect("should open in-memory db"),
        );
        conn.ping().expect("open connection answers a query");

        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY);")
            .expect("should create table");
        conn.ping().expect("connection stays usable after writes");
    }

    #[test]
    fn sqlite_missing_directory_fails_to_connect() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let options = ConnectionOptions::Sqlite(SqliteOptions {
            file: dir.path().join("absent").join("rstudio.sqlite"),
        });
        let manager = ConnectionManager::new(options).expect("manager should build");

        let err = manager.connect().expect_err("directory does not exist");
        assert!(matches!(err, ConnectionError::Sqlite(_)), "got {err:?}");
    }

    #[test]
    fn postgres_unreachable_server_fails_to_connect() {
        // Port 1 on loopback is never a PostgreSQL server.
        let options = ConnectionOptions::Postgres(PostgresOptions {
            host: "127.0.0.1".to_string(),
            port: 1,
            database: "quire".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            connection_timeout_seconds: 2,
        });
        let manager = ConnectionManager::new(options).expect("manager should build");

        let err = manager.connect().expect_err("nothing listens on port 1");
        assert!(
            matches!(
                err,
                ConnectionError::Postgres(_) | ConnectionError::Timeout { .. }
            ),
            "got {err:?}"
        );
    }
}
