//! Startup orchestration and the process-wide database service.
//!
//! [`initialize`] runs once during server startup: it resolves the
//! configuration, builds the pool and optionally migrates the schema. The
//! rest of the process then reaches the database only through
//! [`get_connection`] and [`get_connection_timeout`]. Tests build independent
//! [`DatabaseService`] instances instead of touching the global.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::connection::ConnectionManager;
use crate::error::DatabaseError;
use crate::migrations::SchemaUpdater;
use crate::options::{resolve_options, ConfigSource, ConnectionOptions, Provider};
use crate::pool::{ConnectionPool, PoolError, PooledConnection};

/// Environment override for the migrations directory.
pub const MIGRATIONS_PATH_ENV: &str = "QUIRE_DB_MIGRATIONS_PATH";

/// Pool capacity used when host parallelism cannot be determined.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// The pool type used by the service.
pub type DbPool = ConnectionPool<ConnectionManager>;

/// A connection borrowed from the service's pool.
pub type DbConnection = PooledConnection<ConnectionManager>;

/// Knobs for [`DatabaseService::start`].
#[derive(Debug, Clone, Default)]
pub struct StartupSettings {
    /// Run pending migrations before returning.
    pub update_schema: bool,

    /// Pool capacity. Defaults to [`default_pool_size`].
    pub pool_size: Option<usize>,

    /// Migrations directory. Defaults to [`migrations_dir`].
    pub migrations_dir: Option<PathBuf>,
}

/// Number of hardware threads, or [`DEFAULT_POOL_SIZE`] if unknown.
pub fn default_pool_size() -> usize {
    std::thread::available_parallelism().map_or(DEFAULT_POOL_SIZE, NonZeroUsize::get)
}

/// Locates the migration scripts.
///
/// `QUIRE_DB_MIGRATIONS_PATH` wins for development setups; otherwise the
/// scripts live in `db/` next to the directory holding the executable.
///
/// # Errors
///
/// Returns an I/O error if the executable path cannot be determined.
pub fn migrations_dir() -> std::io::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    migrations_dir_with(|key| std::env::var(key).ok(), &exe)
}

fn migrations_dir_with<F>(env: F, exe: &Path) -> std::io::Result<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = env(MIGRATIONS_PATH_ENV).filter(|path| !path.trim().is_empty()) {
        return Ok(PathBuf::from(path));
    }

    let root = exe.parent().and_then(Path::parent).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("executable {} has no installation root", exe.display()),
        )
    })?;
    Ok(root.join("db"))
}

/// The database layer as seen by the rest of the server.
#[derive(Debug)]
pub struct DatabaseService {
    pool: DbPool,
}

impl DatabaseService {
    /// Resolves options from `source` and starts the service.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if configuration, connection or migration fails.
    pub fn initialize(source: &ConfigSource, update_schema: bool) -> Result<Self, DatabaseError> {
        let options = resolve_options(source).inspect_err(|e| {
            tracing::error!(error = %e, "could not read database configuration");
        })?;

        Self::start(
            options,
            StartupSettings {
                update_schema,
                ..StartupSettings::default()
            },
        )
    }

    /// Builds the pool for `options` and optionally migrates the schema.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::Pool` if the store cannot be reached,
    /// `DatabaseError::MigrationsDir` if the scripts cannot be located and
    /// `DatabaseError::Migration` if a migration fails.
    pub fn start(
        options: ConnectionOptions,
        settings: StartupSettings,
    ) -> Result<Self, DatabaseError> {
        let provider = options.provider();
        let capacity = settings.pool_size.unwrap_or_else(default_pool_size);

        let manager = ConnectionManager::new(options).map_err(PoolError::Connect)?;
        let pool = ConnectionPool::new(capacity, manager).inspect_err(|e| {
            tracing::error!(%provider, error = %e, "could not connect to database");
        })?;

        let service = Self::with_pool(pool);

        if settings.update_schema {
            let dir = match settings.migrations_dir {
                Some(dir) => dir,
                None => migrations_dir().map_err(|e| {
                    tracing::error!(error = %e, "could not determine path to database migration files");
                    DatabaseError::MigrationsDir(e)
                })?,
            };
            service.update_schema(&dir)?;
        }

        Ok(service)
    }

    /// Wraps an existing pool.
    pub fn with_pool(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Runs pending migrations from `dir` on one borrowed connection.
    ///
    /// The connection is returned to the pool whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::Migration` if a migration fails.
    pub fn update_schema(&self, dir: &Path) -> Result<usize, DatabaseError> {
        let mut conn = self.pool.acquire()?;
        let result = SchemaUpdater::new(dir).update(&mut conn);
        self.pool.release(conn);

        result.map_err(|e| {
            tracing::error!(
                dir = %dir.display(),
                error = %e,
                "could not update database to latest schema"
            );
            DatabaseError::Migration(e)
        })
    }

    /// The provider the pool connects to.
    pub fn provider(&self) -> Provider {
        self.pool.manager().options().provider()
    }

    /// The underlying pool.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Blocks until a connection is available.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::Pool` once the service has been shut down.
    pub fn get_connection(&self) -> Result<DbConnection, DatabaseError> {
        Ok(self.pool.acquire()?)
    }

    /// Waits at most `timeout`; `Ok(None)` means none became available.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::Pool` once the service has been shut down.
    pub fn get_connection_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<DbConnection>, DatabaseError> {
        Ok(self.pool.acquire_timeout(timeout)?)
    }

    /// Closes the pool, waiting for borrowed connections to come back.
    pub fn shutdown(&self) {
        self.pool.close();
    }
}

static SERVICE: RwLock<Option<Arc<DatabaseService>>> = RwLock::new(None);

/// Starts the process-wide service from the system `database.conf`.
///
/// # Errors
///
/// Returns `DatabaseError` if startup fails; the server should not start.
pub fn initialize(update_schema: bool) -> Result<(), DatabaseError> {
    initialize_from(&ConfigSource::system_default(), update_schema)
}

/// Starts the process-wide service from `source`.
///
/// # Errors
///
/// Returns `DatabaseError::AlreadyInitialized` if a service is running, or
/// the startup error.
pub fn initialize_from(source: &ConfigSource, update_schema: bool) -> Result<(), DatabaseError> {
    let mut slot = SERVICE.write().unwrap_or_else(|e| e.into_inner());
    if slot.is_some() {
        return Err(DatabaseError::AlreadyInitialized);
    }

    let service = DatabaseService::initialize(source, update_schema)?;
    *slot = Some(Arc::new(service));
    Ok(())
}

fn current() -> Result<Arc<DatabaseService>, DatabaseError> {
    SERVICE
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
        .ok_or(DatabaseError::NotInitialized)
}

/// Borrows a connection from the process-wide pool, blocking until one is free.
///
/// # Errors
///
/// Returns `DatabaseError::NotInitialized` before [`initialize`], or
/// `DatabaseError::Pool` after [`shutdown`].
pub fn get_connection() -> Result<DbConnection, DatabaseError> {
    current()?.get_connection()
}

/// Borrows a connection, waiting at most `timeout`.
///
/// # Errors
///
/// As for [`get_connection`].
pub fn get_connection_timeout(timeout: Duration) -> Result<Option<DbConnection>, DatabaseError> {
    current()?.get_connection_timeout(timeout)
}

/// Tears down the process-wide service. A later [`initialize`] may start a new one.
///
/// Blocks until borrowed connections are released, so the caller must not hold one.
pub fn shutdown() {
    let service = SERVICE.write().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(service) = service {
        service.shutdown();
        tracing::info!("database service shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::options::{ConfigError, SqliteOptions};
    use std::fs;

    fn sqlite_options(dir: &Path) -> ConnectionOptions {
        ConnectionOptions::Sqlite(SqliteOptions {
            file: dir.join("rstudio.sqlite"),
        })
    }

    #[test]
    fn default_pool_size_is_positive() {
        assert!(default_pool_size() >= 1);
    }

    #[test]
    fn migrations_dir_prefers_env_override() {
        let dir = migrations_dir_with(
            |key| (key == MIGRATIONS_PATH_ENV).then(|| "/src/quire/db".to_string()),
            Path::new("/usr/lib/quire/bin/quire-server"),
        )
        .expect("should resolve");
        assert_eq!(dir, PathBuf::from("/src/quire/db"));
    }

    #[test]
    fn migrations_dir_defaults_next_to_bin() {
        let dir = migrations_dir_with(|_| None, Path::new("/usr/lib/quire/bin/quire-server"))
            .expect("should resolve");
        assert_eq!(dir, PathBuf::from("/usr/lib/quire/db"));

        let err = migrations_dir_with(|_| None, Path::new("quire-server"))
            .expect_err("no installation root");
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn start_builds_pool_and_migrates() {
        let data = tempfile::tempdir().expect("should create temp dir");
        let scripts = tempfile::tempdir().expect("should create temp dir");
        fs::write(
            scripts.path().join("001_users.sqlite"),
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL);",
        )
        .expect("should write script");

        let service = DatabaseService::start(
            sqlite_options(data.path()),
            StartupSettings {
                update_schema: true,
                pool_size: Some(2),
                migrations_dir: Some(scripts.path().to_path_buf()),
            },
        )
        .expect("service should start");

        assert_eq!(service.provider(), Provider::Sqlite);
        let state = service.pool().state();
        assert_eq!((state.capacity, state.idle, state.in_use), (2, 2, 0));

        let mut conn = service.get_connection().expect("should borrow");
        let Connection::Sqlite(sqlite) = &mut *conn else {
            panic!("expected sqlite connection");
        };
        sqlite
            .execute("INSERT INTO users (name) VALUES (?1)", ["ada"])
            .expect("migrated table should exist");
        drop(conn);

        assert_eq!(
            service
                .update_schema(scripts.path())
                .expect("second pass should succeed"),
            0
        );
        service.shutdown();
    }

    #[test]
    fn migration_failure_propagates_and_releases_connection() {
        let data = tempfile::tempdir().expect("should create temp dir");
        let scripts = tempfile::tempdir().expect("should create temp dir");
        fs::write(scripts.path().join("001_bad.sqlite"), "CREATE TABLE;")
            .expect("should write script");

        let service = DatabaseService::start(
            sqlite_options(data.path()),
            StartupSettings {
                pool_size: Some(1),
                ..StartupSettings::default()
            },
        )
        .expect("service should start without migrating");

        let err = service
            .update_schema(scripts.path())
            .expect_err("bad script should fail");
        assert!(matches!(err, DatabaseError::Migration(_)), "got {err:?}");
        assert_eq!(service.pool().state().idle, 1, "connection was released");
    }

    #[test]
    fn unreachable_store_fails_startup() {
        let data = tempfile::tempdir().expect("should create temp dir");
        let err = DatabaseService::start(
            sqlite_options(&data.path().join("missing")),
            StartupSettings::default(),
        )
        .expect_err("directory does not exist");
        assert!(
            matches!(err, DatabaseError::Pool(PoolError::Connect(_))),
            "got {err:?}"
        );
    }

    #[test]
    fn invalid_provider_fails_before_connecting() {
        let source = ConfigSource::Inline {
            name: "database.conf".to_string(),
            contents: "provider = \"mongodb\"".to_string(),
        };
        let err = DatabaseService::initialize(&source, true).expect_err("bad provider");
        assert!(
            matches!(
                err,
                DatabaseError::Config(ConfigError::InvalidProvider { .. })
            ),
            "got {err:?}"
        );
        assert!(err.to_string().contains("mongodb"));
    }

    #[test]
    fn bounded_borrow_reports_exhaustion() {
        let data = tempfile::tempdir().expect("should create temp dir");
        let service = DatabaseService::start(
            sqlite_options(data.path()),
            StartupSettings {
                pool_size: Some(1),
                ..StartupSettings::default()
            },
        )
        .expect("service should start");

        let held = service.get_connection().expect("should borrow");
        assert!(service
            .get_connection_timeout(Duration::ZERO)
            .expect("exhaustion is not an error")
            .is_none());
        drop(held);
        assert!(service
            .get_connection_timeout(Duration::from_millis(100))
            .expect("pool open")
            .is_some());

        service.shutdown();
        assert!(matches!(
            service.get_connection(),
            Err(DatabaseError::Pool(PoolError::Closed))
        ));
    }
}
