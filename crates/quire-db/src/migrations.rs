//! Versioned schema migrations read from a directory of scripts.
//!
//! Scripts are named `<version>_<description>.<ext>`, where `<ext>` is the
//! provider's extension (`sqlite` or `postgresql`) or the portable `sql`.
//! They run in ascending version order, each in its own transaction together
//! with the `schema_version` row that records it, so a failed script leaves
//! the store exactly as the previous one left it.

use std::path::{Path, PathBuf};

use chrono::Utc;
use sqlx::Connection as _;
use thiserror::Error;

use crate::connection::Connection;
use crate::error::ConnectionError;
use crate::options::Provider;

/// Table recording applied migration versions.
pub const BOOKKEEPING_TABLE: &str = "schema_version";

const CREATE_BOOKKEEPING_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_version (
    version BIGINT PRIMARY KEY NOT NULL,
    applied_at TEXT NOT NULL
);";

/// A single migration script discovered on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: i64,
    /// File name, used in diagnostics.
    pub name: String,
    pub path: PathBuf,
}

/// Errors that can occur during migration discovery or execution.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The migrations directory could not be listed.
    #[error("failed to read migrations directory {}: {source}", path.display())]
    Discovery {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Two scripts claim the same version.
    #[error("migrations '{first}' and '{second}' share version {version}")]
    DuplicateVersion {
        version: i64,
        first: String,
        second: String,
    },

    /// A migration script could not be read.
    #[error("failed to read migration '{name}': {source}")]
    ReadScript {
        version: i64,
        name: String,
        source: std::io::Error,
    },

    /// Failed to create or query the bookkeeping table.
    #[error("failed to check migration state: {0}")]
    Bookkeeping(#[source] ConnectionError),

    /// A migration's statements or its bookkeeping row failed; both were rolled back.
    #[error("migration {version} ('{name}') failed: {source}")]
    Failed {
        version: i64,
        name: String,
        source: ConnectionError,
    },
}

/// Lists the migrations in `dir` that apply to `provider`, sorted by version.
///
/// # Errors
///
/// Returns `MigrationError::Discovery` if the directory cannot be read and
/// `MigrationError::DuplicateVersion` if two scripts share a version.
pub fn discover(dir: &Path, provider: Provider) -> Result<Vec<Migration>, MigrationError> {
    let discovery_error = |source| MigrationError::Discovery {
        path: dir.to_path_buf(),
        source,
    };

    let mut migrations = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(discovery_error)? {
        let path = entry.map_err(discovery_error)?.path();
        if !path.is_file() {
            continue;
        }

        let extension = path.extension().and_then(|ext| ext.to_str());
        if extension != Some(provider.migration_extension()) && extension != Some("sql") {
            tracing::debug!(file = %path.display(), %provider, "ignoring file in migrations directory");
            continue;
        }

        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            tracing::warn!(file = %path.display(), "migration file name is not valid UTF-8, skipping");
            continue;
        };

        let digits: String = name.chars().take_while(char::is_ascii_digit).collect();
        let Ok(version) = digits.parse::<i64>() else {
            tracing::warn!(file = name, "migration script has no version prefix, skipping");
            continue;
        };

        migrations.push(Migration {
            version,
            name: name.to_string(),
            path,
        });
    }

    // Directory order is arbitrary; the version is the only ordering.
    migrations.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.name.cmp(&b.name)));

    if let Some(pair) = migrations
        .windows(2)
        .find(|pair| pair[0].version == pair[1].version)
    {
        return Err(MigrationError::DuplicateVersion {
            version: pair[0].version,
            first: pair[0].name.clone(),
            second: pair[1].name.clone(),
        });
    }

    Ok(migrations)
}

/// Brings a store up to the newest migration in a directory.
#[derive(Debug, Clone)]
pub struct SchemaUpdater {
    dir: PathBuf,
}

impl SchemaUpdater {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory the scripts are read from.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Highest applied version, or `None` for a store with no migrations.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Bookkeeping` if the bookkeeping table cannot
    /// be created or queried.
    pub fn current_version(&self, conn: &mut Connection) -> Result<Option<i64>, MigrationError> {
        conn.execute_batch(CREATE_BOOKKEEPING_TABLE)
            .map_err(MigrationError::Bookkeeping)?;
        highest_version(conn).map_err(MigrationError::Bookkeeping)
    }

    /// Migrations that [`update`](Self::update) would apply, in order.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError` if discovery or the bookkeeping query fails.
    pub fn pending(&self, conn: &mut Connection) -> Result<Vec<Migration>, MigrationError> {
        let migrations = discover(&self.dir, conn.provider())?;
        let current = self.current_version(conn)?;
        Ok(migrations
            .into_iter()
            .filter(|m| current.map_or(true, |applied| m.version > applied))
            .collect())
    }

    /// Applies every pending migration and returns how many were applied.
    ///
    /// Stops at the first failure; earlier migrations stay committed and later
    /// ones are not attempted. Running again on a current store applies nothing.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Failed` naming the first migration that failed,
    /// or another `MigrationError` if discovery or bookkeeping fails.
    pub fn update(&self, conn: &mut Connection) -> Result<usize, MigrationError> {
        let pending = self.pending(conn)?;
        if pending.is_empty() {
            tracing::debug!(dir = %self.dir.display(), "database schema is up to date");
            return Ok(0);
        }

        for migration in &pending {
            tracing::info!(
                version = migration.version,
                migration = %migration.name,
                "applying migration"
            );

            let script = std::fs::read_to_string(&migration.path).map_err(|e| {
                MigrationError::ReadScript {
                    version: migration.version,
                    name: migration.name.clone(),
                    source: e,
                }
            })?;

            apply(conn, migration.version, &script).map_err(|e| MigrationError::Failed {
                version: migration.version,
                name: migration.name.clone(),
                source: e,
            })?;
        }

        tracing::info!(
            applied = pending.len(),
            version = pending.last().map(|m| m.version),
            "database schema updated"
        );
        Ok(pending.len())
    }
}

fn highest_version(conn: &mut Connection) -> Result<Option<i64>, ConnectionError> {
    const QUERY: &str = "SELECT MAX(version) FROM schema_version";

    match conn {
        Connection::Sqlite(sqlite) => Ok(sqlite.query_row(QUERY, [], |row| row.get(0))?),
        Connection::Postgres(session) => {
            let (runtime, pg) = session.split();
            Ok(runtime.block_on(sqlx::query_scalar::<_, Option<i64>>(QUERY).fetch_one(pg))?)
        }
    }
}

/// Runs `script` and records `version` in one transaction.
fn apply(conn: &mut Connection, version: i64, script: &str) -> Result<(), ConnectionError> {
    let applied_at = Utc::now().to_rfc3339();

    match conn {
        Connection::Sqlite(sqlite) => {
            let tx = sqlite.transaction()?;
            tx.execute_batch(script)?;
            tx.execute(
                "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, applied_at],
            )?;
            tx.commit()?;
        }
        Connection::Postgres(session) => {
            let (runtime, pg) = session.split();
            runtime.block_on(async {
                let mut tx = pg.begin().await?;
                sqlx::raw_sql(script).execute(&mut *tx).await?;
                sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES ($1, $2)")
                    .bind(version)
                    .bind(applied_at.as_str())
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await
            })?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn memory_conn() -> Connection {
        Connection::Sqlite(rusqlite::Connection::open_in_memory().expect("should open in-memory db"))
    }

    fn scripts(files: &[(&str, &str)]) -> TempDir {
        let dir = tempfile::tempdir().expect("should create temp dir");
        for (name, sql) in files {
            fs::write(dir.path().join(name), sql).expect("should write script");
        }
        dir
    }

    fn table_exists(conn: &Connection, table: &str) -> bool {
        let Connection::Sqlite(sqlite) = conn else {
            panic!("expected sqlite connection");
        };
        sqlite
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                [table],
                |row| row.get(0),
            )
            .expect("should query sqlite_master")
    }

    #[test]
    fn discovery_sorts_numerically_and_filters_by_provider() {
        let dir = scripts(&[
            ("10_tenth.sqlite", ""),
            ("9_ninth.sql", ""),
            ("002_second.sqlite", ""),
            ("002_second.postgresql", ""),
            ("README.md", ""),
            ("notes.sqlite", ""),
        ]);
        fs::create_dir(dir.path().join("011_nested.sqlite")).expect("should create dir");

        let found = discover(dir.path(), Provider::Sqlite).expect("discovery should succeed");
        let names: Vec<&str> = found.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["002_second.sqlite", "9_ninth.sql", "10_tenth.sqlite"]);
        assert_eq!(
            found.iter().map(|m| m.version).collect::<Vec<_>>(),
            [2, 9, 10]
        );

        let found = discover(dir.path(), Provider::Postgres).expect("discovery should succeed");
        let names: Vec<&str> = found.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["002_second.postgresql", "9_ninth.sql"]);
    }

    #[test]
    fn duplicate_versions_are_rejected() {
        let dir = scripts(&[("001_a.sqlite", ""), ("1_b.sql", "")]);
        let err = discover(dir.path(), Provider::Sqlite).expect_err("duplicate version");
        assert!(
            matches!(err, MigrationError::DuplicateVersion { version: 1, .. }),
            "got {err:?}"
        );
    }

    #[test]
    fn missing_directory_is_a_discovery_error() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let mut conn = memory_conn();
        let err = SchemaUpdater::new(dir.path().join("absent"))
            .update(&mut conn)
            .expect_err("directory does not exist");
        assert!(matches!(err, MigrationError::Discovery { .. }), "got {err:?}");
    }

    #[test]
    fn empty_directory_creates_bookkeeping_only() {
        let dir = scripts(&[]);
        let mut conn = memory_conn();
        let updater = SchemaUpdater::new(dir.path());

        assert_eq!(updater.update(&mut conn).expect("update should succeed"), 0);
        assert!(table_exists(&conn, BOOKKEEPING_TABLE));
        assert_eq!(updater.current_version(&mut conn).expect("query"), None);
    }

    #[test]
    fn update_is_idempotent() {
        let dir = scripts(&[
            ("001_users.sqlite", "CREATE TABLE users (id INTEGER PRIMARY KEY);"),
            ("002_sessions.sqlite", "CREATE TABLE sessions (id INTEGER PRIMARY KEY);"),
        ]);
        let mut conn = memory_conn();
        let updater = SchemaUpdater::new(dir.path());

        assert_eq!(updater.update(&mut conn).expect("first run should succeed"), 2);
        assert_eq!(
            updater.update(&mut conn).expect("second run should succeed"),
            0,
            "no new migrations to apply"
        );
        assert_eq!(updater.current_version(&mut conn).expect("query"), Some(2));
    }

    #[test]
    fn only_newer_migrations_are_applied() {
        let dir = scripts(&[
            ("001_x.sqlite", "CREATE TABLE x (id INTEGER PRIMARY KEY);"),
            ("002_y.sqlite", "CREATE TABLE y (id INTEGER PRIMARY KEY);"),
        ]);
        let mut conn = memory_conn();
        let updater = SchemaUpdater::new(dir.path());
        assert_eq!(updater.update(&mut conn).expect("should apply 001 and 002"), 2);

        fs::write(
            dir.path().join("003_z.sqlite"),
            "CREATE TABLE z (id INTEGER PRIMARY KEY);",
        )
        .expect("should write script");

        let pending = updater.pending(&mut conn).expect("pending should succeed");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "003_z.sqlite");

        assert_eq!(updater.update(&mut conn).expect("should apply 003"), 1);
        assert_eq!(updater.current_version(&mut conn).expect("query"), Some(3));
        assert!(table_exists(&conn, "z"));
    }

    #[test]
    fn failed_migration_rolls_back_and_can_be_retried() {
        let dir = scripts(&[
            ("001_base.sqlite", "CREATE TABLE base (id INTEGER PRIMARY KEY);"),
            (
                "002_broken.sqlite",
                "CREATE TABLE half_done (id INTEGER PRIMARY KEY);
                 INSERT INTO missing_table (id) VALUES (1);",
            ),
            ("003_after.sqlite", "CREATE TABLE after (id INTEGER PRIMARY KEY);"),
        ]);
        let mut conn = memory_conn();
        let updater = SchemaUpdater::new(dir.path());

        let err = updater.update(&mut conn).expect_err("002 should fail");
        match &err {
            MigrationError::Failed { version, name, .. } => {
                assert_eq!(*version, 2);
                assert_eq!(name, "002_broken.sqlite");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(updater.current_version(&mut conn).expect("query"), Some(1));
        assert!(!table_exists(&conn, "half_done"), "partial work rolled back");
        assert!(!table_exists(&conn, "after"), "later migrations not attempted");

        // Remediate: fix 002 and hold back 003 to observe a single step.
        fs::remove_file(dir.path().join("003_after.sqlite")).expect("should remove script");
        fs::write(
            dir.path().join("002_broken.sqlite"),
            "CREATE TABLE half_done (id INTEGER PRIMARY KEY);",
        )
        .expect("should rewrite script");

        assert_eq!(updater.update(&mut conn).expect("retry should succeed"), 1);
        assert_eq!(updater.current_version(&mut conn).expect("query"), Some(2));
        assert!(table_exists(&conn, "half_done"));
    }

    #[test]
    fn side_effects_roll_back_when_bookkeeping_insert_fails() {
        let dir = scripts(&[(
            "001_conflict.sqlite",
            "CREATE TABLE rollback_probe (id INTEGER PRIMARY KEY);
             INSERT INTO schema_version (version, applied_at) VALUES (1, 'now');",
        )]);
        let mut conn = memory_conn();

        let err = SchemaUpdater::new(dir.path())
            .update(&mut conn)
            .expect_err("bookkeeping conflict should fail the migration");
        assert!(
            matches!(err, MigrationError::Failed { version: 1, .. }),
            "got {err:?}"
        );
        assert!(
            !table_exists(&conn, "rollback_probe"),
            "schema side effects should be rolled back when the bookkeeping insert fails"
        );
    }
}
