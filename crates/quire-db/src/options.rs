//! Resolution of [`ConnectionOptions`] from the database configuration file.
//!
//! The configuration file (`database.conf`) is TOML with kebab-case keys. Every
//! key is optional; an absent file is equivalent to an empty one and selects
//! the embedded SQLite store at its default location.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

/// File name of the embedded store inside its data directory.
pub const DATABASE_FILE_NAME: &str = "rstudio.sqlite";

/// Data directory used when neither the configuration nor the environment names one.
pub const DEFAULT_SQLITE_DIRECTORY: &str = "/var/run/quire-server";

/// Environment override for the embedded store's data directory.
pub const SERVER_DATA_DIR_ENV: &str = "QUIRE_SERVER_DATA_DIR";

/// Environment override for the directory holding `database.conf`.
pub const CONFIG_DIR_ENV: &str = "QUIRE_CONFIG_DIR";

const DEFAULT_CONFIG_DIR: &str = "/etc/quire";
const CONFIG_FILE_NAME: &str = "database.conf";

/// The kind of backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// Embedded single-file store.
    Sqlite,
    /// Networked relational store.
    Postgres,
}

impl Provider {
    /// Canonical configuration name.
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Sqlite => "sqlite",
            Provider::Postgres => "postgresql",
        }
    }

    /// File extension of migration scripts written for this provider.
    pub fn migration_extension(self) -> &'static str {
        match self {
            Provider::Sqlite => "sqlite",
            Provider::Postgres => "postgresql",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string names no known provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown database provider: {0}")]
pub struct ParseProviderError(pub String);

impl FromStr for Provider {
    type Err = ParseProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_ascii_lowercase();
        match value.as_str() {
            "sqlite" | "embedded-file" => Ok(Provider::Sqlite),
            "postgresql" | "postgres" | "networked" => Ok(Provider::Postgres),
            _ => Err(ParseProviderError(s.to_string())),
        }
    }
}

/// Options for the embedded SQLite store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteOptions {
    /// Absolute path to the database file.
    pub file: PathBuf,
}

/// Options for the networked PostgreSQL store.
#[derive(Clone, PartialEq, Eq)]
pub struct PostgresOptions {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    /// Upper bound on establishing a single session.
    pub connection_timeout_seconds: u64,
}

impl fmt::Debug for PostgresOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field(
                "connection_timeout_seconds",
                &self.connection_timeout_seconds,
            )
            .finish()
    }
}

/// How to reach the configured backing store. Fixed for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOptions {
    Sqlite(SqliteOptions),
    Postgres(PostgresOptions),
}

impl ConnectionOptions {
    /// The provider this variant describes.
    pub fn provider(&self) -> Provider {
        match self {
            ConnectionOptions::Sqlite(_) => Provider::Sqlite,
            ConnectionOptions::Postgres(_) => Provider::Postgres,
        }
    }
}

/// Raw settings as read from `database.conf`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DatabaseSettings {
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Data directory for the embedded store.
    #[serde(default)]
    pub directory: Option<String>,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_seconds: u64,
}

fn default_provider() -> String {
    Provider::Sqlite.as_str().to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_database() -> String {
    "quire".to_string()
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_connection_timeout() -> u64 {
    10
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            directory: None,
            host: default_host(),
            port: default_port(),
            database: default_database(),
            user: default_user(),
            password: String::new(),
            connection_timeout_seconds: default_connection_timeout(),
        }
    }
}

/// Errors that can occur while resolving connection options.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file exists but could not be read.
    #[error("failed to read database configuration file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A value in the configuration could not be parsed.
    #[error("invalid database configuration in {source_name}: {source}")]
    Parse {
        source_name: String,
        source: toml::de::Error,
    },

    /// The `provider` key names neither supported store.
    #[error("invalid database provider specified in {source_name}: {value}")]
    InvalidProvider { value: String, source_name: String },
}

/// Where database settings come from.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// A `database.conf` file on disk. A missing file yields defaults.
    File(PathBuf),
    /// Settings held in memory, labelled with `name` for diagnostics.
    Inline { name: String, contents: String },
}

impl ConfigSource {
    /// The system `database.conf`, honouring `QUIRE_CONFIG_DIR`.
    pub fn system_default() -> Self {
        Self::system_default_with_env(|key| std::env::var(key).ok())
    }

    fn system_default_with_env<F>(env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let dir = env(CONFIG_DIR_ENV)
            .filter(|dir| !dir.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONFIG_DIR.to_string());
        Self::in_dir(dir)
    }

    /// `database.conf` inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        ConfigSource::File(dir.as_ref().join(CONFIG_FILE_NAME))
    }

    /// Reads and parses the settings.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Read` if an existing file cannot be read and
    /// `ConfigError::Parse` if its contents are not valid settings.
    pub fn load(&self) -> Result<DatabaseSettings, ConfigError> {
        let contents = match self {
            ConfigSource::Inline { contents, .. } => contents.clone(),
            ConfigSource::File(path) => {
                if path.exists() {
                    check_permissions(path);
                }
                match std::fs::read_to_string(path) {
                    Ok(contents) => contents,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        tracing::info!(
                            path = %path.display(),
                            "database configuration file not found, using defaults"
                        );
                        return Ok(DatabaseSettings::default());
                    }
                    Err(e) => {
                        return Err(ConfigError::Read {
                            path: path.clone(),
                            source: e,
                        })
                    }
                }
            }
        };

        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            source_name: self.to_string(),
            source: e,
        })
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "{}", path.display()),
            ConfigSource::Inline { name, .. } => f.write_str(name),
        }
    }
}

/// Outcome of inspecting the configuration file's permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionCheck {
    /// Only the owning user has access.
    Restricted,
    /// Group or other bits are set; carries the mode's permission bits.
    Lax(u32),
    /// The mode could not be determined.
    Unknown,
}

/// Inspects `path` and logs when it may expose credentials. Never fails.
#[cfg(unix)]
pub fn check_permissions(path: &Path) -> PermissionCheck {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::metadata(path) {
        Ok(meta) => {
            let mode = meta.permissions().mode() & 0o777;
            if mode & 0o077 != 0 {
                tracing::warn!(
                    path = %path.display(),
                    mode = format!("{mode:o}"),
                    "database configuration file has unrestrictive permissions; \
                     restrict it to user read/write (600) if it contains sensitive information"
                );
                PermissionCheck::Lax(mode)
            } else {
                PermissionCheck::Restricted
            }
        }
        Err(e) => {
            tracing::error!(
                path = %path.display(),
                error = %e,
                "could not determine file permissions for database configuration file; \
                 ensure it has only user read/write permissions (600) if it contains sensitive information"
            );
            PermissionCheck::Unknown
        }
    }
}

#[cfg(not(unix))]
pub fn check_permissions(_path: &Path) -> PermissionCheck {
    PermissionCheck::Unknown
}

/// Resolves connection options from `source` and the process environment.
///
/// # Errors
///
/// Returns `ConfigError` if the settings cannot be read or name an unknown provider.
pub fn resolve_options(source: &ConfigSource) -> Result<ConnectionOptions, ConfigError> {
    resolve_options_with_env(source, |key| std::env::var(key).ok())
}

/// Like [`resolve_options`], with an explicit environment lookup.
pub fn resolve_options_with_env<F>(
    source: &ConfigSource,
    env: F,
) -> Result<ConnectionOptions, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let settings = source.load()?;

    let provider: Provider =
        settings
            .provider
            .parse()
            .map_err(|_| ConfigError::InvalidProvider {
                value: settings.provider.clone(),
                source_name: source.to_string(),
            })?;

    match provider {
        Provider::Sqlite => {
            let directory = settings
                .directory
                .filter(|dir| !dir.trim().is_empty())
                .or_else(|| env(SERVER_DATA_DIR_ENV).filter(|dir| !dir.trim().is_empty()))
                .unwrap_or_else(|| DEFAULT_SQLITE_DIRECTORY.to_string());

            let file = Path::new(&directory).join(DATABASE_FILE_NAME);
            let file = std::path::absolute(&file).unwrap_or(file);
            Ok(ConnectionOptions::Sqlite(SqliteOptions { file }))
        }
        Provider::Postgres => Ok(ConnectionOptions::Postgres(PostgresOptions {
            host: settings.host,
            port: settings.port,
            database: settings.database,
            user: settings.user,
            password: settings.password,
            connection_timeout_seconds: settings.connection_timeout_seconds,
        })),
    }
}
