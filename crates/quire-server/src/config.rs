//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Database startup settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database startup configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Apply pending schema migrations before serving.
    #[serde(default = "default_update_schema")]
    pub update_schema: bool,

    /// Directory holding `database.conf`. Defaults to the system location.
    #[serde(default)]
    pub config_dir: Option<PathBuf>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "quire_db=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_update_schema() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            update_schema: default_update_schema(),
            config_dir: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl DatabaseConfig {
    /// Where the database layer reads `database.conf` from.
    pub fn source(&self) -> quire_db::ConfigSource {
        match &self.config_dir {
            Some(dir) => quire_db::ConfigSource::in_dir(dir),
            None => quire_db::ConfigSource::system_default(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `QUIRE_LOG_LEVEL` overrides `logging.level`
/// - `QUIRE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `QUIRE_UPDATE_SCHEMA` overrides `database.update_schema`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

fn load_config_with_env<F>(path: Option<&str>, env: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Some(level) = env("QUIRE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = env("QUIRE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(update) = env("QUIRE_UPDATE_SCHEMA") {
        config.database.update_schema = !(update == "false" || update == "0");
    }

    Ok(config)
}
