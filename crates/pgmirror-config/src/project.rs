use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, ConfigResult};
use crate::validation::validate_config;

/// Environment variable that overrides `postgres.connection_string`.
pub const DATABASE_URL_VAR: &str = "DATABASE_URL";

/// Project configuration from pgmirror.toml
#[derive(Debug, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PostgresConfig {
    /// May reference environment variables as `${VAR}`.
    #[serde(default)]
    pub connection_string: String,
}

/// Replication slot, publication and session timing.
#[derive(Debug, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_slot_name")]
    pub slot_name: String,
    /// Defaults to the slot name.
    pub publication_name: Option<String>,
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Zero retries forever.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Drop the slot and publication when the process stops.
    #[serde(default = "default_drop_on_shutdown")]
    pub drop_on_shutdown: bool,
}

fn default_slot_name() -> String {
    "pgmirror_slot".to_string()
}

fn default_status_interval_secs() -> u64 {
    10
}

fn default_reconnect_backoff_ms() -> u64 {
    5_000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_drop_on_shutdown() -> bool {
    true
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            slot_name: default_slot_name(),
            publication_name: None,
            status_interval_secs: default_status_interval_secs(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            drop_on_shutdown: default_drop_on_shutdown(),
        }
    }
}

impl ReplicationConfig {
    pub fn publication_name(&self) -> &str {
        self.publication_name.as_deref().unwrap_or(&self.slot_name)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file, or `:memory:`.
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String {
    ":memory:".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// A source table to register at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    /// `schema.table`
    pub name: String,
    #[serde(default = "default_snapshot")]
    pub snapshot: bool,
    /// Query whose rows seed the snapshot instead of the whole table.
    pub filter_query: Option<String>,
}

fn default_snapshot() -> bool {
    true
}

impl ProjectConfig {
    /// Parse a project config from a TOML string and validate it.
    pub fn parse(toml_str: &str) -> ConfigResult<Self> {
        let config: ProjectConfig = toml::from_str(toml_str)?;
        validate_config(&config)?;
        Ok(config)
    }

    /// Read, parse and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// The resolved Postgres connection string. A non-empty `DATABASE_URL`
    /// in the environment takes precedence over the file.
    pub fn connection_string(&self) -> ConfigResult<String> {
        if let Ok(url) = std::env::var(DATABASE_URL_VAR) {
            if !url.trim().is_empty() {
                return Ok(url);
            }
        }

        let resolved = resolve_env(&self.postgres.connection_string);
        if resolved.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "postgres.connection_string".to_string(),
            });
        }
        Ok(resolved)
    }
}

/// Resolve environment variables in a string.
/// Supports ${VAR_NAME} syntax; unset variables resolve to "".
pub fn resolve_env(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        result.push_str(&rest[..start]);
        let var_name = &rest[start + 2..start + len];
        result.push_str(&std::env::var(var_name).unwrap_or_default());
        rest = &rest[start + len + 1..];
    }

    result.push_str(rest);
    result
}
