use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error("invalid {field} '{value}': expected a lowercase identifier ([a-z_][a-z0-9_]*)")]
    InvalidIdentifier { field: String, value: String },

    #[error("invalid table name '{0}': expected schema.table")]
    InvalidTableName(String),

    #[error("table '{0}' is listed more than once")]
    DuplicateTable(String),

    #[error("tables '{first}' and '{second}' both map to local table '{local}'")]
    LocalNameCollision {
        first: String,
        second: String,
        local: String,
    },

    #[error("status_interval_secs must be greater than zero")]
    ZeroStatusInterval,

    #[error("reconnect_backoff_ms ({backoff_ms}) exceeds max_backoff_ms ({max_ms})")]
    BackoffAboveCap { backoff_ms: u64, max_ms: u64 },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
