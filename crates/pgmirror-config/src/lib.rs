mod error;
mod project;
mod validation;

pub use error::{ConfigError, ConfigResult};
pub use project::{
    resolve_env, PostgresConfig, ProjectConfig, ReplicationConfig, StoreConfig, TableConfig,
    DATABASE_URL_VAR,
};
pub use validation::validate_config;
