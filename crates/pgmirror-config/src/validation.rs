use std::collections::{HashMap, HashSet};

use pgmirror_core::TableName;

use crate::error::{ConfigError, ConfigResult};
use crate::project::{ProjectConfig, ReplicationConfig, TableConfig};

/// Validate a parsed project configuration.
pub fn validate_config(config: &ProjectConfig) -> ConfigResult<()> {
    validate_replication(&config.replication)?;
    validate_tables(&config.tables)?;
    Ok(())
}

fn validate_replication(replication: &ReplicationConfig) -> ConfigResult<()> {
    validate_identifier("slot_name", &replication.slot_name)?;
    if let Some(publication) = &replication.publication_name {
        validate_identifier("publication_name", publication)?;
    }

    if replication.status_interval_secs == 0 {
        return Err(ConfigError::ZeroStatusInterval);
    }
    if replication.reconnect_backoff_ms > replication.max_backoff_ms {
        return Err(ConfigError::BackoffAboveCap {
            backoff_ms: replication.reconnect_backoff_ms,
            max_ms: replication.max_backoff_ms,
        });
    }
    Ok(())
}

fn validate_tables(tables: &[TableConfig]) -> ConfigResult<()> {
    let mut seen = HashSet::new();
    let mut locals: HashMap<String, &str> = HashMap::new();
    for table in tables {
        let name = TableName::parse(&table.name)
            .map_err(|_| ConfigError::InvalidTableName(table.name.clone()))?;
        let local = name.local_name();
        if !seen.insert(name) {
            return Err(ConfigError::DuplicateTable(table.name.clone()));
        }
        if let Some(first) = locals.insert(local.clone(), &table.name) {
            return Err(ConfigError::LocalNameCollision {
                first: first.to_string(),
                second: table.name.clone(),
                local,
            });
        }
    }
    Ok(())
}

/// Slot and publication names are interpolated into replication commands,
/// so only plain identifiers are accepted.
fn validate_identifier(field: &str, value: &str) -> ConfigResult<()> {
    let mut chars = value.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_lowercase() || first == '_')
                && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        }
        None => false,
    };

    if !valid {
        return Err(ConfigError::InvalidIdentifier {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
    Ok(())
}
