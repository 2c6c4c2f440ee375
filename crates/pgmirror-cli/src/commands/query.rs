use anyhow::{Context, Result};
use pgmirror_config::ProjectConfig;
use pgmirror_store::{LocalStore, QueryResult};

pub fn cmd_query(config: ProjectConfig, sql: &str) -> Result<()> {
    if config.store.path == ":memory:" {
        anyhow::bail!("The local store is in-memory; set [store] path to query it from another process");
    }

    let store = LocalStore::open(&config.store.path)
        .with_context(|| format!("Failed to open local store: {}", config.store.path))?;
    let result = store.query(sql, &[]).context("Query failed")?;

    for line in json_lines(result) {
        println!("{}", line);
    }
    Ok(())
}

/// One JSON object per row, keyed by column name (keys sorted).
fn json_lines(result: QueryResult) -> Vec<String> {
    let QueryResult { columns, rows } = result;
    rows.into_iter()
        .map(|row| {
            let object: serde_json::Map<String, serde_json::Value> = columns
                .iter()
                .cloned()
                .zip(row.into_iter().map(serde_json::Value::from))
                .collect();
            serde_json::Value::Object(object).to_string()
        })
        .collect()
}
