use anyhow::{Context, Result};
use colored::Colorize;
use pgmirror_config::ProjectConfig;
use pgmirror_core::{TableName, TypeRegistry};
use pgmirror_pg::replication::{PublicationStatus, SlotStatus};
use pgmirror_pg::{format_lsn, PgError, PgSource, Source, TableCatalog};

use crate::APPLICATION_NAME;

pub async fn cmd_check(config: ProjectConfig) -> Result<()> {
    println!("{}", "Config OK".green());

    let source = PgSource::connect(&config.connection_string()?, APPLICATION_NAME)
        .await
        .context("Failed to connect to Postgres")?;

    let replication = &config.replication;
    let status = source
        .check_setup(&replication.slot_name, replication.publication_name())
        .await
        .context("Failed to inspect replication setup")?;

    println!("\nReplication:");
    match &status.slot {
        SlotStatus::Ready {
            confirmed_flush_lsn,
            active,
        } => println!(
            "  {} slot '{}' (confirmed {}, {})",
            "✓".green(),
            replication.slot_name,
            confirmed_flush_lsn.map_or_else(|| "-".to_string(), format_lsn),
            if *active { "active" } else { "inactive" }
        ),
        SlotStatus::WrongPlugin { plugin } => println!(
            "  {} slot '{}' uses plugin {}; it will be recreated",
            "!".yellow(),
            replication.slot_name,
            plugin.as_deref().unwrap_or("unknown")
        ),
        SlotStatus::Missing => println!(
            "  {} slot '{}' does not exist yet",
            "-".dimmed(),
            replication.slot_name
        ),
    }
    match &status.publication {
        PublicationStatus::Exists { tables } => println!(
            "  {} publication '{}' ({} tables)",
            "✓".green(),
            replication.publication_name(),
            tables.len()
        ),
        PublicationStatus::Missing => println!(
            "  {} publication '{}' does not exist yet",
            "-".dimmed(),
            replication.publication_name()
        ),
    }

    println!("\nTables:");
    let types = TypeRegistry::new();
    let mut problems = 0;
    for table in &config.tables {
        let name = TableName::parse(&table.name)?;
        match source.describe_table(&name).await {
            Ok(catalog) => match describe_problem(&catalog) {
                None => println!(
                    "  {} {} ({} columns){}",
                    "✓".green(),
                    name,
                    catalog.columns.len(),
                    blob_note(&types, &catalog)
                ),
                Some(problem) => {
                    problems += 1;
                    println!("  {} {}: {}", "✗".red(), name, problem);
                }
            },
            Err(PgError::TableNotFound { .. }) => {
                problems += 1;
                println!("  {} {}: table does not exist", "✗".red(), name);
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to describe {}", name)),
        }
    }

    if problems > 0 {
        anyhow::bail!("{} configured table(s) cannot be replicated", problems);
    }
    println!("\n{}", "Ready to run.".green());
    Ok(())
}

fn describe_problem(catalog: &TableCatalog) -> Option<&'static str> {
    if catalog.columns.is_empty() {
        Some("table has no columns")
    } else if !catalog.columns.iter().any(|c| c.primary_key) {
        Some("table has no primary key")
    } else {
        None
    }
}

/// Columns whose type is not decoded natively end up as raw BLOBs.
fn blob_note(types: &TypeRegistry, catalog: &TableCatalog) -> String {
    let raw: Vec<&str> = catalog
        .columns
        .iter()
        .filter(|c| !types.is_known(c.type_oid))
        .map(|c| c.name.as_str())
        .collect();
    if raw.is_empty() {
        String::new()
    } else {
        format!(", stored as raw bytes: {}", raw.join(", "))
    }
}
