//! Publication management.
//!
//! The publication starts empty and tables are added or removed one at a
//! time as they are registered.

use pgmirror_core::TableName;
use tokio_postgres::Client;
use tracing::{debug, info};

use crate::error::{PgError, PgResult};

/// Quote an identifier for use in SQL (double quotes).
pub fn quote_ident(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Quote a qualified table name (`"schema"."table"`).
pub fn quote_table_name(table: &TableName) -> String {
    format!("{}.{}", quote_ident(table.schema()), quote_ident(table.table()))
}

pub async fn publication_exists(client: &Client, publication_name: &str) -> PgResult<bool> {
    let row = client
        .query_opt("SELECT 1 FROM pg_publication WHERE pubname = $1", &[&publication_name])
        .await?;
    Ok(row.is_some())
}

/// Create the publication, empty, unless it already exists.
pub async fn ensure_publication(client: &Client, publication_name: &str) -> PgResult<()> {
    if publication_exists(client, publication_name).await? {
        debug!(publication = %publication_name, "Publication exists");
        return Ok(());
    }
    info!(publication = %publication_name, "Creating publication");
    client
        .batch_execute(&format!("CREATE PUBLICATION {}", quote_ident(publication_name)))
        .await?;
    Ok(())
}

pub async fn drop_publication(client: &Client, publication_name: &str) -> PgResult<()> {
    info!(publication = %publication_name, "Dropping publication");
    client
        .batch_execute(&format!("DROP PUBLICATION IF EXISTS {}", quote_ident(publication_name)))
        .await?;
    Ok(())
}

pub async fn publication_has_table(
    client: &Client,
    publication_name: &str,
    table: &TableName,
) -> PgResult<bool> {
    let row = client
        .query_opt(
            "SELECT 1 FROM pg_publication_tables \
             WHERE pubname = $1 AND schemaname = $2 AND tablename = $3",
            &[&publication_name, &table.schema(), &table.table()],
        )
        .await?;
    Ok(row.is_some())
}

#[derive(Debug, Clone, Copy)]
enum Membership {
    Add,
    Drop,
}

async fn alter_membership(
    client: &Client,
    publication_name: &str,
    table: &TableName,
    change: Membership,
) -> PgResult<()> {
    let verb = match change {
        Membership::Add => "ADD",
        Membership::Drop => "DROP",
    };
    info!(publication = %publication_name, table = %table, change = verb, "Altering publication");
    let sql = format!(
        "ALTER PUBLICATION {} {} TABLE {}",
        quote_ident(publication_name),
        verb,
        quote_table_name(table)
    );
    client.batch_execute(&sql).await.map_err(|e| {
        PgError::Replication(format!(
            "{} {} on publication {}: {}",
            verb.to_lowercase(),
            table,
            publication_name,
            e
        ))
    })
}

pub async fn add_table_to_publication(
    client: &Client,
    publication_name: &str,
    table: &TableName,
) -> PgResult<()> {
    alter_membership(client, publication_name, table, Membership::Add).await
}

pub async fn drop_table_from_publication(
    client: &Client,
    publication_name: &str,
    table: &TableName,
) -> PgResult<()> {
    alter_membership(client, publication_name, table, Membership::Drop).await
}
