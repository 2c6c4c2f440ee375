//! The seam between the replication engine and the source database.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use pgmirror_core::TableName;
use tokio_postgres::Client;
use tracing::info;

use crate::connect::{connect_postgres, ConnectionParams};
use crate::error::{PgError, PgResult};
use crate::replication::{self, publication, quote_table_name, slot, ReplicationStatus, TableCatalog};
use crate::transport::ReplicationConnection;

/// Raw COPY data as it arrives from the source, in arbitrary chunks.
pub type CopyStream = BoxStream<'static, PgResult<Bytes>>;

/// Where streaming starts for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStart {
    /// The slot already existed; resume from its confirmed position.
    Resumed(u64),
    /// The slot was just created; stream from its consistent point.
    Created(u64),
}

impl SlotStart {
    pub fn lsn(&self) -> u64 {
        match self {
            SlotStart::Resumed(lsn) | SlotStart::Created(lsn) => *lsn,
        }
    }
}

/// An open replication stream in CopyBoth mode.
///
/// `recv` must be cancel safe: dropping its future mid-read may not lose
/// bytes, since the session wraps it in a deadline.
#[async_trait]
pub trait ReplicationTransport: Send {
    /// The next CopyData payload, or `None` once the server ends the stream.
    async fn recv(&mut self) -> PgResult<Option<Bytes>>;

    /// Report `lsn` as written, flushed and applied.
    async fn send_status(&mut self, lsn: u64) -> PgResult<()>;

    async fn close(&mut self) -> PgResult<()>;
}

/// Everything the engine needs from the source database.
#[async_trait]
pub trait Source: Send + Sync + 'static {
    async fn ensure_publication(&self, publication: &str) -> PgResult<()>;

    async fn drop_publication(&self, publication: &str) -> PgResult<()>;

    async fn publication_has_table(&self, publication: &str, table: &TableName) -> PgResult<bool>;

    async fn add_publication_table(&self, publication: &str, table: &TableName) -> PgResult<()>;

    async fn drop_publication_table(&self, publication: &str, table: &TableName) -> PgResult<()>;

    /// Create the slot if needed and report where streaming should start.
    async fn ensure_slot(&self, slot: &str) -> PgResult<SlotStart>;

    async fn drop_slot(&self, slot: &str) -> PgResult<()>;

    /// Live columns, type ids and key flags of a table.
    async fn describe_table(&self, table: &TableName) -> PgResult<TableCatalog>;

    /// Stream a table's rows in COPY BINARY format. With a filter query, the
    /// query's result set is copied instead of the whole table.
    async fn copy_out(&self, table: &TableName, filter_query: Option<&str>) -> PgResult<CopyStream>;

    /// Open a replication connection and start streaming `slot` from `start_lsn`.
    /// An LSN of zero resumes from the slot's confirmed position.
    async fn open_replication(
        &self,
        slot: &str,
        publication: &str,
        start_lsn: u64,
    ) -> PgResult<Box<dyn ReplicationTransport>>;
}

/// Build the COPY statement for a snapshot.
pub fn copy_statement(table: &TableName, filter_query: Option<&str>) -> String {
    match filter_query.map(str::trim).filter(|q| !q.is_empty()) {
        Some(query) => format!(
            "COPY ({}) TO STDOUT WITH (FORMAT binary)",
            query.trim_end_matches(';')
        ),
        None => format!("COPY {} TO STDOUT WITH (FORMAT binary)", quote_table_name(table)),
    }
}

/// The production source: a `tokio-postgres` control connection plus raw
/// replication connections opened on demand.
pub struct PgSource {
    client: Client,
    params: ConnectionParams,
    application_name: String,
}

impl PgSource {
    pub async fn connect(connection_string: &str, application_name: &str) -> PgResult<Self> {
        let params = ConnectionParams::parse(connection_string)?;
        let client = connect_postgres(connection_string).await?;
        info!(host = %params.host, database = %params.database, "Connected to source");
        Ok(Self {
            client,
            params,
            application_name: application_name.to_string(),
        })
    }

    /// The control connection.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Inspect the slot and publication without changing anything.
    pub async fn check_setup(&self, slot: &str, publication: &str) -> PgResult<ReplicationStatus> {
        replication::check_replication_setup(&self.client, slot, publication).await
    }
}

#[async_trait]
impl Source for PgSource {
    async fn ensure_publication(&self, publication: &str) -> PgResult<()> {
        publication::ensure_publication(&self.client, publication).await
    }

    async fn drop_publication(&self, publication: &str) -> PgResult<()> {
        publication::drop_publication(&self.client, publication).await
    }

    async fn publication_has_table(&self, publication: &str, table: &TableName) -> PgResult<bool> {
        publication::publication_has_table(&self.client, publication, table).await
    }

    async fn add_publication_table(&self, publication: &str, table: &TableName) -> PgResult<()> {
        publication::add_table_to_publication(&self.client, publication, table).await
    }

    async fn drop_publication_table(&self, publication: &str, table: &TableName) -> PgResult<()> {
        publication::drop_table_from_publication(&self.client, publication, table).await
    }

    async fn ensure_slot(&self, slot_name: &str) -> PgResult<SlotStart> {
        slot::ensure_slot(&self.client, slot_name).await
    }

    async fn drop_slot(&self, slot_name: &str) -> PgResult<()> {
        slot::drop_slot(&self.client, slot_name).await
    }

    async fn describe_table(&self, table: &TableName) -> PgResult<TableCatalog> {
        replication::describe_table(&self.client, table).await
    }

    async fn copy_out(&self, table: &TableName, filter_query: Option<&str>) -> PgResult<CopyStream> {
        let statement = copy_statement(table, filter_query);
        info!(table = %table, "Starting snapshot copy");
        let stream = self.client.copy_out(statement.as_str()).await?;
        Ok(stream.map_err(PgError::from).boxed())
    }

    async fn open_replication(
        &self,
        slot_name: &str,
        publication: &str,
        start_lsn: u64,
    ) -> PgResult<Box<dyn ReplicationTransport>> {
        let mut conn = ReplicationConnection::connect(&self.params, &self.application_name).await?;
        conn.start_replication(slot_name, publication, start_lsn).await?;
        Ok(Box::new(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_start_lsn() {
        assert_eq!(SlotStart::Resumed(42).lsn(), 42);
        assert_eq!(SlotStart::Created(7).lsn(), 7);
    }

    #[test]
    fn test_copy_statement_whole_table() {
        let table = TableName::new("public", "users");
        assert_eq!(
            copy_statement(&table, None),
            "COPY \"public\".\"users\" TO STDOUT WITH (FORMAT binary)"
        );
        assert_eq!(
            copy_statement(&table, Some("   ")),
            "COPY \"public\".\"users\" TO STDOUT WITH (FORMAT binary)"
        );
    }

    #[test]
    fn test_copy_statement_filter_query() {
        let table = TableName::new("public", "users");
        assert_eq!(
            copy_statement(&table, Some("SELECT * FROM public.users WHERE active;")),
            "COPY (SELECT * FROM public.users WHERE active) TO STDOUT WITH (FORMAT binary)"
        );
    }
}
