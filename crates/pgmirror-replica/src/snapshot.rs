//! Initial (and post-drift) bulk load of a table through COPY BINARY.

use std::time::Instant;

use futures::StreamExt;
use pgmirror_core::TableName;
use pgmirror_pg::wire::CopyBinaryDecoder;
use pgmirror_pg::Source;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::applier::Replica;
use crate::error::ReplicaResult;

/// Stream a table's rows from the source into its registered local table.
///
/// The writer lock is taken once per received chunk, so streaming apply for
/// other tables interleaves with the load. Events for this table stay queued
/// in the registry until the caller finishes loading.
pub(crate) async fn load_snapshot<S: Source>(
    source: &S,
    replica: &Mutex<Replica>,
    table: &TableName,
    filter_query: Option<&str>,
) -> ReplicaResult<u64> {
    let started = Instant::now();
    let mut stream = source.copy_out(table, filter_query).await?;
    let mut decoder = CopyBinaryDecoder::new();
    let mut loaded = 0u64;

    while let Some(chunk) = stream.next().await {
        let tuples = decoder.feed(&chunk?)?;
        if tuples.is_empty() {
            continue;
        }
        let count = tuples.len();
        loaded += replica.lock().await.load_rows(table, tuples)?;
        debug!(table = %table, tuples = count, "Loaded snapshot chunk");
    }

    let decoded = decoder.finish()?;
    info!(
        table = %table,
        rows = loaded,
        skipped = decoded.saturating_sub(loaded),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Snapshot complete"
    );
    Ok(loaded)
}
