//! Logical replication slots: lookup, creation, removal and the start
//! position for streaming.

use tokio_postgres::Client;
use tracing::{info, warn};

use super::lsn::{format_lsn, parse_lsn};
use crate::error::{PgError, PgResult};
use crate::source::SlotStart;

/// Output plugin the decoder understands.
pub const PLUGIN: &str = "pgoutput";

/// A slot row from `pg_replication_slots`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub plugin: Option<String>,
    pub confirmed_flush_lsn: Option<u64>,
    pub active: bool,
}

impl SlotInfo {
    pub fn uses_pgoutput(&self) -> bool {
        self.plugin.as_deref() == Some(PLUGIN)
    }
}

pub async fn slot_info(client: &Client, slot_name: &str) -> PgResult<Option<SlotInfo>> {
    let row = client
        .query_opt(
            "SELECT plugin::text, confirmed_flush_lsn::text, active \
             FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot_name],
        )
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let confirmed_flush_lsn = row
        .get::<_, Option<String>>(1)
        .map(|lsn| parse_lsn(&lsn))
        .transpose()?;
    Ok(Some(SlotInfo {
        plugin: row.get(0),
        confirmed_flush_lsn,
        active: row.get(2),
    }))
}

async fn create_slot(client: &Client, slot_name: &str) -> PgResult<u64> {
    let lsn: String = client
        .query_one(
            "SELECT lsn::text FROM pg_create_logical_replication_slot($1, $2)",
            &[&slot_name, &PLUGIN],
        )
        .await
        .map_err(|e| PgError::SlotCreationFailed(e.to_string()))?
        .get(0);
    parse_lsn(&lsn)
}

/// Drop a replication slot. A missing slot is `SlotNotFound`.
pub async fn drop_slot(client: &Client, slot_name: &str) -> PgResult<()> {
    if slot_info(client, slot_name).await?.is_none() {
        return Err(PgError::SlotNotFound(slot_name.to_string()));
    }
    info!(slot = %slot_name, "Dropping replication slot");
    client
        .execute("SELECT pg_drop_replication_slot($1)", &[&slot_name])
        .await
        .map_err(|e| PgError::Replication(format!("failed to drop slot {}: {}", slot_name, e)))?;
    Ok(())
}

/// Ensure a pgoutput slot exists and decide where streaming starts.
///
/// An existing pgoutput slot resumes from its confirmed position. A missing
/// slot, or one bound to another plugin, is (re)created and streaming starts
/// at the position the server reports for the new slot.
pub async fn ensure_slot(client: &Client, slot_name: &str) -> PgResult<SlotStart> {
    if let Some(existing) = slot_info(client, slot_name).await? {
        match existing.confirmed_flush_lsn {
            Some(lsn) if existing.uses_pgoutput() => {
                info!(slot = %slot_name, lsn = %format_lsn(lsn), "Resuming existing replication slot");
                return Ok(SlotStart::Resumed(lsn));
            }
            _ => {
                warn!(
                    slot = %slot_name,
                    plugin = ?existing.plugin,
                    "Existing slot cannot be resumed, dropping and recreating"
                );
                drop_slot(client, slot_name).await?;
            }
        }
    }

    let lsn = create_slot(client, slot_name).await?;
    info!(slot = %slot_name, lsn = %format_lsn(lsn), "Created replication slot");
    Ok(SlotStart::Created(lsn))
}
