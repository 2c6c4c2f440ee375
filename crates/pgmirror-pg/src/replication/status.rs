//! Read-only report on the slot and publication a mirror uses.

use pgmirror_core::TableName;
use tokio_postgres::Client;

use super::slot::{slot_info, SlotInfo};
use crate::error::PgResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotStatus {
    /// A pgoutput slot; `confirmed_flush_lsn` is where streaming resumes.
    Ready {
        confirmed_flush_lsn: Option<u64>,
        active: bool,
    },
    /// Bound to another output plugin; the next start recreates it.
    WrongPlugin { plugin: Option<String> },
    Missing,
}

impl From<Option<SlotInfo>> for SlotStatus {
    fn from(info: Option<SlotInfo>) -> Self {
        match info {
            Some(info) if info.uses_pgoutput() => SlotStatus::Ready {
                confirmed_flush_lsn: info.confirmed_flush_lsn,
                active: info.active,
            },
            Some(info) => SlotStatus::WrongPlugin {
                plugin: info.plugin,
            },
            None => SlotStatus::Missing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicationStatus {
    Exists { tables: Vec<TableName> },
    Missing,
}

#[derive(Debug, Clone)]
pub struct ReplicationStatus {
    pub slot: SlotStatus,
    pub publication: PublicationStatus,
}

impl ReplicationStatus {
    /// Both exist and the slot can be resumed.
    pub fn is_ready(&self) -> bool {
        matches!(self.slot, SlotStatus::Ready { .. })
            && matches!(self.publication, PublicationStatus::Exists { .. })
    }
}

pub async fn check_replication_setup(
    client: &Client,
    slot_name: &str,
    publication_name: &str,
) -> PgResult<ReplicationStatus> {
    let slot = slot_info(client, slot_name).await?.into();

    // One row per member table; a single row of NULLs for an empty publication.
    let rows = client
        .query(
            "SELECT t.schemaname::text, t.tablename::text \
             FROM pg_publication p \
             LEFT JOIN pg_publication_tables t ON t.pubname = p.pubname \
             WHERE p.pubname = $1 \
             ORDER BY 1, 2",
            &[&publication_name],
        )
        .await?;

    let publication = if rows.is_empty() {
        PublicationStatus::Missing
    } else {
        let tables = rows
            .iter()
            .filter_map(|row| {
                let schema: Option<String> = row.get(0);
                let table: Option<String> = row.get(1);
                Some(TableName::new(schema?, table?))
            })
            .collect();
        PublicationStatus::Exists { tables }
    };

    Ok(ReplicationStatus { slot, publication })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(plugin: Option<&str>) -> SlotInfo {
        SlotInfo {
            plugin: plugin.map(String::from),
            confirmed_flush_lsn: Some(0x16B3748),
            active: true,
        }
    }

    #[test]
    fn test_slot_status_from_info() {
        assert_eq!(
            SlotStatus::from(Some(info(Some("pgoutput")))),
            SlotStatus::Ready {
                confirmed_flush_lsn: Some(0x16B3748),
                active: true
            }
        );
        assert_eq!(
            SlotStatus::from(Some(info(Some("test_decoding")))),
            SlotStatus::WrongPlugin {
                plugin: Some("test_decoding".to_string())
            }
        );
        assert_eq!(SlotStatus::from(None), SlotStatus::Missing);
    }

    #[test]
    fn test_is_ready_needs_slot_and_publication() {
        let ready = ReplicationStatus {
            slot: Some(info(Some("pgoutput"))).into(),
            publication: PublicationStatus::Exists { tables: vec![] },
        };
        assert!(ready.is_ready());

        let no_publication = ReplicationStatus {
            publication: PublicationStatus::Missing,
            ..ready.clone()
        };
        assert!(!no_publication.is_ready());

        let wrong_plugin = ReplicationStatus {
            slot: Some(info(Some("wal2json"))).into(),
            ..ready
        };
        assert!(!wrong_plugin.is_ready());
    }
}
