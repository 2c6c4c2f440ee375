//! Control-connection helpers for logical replication: LSNs, slots,
//! publications and catalog lookups.

pub mod catalog;
pub mod lsn;
pub mod publication;
pub mod slot;
pub mod status;

pub use catalog::{describe_table, CatalogColumn, TableCatalog};
pub use lsn::{format_lsn, parse_lsn};
pub use publication::{quote_ident, quote_table_name};
pub use slot::{drop_slot, ensure_slot, slot_info, SlotInfo};
pub use status::{check_replication_setup, PublicationStatus, ReplicationStatus, SlotStatus};
