mod connect;
mod error;
pub mod replication;
mod source;
mod transport;
pub mod wire;

pub use connect::{connect_postgres, ConnectionParams};
pub use error::{PgError, PgResult};
pub use replication::{format_lsn, parse_lsn, TableCatalog};
pub use source::{CopyStream, PgSource, ReplicationTransport, SlotStart, Source};
pub use transport::ReplicationConnection;
