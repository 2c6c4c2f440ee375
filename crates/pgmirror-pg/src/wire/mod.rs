//! Decoders for the source's binary wire formats: COPY BINARY snapshots,
//! replication stream frames and pgoutput logical messages.

pub mod copy;
pub mod frame;
pub mod pgoutput;
mod reader;

pub use copy::{CopyBinaryDecoder, RawTuple, COPY_SIGNATURE};
pub use frame::{decode_frame, encode_standby_status, KeepAlive, ReplicationFrame, XLogData};
pub use pgoutput::{
    ColumnInfo, ColumnValue, PgOutputDecoder, PgOutputMessage, RelationMessage, ReplicaIdentity,
    TupleData,
};
pub(crate) use reader::ByteReader;
