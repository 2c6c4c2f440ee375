//! Streaming replication frames carried inside CopyData.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-replication.html

use bytes::{BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

use super::ByteReader;
use crate::error::{PgError, PgResult};

/// Seconds between the Unix epoch and 2000-01-01.
const PG_EPOCH_OFFSET_SECS: u64 = 946_684_800;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAlive {
    pub wal_end: u64,
    pub server_time: i64,
    pub reply_requested: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XLogData {
    pub wal_start: u64,
    pub wal_end: u64,
    pub server_time: i64,
    pub data: Bytes,
}

impl XLogData {
    /// Log position just past this frame's payload.
    pub fn end_lsn(&self) -> u64 {
        self.wal_start.saturating_add(self.data.len() as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationFrame {
    KeepAlive(KeepAlive),
    XLogData(XLogData),
}

/// Decode the payload of one CopyData message received while streaming.
pub fn decode_frame(payload: Bytes) -> PgResult<ReplicationFrame> {
    let mut reader = ByteReader::new(&payload, PgError::Framing);
    match reader.read_u8()? {
        b'k' => Ok(ReplicationFrame::KeepAlive(KeepAlive {
            wal_end: reader.read_u64()?,
            server_time: reader.read_i64()?,
            reply_requested: reader.read_u8()? != 0,
        })),
        b'w' => {
            let wal_start = reader.read_u64()?;
            let wal_end = reader.read_u64()?;
            let server_time = reader.read_i64()?;
            let header_len = payload.len() - reader.remaining();
            Ok(ReplicationFrame::XLogData(XLogData {
                wal_start,
                wal_end,
                server_time,
                data: payload.slice(header_len..),
            }))
        }
        other => Err(PgError::framing(format!(
            "unknown replication frame tag '{}' (0x{:02X})",
            other as char, other
        ))),
    }
}

/// Current time in microseconds since 2000-01-01.
pub fn pg_now_micros() -> i64 {
    let pg_epoch = UNIX_EPOCH + std::time::Duration::from_secs(PG_EPOCH_OFFSET_SECS);
    SystemTime::now()
        .duration_since(pg_epoch)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Build a standby status update reporting `lsn` as written, flushed and
/// applied.
pub fn encode_standby_status(lsn: u64, now_micros: i64, reply_requested: bool) -> Bytes {
    let mut payload = BytesMut::with_capacity(34);
    payload.put_u8(b'r');
    payload.put_u64(lsn);
    payload.put_u64(lsn);
    payload.put_u64(lsn);
    payload.put_i64(now_micros);
    payload.put_u8(reply_requested as u8);
    payload.freeze()
}
