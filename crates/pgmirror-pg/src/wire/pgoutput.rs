//! Decoder for PostgreSQL pgoutput logical replication protocol.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-logicalrep-message-formats.html

use pgmirror_core::TableName;

use super::ByteReader;
use crate::error::{PgError, PgResult};

/// A decoded pgoutput message.
#[derive(Debug, Clone, PartialEq)]
pub enum PgOutputMessage {
    Begin(BeginMessage),
    Commit(CommitMessage),
    Relation(RelationMessage),
    Type(TypeMessage),
    Insert(InsertMessage),
    Update(UpdateMessage),
    Delete(DeleteMessage),
    Truncate(TruncateMessage),
    Origin(OriginMessage),
    Message(LogicalMessage),
}

impl PgOutputMessage {
    /// Relation the message refers to, for row-level messages.
    pub fn relation_id(&self) -> Option<u32> {
        match self {
            PgOutputMessage::Relation(m) => Some(m.relation_id),
            PgOutputMessage::Insert(m) => Some(m.relation_id),
            PgOutputMessage::Update(m) => Some(m.relation_id),
            PgOutputMessage::Delete(m) => Some(m.relation_id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PgOutputMessage::Begin(_) => "begin",
            PgOutputMessage::Commit(_) => "commit",
            PgOutputMessage::Relation(_) => "relation",
            PgOutputMessage::Type(_) => "type",
            PgOutputMessage::Insert(_) => "insert",
            PgOutputMessage::Update(_) => "update",
            PgOutputMessage::Delete(_) => "delete",
            PgOutputMessage::Truncate(_) => "truncate",
            PgOutputMessage::Origin(_) => "origin",
            PgOutputMessage::Message(_) => "message",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginMessage {
    pub final_lsn: u64,
    pub timestamp: i64, // microseconds since 2000-01-01
    pub xid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMessage {
    pub flags: u8,
    pub commit_lsn: u64,
    pub end_lsn: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationMessage {
    pub relation_id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: ReplicaIdentity,
    pub columns: Vec<ColumnInfo>,
}

impl RelationMessage {
    pub fn table_name(&self) -> TableName {
        TableName::new(&self.namespace, &self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaIdentity {
    Default, // 'd' - primary key
    Nothing, // 'n' - nothing
    Full,    // 'f' - all columns
    Index,   // 'i' - a unique index
}

impl From<u8> for ReplicaIdentity {
    fn from(b: u8) -> Self {
        match b {
            b'n' => ReplicaIdentity::Nothing,
            b'f' => ReplicaIdentity::Full,
            b'i' => ReplicaIdentity::Index,
            _ => ReplicaIdentity::Default,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub flags: u8, // 1 = part of key
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
}

impl ColumnInfo {
    pub fn is_key(&self) -> bool {
        self.flags & 1 == 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMessage {
    pub type_id: u32,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertMessage {
    pub relation_id: u32,
    pub tuple: TupleData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateMessage {
    pub relation_id: u32,
    /// Pre-image, sent when the key changed ('K') or with replica identity FULL ('O').
    pub old_tuple: Option<TupleData>,
    pub new_tuple: TupleData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteMessage {
    pub relation_id: u32,
    pub old_tuple: TupleData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncateMessage {
    pub options: u8,
    pub relation_ids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginMessage {
    pub origin_lsn: u64,
    pub origin_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalMessage {
    pub flags: u8,
    pub lsn: u64,
    pub prefix: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TupleData {
    pub columns: Vec<ColumnValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValue {
    Null,
    Unchanged, // TOASTed value not resent
    Text(String),
    Binary(Vec<u8>),
}

/// Decoder for pgoutput binary protocol messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct PgOutputDecoder;

impl PgOutputDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Decode a pgoutput message from raw bytes.
    pub fn decode(&self, data: &[u8]) -> PgResult<PgOutputMessage> {
        let Some((&msg_type, payload)) = data.split_first() else {
            return Err(PgError::PgOutput("empty message".into()));
        };
        let mut reader = ByteReader::new(payload, PgError::PgOutput);

        match msg_type {
            b'B' => self.decode_begin(&mut reader),
            b'C' => self.decode_commit(&mut reader),
            b'R' => self.decode_relation(&mut reader),
            b'Y' => self.decode_type(&mut reader),
            b'I' => self.decode_insert(&mut reader),
            b'U' => self.decode_update(&mut reader),
            b'D' => self.decode_delete(&mut reader),
            b'T' => self.decode_truncate(&mut reader),
            b'O' => self.decode_origin(&mut reader),
            b'M' => self.decode_message(&mut reader),
            other => Err(PgError::PgOutput(format!(
                "unknown message type: {} (0x{:02X})",
                other as char, other
            ))),
        }
    }

    fn decode_begin(&self, reader: &mut ByteReader<'_>) -> PgResult<PgOutputMessage> {
        Ok(PgOutputMessage::Begin(BeginMessage {
            final_lsn: reader.read_u64()?,
            timestamp: reader.read_i64()?,
            xid: reader.read_u32()?,
        }))
    }

    fn decode_commit(&self, reader: &mut ByteReader<'_>) -> PgResult<PgOutputMessage> {
        Ok(PgOutputMessage::Commit(CommitMessage {
            flags: reader.read_u8()?,
            commit_lsn: reader.read_u64()?,
            end_lsn: reader.read_u64()?,
            timestamp: reader.read_i64()?,
        }))
    }

    fn decode_relation(&self, reader: &mut ByteReader<'_>) -> PgResult<PgOutputMessage> {
        let relation_id = reader.read_u32()?;
        let namespace = reader.read_cstr()?;
        let name = reader.read_cstr()?;
        let replica_identity = reader.read_u8()?.into();
        let num_columns = self.read_count(reader)?;

        let mut columns = Vec::with_capacity(num_columns.min(reader.remaining()));
        for _ in 0..num_columns {
            columns.push(ColumnInfo {
                flags: reader.read_u8()?,
                name: reader.read_cstr()?,
                type_oid: reader.read_u32()?,
                type_modifier: reader.read_i32()?,
            });
        }

        Ok(PgOutputMessage::Relation(RelationMessage {
            relation_id,
            namespace,
            name,
            replica_identity,
            columns,
        }))
    }

    fn decode_type(&self, reader: &mut ByteReader<'_>) -> PgResult<PgOutputMessage> {
        Ok(PgOutputMessage::Type(TypeMessage {
            type_id: reader.read_u32()?,
            namespace: reader.read_cstr()?,
            name: reader.read_cstr()?,
        }))
    }

    fn decode_insert(&self, reader: &mut ByteReader<'_>) -> PgResult<PgOutputMessage> {
        let relation_id = reader.read_u32()?;
        self.expect_marker(reader, b'N', "insert")?;
        let tuple = self.decode_tuple(reader)?;

        Ok(PgOutputMessage::Insert(InsertMessage { relation_id, tuple }))
    }

    fn decode_update(&self, reader: &mut ByteReader<'_>) -> PgResult<PgOutputMessage> {
        let relation_id = reader.read_u32()?;

        let (old_tuple, new_tuple) = match reader.read_u8()? {
            b'K' | b'O' => {
                let old = self.decode_tuple(reader)?;
                self.expect_marker(reader, b'N', "update")?;
                (Some(old), self.decode_tuple(reader)?)
            }
            b'N' => (None, self.decode_tuple(reader)?),
            other => {
                return Err(PgError::PgOutput(format!(
                    "unexpected tuple type in update: '{}'",
                    other as char
                )));
            }
        };

        Ok(PgOutputMessage::Update(UpdateMessage {
            relation_id,
            old_tuple,
            new_tuple,
        }))
    }

    fn decode_delete(&self, reader: &mut ByteReader<'_>) -> PgResult<PgOutputMessage> {
        let relation_id = reader.read_u32()?;
        match reader.read_u8()? {
            b'K' | b'O' => {}
            other => {
                return Err(PgError::PgOutput(format!(
                    "expected 'K' or 'O' for delete tuple, got '{}'",
                    other as char
                )));
            }
        }
        let old_tuple = self.decode_tuple(reader)?;

        Ok(PgOutputMessage::Delete(DeleteMessage {
            relation_id,
            old_tuple,
        }))
    }

    fn decode_truncate(&self, reader: &mut ByteReader<'_>) -> PgResult<PgOutputMessage> {
        let num_relations = reader.read_u32()? as usize;
        let options = reader.read_u8()?;

        if num_relations.saturating_mul(4) > reader.remaining() {
            return Err(PgError::PgOutput(format!(
                "truncate lists {} relations but only {} bytes remain",
                num_relations,
                reader.remaining()
            )));
        }
        let mut relation_ids = Vec::with_capacity(num_relations);
        for _ in 0..num_relations {
            relation_ids.push(reader.read_u32()?);
        }

        Ok(PgOutputMessage::Truncate(TruncateMessage {
            options,
            relation_ids,
        }))
    }

    fn decode_origin(&self, reader: &mut ByteReader<'_>) -> PgResult<PgOutputMessage> {
        Ok(PgOutputMessage::Origin(OriginMessage {
            origin_lsn: reader.read_u64()?,
            origin_name: reader.read_cstr()?,
        }))
    }

    fn decode_message(&self, reader: &mut ByteReader<'_>) -> PgResult<PgOutputMessage> {
        let flags = reader.read_u8()?;
        let lsn = reader.read_u64()?;
        let prefix = reader.read_cstr()?;
        let content = reader.read_len_prefixed()?.to_vec();

        Ok(PgOutputMessage::Message(LogicalMessage {
            flags,
            lsn,
            prefix,
            content,
        }))
    }

    fn decode_tuple(&self, reader: &mut ByteReader<'_>) -> PgResult<TupleData> {
        let num_columns = self.read_count(reader)?;
        let mut columns = Vec::with_capacity(num_columns.min(reader.remaining()));

        for _ in 0..num_columns {
            let value = match reader.read_u8()? {
                b'n' => ColumnValue::Null,
                b'u' => ColumnValue::Unchanged,
                b't' => ColumnValue::Text(
                    String::from_utf8_lossy(reader.read_len_prefixed()?).into_owned(),
                ),
                b'b' => ColumnValue::Binary(reader.read_len_prefixed()?.to_vec()),
                other => {
                    return Err(PgError::PgOutput(format!(
                        "unknown column value type: '{}' (0x{:02X})",
                        other as char, other
                    )));
                }
            };
            columns.push(value);
        }

        Ok(TupleData { columns })
    }

    fn read_count(&self, reader: &mut ByteReader<'_>) -> PgResult<usize> {
        let count = reader.read_i16()?;
        if count < 0 {
            return Err(PgError::PgOutput(format!("negative column count {}", count)));
        }
        Ok(count as usize)
    }

    fn expect_marker(&self, reader: &mut ByteReader<'_>, marker: u8, context: &str) -> PgResult<()> {
        let got = reader.read_u8()?;
        if got != marker {
            return Err(PgError::PgOutput(format!(
                "expected '{}' for {} tuple, got '{}'",
                marker as char, context, got as char
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(data: &mut Vec<u8>, value: &str) {
        data.push(b't');
        data.extend_from_slice(&(value.len() as i32).to_be_bytes());
        data.extend_from_slice(value.as_bytes());
    }

    #[test]
    fn test_decode_begin() {
        let mut data = vec![b'B'];
        data.extend_from_slice(&0x16B3748u64.to_be_bytes()); // final_lsn
        data.extend_from_slice(&12345678i64.to_be_bytes()); // timestamp
        data.extend_from_slice(&123u32.to_be_bytes()); // xid

        match PgOutputDecoder::new().decode(&data).unwrap() {
            PgOutputMessage::Begin(b) => {
                assert_eq!(b.xid, 123);
                assert_eq!(b.final_lsn, 0x16B3748);
                assert_eq!(b.timestamp, 12345678);
            }
            other => panic!("expected Begin message, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_commit() {
        let mut data = vec![b'C', 0];
        data.extend_from_slice(&100u64.to_be_bytes()); // commit_lsn
        data.extend_from_slice(&200u64.to_be_bytes()); // end_lsn
        data.extend_from_slice(&12345i64.to_be_bytes()); // timestamp

        match PgOutputDecoder::new().decode(&data).unwrap() {
            PgOutputMessage::Commit(c) => {
                assert_eq!(c.commit_lsn, 100);
                assert_eq!(c.end_lsn, 200);
            }
            other => panic!("expected Commit message, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_relation() {
        let mut data = vec![b'R'];
        data.extend_from_slice(&16384u32.to_be_bytes());
        data.extend_from_slice(b"public\0");
        data.extend_from_slice(b"users\0");
        data.push(b'd');
        data.extend_from_slice(&2i16.to_be_bytes());

        data.push(1); // key
        data.extend_from_slice(b"id\0");
        data.extend_from_slice(&23u32.to_be_bytes());
        data.extend_from_slice(&(-1i32).to_be_bytes());

        data.push(0);
        data.extend_from_slice(b"name\0");
        data.extend_from_slice(&25u32.to_be_bytes());
        data.extend_from_slice(&(-1i32).to_be_bytes());

        match PgOutputDecoder::new().decode(&data).unwrap() {
            PgOutputMessage::Relation(r) => {
                assert_eq!(r.relation_id, 16384);
                assert_eq!(r.table_name(), TableName::new("public", "users"));
                assert_eq!(r.replica_identity, ReplicaIdentity::Default);
                assert_eq!(r.columns.len(), 2);
                assert!(r.columns[0].is_key());
                assert!(!r.columns[1].is_key());
                assert_eq!(r.columns[1].type_oid, 25);
            }
            other => panic!("expected Relation message, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_insert_with_null_and_unchanged() {
        let mut data = vec![b'I'];
        data.extend_from_slice(&16384u32.to_be_bytes());
        data.push(b'N');
        data.extend_from_slice(&3i16.to_be_bytes());
        text(&mut data, "1");
        data.push(b'n');
        data.push(b'u');

        match PgOutputDecoder::new().decode(&data).unwrap() {
            PgOutputMessage::Insert(i) => {
                assert_eq!(i.relation_id, 16384);
                assert_eq!(
                    i.tuple.columns,
                    vec![
                        ColumnValue::Text("1".to_string()),
                        ColumnValue::Null,
                        ColumnValue::Unchanged,
                    ]
                );
            }
            other => panic!("expected Insert message, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_update_with_key_change() {
        let mut data = vec![b'U'];
        data.extend_from_slice(&16384u32.to_be_bytes());
        data.push(b'K');
        data.extend_from_slice(&2i16.to_be_bytes());
        text(&mut data, "1");
        data.push(b'n');
        data.push(b'N');
        data.extend_from_slice(&2i16.to_be_bytes());
        text(&mut data, "7");
        text(&mut data, "bob");

        match PgOutputDecoder::new().decode(&data).unwrap() {
            PgOutputMessage::Update(u) => {
                let old = u.old_tuple.expect("old tuple");
                assert_eq!(old.columns[0], ColumnValue::Text("1".to_string()));
                assert_eq!(u.new_tuple.columns[1], ColumnValue::Text("bob".to_string()));
            }
            other => panic!("expected Update message, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_delete() {
        let mut data = vec![b'D'];
        data.extend_from_slice(&16384u32.to_be_bytes());
        data.push(b'K');
        data.extend_from_slice(&1i16.to_be_bytes());
        text(&mut data, "1");

        match PgOutputDecoder::new().decode(&data).unwrap() {
            PgOutputMessage::Delete(d) => {
                assert_eq!(d.relation_id, 16384);
                assert_eq!(d.old_tuple.columns.len(), 1);
            }
            other => panic!("expected Delete message, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_truncate() {
        let mut data = vec![b'T'];
        data.extend_from_slice(&2u32.to_be_bytes());
        data.push(0);
        data.extend_from_slice(&16384u32.to_be_bytes());
        data.extend_from_slice(&16390u32.to_be_bytes());

        match PgOutputDecoder::new().decode(&data).unwrap() {
            PgOutputMessage::Truncate(t) => assert_eq!(t.relation_ids, vec![16384, 16390]),
            other => panic!("expected Truncate message, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_messages_are_errors() {
        let decoder = PgOutputDecoder::new();
        assert!(decoder.decode(&[]).is_err());
        assert!(decoder.decode(b"B\x00\x01").is_err());

        // Declared value length runs past the end of the message.
        let mut data = vec![b'I'];
        data.extend_from_slice(&1u32.to_be_bytes());
        data.push(b'N');
        data.extend_from_slice(&1i16.to_be_bytes());
        data.push(b't');
        data.extend_from_slice(&1000i32.to_be_bytes());
        data.extend_from_slice(b"short");
        assert!(matches!(decoder.decode(&data), Err(PgError::PgOutput(_))));

        // Truncate claims more relations than it carries.
        let mut data = vec![b'T'];
        data.extend_from_slice(&u32::MAX.to_be_bytes());
        data.push(0);
        assert!(decoder.decode(&data).is_err());
    }

    #[test]
    fn test_unknown_message_type() {
        assert!(PgOutputDecoder::new().decode(b"Z").is_err());
    }
}
