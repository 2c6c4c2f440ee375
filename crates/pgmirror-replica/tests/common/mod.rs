//! Test fixtures: an in-memory source, scripted replication streams and
//! encoders for the wire formats the engine consumes.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use pgmirror_core::TableName;
use pgmirror_pg::replication::CatalogColumn;
use pgmirror_pg::wire::COPY_SIGNATURE;
use pgmirror_pg::{
    CopyStream, PgError, PgResult, ReplicationTransport, SlotStart, Source, TableCatalog,
};
use pgmirror_replica::{Engine, EngineConfig, SessionHandle};
use pgmirror_store::LocalStore;
use tokio::sync::{mpsc, Notify};

pub const SLOT: &str = "pgmirror_test";
pub const INITIAL_LSN: u64 = 0x1000;

// ---------------------------------------------------------------------------
// Fake source
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeTable {
    catalog: Option<TableCatalog>,
    copy_chunks: Vec<Bytes>,
    /// When set, the copy stream pauses after its first chunk until notified.
    gate: Option<Arc<Notify>>,
}

#[derive(Default)]
struct FakeState {
    publications: HashMap<String, BTreeSet<TableName>>,
    slots: HashMap<String, u64>,
    tables: HashMap<TableName, FakeTable>,
    transports: VecDeque<ScriptedTransport>,
    opened: Vec<u64>,
    copies: Vec<String>,
}

/// A source backed by in-memory catalogs, canned COPY data and scripted
/// replication streams.
#[derive(Clone, Default)]
pub struct FakeSource {
    state: Arc<Mutex<FakeState>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a table: `(name, type oid, primary key)` per column.
    pub fn define_table(&self, table: &str, relation_id: u32, columns: &[(&str, u32, bool)]) {
        let name = TableName::parse(table).unwrap();
        let catalog = TableCatalog {
            relation_id,
            name: name.clone(),
            columns: columns
                .iter()
                .map(|(column, type_oid, primary_key)| CatalogColumn {
                    name: column.to_string(),
                    type_oid: *type_oid,
                    primary_key: *primary_key,
                })
                .collect(),
        };
        let mut state = self.state.lock().unwrap();
        state.tables.entry(name).or_default().catalog = Some(catalog);
    }

    /// Set the COPY BINARY bytes served for a table, split into chunks.
    pub fn set_copy_data(&self, table: &str, data: Bytes, chunk_size: usize) {
        let name = TableName::parse(table).unwrap();
        let chunks = data
            .chunks(chunk_size)
            .map(Bytes::copy_from_slice)
            .collect();
        let mut state = self.state.lock().unwrap();
        state.tables.entry(name).or_default().copy_chunks = chunks;
    }

    /// Pause the table's COPY stream after its first chunk until the
    /// returned notify fires.
    pub fn gate_copy(&self, table: &str) -> Arc<Notify> {
        let name = TableName::parse(table).unwrap();
        let gate = Arc::new(Notify::new());
        let mut state = self.state.lock().unwrap();
        state.tables.entry(name).or_default().gate = Some(gate.clone());
        gate
    }

    /// Queue a replication stream for the next `open_replication` call.
    pub fn push_transport(&self) -> StreamControl {
        let (tx, rx) = mpsc::unbounded_channel();
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(false));
        let transport = ScriptedTransport {
            rx,
            statuses: statuses.clone(),
            closed: closed.clone(),
        };
        self.state.lock().unwrap().transports.push_back(transport);
        StreamControl {
            tx,
            statuses,
            closed,
        }
    }

    pub fn publication_tables(&self, publication: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .publications
            .get(publication)
            .map(|tables| tables.iter().map(|t| t.to_string()).collect())
            .unwrap_or_default()
    }

    pub fn has_publication(&self, publication: &str) -> bool {
        self.state.lock().unwrap().publications.contains_key(publication)
    }

    pub fn has_slot(&self, slot: &str) -> bool {
        self.state.lock().unwrap().slots.contains_key(slot)
    }

    /// Start LSNs passed to `open_replication`, in call order.
    pub fn opened(&self) -> Vec<u64> {
        self.state.lock().unwrap().opened.clone()
    }

    pub fn copies(&self) -> Vec<String> {
        self.state.lock().unwrap().copies.clone()
    }
}

#[async_trait]
impl Source for FakeSource {
    async fn ensure_publication(&self, publication: &str) -> PgResult<()> {
        let mut state = self.state.lock().unwrap();
        state.publications.entry(publication.to_string()).or_default();
        Ok(())
    }

    async fn drop_publication(&self, publication: &str) -> PgResult<()> {
        self.state.lock().unwrap().publications.remove(publication);
        Ok(())
    }

    async fn publication_has_table(&self, publication: &str, table: &TableName) -> PgResult<bool> {
        let state = self.state.lock().unwrap();
        Ok(state
            .publications
            .get(publication)
            .is_some_and(|tables| tables.contains(table)))
    }

    async fn add_publication_table(&self, publication: &str, table: &TableName) -> PgResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.tables.contains_key(table) {
            return Err(PgError::Replication(format!("relation {} does not exist", table)));
        }
        state
            .publications
            .get_mut(publication)
            .ok_or_else(|| PgError::Replication(format!("publication {} missing", publication)))?
            .insert(table.clone());
        Ok(())
    }

    async fn drop_publication_table(&self, publication: &str, table: &TableName) -> PgResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(tables) = state.publications.get_mut(publication) {
            tables.remove(table);
        }
        Ok(())
    }

    async fn ensure_slot(&self, slot: &str) -> PgResult<SlotStart> {
        let mut state = self.state.lock().unwrap();
        match state.slots.get(slot) {
            Some(lsn) => Ok(SlotStart::Resumed(*lsn)),
            None => {
                state.slots.insert(slot.to_string(), INITIAL_LSN);
                Ok(SlotStart::Created(INITIAL_LSN))
            }
        }
    }

    async fn drop_slot(&self, slot: &str) -> PgResult<()> {
        match self.state.lock().unwrap().slots.remove(slot) {
            Some(_) => Ok(()),
            None => Err(PgError::SlotNotFound(slot.to_string())),
        }
    }

    async fn describe_table(&self, table: &TableName) -> PgResult<TableCatalog> {
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(table)
            .and_then(|t| t.catalog.clone())
            .ok_or_else(|| PgError::TableNotFound {
                schema: table.schema().to_string(),
                table: table.table().to_string(),
            })
    }

    async fn copy_out(&self, table: &TableName, filter_query: Option<&str>) -> PgResult<CopyStream> {
        let mut state = self.state.lock().unwrap();
        state
            .copies
            .push(filter_query.map_or_else(|| table.to_string(), String::from));
        let fake = state.tables.get(table).ok_or_else(|| PgError::TableNotFound {
            schema: table.schema().to_string(),
            table: table.table().to_string(),
        })?;
        let chunks = fake.copy_chunks.clone();
        let gate = fake.gate.clone();

        let stream = futures::stream::unfold(
            (chunks.into_iter(), gate, 0usize),
            |(mut chunks, gate, sent)| async move {
                if sent == 1 {
                    if let Some(gate) = &gate {
                        gate.notified().await;
                    }
                }
                let chunk = chunks.next()?;
                Some((Ok(chunk), (chunks, gate, sent + 1)))
            },
        );
        Ok(stream.boxed())
    }

    async fn open_replication(
        &self,
        _slot: &str,
        _publication: &str,
        start_lsn: u64,
    ) -> PgResult<Box<dyn ReplicationTransport>> {
        let mut state = self.state.lock().unwrap();
        state.opened.push(start_lsn);
        match state.transports.pop_front() {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(PgError::Connection("connection refused".into())),
        }
    }
}

// ---------------------------------------------------------------------------
// Scripted replication stream
// ---------------------------------------------------------------------------

pub enum Step {
    Frame(Bytes),
    Fail(PgError),
    End,
}

struct ScriptedTransport {
    rx: mpsc::UnboundedReceiver<Step>,
    statuses: Arc<Mutex<Vec<u64>>>,
    closed: Arc<Mutex<bool>>,
}

#[async_trait]
impl ReplicationTransport for ScriptedTransport {
    async fn recv(&mut self) -> PgResult<Option<Bytes>> {
        match self.rx.recv().await {
            Some(Step::Frame(frame)) => Ok(Some(frame)),
            Some(Step::Fail(e)) => Err(e),
            Some(Step::End) => Ok(None),
            None => std::future::pending().await,
        }
    }

    async fn send_status(&mut self, lsn: u64) -> PgResult<()> {
        self.statuses.lock().unwrap().push(lsn);
        Ok(())
    }

    async fn close(&mut self) -> PgResult<()> {
        *self.closed.lock().unwrap() = true;
        Ok(())
    }
}

/// The test's end of a scripted stream.
pub struct StreamControl {
    tx: mpsc::UnboundedSender<Step>,
    statuses: Arc<Mutex<Vec<u64>>>,
    closed: Arc<Mutex<bool>>,
}

impl StreamControl {
    pub fn send(&self, frame: Bytes) {
        let _ = self.tx.send(Step::Frame(frame));
    }

    pub fn fail(&self, error: PgError) {
        let _ = self.tx.send(Step::Fail(error));
    }

    pub fn end(&self) {
        let _ = self.tx.send(Step::End);
    }

    pub fn statuses(&self) -> Vec<u64> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

/// Feeds pgoutput messages as XLogData frames with increasing positions.
pub struct WalWriter {
    pub control: StreamControl,
    next_lsn: u64,
}

impl WalWriter {
    pub fn new(control: StreamControl, start_lsn: u64) -> Self {
        Self {
            control,
            next_lsn: start_lsn,
        }
    }

    /// Send one message and return the LSN just past it.
    pub fn send(&mut self, message: Bytes) -> u64 {
        let start = self.next_lsn;
        let end = start + message.len() as u64;
        self.control.send(xlog_data(start, end, message));
        self.next_lsn = end;
        end
    }
}

// ---------------------------------------------------------------------------
// Engine helpers
// ---------------------------------------------------------------------------

pub fn test_config() -> EngineConfig {
    EngineConfig {
        slot_name: SLOT.to_string(),
        publication_name: SLOT.to_string(),
        status_interval: Duration::from_secs(10),
        reconnect_backoff: Duration::from_secs(5),
        max_backoff: Duration::from_secs(60),
        max_reconnect_attempts: 3,
    }
}

pub fn engine(source: &FakeSource) -> Engine<FakeSource> {
    Engine::new(source.clone(), LocalStore::in_memory().unwrap(), test_config())
}

/// Wait until the session has read and applied everything up to `lsn`.
pub async fn wait_for_lsn(handle: &SessionHandle, lsn: u64) {
    let mut rx = handle.subscribe_lsn();
    tokio::time::timeout(Duration::from_secs(5), async {
        while *rx.borrow_and_update() < lsn {
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .expect("session did not reach the expected LSN");
    assert!(handle.lsn() >= lsn, "session stopped before reaching LSN {:#x}", lsn);
}

/// Poll `check` until it holds, for work that finishes off the receive loop.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {}", what);
}

// ---------------------------------------------------------------------------
// Encoders
// ---------------------------------------------------------------------------

/// A COPY BINARY stream holding the given rows.
pub fn copy_binary(rows: &[Vec<Option<Vec<u8>>>]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(COPY_SIGNATURE);
    buf.put_i32(0);
    buf.put_i32(0);
    for row in rows {
        buf.put_i16(row.len() as i16);
        for field in row {
            match field {
                Some(bytes) => {
                    buf.put_i32(bytes.len() as i32);
                    buf.put_slice(bytes);
                }
                None => buf.put_i32(-1),
            }
        }
    }
    buf.put_i16(-1);
    buf.freeze()
}

pub fn int4(v: i32) -> Option<Vec<u8>> {
    Some(v.to_be_bytes().to_vec())
}

pub fn int8(v: i64) -> Option<Vec<u8>> {
    Some(v.to_be_bytes().to_vec())
}

pub fn text(v: &str) -> Option<Vec<u8>> {
    Some(v.as_bytes().to_vec())
}

/// One streamed tuple column.
#[derive(Clone, Copy)]
pub enum Col<'a> {
    Null,
    Unchanged,
    Text(&'a str),
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_tuple(buf: &mut BytesMut, columns: &[Col<'_>]) {
    buf.put_i16(columns.len() as i16);
    for column in columns {
        match column {
            Col::Null => buf.put_u8(b'n'),
            Col::Unchanged => buf.put_u8(b'u'),
            Col::Text(value) => {
                buf.put_u8(b't');
                buf.put_i32(value.len() as i32);
                buf.put_slice(value.as_bytes());
            }
        }
    }
}

pub fn begin(xid: u32) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'B');
    buf.put_u64(0);
    buf.put_i64(0);
    buf.put_u32(xid);
    buf.freeze()
}

pub fn commit() -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'C');
    buf.put_u8(0);
    buf.put_u64(0);
    buf.put_u64(0);
    buf.put_i64(0);
    buf.freeze()
}

/// A Relation message with replica identity default.
pub fn relation(relation_id: u32, table: &str, columns: &[(&str, u32, bool)]) -> Bytes {
    let name = TableName::parse(table).unwrap();
    let mut buf = BytesMut::new();
    buf.put_u8(b'R');
    buf.put_u32(relation_id);
    put_cstr(&mut buf, name.schema());
    put_cstr(&mut buf, name.table());
    buf.put_u8(b'd');
    buf.put_i16(columns.len() as i16);
    for (column, type_oid, key) in columns {
        buf.put_u8(u8::from(*key));
        put_cstr(&mut buf, column);
        buf.put_u32(*type_oid);
        buf.put_i32(-1);
    }
    buf.freeze()
}

pub fn insert(relation_id: u32, columns: &[Col<'_>]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'I');
    buf.put_u32(relation_id);
    buf.put_u8(b'N');
    put_tuple(&mut buf, columns);
    buf.freeze()
}

/// An Update; `old_key` is sent as a 'K' tuple when the key changed.
pub fn update(relation_id: u32, old_key: Option<&[Col<'_>]>, columns: &[Col<'_>]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'U');
    buf.put_u32(relation_id);
    if let Some(old) = old_key {
        buf.put_u8(b'K');
        put_tuple(&mut buf, old);
    }
    buf.put_u8(b'N');
    put_tuple(&mut buf, columns);
    buf.freeze()
}

pub fn delete(relation_id: u32, key: &[Col<'_>]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'D');
    buf.put_u32(relation_id);
    buf.put_u8(b'K');
    put_tuple(&mut buf, key);
    buf.freeze()
}

pub fn truncate(relation_ids: &[u32]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'T');
    buf.put_u32(relation_ids.len() as u32);
    buf.put_u8(0);
    for id in relation_ids {
        buf.put_u32(*id);
    }
    buf.freeze()
}

pub fn xlog_data(wal_start: u64, wal_end: u64, message: Bytes) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'w');
    buf.put_u64(wal_start);
    buf.put_u64(wal_end);
    buf.put_i64(0);
    buf.put_slice(&message);
    buf.freeze()
}

pub fn keepalive(wal_end: u64, reply_requested: bool) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'k');
    buf.put_u64(wal_end);
    buf.put_i64(0);
    buf.put_u8(u8::from(reply_requested));
    buf.freeze()
}
