//! Replication-mode connection speaking the frontend/backend protocol
//! directly: startup, authentication, `START_REPLICATION` and the CopyBoth
//! exchange that follows it.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-flow.html

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use postgres_protocol::authentication;
use postgres_protocol::authentication::sasl::{ChannelBinding, ScramSha256, SCRAM_SHA_256};
use postgres_protocol::message::{backend, frontend};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_postgres::tls::{MakeTlsConnect, TlsConnect};
use tracing::{debug, info, warn};

use crate::connect::{make_tls_connector, ConnectionParams};
use crate::error::{PgError, PgResult};
use crate::replication::format_lsn;
use crate::source::ReplicationTransport;
use crate::wire::{encode_standby_status, frame::pg_now_micros, ByteReader};

trait PgStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> PgStream for T {}

const READ_CHUNK: usize = 64 * 1024;

/// A backend message: tag byte plus body (length prefix stripped).
struct RawMessage {
    tag: u8,
    /// The full message including tag and length, for `backend::Message::parse`.
    raw: BytesMut,
}

impl RawMessage {
    fn body(&self) -> &[u8] {
        &self.raw[5..]
    }
}

/// A connection in replication mode.
pub struct ReplicationConnection {
    stream: Box<dyn PgStream>,
    buf: BytesMut,
    streaming: bool,
}

impl ReplicationConnection {
    /// Connect, authenticate and wait for ReadyForQuery.
    pub async fn connect(params: &ConnectionParams, application_name: &str) -> PgResult<Self> {
        info!(host = %params.host, port = params.port, user = %params.user, "Opening replication connection");

        let stream = open_stream(params).await?;
        let mut conn = Self {
            stream,
            buf: BytesMut::with_capacity(READ_CHUNK),
            streaming: false,
        };

        let startup = [
            ("user", params.user.as_str()),
            ("database", params.database.as_str()),
            ("replication", "database"),
            ("application_name", application_name),
        ];
        let mut out = BytesMut::new();
        frontend::startup_message(startup.iter().copied(), &mut out)?;
        conn.write(&out).await?;

        conn.authenticate(params).await?;
        conn.wait_ready().await?;
        Ok(conn)
    }

    /// Enter CopyBoth mode streaming the given slot from `start_lsn`.
    pub async fn start_replication(
        &mut self,
        slot_name: &str,
        publication_name: &str,
        start_lsn: u64,
    ) -> PgResult<()> {
        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL {} (proto_version '1', publication_names '{}')",
            slot_name,
            format_lsn(start_lsn),
            publication_name.replace('\'', "''")
        );
        debug!(query = %query, "Starting replication");

        let mut out = BytesMut::new();
        frontend::query(&query, &mut out)?;
        self.write(&out).await?;

        loop {
            let msg = self.read_message().await?;
            match msg.tag {
                b'W' => {
                    info!(slot = %slot_name, lsn = %format_lsn(start_lsn), "Entered CopyBoth mode");
                    self.streaming = true;
                    return Ok(());
                }
                b'E' => return Err(parse_error_response(msg.body())),
                b'N' => log_notice(msg.body()),
                other => {
                    return Err(PgError::Replication(format!(
                        "unexpected response to START_REPLICATION: '{}'",
                        other as char
                    )))
                }
            }
        }
    }

    async fn authenticate(&mut self, params: &ConnectionParams) -> PgResult<()> {
        let mut scram: Option<ScramSha256> = None;

        loop {
            let mut msg = self.read_message().await?;
            if msg.tag == b'E' {
                return Err(PgError::Auth(parse_error_response(msg.body()).to_string()));
            }
            if msg.tag != b'R' {
                return Err(PgError::Auth(format!(
                    "unexpected message during authentication: '{}'",
                    msg.tag as char
                )));
            }

            let parsed = backend::Message::parse(&mut msg.raw)?
                .ok_or_else(|| PgError::framing("incomplete authentication message"))?;
            let mut out = BytesMut::new();

            match parsed {
                backend::Message::AuthenticationOk => {
                    debug!("Authentication successful");
                    return Ok(());
                }
                backend::Message::AuthenticationCleartextPassword => {
                    frontend::password_message(params.password.as_bytes(), &mut out)?;
                }
                backend::Message::AuthenticationMd5Password(body) => {
                    let hash = authentication::md5_hash(
                        params.user.as_bytes(),
                        params.password.as_bytes(),
                        body.salt(),
                    );
                    frontend::password_message(hash.as_bytes(), &mut out)?;
                }
                backend::Message::AuthenticationSasl(_) => {
                    let state = ScramSha256::new(params.password.as_bytes(), ChannelBinding::unsupported());
                    frontend::sasl_initial_response(SCRAM_SHA_256, state.message(), &mut out)?;
                    scram = Some(state);
                }
                backend::Message::AuthenticationSaslContinue(body) => {
                    let state = scram
                        .as_mut()
                        .ok_or_else(|| PgError::Auth("SASL continue without SASL start".into()))?;
                    state
                        .update(body.data())
                        .map_err(|e| PgError::Auth(e.to_string()))?;
                    frontend::sasl_response(state.message(), &mut out)?;
                }
                backend::Message::AuthenticationSaslFinal(body) => {
                    let state = scram
                        .as_mut()
                        .ok_or_else(|| PgError::Auth("SASL final without SASL start".into()))?;
                    state
                        .finish(body.data())
                        .map_err(|e| PgError::Auth(e.to_string()))?;
                    continue;
                }
                _ => {
                    return Err(PgError::Auth("unsupported authentication method".into()));
                }
            }

            self.write(&out).await?;
        }
    }

    async fn wait_ready(&mut self) -> PgResult<()> {
        loop {
            let msg = self.read_message().await?;
            match msg.tag {
                b'Z' => return Ok(()),
                b'E' => return Err(parse_error_response(msg.body())),
                b'N' => log_notice(msg.body()),
                // ParameterStatus, BackendKeyData
                _ => {}
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> PgResult<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Split one complete message off the read buffer, if there is one.
    fn take_message(&mut self) -> PgResult<Option<RawMessage>> {
        if self.buf.len() < 5 {
            return Ok(None);
        }
        let len = i32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
        if len < 4 {
            return Err(PgError::framing(format!("invalid message length {}", len)));
        }
        let total = 1 + len as usize;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }
        let raw = self.buf.split_to(total);
        Ok(Some(RawMessage { tag: raw[0], raw }))
    }

    /// Read the next backend message. Cancel safe: a partially received
    /// message stays in the buffer for the next call.
    async fn read_message(&mut self) -> PgResult<RawMessage> {
        loop {
            if let Some(msg) = self.take_message()? {
                return Ok(msg);
            }
            if self.buf.capacity() - self.buf.len() < READ_CHUNK / 4 {
                self.buf.reserve(READ_CHUNK);
            }
            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(PgError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                )));
            }
        }
    }
}

#[async_trait]
impl ReplicationTransport for ReplicationConnection {
    async fn recv(&mut self) -> PgResult<Option<Bytes>> {
        loop {
            let mut msg = self.read_message().await?;
            match msg.tag {
                b'd' => {
                    msg.raw.advance(5);
                    return Ok(Some(msg.raw.freeze()));
                }
                b'c' => {
                    self.streaming = false;
                    return Ok(None);
                }
                b'E' => return Err(parse_error_response(msg.body())),
                b'N' => log_notice(msg.body()),
                b'C' | b'Z' if !self.streaming => return Ok(None),
                other => debug!(tag = %(other as char), "Ignoring message while streaming"),
            }
        }
    }

    async fn send_status(&mut self, lsn: u64) -> PgResult<()> {
        let payload = encode_standby_status(lsn, pg_now_micros(), false);
        let mut out = BytesMut::with_capacity(5 + payload.len());
        out.put_u8(b'd');
        out.put_i32((payload.len() + 4) as i32);
        out.put_slice(&payload);
        self.write(&out).await?;
        debug!(lsn = %format_lsn(lsn), "Sent standby status update");
        Ok(())
    }

    async fn close(&mut self) -> PgResult<()> {
        let mut out = BytesMut::new();
        if self.streaming {
            frontend::copy_done(&mut out);
            self.streaming = false;
        }
        frontend::terminate(&mut out);
        self.write(&out).await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}

async fn open_stream(params: &ConnectionParams) -> PgResult<Box<dyn PgStream>> {
    let mut tcp = TcpStream::connect((params.host.as_str(), params.port))
        .await
        .map_err(|e| PgError::Connection(format!("{}:{}: {}", params.host, params.port, e)))?;
    tcp.set_nodelay(true)?;

    if !params.requires_tls() {
        return Ok(Box::new(tcp));
    }

    let mut out = BytesMut::new();
    frontend::ssl_request(&mut out);
    tcp.write_all(&out).await?;
    if tcp.read_u8().await? != b'S' {
        return Err(PgError::Connection("server does not support TLS".into()));
    }

    let mut connector = make_tls_connector()?;
    let tls = MakeTlsConnect::<TcpStream>::make_tls_connect(&mut connector, &params.host)
        .map_err(|e| PgError::Connection(format!("TLS setup failed: {}", boxed(e))))?;
    let stream = tls
        .connect(tcp)
        .await
        .map_err(|e| PgError::Connection(format!("TLS handshake failed: {}", boxed(e))))?;
    Ok(Box::new(stream))
}

fn boxed(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Box<dyn std::error::Error + Sync + Send> {
    e.into()
}

/// Pull the severity, code and message fields out of an ErrorResponse or
/// NoticeResponse body.
fn parse_fields(body: &[u8]) -> (String, String, String) {
    let mut severity = String::new();
    let mut code = String::new();
    let mut message = String::new();

    let mut reader = ByteReader::new(body, PgError::Framing);
    while let Ok(field) = reader.read_u8() {
        if field == 0 {
            break;
        }
        let Ok(value) = reader.read_cstr() else {
            break;
        };
        match field {
            b'V' => severity = value,
            b'S' if severity.is_empty() => severity = value,
            b'C' => code = value,
            b'M' => message = value,
            _ => {}
        }
    }
    (severity, code, message)
}

fn parse_error_response(body: &[u8]) -> PgError {
    let (severity, code, message) = parse_fields(body);
    PgError::Server {
        severity,
        code,
        message,
    }
}

fn log_notice(body: &[u8]) {
    let (severity, code, message) = parse_fields(body);
    warn!(severity = %severity, code = %code, "Server notice: {}", message);
}
