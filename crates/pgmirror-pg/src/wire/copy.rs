//! COPY BINARY stream decoder.
//!
//! Reference: https://www.postgresql.org/docs/current/sql-copy.html#id-1.9.3.55.9.4

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{PgError, PgResult};

/// Fixed 11-byte file signature.
pub const COPY_SIGNATURE: &[u8; 11] = b"PGCOPY\n\xff\r\n\0";

/// One decoded tuple: raw binary field values, `None` for NULL.
pub type RawTuple = Vec<Option<Bytes>>;

const HEADER_FIXED_LEN: usize = COPY_SIGNATURE.len() + 4 + 4;

/// Incremental decoder for a COPY BINARY stream. Bytes may be fed in chunks
/// split at arbitrary points; only complete tuples are emitted.
#[derive(Debug, Default)]
pub struct CopyBinaryDecoder {
    buf: BytesMut,
    header_read: bool,
    finished: bool,
    tuples: u64,
}

impl CopyBinaryDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn is_finished(&self) -> bool {
        self.finished
    }

    /// Append a chunk and return every tuple it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> PgResult<Vec<RawTuple>> {
        if self.finished {
            return Ok(Vec::new());
        }
        self.buf.extend_from_slice(chunk);

        if !self.header_read && !self.read_header()? {
            return Ok(Vec::new());
        }

        let mut tuples = Vec::new();
        while !self.finished {
            match self.read_tuple()? {
                Some(tuple) => {
                    self.tuples += 1;
                    tuples.push(tuple);
                }
                None => break,
            }
        }
        Ok(tuples)
    }

    /// Check that the stream ended cleanly: header seen and no partial tuple
    /// left behind.
    pub fn finish(self) -> PgResult<u64> {
        if !self.header_read {
            return Err(PgError::framing("COPY stream ended before header"));
        }
        if !self.finished && !self.buf.is_empty() {
            return Err(PgError::framing(format!(
                "COPY stream ended inside a tuple ({} bytes left)",
                self.buf.len()
            )));
        }
        Ok(self.tuples)
    }

    /// Consume the header if it is complete. Fails as soon as the bytes seen
    /// so far contradict the signature.
    fn read_header(&mut self) -> PgResult<bool> {
        let seen = self.buf.len().min(COPY_SIGNATURE.len());
        if self.buf[..seen] != COPY_SIGNATURE[..seen] {
            return Err(PgError::framing("invalid COPY BINARY signature"));
        }
        if self.buf.len() < HEADER_FIXED_LEN {
            return Ok(false);
        }

        let ext_len = i32::from_be_bytes([
            self.buf[15],
            self.buf[16],
            self.buf[17],
            self.buf[18],
        ]);
        if ext_len < 0 {
            return Err(PgError::framing(format!(
                "negative header extension length {}",
                ext_len
            )));
        }
        let header_len = HEADER_FIXED_LEN + ext_len as usize;
        if self.buf.len() < header_len {
            return Ok(false);
        }

        self.buf.advance(header_len);
        self.header_read = true;
        Ok(true)
    }

    /// Decode one tuple if the buffer holds all of it.
    fn read_tuple(&mut self) -> PgResult<Option<RawTuple>> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let count = i16::from_be_bytes([self.buf[0], self.buf[1]]);
        if count == -1 {
            self.buf.advance(2);
            self.finished = true;
            return Ok(None);
        }
        if count < 0 {
            return Err(PgError::framing(format!("invalid field count {}", count)));
        }

        // Walk the field lengths first so nothing is consumed until the
        // whole tuple is available.
        let mut offset = 2;
        let mut spans = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if self.buf.len() < offset + 4 {
                return Ok(None);
            }
            let len = i32::from_be_bytes([
                self.buf[offset],
                self.buf[offset + 1],
                self.buf[offset + 2],
                self.buf[offset + 3],
            ]);
            offset += 4;
            match len {
                -1 => spans.push(None),
                len if len < -1 => {
                    return Err(PgError::framing(format!("invalid field length {}", len)))
                }
                len => {
                    let end = offset + len as usize;
                    if self.buf.len() < end {
                        return Ok(None);
                    }
                    spans.push(Some(offset..end));
                    offset = end;
                }
            }
        }

        let data = self.buf.split_to(offset).freeze();
        Ok(Some(
            spans
                .into_iter()
                .map(|span| span.map(|range| data.slice(range)))
                .collect(),
        ))
    }
}
