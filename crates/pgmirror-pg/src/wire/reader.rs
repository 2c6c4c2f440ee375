use byteorder::{BigEndian, ReadBytesExt};
use std::io::Cursor;

use crate::error::{PgError, PgResult};

/// Bounds-checked big-endian reader over a byte slice. Every read that runs
/// past the end fails with the given error constructor instead of panicking.
pub(crate) struct ByteReader<'a> {
    cursor: Cursor<&'a [u8]>,
    error: fn(String) -> PgError,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8], error: fn(String) -> PgError) -> Self {
        Self {
            cursor: Cursor::new(data),
            error,
        }
    }

    pub fn remaining(&self) -> usize {
        let data = *self.cursor.get_ref();
        data.len().saturating_sub(self.cursor.position() as usize)
    }

    fn truncated(&self, what: &str) -> PgError {
        (self.error)(format!(
            "truncated {} at offset {}",
            what,
            self.cursor.position()
        ))
    }

    pub fn read_u8(&mut self) -> PgResult<u8> {
        self.cursor.read_u8().map_err(|_| self.truncated("u8"))
    }

    pub fn read_i16(&mut self) -> PgResult<i16> {
        self.cursor
            .read_i16::<BigEndian>()
            .map_err(|_| self.truncated("i16"))
    }

    pub fn read_i32(&mut self) -> PgResult<i32> {
        self.cursor
            .read_i32::<BigEndian>()
            .map_err(|_| self.truncated("i32"))
    }

    pub fn read_u32(&mut self) -> PgResult<u32> {
        self.cursor
            .read_u32::<BigEndian>()
            .map_err(|_| self.truncated("u32"))
    }

    pub fn read_i64(&mut self) -> PgResult<i64> {
        self.cursor
            .read_i64::<BigEndian>()
            .map_err(|_| self.truncated("i64"))
    }

    pub fn read_u64(&mut self) -> PgResult<u64> {
        self.cursor
            .read_u64::<BigEndian>()
            .map_err(|_| self.truncated("u64"))
    }

    /// Read exactly `len` bytes, checking the length against what is left
    /// before touching the data.
    pub fn read_bytes(&mut self, len: usize) -> PgResult<&'a [u8]> {
        if len > self.remaining() {
            return Err((self.error)(format!(
                "declared length {} exceeds remaining {} bytes",
                len,
                self.remaining()
            )));
        }
        let start = self.cursor.position() as usize;
        let data: &'a [u8] = *self.cursor.get_ref();
        self.cursor.set_position((start + len) as u64);
        Ok(&data[start..start + len])
    }

    /// Read a length prefixed by a signed 32-bit integer, rejecting negatives.
    pub fn read_len_prefixed(&mut self) -> PgResult<&'a [u8]> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err((self.error)(format!("negative length {}", len)));
        }
        self.read_bytes(len as usize)
    }

    /// Read a NUL-terminated string.
    pub fn read_cstr(&mut self) -> PgResult<String> {
        let start = self.cursor.position() as usize;
        let data: &'a [u8] = *self.cursor.get_ref();
        let rest = data.get(start..).unwrap_or_default();
        match rest.iter().position(|b| *b == 0) {
            Some(end) => {
                self.cursor.set_position((start + end + 1) as u64);
                Ok(String::from_utf8_lossy(&rest[..end]).into_owned())
            }
            None => Err(self.truncated("string")),
        }
    }

    pub fn read_rest(&mut self) -> &'a [u8] {
        let start = self.cursor.position() as usize;
        let data: &'a [u8] = *self.cursor.get_ref();
        self.cursor.set_position(data.len() as u64);
        data.get(start..).unwrap_or_default()
    }
}
