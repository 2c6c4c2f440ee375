//! Source type lookup table.
//!
//! Maps a source type id (OID) to its local storage class plus the two
//! decoders needed to read it: one for the text wire format used by
//! streaming tuples and one for the binary format used by COPY snapshots.
//! Unknown ids resolve to a byte-string fallback instead of failing.

use byteorder::{BigEndian, ReadBytesExt};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use std::collections::HashMap;
use std::fmt::Write as _;

use crate::error::{Error, Result};
use crate::value::{StorageClass, Value};

pub mod oid {
    pub const BOOL: u32 = 16;
    pub const BYTEA: u32 = 17;
    pub const NAME: u32 = 19;
    pub const INT8: u32 = 20;
    pub const INT2: u32 = 21;
    pub const INT4: u32 = 23;
    pub const TEXT: u32 = 25;
    pub const OID: u32 = 26;
    pub const JSON: u32 = 114;
    pub const FLOAT4: u32 = 700;
    pub const FLOAT8: u32 = 701;
    pub const BPCHAR: u32 = 1042;
    pub const VARCHAR: u32 = 1043;
    pub const DATE: u32 = 1082;
    pub const TIMESTAMP: u32 = 1114;
    pub const TIMESTAMPTZ: u32 = 1184;
    pub const NUMERIC: u32 = 1700;
    pub const UUID: u32 = 2950;
    pub const JSONB: u32 = 3802;
}

/// Microseconds between the Unix epoch and the source epoch (2000-01-01).
pub const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

const MICROS_PER_DAY: i64 = 86_400_000_000;

pub type TextDecoder = fn(&str) -> Result<Value>;
pub type BinaryDecoder = fn(&[u8]) -> Result<Value>;

/// One row of the lookup table.
#[derive(Clone, Copy)]
pub struct SourceType {
    pub oid: u32,
    pub name: &'static str,
    pub storage: StorageClass,
    text: TextDecoder,
    binary: BinaryDecoder,
}

impl SourceType {
    const fn new(
        oid: u32,
        name: &'static str,
        storage: StorageClass,
        text: TextDecoder,
        binary: BinaryDecoder,
    ) -> Self {
        Self {
            oid,
            name,
            storage,
            text,
            binary,
        }
    }

    pub fn decode_text(&self, raw: &str) -> Result<Value> {
        (self.text)(raw)
    }

    pub fn decode_binary(&self, raw: &[u8]) -> Result<Value> {
        (self.binary)(raw)
    }
}

impl std::fmt::Debug for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceType")
            .field("oid", &self.oid)
            .field("name", &self.name)
            .field("storage", &self.storage)
            .finish()
    }
}

const FALLBACK: SourceType = SourceType::new(0, "unknown", StorageClass::Blob, text_raw, binary_raw);

/// Lookup table from source type id to storage class and decoders.
/// Built once and shared read-only.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    types: HashMap<u32, SourceType>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        use StorageClass::*;

        let table = [
            SourceType::new(oid::BOOL, "bool", Boolean, text_bool, binary_bool),
            SourceType::new(oid::INT2, "int2", Integer, text_int, binary_int2),
            SourceType::new(oid::INT4, "int4", Integer, text_int, binary_int4),
            SourceType::new(oid::INT8, "int8", Integer, text_int, binary_int8),
            SourceType::new(oid::OID, "oid", Integer, text_int, binary_oid),
            SourceType::new(oid::FLOAT4, "float4", Real, text_float, binary_float4),
            SourceType::new(oid::FLOAT8, "float8", Real, text_float, binary_float8),
            SourceType::new(oid::NUMERIC, "numeric", Real, text_float, binary_numeric),
            SourceType::new(oid::TIMESTAMP, "timestamp", Integer, text_timestamp, binary_timestamp),
            SourceType::new(oid::TIMESTAMPTZ, "timestamptz", Integer, text_timestamptz, binary_timestamp),
            SourceType::new(oid::DATE, "date", Integer, text_date, binary_date),
            SourceType::new(oid::TEXT, "text", Text, text_string, binary_string),
            SourceType::new(oid::VARCHAR, "varchar", Text, text_string, binary_string),
            SourceType::new(oid::BPCHAR, "bpchar", Text, text_string, binary_string),
            SourceType::new(oid::NAME, "name", Text, text_string, binary_string),
            SourceType::new(oid::UUID, "uuid", Text, text_uuid, binary_uuid),
            SourceType::new(oid::BYTEA, "bytea", Blob, text_bytea, binary_raw),
            SourceType::new(oid::JSON, "json", Blob, text_raw, binary_raw),
            SourceType::new(oid::JSONB, "jsonb", Blob, text_raw, binary_jsonb),
        ];

        Self {
            types: table.into_iter().map(|t| (t.oid, t)).collect(),
        }
    }

    /// Resolve a type id, falling back to the byte-string type.
    pub fn resolve(&self, type_oid: u32) -> &SourceType {
        self.types.get(&type_oid).unwrap_or(&FALLBACK)
    }

    pub fn is_known(&self, type_oid: u32) -> bool {
        self.types.contains_key(&type_oid)
    }

    pub fn storage_class(&self, type_oid: u32) -> StorageClass {
        self.resolve(type_oid).storage
    }

    /// Decode a value sent in the text wire format (streaming tuples).
    pub fn decode_text(&self, type_oid: u32, raw: &str) -> Result<Value> {
        self.resolve(type_oid).decode_text(raw)
    }

    /// Decode a value sent in the binary wire format (COPY BINARY fields).
    pub fn decode_binary(&self, type_oid: u32, raw: &[u8]) -> Result<Value> {
        self.resolve(type_oid).decode_binary(raw)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// Text format

fn text_bool(raw: &str) -> Result<Value> {
    match raw {
        "t" | "true" => Ok(Value::Boolean(true)),
        "f" | "false" => Ok(Value::Boolean(false)),
        other => Err(Error::decode("bool", format!("unexpected literal '{}'", other))),
    }
}

fn text_int(raw: &str) -> Result<Value> {
    raw.parse::<i64>()
        .map(Value::Integer)
        .map_err(|e| Error::decode("integer", e))
}

fn text_float(raw: &str) -> Result<Value> {
    raw.parse::<f64>()
        .map(Value::Real)
        .map_err(|e| Error::decode("float", e))
}

fn text_string(raw: &str) -> Result<Value> {
    Ok(Value::Text(raw.to_string()))
}

fn text_uuid(raw: &str) -> Result<Value> {
    uuid::Uuid::parse_str(raw)
        .map(|u| Value::Text(u.to_string()))
        .map_err(|e| Error::decode("uuid", e))
}

fn text_bytea(raw: &str) -> Result<Value> {
    match raw.strip_prefix("\\x") {
        Some(hex_digits) => hex::decode(hex_digits)
            .map(Value::Blob)
            .map_err(|e| Error::decode("bytea", e)),
        None => Ok(Value::Blob(raw.as_bytes().to_vec())),
    }
}

fn text_raw(raw: &str) -> Result<Value> {
    Ok(Value::Blob(raw.as_bytes().to_vec()))
}

fn text_infinity(raw: &str) -> Option<i64> {
    match raw {
        "infinity" => Some(i64::MAX),
        "-infinity" => Some(i64::MIN),
        _ => None,
    }
}

fn text_timestamp(raw: &str) -> Result<Value> {
    if let Some(v) = text_infinity(raw) {
        return Ok(Value::Integer(v));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .map(|ts| Value::Integer(ts.and_utc().timestamp_micros()))
        .map_err(|e| Error::decode("timestamp", e))
}

fn text_timestamptz(raw: &str) -> Result<Value> {
    if let Some(v) = text_infinity(raw) {
        return Ok(Value::Integer(v));
    }
    DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z")
        .map(|ts| Value::Integer(ts.timestamp_micros()))
        .map_err(|e| Error::decode("timestamptz", e))
}

fn text_date(raw: &str) -> Result<Value> {
    if let Some(v) = text_infinity(raw) {
        return Ok(Value::Integer(v));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|d| Value::Integer(d.and_time(NaiveTime::MIN).and_utc().timestamp_micros()))
        .map_err(|e| Error::decode("date", e))
}

// Binary format

fn fixed<const N: usize>(type_name: &'static str, raw: &[u8]) -> Result<[u8; N]> {
    raw.try_into().map_err(|_| {
        Error::decode(
            type_name,
            format!("expected {} bytes, got {}", N, raw.len()),
        )
    })
}

fn binary_bool(raw: &[u8]) -> Result<Value> {
    let [b] = fixed::<1>("bool", raw)?;
    Ok(Value::Boolean(b != 0))
}

fn binary_int2(raw: &[u8]) -> Result<Value> {
    Ok(Value::Integer(i16::from_be_bytes(fixed("int2", raw)?) as i64))
}

fn binary_int4(raw: &[u8]) -> Result<Value> {
    Ok(Value::Integer(i32::from_be_bytes(fixed("int4", raw)?) as i64))
}

fn binary_int8(raw: &[u8]) -> Result<Value> {
    Ok(Value::Integer(i64::from_be_bytes(fixed("int8", raw)?)))
}

fn binary_oid(raw: &[u8]) -> Result<Value> {
    Ok(Value::Integer(u32::from_be_bytes(fixed("oid", raw)?) as i64))
}

fn binary_float4(raw: &[u8]) -> Result<Value> {
    Ok(Value::Real(f32::from_be_bytes(fixed("float4", raw)?) as f64))
}

fn binary_float8(raw: &[u8]) -> Result<Value> {
    Ok(Value::Real(f64::from_be_bytes(fixed("float8", raw)?)))
}

fn binary_string(raw: &[u8]) -> Result<Value> {
    String::from_utf8(raw.to_vec())
        .map(Value::Text)
        .map_err(|e| Error::decode("text", e))
}

fn binary_uuid(raw: &[u8]) -> Result<Value> {
    uuid::Uuid::from_slice(raw)
        .map(|u| Value::Text(u.to_string()))
        .map_err(|e| Error::decode("uuid", e))
}

fn binary_raw(raw: &[u8]) -> Result<Value> {
    Ok(Value::Blob(raw.to_vec()))
}

fn binary_jsonb(raw: &[u8]) -> Result<Value> {
    match raw.split_first() {
        Some((1, body)) => Ok(Value::Blob(body.to_vec())),
        Some((version, _)) => Err(Error::decode(
            "jsonb",
            format!("unsupported version {}", version),
        )),
        None => Err(Error::decode("jsonb", "empty value")),
    }
}

fn binary_timestamp(raw: &[u8]) -> Result<Value> {
    let micros = i64::from_be_bytes(fixed("timestamp", raw)?);
    let value = match micros {
        i64::MAX | i64::MIN => micros,
        _ => micros
            .checked_add(PG_EPOCH_OFFSET_MICROS)
            .ok_or_else(|| Error::decode("timestamp", "out of range"))?,
    };
    Ok(Value::Integer(value))
}

fn binary_date(raw: &[u8]) -> Result<Value> {
    let days = i32::from_be_bytes(fixed("date", raw)?);
    let value = match days {
        i32::MAX => i64::MAX,
        i32::MIN => i64::MIN,
        _ => (days as i64) * MICROS_PER_DAY + PG_EPOCH_OFFSET_MICROS,
    };
    Ok(Value::Integer(value))
}

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Numeric binary layout: ndigits, weight, sign, dscale (all 16-bit) then
/// `ndigits` base-10000 digits, the first one weighted `10000^weight`.
fn binary_numeric(raw: &[u8]) -> Result<Value> {
    let err = |e: std::io::Error| Error::decode("numeric", e);
    let mut cursor = raw;

    let ndigits = cursor.read_i16::<BigEndian>().map_err(err)?;
    let weight = cursor.read_i16::<BigEndian>().map_err(err)? as i32;
    let sign = cursor.read_u16::<BigEndian>().map_err(err)?;
    let _dscale = cursor.read_u16::<BigEndian>().map_err(err)?;

    match sign {
        NUMERIC_NAN => return Ok(Value::Real(f64::NAN)),
        NUMERIC_PINF => return Ok(Value::Real(f64::INFINITY)),
        NUMERIC_NINF => return Ok(Value::Real(f64::NEG_INFINITY)),
        NUMERIC_POS | NUMERIC_NEG => {}
        other => {
            return Err(Error::decode(
                "numeric",
                format!("invalid sign 0x{:04X}", other),
            ))
        }
    }
    if ndigits < 0 {
        return Err(Error::decode("numeric", "negative digit count"));
    }

    let mut digits = Vec::with_capacity(ndigits as usize);
    for _ in 0..ndigits {
        let digit = cursor.read_i16::<BigEndian>().map_err(err)?;
        if !(0..10000).contains(&digit) {
            return Err(Error::decode("numeric", format!("invalid digit {}", digit)));
        }
        digits.push(digit);
    }
    if !cursor.is_empty() {
        return Err(Error::decode("numeric", "trailing bytes"));
    }

    let mut text = String::new();
    if sign == NUMERIC_NEG {
        text.push('-');
    }
    if weight < 0 {
        text.push('0');
    } else {
        for i in 0..=weight {
            let digit = digits.get(i as usize).copied().unwrap_or(0);
            if i == 0 {
                let _ = write!(text, "{}", digit);
            } else {
                let _ = write!(text, "{:04}", digit);
            }
        }
    }
    text.push('.');
    for _ in 0..(-weight - 1).max(0) {
        text.push_str("0000");
    }
    for digit in digits.iter().skip((weight + 1).max(0) as usize) {
        let _ = write!(text, "{:04}", digit);
    }
    text.push('0');

    text.parse::<f64>()
        .map(Value::Real)
        .map_err(|e| Error::decode("numeric", e))
}
