use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Local column storage class. Every source type maps onto exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StorageClass {
    Integer,
    Real,
    Text,
    Blob,
    Boolean,
}

impl StorageClass {
    /// Declared type used in local `CREATE TABLE` statements.
    pub fn as_sql(&self) -> &'static str {
        match self {
            StorageClass::Integer => "INTEGER",
            StorageClass::Real => "REAL",
            StorageClass::Text => "TEXT",
            StorageClass::Blob => "BLOB",
            StorageClass::Boolean => "BOOLEAN",
        }
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for StorageClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INTEGER" => Ok(StorageClass::Integer),
            "REAL" => Ok(StorageClass::Real),
            "TEXT" => Ok(StorageClass::Text),
            "BLOB" => Ok(StorageClass::Blob),
            "BOOLEAN" => Ok(StorageClass::Boolean),
            other => Err(Error::UnknownStorageClass(other.to_string())),
        }
    }
}

/// A decoded column value, already normalized to its storage class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Storage class of the value, `None` for NULL.
    pub fn storage_class(&self) -> Option<StorageClass> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(StorageClass::Boolean),
            Value::Integer(_) => Some(StorageClass::Integer),
            Value::Real(_) => Some(StorageClass::Real),
            Value::Text(_) => Some(StorageClass::Text),
            Value::Blob(_) => Some(StorageClass::Blob),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Boolean(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Real(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            Value::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(b),
            Value::Integer(i) => serde_json::Value::Number(i.into()),
            Value::Real(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s),
            Value::Blob(b) => match String::from_utf8(b) {
                Ok(s) => serde_json::Value::String(s),
                Err(e) => serde_json::Value::String(format!("\\x{}", hex::encode(e.into_bytes()))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_class_roundtrip() {
        for class in [
            StorageClass::Integer,
            StorageClass::Real,
            StorageClass::Text,
            StorageClass::Blob,
            StorageClass::Boolean,
        ] {
            assert_eq!(class.as_sql().parse::<StorageClass>().unwrap(), class);
        }
        assert_eq!("integer".parse::<StorageClass>().unwrap(), StorageClass::Integer);
        assert!("VARCHAR".parse::<StorageClass>().is_err());
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::from(42i64).as_i64(), Some(42));
        assert_eq!(Value::from(true).as_i64(), Some(1));
        assert_eq!(Value::from(1.5).as_f64(), Some(1.5));
        assert_eq!(Value::from("hi").as_str(), Some("hi"));
        assert!(Value::Null.is_null());
        assert_eq!(Value::Null.storage_class(), None);
        assert_eq!(
            Value::Blob(vec![1]).storage_class(),
            Some(StorageClass::Blob)
        );
    }

    #[test]
    fn test_blob_to_json() {
        let json: serde_json::Value = Value::Blob(br#"{"a":1}"#.to_vec()).into();
        assert_eq!(json, serde_json::json!(r#"{"a":1}"#));

        let json: serde_json::Value = Value::Blob(vec![0xff, 0x00]).into();
        assert_eq!(json, serde_json::json!("\\xff00"));
    }
}
