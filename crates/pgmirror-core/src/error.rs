use thiserror::Error;

/// Errors that can occur in pgmirror-core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid table name '{0}': expected schema.table")]
    InvalidTableName(String),

    #[error("table {0} has no primary key")]
    MissingPrimaryKey(String),

    #[error("failed to decode {type_name} value: {reason}")]
    Decode {
        type_name: &'static str,
        reason: String,
    },

    #[error("unknown storage class: {0}")]
    UnknownStorageClass(String),
}

impl Error {
    pub(crate) fn decode(type_name: &'static str, reason: impl ToString) -> Self {
        Error::Decode {
            type_name,
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
