use pgmirror_pg::PgError;
use pgmirror_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error(transparent)]
    Pg(#[from] PgError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(pgmirror_core::Error),

    #[error("table {0} has no primary key and cannot be replicated")]
    MissingPrimaryKey(String),

    #[error("source table {0} does not exist")]
    TableNotFound(String),

    #[error("table {table} maps to local table {local}, already used by {existing}")]
    LocalNameTaken {
        table: String,
        local: String,
        existing: String,
    },

    #[error("table {0} is not registered")]
    NotRegistered(String),

    #[error("invalid table name '{0}': expected schema.table")]
    InvalidTableName(String),

    #[error("row for {table} has {actual} columns, expected {expected}")]
    RowShape {
        table: String,
        expected: usize,
        actual: usize,
    },

    #[error("key column {column} of {table} is missing from the row")]
    MissingKey { table: String, column: String },

    #[error("schema of {0} kept changing while it was being registered")]
    SchemaUnstable(String),

    #[error("replication session already started")]
    AlreadyStarted,

    #[error("gave up reconnecting after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    #[error("session task failed: {0}")]
    Task(String),
}

impl From<pgmirror_core::Error> for ReplicaError {
    fn from(e: pgmirror_core::Error) -> Self {
        match e {
            pgmirror_core::Error::InvalidTableName(name) => ReplicaError::InvalidTableName(name),
            pgmirror_core::Error::MissingPrimaryKey(name) => ReplicaError::MissingPrimaryKey(name),
            other => ReplicaError::Core(other),
        }
    }
}

pub type ReplicaResult<T> = Result<T, ReplicaError>;
