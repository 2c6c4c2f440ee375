use thiserror::Error;

#[derive(Debug, Error)]
pub enum PgError {
    #[error("postgres error: {0}")]
    Postgres(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("server error: {severity} {code}: {message}")]
    Server {
        severity: String,
        code: String,
        message: String,
    },

    #[error("framing error: {0}")]
    Framing(String),

    #[error("pgoutput decode error: {0}")]
    PgOutput(String),

    #[error("replication slot '{0}' does not exist")]
    SlotNotFound(String),

    #[error("failed to create replication slot: {0}")]
    SlotCreationFailed(String),

    #[error("table {schema}.{table} does not exist")]
    TableNotFound { schema: String, table: String },

    #[error("invalid LSN format: {0}")]
    InvalidLsn(String),

    #[error("replication error: {0}")]
    Replication(String),
}

impl PgError {
    /// Whether the error is recoverable by reconnecting and replaying from
    /// the slot. Server error frames and malformed data are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PgError::Io(_) | PgError::Connection(_) | PgError::Postgres(_)
        )
    }

    pub(crate) fn framing(msg: impl Into<String>) -> Self {
        PgError::Framing(msg.into())
    }
}

impl From<tokio_postgres::Error> for PgError {
    fn from(e: tokio_postgres::Error) -> Self {
        if let Some(db_err) = e.as_db_error() {
            PgError::Server {
                severity: db_err.severity().to_string(),
                code: db_err.code().code().to_string(),
                message: db_err.message().to_string(),
            }
        } else {
            PgError::Postgres(e.to_string())
        }
    }
}

pub type PgResult<T> = Result<T, PgError>;
