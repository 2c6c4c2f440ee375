use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("table '{table}' expects {expected} values, got {actual}")]
    Arity {
        table: String,
        expected: usize,
        actual: usize,
    },

    #[error("update on '{0}' has no columns to set")]
    EmptyUpdate(String),

    #[error("local table not found: {0}")]
    TableNotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
