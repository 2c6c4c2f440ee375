mod error;
mod sqlite;
mod table;

pub use error::{StoreError, StoreResult};
pub use sqlite::{LocalColumn, LocalStore, QueryResult};
pub use table::{quote_ident, LocalTable};
