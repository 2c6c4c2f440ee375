pub mod error;
pub mod relation;
pub mod types;
pub mod value;

pub use error::{Error, Result};
pub use relation::{ColumnDescriptor, DriftReason, RelationDescriptor, TableName};
pub use types::{SourceType, TypeRegistry};
pub use value::{StorageClass, Value};
