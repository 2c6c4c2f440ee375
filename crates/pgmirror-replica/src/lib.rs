//! The change-replication engine: keeps a local store in step with a set of
//! source tables through logical replication.

mod applier;
mod engine;
mod error;
mod registry;
mod session;
mod snapshot;

pub use engine::{Engine, EngineConfig, SessionHandle};
pub use error::{ReplicaError, ReplicaResult};
pub use registry::RegistrationOptions;
pub use session::SessionState;
