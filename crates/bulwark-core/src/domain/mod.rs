//! Domain model (ids, task keys, task results, workflow states, call errors).

pub mod errors;
pub mod ids;
pub mod outcome;
pub mod state;
pub mod task;

pub use errors::{ErrorKind, TaskError};
pub use ids::{BatchId, Id, IdMarker, SessionId};
pub use outcome::{TaskFailure, TaskOutput, TaskResult};
pub use state::WorkflowState;
pub use task::{Task, TaskKey, content_hash};
