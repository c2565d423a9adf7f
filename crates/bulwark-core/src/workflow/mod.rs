//! Sequential workflows: ordered task keys executed one at a time.

mod manager;
mod session;

pub use manager::{SequentialWorkflow, WorkflowStatus};
pub use session::WorkflowSession;
