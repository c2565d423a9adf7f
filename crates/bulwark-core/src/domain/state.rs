//! Workflow session states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a sequential workflow session.
///
/// Transitions:
/// - Initialized -> Consulting (queue not empty) | Completed (queue empty)
/// - Consulting -> InProgress -> Consulting (next position) | Completed
/// - any non-terminal state -> Failed
///
/// `Consulting` is the only state with a current task key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Initialized,
    Consulting,
    InProgress,
    Completed,
    Failed,
}

impl WorkflowState {
    /// Is this a terminal state (no further transitions without a restart)?
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowState::Completed | WorkflowState::Failed)
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowState::Initialized => "initialized",
            WorkflowState::Consulting => "consulting",
            WorkflowState::InProgress => "in_progress",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
        };
        f.write_str(s)
    }
}
