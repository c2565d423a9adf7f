use std::time::Duration;

use thiserror::Error;

use crate::domain::{SessionId, TaskError, TaskKey, WorkflowState};

/// Engine-level error taxonomy.
///
/// `Clone` so that a single failure can be reported both to the caller and
/// into aggregated batch results.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// No pool slot became free within the acquire timeout.
    #[error("no pool slot available within {waited:?}")]
    PoolTimeout { waited: Duration },

    /// Acquire attempted (or pending) after the pool was shut down.
    #[error("resource pool is closed")]
    PoolClosed,

    /// Fast-fail: the underlying call was never invoked.
    #[error("circuit open for task_key={task_key}, retry in {retry_in:?}")]
    CircuitOpen {
        task_key: TaskKey,
        retry_in: Duration,
    },

    /// Every attempt failed; carries the last underlying error.
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: TaskError },

    /// Non-retryable underlying error, surfaced as-is.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// The per-task timeout won the race against the call.
    #[error("task_key={task_key} timed out after {timeout:?}")]
    TaskTimeout { task_key: TaskKey, timeout: Duration },

    #[error("workflow session {session_id} in state {state}: {reason}")]
    WorkflowState {
        session_id: SessionId,
        state: WorkflowState,
        reason: String,
    },

    #[error("workflow session {0} not found")]
    SessionNotFound(SessionId),

    #[error("invalid invalidation pattern: {0}")]
    InvalidPattern(String),

    /// A spawned call panicked or was aborted by the runtime.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Underlying call error, if this failure came from the service itself.
    pub fn task_error(&self) -> Option<&TaskError> {
        match self {
            EngineError::RetryExhausted { last_error, .. } => Some(last_error),
            EngineError::Task(err) => Some(err),
            _ => None,
        }
    }

    /// Short machine-readable tag, used in logs and JSON views.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::PoolTimeout { .. } => "pool_timeout",
            EngineError::PoolClosed => "pool_closed",
            EngineError::CircuitOpen { .. } => "circuit_open",
            EngineError::RetryExhausted { .. } => "retry_exhausted",
            EngineError::Task(_) => "task_error",
            EngineError::TaskTimeout { .. } => "task_timeout",
            EngineError::WorkflowState { .. } => "workflow_state",
            EngineError::SessionNotFound(_) => "session_not_found",
            EngineError::InvalidPattern(_) => "invalid_pattern",
            EngineError::Internal(_) => "internal",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
