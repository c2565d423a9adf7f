//! Task results: the common shape the executor hands back to callers.

use std::time::Duration;

use serde::{Serialize, Serializer};

use super::TaskKey;
use crate::error::EngineError;

fn duration_ms<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

fn error_message<S: Serializer>(e: &EngineError, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(e)
}

/// A successful task execution (fresh or served from cache).
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutput {
    pub task_key: TaskKey,
    pub value: serde_json::Value,
    #[serde(rename = "duration_ms", serialize_with = "duration_ms")]
    pub duration: Duration,
    pub cached: bool,
}

/// A failed task execution.
#[derive(Debug, Clone, Serialize)]
pub struct TaskFailure {
    pub task_key: TaskKey,
    #[serde(serialize_with = "error_message")]
    pub error: EngineError,
    #[serde(rename = "duration_ms", serialize_with = "duration_ms")]
    pub duration: Duration,
}

impl TaskFailure {
    pub fn code(&self) -> &'static str {
        self.error.code()
    }
}

/// Outcome of one task: value or error, duration, cache-hit flag.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskResult {
    Succeeded(TaskOutput),
    Failed(TaskFailure),
}

impl TaskResult {
    pub fn task_key(&self) -> &TaskKey {
        match self {
            TaskResult::Succeeded(o) => &o.task_key,
            TaskResult::Failed(f) => &f.task_key,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskResult::Succeeded(_))
    }

    pub fn duration(&self) -> Duration {
        match self {
            TaskResult::Succeeded(o) => o.duration,
            TaskResult::Failed(f) => f.duration,
        }
    }

    pub fn cached(&self) -> bool {
        matches!(self, TaskResult::Succeeded(TaskOutput { cached: true, .. }))
    }

    pub fn into_result(self) -> Result<TaskOutput, TaskFailure> {
        match self {
            TaskResult::Succeeded(o) => Ok(o),
            TaskResult::Failed(f) => Err(f),
        }
    }
}

impl From<Result<TaskOutput, TaskFailure>> for TaskResult {
    fn from(r: Result<TaskOutput, TaskFailure>) -> Self {
        match r {
            Ok(o) => TaskResult::Succeeded(o),
            Err(f) => TaskResult::Failed(f),
        }
    }
}
