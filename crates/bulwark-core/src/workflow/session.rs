//! Workflow session record and its state transitions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::domain::{SessionId, TaskKey, WorkflowState};
use crate::error::{EngineError, EngineResult};

/// One sequential workflow: an ordered queue of task keys, run one at a time.
///
/// Fields are private; state changes go through the transition methods:
/// - `current_task_key` is `Some` exactly while the state is `Consulting`
/// - `outputs[i]` is the output of `queue[i]`
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSession {
    pub(crate) id: SessionId,
    queue: Vec<TaskKey>,
    /// Index into `queue` of the next task to run.
    position: usize,
    current_task_key: Option<TaskKey>,
    state: WorkflowState,
    outputs: Vec<(TaskKey, Value)>,

    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,

    /// Message of the error that failed the session.
    error: Option<String>,
}

impl WorkflowSession {
    pub fn new(id: SessionId, queue: Vec<TaskKey>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            queue,
            position: 0,
            current_task_key: None,
            state: WorkflowState::Initialized,
            outputs: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
        }
    }

    /// Enter the first position, or complete immediately on an empty queue.
    pub fn initialize(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        if self.state != WorkflowState::Initialized {
            return Err(self.rejected("session is already initialized"));
        }
        self.advance(now);
        Ok(())
    }

    /// Record the output of the current task and move on.
    ///
    /// A key other than the current one, or a terminal session, is rejected
    /// and leaves the session untouched.
    pub fn add_output(&mut self, task_key: &TaskKey, value: Value, now: DateTime<Utc>) -> EngineResult<()> {
        if self.state.is_terminal() {
            return Err(self.rejected(format!("session is {}", self.state)));
        }
        match &self.current_task_key {
            Some(current) if current == task_key => {}
            Some(current) => {
                return Err(self.rejected(format!(
                    "expected output for task_key={current}, got task_key={task_key}"
                )));
            }
            None => {
                return Err(self.rejected(format!(
                    "no task is awaiting output, got task_key={task_key}"
                )));
            }
        }

        self.outputs.push((task_key.clone(), value));
        self.current_task_key = None;
        self.state = WorkflowState::InProgress;
        self.position += 1;
        self.advance(now);
        Ok(())
    }

    /// Mark the session failed. No-op on a terminal session.
    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = WorkflowState::Failed;
        self.current_task_key = None;
        self.error = Some(message.into());
        self.updated_at = now;
    }

    /// Resume a failed session at its first incomplete position.
    pub fn restart(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        if self.state != WorkflowState::Failed {
            return Err(self.rejected("only a failed session can be restarted"));
        }
        self.error = None;
        self.position = self.outputs.len();
        self.advance(now);
        Ok(())
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn queue(&self) -> &[TaskKey] {
        &self.queue
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    /// Task awaiting output; `None` unless the state is `Consulting`.
    pub fn current_task_key(&self) -> Option<&TaskKey> {
        self.current_task_key.as_ref()
    }

    pub fn outputs(&self) -> &[(TaskKey, Value)] {
        &self.outputs
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn completed_keys(&self) -> Vec<TaskKey> {
        self.outputs.iter().map(|(key, _)| key.clone()).collect()
    }

    /// Fraction of the queue with a recorded output, 1.0 for an empty queue.
    pub fn progress(&self) -> f64 {
        if self.queue.is_empty() {
            1.0
        } else {
            self.outputs.len() as f64 / self.queue.len() as f64
        }
    }

    fn advance(&mut self, now: DateTime<Utc>) {
        match self.queue.get(self.position) {
            Some(next) => {
                self.current_task_key = Some(next.clone());
                self.state = WorkflowState::Consulting;
            }
            None => {
                self.current_task_key = None;
                self.state = WorkflowState::Completed;
                self.completed_at = Some(now);
            }
        }
        self.updated_at = now;
    }

    fn rejected(&self, reason: impl Into<String>) -> EngineError {
        EngineError::WorkflowState {
            session_id: self.id,
            state: self.state,
            reason: reason.into(),
        }
    }
}
