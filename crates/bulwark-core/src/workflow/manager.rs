use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::session::WorkflowSession;
use crate::domain::{SessionId, Task, TaskKey, TaskOutput, WorkflowState};
use crate::error::{EngineError, EngineResult};
use crate::executor::{ExecuteOptions, TaskExecutor};
use crate::ports::{Clock, IdGenerator};

/// Externally visible view of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowStatus {
    pub session_id: SessionId,
    pub state: WorkflowState,
    pub current_task_key: Option<TaskKey>,
    pub completed_keys: Vec<TaskKey>,
    pub progress: f64,
    pub error: Option<String>,
}

impl From<&WorkflowSession> for WorkflowStatus {
    fn from(session: &WorkflowSession) -> Self {
        Self {
            session_id: session.id(),
            state: session.state(),
            current_task_key: session.current_task_key().cloned(),
            completed_keys: session.completed_keys(),
            progress: session.progress(),
            error: session.error().map(str::to_string),
        }
    }
}

/// Session manager for sequential workflows.
///
/// Every session sits behind its own lock; the lock is taken only for
/// transitions and never held while a task runs.
pub struct SequentialWorkflow {
    sessions: DashMap<SessionId, Arc<Mutex<WorkflowSession>>>,
    executor: Arc<TaskExecutor>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    per_task_timeout: Duration,
}

impl SequentialWorkflow {
    pub fn new(
        executor: Arc<TaskExecutor>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        per_task_timeout: Duration,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            executor,
            ids,
            clock,
            per_task_timeout,
        }
    }

    /// Create and initialize a session over `queue`.
    pub fn start<I, K>(&self, queue: I) -> EngineResult<SessionId>
    where
        I: IntoIterator<Item = K>,
        K: Into<TaskKey>,
    {
        let queue: Vec<TaskKey> = queue.into_iter().map(|key| -> TaskKey { key.into() }).collect();
        let id = self.ids.session_id();
        let now = self.clock.now();
        let mut session = WorkflowSession::new(id, queue, now);
        session.initialize(now)?;
        info!(
            session_id = %id,
            tasks = session.queue().len(),
            state = %session.state(),
            "workflow started"
        );
        self.sessions.insert(id, Arc::new(Mutex::new(session)));
        Ok(id)
    }

    /// Record an externally produced output for the current task.
    pub fn add_output(&self, id: SessionId, task_key: &TaskKey, value: Value) -> EngineResult<WorkflowStatus> {
        let session = self.session(id)?;
        let mut session = session.lock();
        session.add_output(task_key, value, self.clock.now())?;
        debug!(session_id = %id, task_key = %task_key, state = %session.state(), "workflow output recorded");
        Ok(WorkflowStatus::from(&*session))
    }

    pub fn get_status(&self, id: SessionId) -> EngineResult<WorkflowStatus> {
        let session = self.session(id)?;
        let session = session.lock();
        Ok(WorkflowStatus::from(&*session))
    }

    /// Outputs in queue order.
    pub fn outputs(&self, id: SessionId) -> EngineResult<Vec<(TaskKey, Value)>> {
        let session = self.session(id)?;
        let outputs = session.lock().outputs().to_vec();
        Ok(outputs)
    }

    /// Full copy of the session record.
    pub fn snapshot(&self, id: SessionId) -> EngineResult<WorkflowSession> {
        let session = self.session(id)?;
        let snapshot = session.lock().clone();
        Ok(snapshot)
    }

    /// Execute the current task and record its output.
    ///
    /// An executor error fails the session and is returned as is.
    pub async fn run_next(&self, id: SessionId, payload: Value) -> EngineResult<TaskOutput> {
        let session = self.session(id)?;
        let task_key = {
            let guard = session.lock();
            match (guard.current_task_key(), guard.state()) {
                (Some(key), WorkflowState::Consulting) => key.clone(),
                (_, state) => {
                    return Err(EngineError::WorkflowState {
                        session_id: id,
                        state,
                        reason: "no task is ready to run".to_string(),
                    });
                }
            }
        };

        let task = Task::new(task_key.clone(), payload);
        let options = ExecuteOptions::new(self.per_task_timeout);
        match self.executor.execute(&task, &options).await {
            Ok(output) => {
                let mut guard = session.lock();
                guard.add_output(&task_key, output.value.clone(), self.clock.now())?;
                debug!(
                    session_id = %id,
                    task_key = %task_key,
                    cached = output.cached,
                    state = %guard.state(),
                    "workflow step done"
                );
                Ok(output)
            }
            Err(err) => {
                warn!(session_id = %id, task_key = %task_key, error = %err, "workflow failed");
                session.lock().fail(err.to_string(), self.clock.now());
                Err(err)
            }
        }
    }

    /// `run_next` until the session is terminal; stops at the first error.
    pub async fn run_to_completion(&self, id: SessionId, payload: Value) -> EngineResult<WorkflowStatus> {
        loop {
            let status = self.get_status(id)?;
            if status.state != WorkflowState::Consulting {
                info!(session_id = %id, state = %status.state, "workflow finished");
                return Ok(status);
            }
            self.run_next(id, payload.clone()).await?;
        }
    }

    /// Resume a failed session at its first incomplete position.
    pub fn restart(&self, id: SessionId) -> EngineResult<WorkflowStatus> {
        let session = self.session(id)?;
        let mut session = session.lock();
        session.restart(self.clock.now())?;
        info!(session_id = %id, position = session.position(), "workflow restarted");
        Ok(WorkflowStatus::from(&*session))
    }

    /// Drop a session, returning its final record.
    pub fn remove(&self, id: SessionId) -> EngineResult<WorkflowSession> {
        let (_, session) = self
            .sessions
            .remove(&id)
            .ok_or(EngineError::SessionNotFound(id))?;
        let session = session.lock().clone();
        Ok(session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn session(&self, id: SessionId) -> EngineResult<Arc<Mutex<WorkflowSession>>> {
        self.sessions
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(EngineError::SessionNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PriorityCache;
    use crate::config::{BreakerConfig, CacheConfig};
    use crate::domain::TaskError;
    use crate::pool::ResourcePool;
    use crate::ports::{FixedClock, TaskCall, UlidGenerator, task_fn};
    use crate::resilience::{BreakerRegistry, RetryPolicy};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn workflow(call: Arc<dyn TaskCall>) -> (SequentialWorkflow, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::starting_now());
        let executor = TaskExecutor::new(
            call,
            ResourcePool::with_workers(1),
            Arc::new(BreakerRegistry::new(BreakerConfig::default(), clock.clone())),
            Arc::new(PriorityCache::new(CacheConfig::default(), clock.clone())),
        )
        .with_retry(RetryPolicy::no_retry());
        let workflow = SequentialWorkflow::new(
            Arc::new(executor),
            Arc::new(UlidGenerator::new(clock.clone())),
            clock.clone(),
            Duration::from_secs(5),
        );
        (workflow, clock)
    }

    fn echo() -> Arc<dyn TaskCall> {
        task_fn(|ctx, _payload| async move { Ok(json!(format!("{}-done", ctx.task_key))) })
    }

    #[test]
    fn manual_outputs_follow_the_queue() {
        let (workflow, _) = workflow(echo());
        let id = workflow.start(["t1", "t2"]).unwrap();

        let status = workflow.get_status(id).unwrap();
        assert_eq!(status.state, WorkflowState::Consulting);
        assert_eq!(status.current_task_key, Some(TaskKey::new("t1")));

        let err = workflow.add_output(id, &TaskKey::new("t2"), json!("r2")).unwrap_err();
        assert_eq!(err.code(), "workflow_state");
        assert_eq!(workflow.get_status(id).unwrap().current_task_key, Some(TaskKey::new("t1")));

        workflow.add_output(id, &TaskKey::new("t1"), json!("r1")).unwrap();
        let status = workflow.add_output(id, &TaskKey::new("t2"), json!("r2")).unwrap();
        assert_eq!(status.state, WorkflowState::Completed);
        assert_eq!(status.progress, 1.0);
        assert_eq!(
            workflow.outputs(id).unwrap(),
            vec![(TaskKey::new("t1"), json!("r1")), (TaskKey::new("t2"), json!("r2"))]
        );
    }

    #[test]
    fn empty_queue_is_completed_at_start() {
        let (workflow, _) = workflow(echo());
        let id = workflow.start(Vec::<TaskKey>::new()).unwrap();
        assert_eq!(workflow.get_status(id).unwrap().state, WorkflowState::Completed);
    }

    #[tokio::test]
    async fn run_to_completion_executes_each_task_in_order() {
        let (workflow, _) = workflow(echo());
        let id = workflow.start(["plan", "draft", "review"]).unwrap();

        let status = workflow.run_to_completion(id, json!({ "doc": 7 })).await.unwrap();

        assert_eq!(status.state, WorkflowState::Completed);
        assert_eq!(
            status.completed_keys,
            vec![TaskKey::new("plan"), TaskKey::new("draft"), TaskKey::new("review")]
        );
        let outputs = workflow.outputs(id).unwrap();
        assert_eq!(outputs[2].1, json!("review-done"));
        assert!(workflow.snapshot(id).unwrap().completed_at().is_some());
    }

    #[tokio::test]
    async fn failed_step_fails_the_session_and_restart_resumes_it() {
        let broken = Arc::new(AtomicBool::new(true));
        let call = task_fn({
            let broken = broken.clone();
            move |ctx, _payload| {
                let broken = broken.clone();
                async move {
                    if ctx.task_key.as_str() == "t2" && broken.load(Ordering::SeqCst) {
                        Err(TaskError::validation("t2 rejected the input"))
                    } else {
                        Ok(json!(ctx.task_key.as_str()))
                    }
                }
            }
        });
        let (workflow, _) = workflow(call);
        let id = workflow.start(["t1", "t2", "t3"]).unwrap();

        let err = workflow.run_to_completion(id, json!(null)).await.unwrap_err();
        assert_eq!(err.code(), "task_error");

        let status = workflow.get_status(id).unwrap();
        assert_eq!(status.state, WorkflowState::Failed);
        assert_eq!(status.current_task_key, None);
        assert_eq!(status.completed_keys, vec![TaskKey::new("t1")]);
        assert!(status.error.unwrap().contains("t2 rejected the input"));

        let err = workflow.run_next(id, json!(null)).await.unwrap_err();
        assert_eq!(err.code(), "workflow_state");

        broken.store(false, Ordering::SeqCst);
        let status = workflow.restart(id).unwrap();
        assert_eq!(status.current_task_key, Some(TaskKey::new("t2")));

        let status = workflow.run_to_completion(id, json!(null)).await.unwrap();
        assert_eq!(status.state, WorkflowState::Completed);
        assert_eq!(workflow.outputs(id).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn timestamps_come_from_the_clock() {
        let (workflow, clock) = workflow(echo());
        let id = workflow.start(["t1"]).unwrap();
        let created = workflow.snapshot(id).unwrap().created_at();

        clock.advance(Duration::from_secs(30));
        workflow.run_next(id, json!(1)).await.unwrap();

        let session = workflow.snapshot(id).unwrap();
        assert_eq!(session.updated_at() - created, chrono::Duration::seconds(30));
        assert_eq!(session.completed_at(), Some(session.updated_at()));
    }

    #[test]
    fn unknown_and_removed_sessions_are_not_found() {
        let (workflow, _) = workflow(echo());
        let id = workflow.start(["t1"]).unwrap();

        let removed = workflow.remove(id).unwrap();
        assert_eq!(removed.id, id);
        assert!(workflow.is_empty());
        assert!(matches!(
            workflow.get_status(id),
            Err(EngineError::SessionNotFound(missing)) if missing == id
        ));
    }
}
