//! EngineBuilder: wires one instance of every shared component.
//!
//! Pool, breakers and cache are created once here and handed to the executor,
//! the orchestrator and the workflow manager as `Arc`s. Missing handlers are
//! reported by `build()`, not at the first call.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cache::PriorityCache;
use crate::config::{ConfigError, EngineConfig};
use crate::executor::TaskExecutor;
use crate::observability::EngineSnapshot;
use crate::orchestrator::{ParallelOrchestrator, RunOptions};
use crate::pool::{ResourcePool, Worker};
use crate::ports::{Clock, IdGenerator, SystemClock, TaskCall, UlidGenerator};
use crate::registry::{HandlerRegistry, RegistryError, TaskHandler};
use crate::resilience::{BreakerRegistry, RetryPolicy};
use crate::scheduler::Scheduler;
use crate::typed::{Handler, TypedTask};
use crate::workflow::SequentialWorkflow;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing task keys: {0:?}. These were expected but have no handler.")]
    MissingTaskTypes(Vec<String>),

    #[error("no handlers registered and no task call set")]
    NoTaskCall,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub struct EngineBuilder {
    config: EngineConfig,
    registry: HandlerRegistry,
    call: Option<Arc<dyn TaskCall>>,
    expected_tasks: Option<Vec<String>>,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
    scheduler: Option<Scheduler>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            registry: HandlerRegistry::new(),
            call: None,
            expected_tasks: None,
            clock: Arc::new(SystemClock),
            ids: None,
            scheduler: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn register(
        mut self,
        task_key: &str,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self, RegistryError> {
        self.registry.register(task_key, handler)?;
        Ok(self)
    }

    pub fn register_typed<T: TypedTask, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register_typed::<T, H>(handler)?;
        Ok(self)
    }

    /// Use `call` for every task key instead of the handler registry.
    ///
    /// `expect_tasks` is not checked against an opaque call.
    pub fn with_call(mut self, call: Arc<dyn TaskCall>) -> Self {
        self.call = Some(call);
        self
    }

    /// Task keys that must have a handler when `build()` runs.
    pub fn expect_tasks(mut self, task_keys: &[&str]) -> Self {
        self.expected_tasks = Some(task_keys.iter().map(|k| k.to_string()).collect());
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Replaces the default scheduler (cache-first, breaker-aware, load-based).
    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn build(self) -> Result<Engine, BuildError> {
        self.config.validate()?;

        let call: Arc<dyn TaskCall> = match self.call {
            Some(call) => call,
            None => {
                if let Some(expected_tasks) = &self.expected_tasks {
                    let registered: Vec<String> = self
                        .registry
                        .task_keys()
                        .iter()
                        .map(|k| k.as_str().to_string())
                        .collect();
                    let missing: Vec<String> = expected_tasks
                        .iter()
                        .filter(|k| !registered.contains(k))
                        .cloned()
                        .collect();
                    if !missing.is_empty() {
                        return Err(BuildError::MissingTaskTypes(missing));
                    }
                }
                if self.registry.is_empty() {
                    return Err(BuildError::NoTaskCall);
                }
                Arc::new(self.registry)
            }
        };

        let config = self.config;
        let clock = self.clock;
        let ids: Arc<dyn IdGenerator> = match self.ids {
            Some(ids) => ids,
            None => Arc::new(UlidGenerator::new(Arc::clone(&clock))),
        };

        let pool = ResourcePool::<Worker>::with_workers(config.pool.max_size);
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone(), Arc::clone(&clock)));
        let cache = Arc::new(PriorityCache::new(config.cache.clone(), Arc::clone(&clock)));
        let executor = Arc::new(
            TaskExecutor::new(call, pool, breakers, cache)
                .with_retry(RetryPolicy::from_config(&config.retry))
                .with_acquire_timeout(config.pool.acquire_timeout()),
        );

        let scheduler = self.scheduler.unwrap_or_else(Scheduler::with_defaults);
        let orchestrator = ParallelOrchestrator::new(Arc::clone(&executor), Arc::clone(&ids))
            .with_scheduler(Arc::new(scheduler));
        let workflows = SequentialWorkflow::new(
            Arc::clone(&executor),
            ids,
            clock,
            config.orchestrator.per_task_timeout(),
        );

        info!(
            pool_size = config.pool.max_size,
            failure_threshold = config.breaker.failure_threshold,
            cache_max_size = config.cache.max_size,
            "engine built"
        );
        Ok(Engine {
            config,
            executor,
            orchestrator,
            workflows,
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A wired engine. Components share one pool, one breaker registry and one
/// cache.
pub struct Engine {
    config: EngineConfig,
    executor: Arc<TaskExecutor>,
    orchestrator: ParallelOrchestrator,
    workflows: SequentialWorkflow,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    pub fn orchestrator(&self) -> &ParallelOrchestrator {
        &self.orchestrator
    }

    pub fn workflows(&self) -> &SequentialWorkflow {
        &self.workflows
    }

    pub fn cache(&self) -> &Arc<PriorityCache<serde_json::Value>> {
        self.executor.cache()
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        self.executor.breakers()
    }

    pub fn pool(&self) -> &ResourcePool<Worker> {
        self.executor.pool()
    }

    /// Batch options from the orchestrator section of the config.
    pub fn run_options(&self) -> RunOptions {
        RunOptions::from_config(&self.config.orchestrator)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot::collect(&self.executor, self.workflows.len())
    }

    /// Refuse new work and wait up to `timeout` for in-flight calls.
    ///
    /// Returns `false` if calls were still running when the timeout hit.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.pool().shutdown();
        let drained = self.pool().drain(timeout).await;
        info!(drained, "engine shut down");
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskError, TaskKey, WorkflowState};
    use crate::ports::{CallContext, task_fn};
    use async_trait::async_trait;
    use serde::Deserialize;
    use serde_json::{Value, json};

    #[derive(Deserialize)]
    struct Summarize {
        text: String,
    }

    impl TypedTask for Summarize {
        const KEY: &'static str = "summarize.v1";
        type Output = String;
    }

    struct SummarizeHandler;

    #[async_trait]
    impl Handler<Summarize> for SummarizeHandler {
        async fn handle(&self, _ctx: &CallContext, task: Summarize) -> Result<String, TaskError> {
            Ok(task.text.chars().take(5).collect())
        }
    }

    struct Shout;

    #[async_trait]
    impl TaskHandler for Shout {
        async fn handle(&self, _ctx: &CallContext, payload: &Value) -> Result<Value, TaskError> {
            Ok(json!(payload["text"].as_str().unwrap_or_default().to_uppercase()))
        }
    }

    fn engine() -> Engine {
        EngineBuilder::new()
            .register_typed::<Summarize, _>(SummarizeHandler)
            .unwrap()
            .register("shout", Arc::new(Shout))
            .unwrap()
            .expect_tasks(&[Summarize::KEY, "shout"])
            .build()
            .unwrap()
    }

    #[test]
    fn build_fails_on_missing_expected_tasks() {
        let result = EngineBuilder::new()
            .register("shout", Arc::new(Shout))
            .unwrap()
            .expect_tasks(&["shout", "translate"])
            .build();
        assert!(matches!(
            result,
            Err(BuildError::MissingTaskTypes(missing)) if missing == vec!["translate".to_string()]
        ));
    }

    #[test]
    fn build_requires_something_to_call() {
        assert!(matches!(EngineBuilder::new().build(), Err(BuildError::NoTaskCall)));
    }

    #[test]
    fn build_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.pool.max_size = 0;
        let result = EngineBuilder::new()
            .with_call(task_fn(|_ctx, _payload| async { Ok(json!(null)) }))
            .with_config(config)
            .build();
        assert!(matches!(result, Err(BuildError::Config(_))));
    }

    #[tokio::test]
    async fn batch_and_workflow_share_the_cache() {
        let engine = engine();
        let payload = json!({ "text": "hello world" });

        let batch = engine
            .orchestrator()
            .run([Summarize::KEY, "shout"], payload.clone(), engine.run_options())
            .await
            .unwrap();
        assert!(batch.is_complete());
        assert_eq!(batch.value(&TaskKey::new("shout")), Some(&json!("HELLO WORLD")));

        let id = engine.workflows().start([Summarize::KEY]).unwrap();
        let output = engine.workflows().run_next(id, payload).await.unwrap();
        assert!(output.cached);
        assert_eq!(output.value, json!("hello"));
        assert_eq!(
            engine.workflows().get_status(id).unwrap().state,
            WorkflowState::Completed
        );

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.cache.entries, 2);
        assert_eq!(snapshot.workflow_sessions, 1);
        assert_eq!(snapshot.pool.max_size, engine.config().pool.max_size);
    }

    #[tokio::test]
    async fn shutdown_closes_the_pool() {
        let engine = engine();
        assert!(engine.shutdown(Duration::from_millis(100)).await);
        assert!(engine.pool().is_closed());

        let err = engine
            .executor()
            .execute(
                &crate::domain::Task::new("shout", json!({ "text": "late" })),
                &crate::executor::ExecuteOptions::new(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "pool_closed");
    }
}
