//! Parallel orchestrator: one payload fanned out to many task keys.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::domain::{BatchId, Task, TaskFailure, TaskKey, TaskOutput, TaskResult};
use crate::error::{EngineError, EngineResult};
use crate::executor::{ExecuteOptions, TaskExecutor, batch_tag};
use crate::ports::IdGenerator;
use crate::scheduler::{ExecutionMode, ExecutionPlan, PlanContext, Scheduler};

#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    /// Collect every outcome (`true`) or fail on the first error (`false`).
    pub allow_partial_failure: bool,
    pub per_task_timeout: Duration,
    pub context_hash: Option<String>,
    /// Generated when `None`.
    pub batch_id: Option<BatchId>,
}

impl RunOptions {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            allow_partial_failure: config.allow_partial_failure,
            per_task_timeout: config.per_task_timeout(),
            context_hash: None,
            batch_id: None,
        }
    }

    pub fn strict(mut self) -> Self {
        self.allow_partial_failure = false;
        self
    }

    pub fn partial(mut self) -> Self {
        self.allow_partial_failure = true;
        self
    }

    pub fn timeout(mut self, per_task_timeout: Duration) -> Self {
        self.per_task_timeout = per_task_timeout;
        self
    }

    pub fn context_hash(mut self, context_hash: impl Into<String>) -> Self {
        self.context_hash = Some(context_hash.into());
        self
    }

    pub fn batch_id(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchTimings {
    #[serde(rename = "total_ms", serialize_with = "as_millis")]
    pub total: Duration,
    /// Per task key, in milliseconds.
    pub per_task_ms: BTreeMap<TaskKey, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub batch_id: BatchId,
    pub succeeded: BTreeMap<TaskKey, TaskOutput>,
    pub failed: Vec<TaskFailure>,
    pub timings: BatchTimings,
    pub plan: ExecutionPlan,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn value(&self, key: &TaskKey) -> Option<&Value> {
        self.succeeded.get(key).map(|o| &o.value)
    }

    pub fn cache_hits(&self) -> usize {
        self.succeeded.values().filter(|o| o.cached).count()
    }
}

pub struct ParallelOrchestrator {
    executor: Arc<TaskExecutor>,
    ids: Arc<dyn IdGenerator>,
    scheduler: Option<Arc<Scheduler>>,
}

impl ParallelOrchestrator {
    pub fn new(executor: Arc<TaskExecutor>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            executor,
            ids,
            scheduler: None,
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    /// Run every key against `payload`.
    ///
    /// Partial mode returns all outcomes. Strict mode returns the first
    /// failure as the error; tasks still in flight are left to finish on
    /// their own and their results are dropped.
    pub async fn run<I, K>(
        &self,
        task_keys: I,
        payload: Value,
        options: RunOptions,
    ) -> EngineResult<BatchOutcome>
    where
        I: IntoIterator<Item = K>,
        K: Into<TaskKey>,
    {
        let started = Instant::now();
        let batch_id = options.batch_id.unwrap_or_else(|| self.ids.batch_id());
        let tasks = self.tasks(task_keys, payload, options.context_hash.as_deref());

        let plan = match &self.scheduler {
            Some(scheduler) => scheduler.plan(&PlanContext::gather(&self.executor, &tasks)),
            None => ExecutionPlan::baseline(&tasks.iter().map(|t| t.key().clone()).collect::<Vec<_>>()),
        };
        let tasks = ordered(tasks, &plan.order);

        let exec_options = ExecuteOptions::new(options.per_task_timeout).batch(batch_id);
        let strict = !options.allow_partial_failure;
        info!(
            batch_id = %batch_id,
            tasks = tasks.len(),
            mode = ?plan.mode,
            strict,
            "batch started"
        );

        let results = match plan.mode {
            ExecutionMode::Parallel => self.run_parallel(tasks, &exec_options, strict).await?,
            ExecutionMode::Sequential => self.run_sequential(tasks, &exec_options, strict).await?,
        };

        let mut outcome = BatchOutcome {
            batch_id,
            succeeded: BTreeMap::new(),
            failed: Vec::new(),
            timings: BatchTimings::default(),
            plan,
        };
        for result in results {
            outcome
                .timings
                .per_task_ms
                .insert(result.task_key().clone(), result.duration().as_millis() as u64);
            match result {
                TaskResult::Succeeded(output) => {
                    outcome.succeeded.insert(output.task_key.clone(), output);
                }
                TaskResult::Failed(failure) => outcome.failed.push(failure),
            }
        }
        outcome.failed.sort_by(|a, b| a.task_key.cmp(&b.task_key));
        outcome.timings.total = started.elapsed();

        info!(
            batch_id = %batch_id,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            cache_hits = outcome.cache_hits(),
            total_ms = outcome.timings.total.as_millis() as u64,
            "batch finished"
        );
        Ok(outcome)
    }

    /// Drop every cache entry written by `batch_id`.
    pub fn invalidate_batch(&self, batch_id: &BatchId) -> Vec<String> {
        let removed = self.executor.cache().invalidate_by_tag(&batch_tag(batch_id));
        info!(batch_id = %batch_id, removed = removed.len(), "batch invalidated");
        removed
    }

    fn tasks<I, K>(&self, task_keys: I, payload: Value, context_hash: Option<&str>) -> Vec<Task>
    where
        I: IntoIterator<Item = K>,
        K: Into<TaskKey>,
    {
        let payload = Arc::new(payload);
        let mut seen = HashSet::new();
        let mut tasks = Vec::new();
        for key in task_keys.into_iter() {
            let key: TaskKey = key.into();
            if !seen.insert(key.clone()) {
                warn!(task_key = %key, "duplicate task key in batch, running it once");
                continue;
            }
            let task = Task::with_shared_payload(key, Arc::clone(&payload));
            tasks.push(match context_hash {
                Some(ctx) => task.with_context_hash(ctx),
                None => task,
            });
        }
        tasks
    }

    async fn run_parallel(
        &self,
        tasks: Vec<Task>,
        options: &ExecuteOptions,
        strict: bool,
    ) -> EngineResult<Vec<TaskResult>> {
        let mut set = JoinSet::new();
        let mut keys = HashMap::new();
        for task in tasks {
            let executor = Arc::clone(&self.executor);
            let options = options.clone();
            let key = task.key().clone();
            let handle = set.spawn(async move { executor.run(&task, &options).await });
            keys.insert(handle.id(), key);
        }

        let mut results = Vec::with_capacity(keys.len());
        while let Some(joined) = set.join_next_with_id().await {
            let result = match joined {
                Ok((_, result)) => result,
                Err(join_err) => TaskResult::Failed(TaskFailure {
                    task_key: keys.get(&join_err.id()).cloned().unwrap_or_else(|| TaskKey::new("unknown")),
                    error: EngineError::Internal(join_err.to_string()),
                    duration: Duration::ZERO,
                }),
            };
            if strict {
                if let TaskResult::Failed(failure) = result {
                    set.detach_all();
                    return Err(failure.error);
                }
            }
            results.push(result);
        }
        Ok(results)
    }

    async fn run_sequential(
        &self,
        tasks: Vec<Task>,
        options: &ExecuteOptions,
        strict: bool,
    ) -> EngineResult<Vec<TaskResult>> {
        let mut results = Vec::with_capacity(tasks.len());
        for task in &tasks {
            let result = self.executor.run(task, options).await;
            if strict {
                if let TaskResult::Failed(failure) = result {
                    return Err(failure.error);
                }
            }
            results.push(result);
        }
        Ok(results)
    }
}

/// Reorder `tasks` to follow `order`. Keys missing from `order` keep their
/// relative position at the end.
fn ordered(tasks: Vec<Task>, order: &[TaskKey]) -> Vec<Task> {
    let rank: HashMap<&TaskKey, usize> = order.iter().enumerate().map(|(i, k)| (k, i)).collect();
    let mut tasks = tasks;
    tasks.sort_by_key(|t| rank.get(t.key()).copied().unwrap_or(usize::MAX));
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PriorityCache;
    use crate::config::{BreakerConfig, CacheConfig};
    use crate::domain::TaskError;
    use crate::pool::ResourcePool;
    use crate::ports::{SystemClock, TaskCall, UlidGenerator, task_fn};
    use crate::resilience::{BreakerRegistry, RetryPolicy};
    use crate::scheduler::ExecutionStrategy;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn orchestrator(call: Arc<dyn TaskCall>, pool_size: usize) -> ParallelOrchestrator {
        let clock = Arc::new(SystemClock);
        let executor = TaskExecutor::new(
            call,
            ResourcePool::with_workers(pool_size),
            Arc::new(BreakerRegistry::new(BreakerConfig::default(), clock.clone())),
            Arc::new(PriorityCache::new(CacheConfig::default(), clock.clone())),
        )
        .with_retry(RetryPolicy::no_retry());
        ParallelOrchestrator::new(Arc::new(executor), Arc::new(UlidGenerator::new(clock)))
    }

    /// Fails for task key "b", echoes otherwise.
    fn b_fails() -> Arc<dyn TaskCall> {
        task_fn(|ctx, payload| async move {
            if ctx.task_key.as_str() == "b" {
                Err(TaskError::validation("b always fails"))
            } else {
                Ok(json!({ "task": ctx.task_key.as_str(), "q": payload["q"] }))
            }
        })
    }

    fn opts() -> RunOptions {
        RunOptions::default().timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn partial_mode_collects_successes_and_failures() {
        let orch = orchestrator(b_fails(), 4);

        let outcome = orch
            .run(["a", "b", "c"], json!({ "q": 1 }), opts().partial())
            .await
            .unwrap();

        let succeeded: Vec<&str> = outcome.succeeded.keys().map(|k| k.as_str()).collect();
        assert_eq!(succeeded, vec!["a", "c"]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].task_key.as_str(), "b");
        assert_eq!(outcome.value(&TaskKey::new("a")), Some(&json!({ "task": "a", "q": 1 })));
        assert_eq!(outcome.timings.per_task_ms.len(), 3);
        assert!(!outcome.is_complete());
    }

    #[tokio::test]
    async fn strict_mode_returns_the_first_failure() {
        let orch = orchestrator(b_fails(), 4);

        let err = orch
            .run(["a", "b", "c"], json!({ "q": 1 }), opts().strict())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "task_error");
        assert!(err.to_string().contains("b always fails"));
    }

    #[tokio::test(start_paused = true)]
    async fn strict_mode_leaves_the_rest_running_to_completion() {
        let call = task_fn(|ctx, _payload| async move {
            if ctx.task_key.as_str() == "b" {
                return Err(TaskError::validation("b always fails"));
            }
            // does not watch the cancellation token
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(json!(ctx.task_key.as_str()))
        });
        let orch = orchestrator(call, 4);
        let payload = json!({ "q": 1 });

        let err = orch
            .run(["a", "b", "c"], payload.clone(), opts().strict())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("b always fails"));

        let pool = orch.executor().pool();
        assert_eq!(pool.stats().in_use, 2);
        assert!(pool.drain(Duration::from_secs(1)).await);
        assert_eq!(pool.stats().in_use, 0);

        for key in ["a", "c"] {
            assert!(orch.executor().is_cached(&Task::new(key, payload.clone())));
        }
        assert!(!orch.executor().is_cached(&Task::new("b", payload)));
    }

    #[tokio::test]
    async fn rerun_is_served_from_cache_until_batch_is_invalidated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let call = task_fn({
            let calls = calls.clone();
            move |_ctx, _payload| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("done"))
                }
            }
        });
        let orch = orchestrator(call, 2);

        let first = orch.run(["a", "b"], json!({}), opts()).await.unwrap();
        let second = orch.run(["a", "b"], json!({}), opts()).await.unwrap();
        assert_eq!(first.cache_hits(), 0);
        assert_eq!(second.cache_hits(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert_eq!(orch.invalidate_batch(&first.batch_id).len(), 2);
        let third = orch.run(["a", "b"], json!({}), opts()).await.unwrap();
        assert_eq!(third.cache_hits(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn context_hash_separates_cache_entries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let call = task_fn({
            let calls = calls.clone();
            move |_ctx, _payload| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(1))
                }
            }
        });
        let orch = orchestrator(call, 2);

        orch.run(["a"], json!({}), opts().context_hash("turn-1")).await.unwrap();
        orch.run(["a"], json!({}), opts().context_hash("turn-2")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn duplicate_keys_run_once() {
        let orch = orchestrator(b_fails(), 2);
        let outcome = orch.run(["a", "a", "c"], json!({}), opts()).await.unwrap();
        assert_eq!(outcome.succeeded.len(), 2);
        assert_eq!(outcome.timings.per_task_ms.len(), 2);
    }

    struct AlwaysSequential;

    impl ExecutionStrategy for AlwaysSequential {
        fn name(&self) -> &'static str {
            "always_sequential"
        }
        fn rank(&self) -> u32 {
            100
        }
        fn applies(&self, _ctx: &PlanContext) -> bool {
            true
        }
        fn apply(&self, _ctx: &PlanContext, plan: &mut ExecutionPlan) {
            plan.mode = ExecutionMode::Sequential;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_plan_runs_one_task_at_a_time() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let call = task_fn({
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            move |_ctx, _payload| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            }
        });
        let scheduler = Scheduler::with_defaults().with_strategy(Arc::new(AlwaysSequential));
        let orch = orchestrator(call, 4).with_scheduler(Arc::new(scheduler));

        let outcome = orch.run(["a", "b", "c"], json!({}), opts()).await.unwrap();

        assert_eq!(outcome.plan.mode, ExecutionMode::Sequential);
        assert_eq!(outcome.succeeded.len(), 3);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
