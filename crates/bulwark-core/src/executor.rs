//! Task executor: one task call behind cache, pool, breaker and retry.
//!
//! Flow per task:
//! 1. cache lookup by `task.cache_key()`; a hit returns right away
//! 2. acquire a pool slot
//! 3. spawn `breaker(retry(call))`; the spawned task owns the slot
//! 4. race it against the per-task timeout; on timeout the call's
//!    cancellation token fires and the caller gets `TaskTimeout`
//! 5. write successes through to the cache

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{Priority, PriorityCache, SetOptions};
use crate::config::PoolConfig;
use crate::domain::{BatchId, Task, TaskFailure, TaskKey, TaskOutput, TaskResult};
use crate::error::{EngineError, EngineResult};
use crate::pool::{PoolSlot, ResourcePool, Worker};
use crate::ports::{CallContext, TaskCall};
use crate::resilience::{BreakerRegistry, RetryPolicy};

/// Cache tag for entries written on behalf of `batch_id`.
pub fn batch_tag(batch_id: &BatchId) -> String {
    format!("batch:{batch_id}")
}

/// Cache tag for entries computed from the payload with hash `hash`.
pub fn payload_tag(hash: &str) -> String {
    format!("payload:{hash}")
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteOptions {
    pub timeout: Duration,
    /// Tags the cache write so the batch can be invalidated as a whole.
    pub batch_id: Option<BatchId>,
    pub cache_priority: Priority,
    /// `None` uses the cache default.
    pub cache_ttl: Option<Duration>,
    /// Skip the lookup (the result is still written).
    pub bypass_cache: bool,
}

impl ExecuteOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            batch_id: None,
            cache_priority: Priority::Normal,
            cache_ttl: None,
            bypass_cache: false,
        }
    }

    pub fn batch(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn bypass_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }
}

/// Per-task-key counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KeyMetrics {
    pub task_key: Option<TaskKey>,
    pub executions: u64,
    pub cache_hits: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub rejections: u64,
    pub total_call_ms: u64,
    pub last_error: Option<String>,
}

impl KeyMetrics {
    /// Share of non-cached executions that succeeded.
    pub fn success_rate(&self) -> f64 {
        let calls = self.successes + self.failures;
        if calls == 0 {
            return 1.0;
        }
        self.successes as f64 / calls as f64
    }

    pub fn mean_call_ms(&self) -> Option<u64> {
        let calls = self.successes + self.failures;
        (calls > 0).then(|| self.total_call_ms / calls)
    }
}

pub struct TaskExecutor {
    call: Arc<dyn TaskCall>,
    pool: ResourcePool<Worker>,
    breakers: Arc<BreakerRegistry>,
    cache: Arc<PriorityCache<Value>>,
    retry: RetryPolicy,
    acquire_timeout: Duration,
    metrics: DashMap<TaskKey, KeyMetrics>,
}

impl TaskExecutor {
    pub fn new(
        call: Arc<dyn TaskCall>,
        pool: ResourcePool<Worker>,
        breakers: Arc<BreakerRegistry>,
        cache: Arc<PriorityCache<Value>>,
    ) -> Self {
        Self {
            call,
            pool,
            breakers,
            cache,
            retry: RetryPolicy::default(),
            acquire_timeout: PoolConfig::default().acquire_timeout(),
            metrics: DashMap::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_acquire_timeout(mut self, acquire_timeout: Duration) -> Self {
        self.acquire_timeout = acquire_timeout;
        self
    }

    pub fn pool(&self) -> &ResourcePool<Worker> {
        &self.pool
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn cache(&self) -> &Arc<PriorityCache<Value>> {
        &self.cache
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Served from cache without executing?
    pub fn is_cached(&self, task: &Task) -> bool {
        self.cache.contains(&task.cache_key())
    }

    pub async fn execute(&self, task: &Task, options: &ExecuteOptions) -> EngineResult<TaskOutput> {
        let started = Instant::now();
        let key = task.key().clone();
        let cache_key = task.cache_key();

        if !options.bypass_cache {
            if let Some(value) = self.cache.get(&cache_key) {
                debug!(task_key = %key, cache_key = %cache_key, "served from cache");
                self.record(&key, |m| m.cache_hits += 1);
                return Ok(TaskOutput {
                    task_key: key,
                    value,
                    duration: started.elapsed(),
                    cached: true,
                });
            }
        }

        let slot = match self.pool.acquire(self.acquire_timeout).await {
            Ok(slot) => slot,
            Err(err) => return Err(self.failed(&key, err, started)),
        };

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_call(
            Arc::clone(&self.call),
            Arc::clone(&self.breakers),
            self.retry.clone(),
            key.clone(),
            task.shared_payload(),
            slot,
            cancel.clone(),
        ));

        let result = match tokio::time::timeout(options.timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(EngineError::Internal(format!(
                "task_key={key} call aborted: {join_err}"
            ))),
            Err(_elapsed) => {
                // the spawned call keeps its slot until it notices
                cancel.cancel();
                Err(EngineError::TaskTimeout {
                    task_key: key.clone(),
                    timeout: options.timeout,
                })
            }
        };

        let value = match result {
            Ok(value) => value,
            Err(err) => return Err(self.failed(&key, err, started)),
        };

        let mut set = SetOptions::new()
            .tag(payload_tag(task.payload_hash()))
            .priority(options.cache_priority);
        if let Some(ttl) = options.cache_ttl {
            set = set.ttl(ttl);
        }
        if let Some(batch_id) = &options.batch_id {
            set = set.tag(batch_tag(batch_id));
        }
        if !self.cache.set(cache_key, value.clone(), set) {
            debug!(task_key = %key, "cache full of higher-priority entries, result not cached");
        }

        let duration = started.elapsed();
        self.record(&key, |m| {
            m.executions += 1;
            m.successes += 1;
            m.total_call_ms += duration.as_millis() as u64;
        });
        debug!(task_key = %key, duration_ms = duration.as_millis() as u64, "task succeeded");

        Ok(TaskOutput {
            task_key: key,
            value,
            duration,
            cached: false,
        })
    }

    /// `execute`, folded into a `TaskResult`.
    pub async fn run(&self, task: &Task, options: &ExecuteOptions) -> TaskResult {
        let started = Instant::now();
        match self.execute(task, options).await {
            Ok(output) => TaskResult::Succeeded(output),
            Err(error) => TaskResult::Failed(TaskFailure {
                task_key: task.key().clone(),
                error,
                duration: started.elapsed(),
            }),
        }
    }

    pub fn metrics(&self, key: &TaskKey) -> Option<KeyMetrics> {
        self.metrics.get(key).map(|m| m.value().clone())
    }

    /// Every key seen so far, sorted by task key.
    pub fn all_metrics(&self) -> Vec<KeyMetrics> {
        let mut all: Vec<KeyMetrics> = self.metrics.iter().map(|m| m.value().clone()).collect();
        all.sort_by(|a, b| a.task_key.cmp(&b.task_key));
        all
    }

    fn record(&self, key: &TaskKey, update: impl FnOnce(&mut KeyMetrics)) {
        let mut entry = self.metrics.entry(key.clone()).or_insert_with(|| KeyMetrics {
            task_key: Some(key.clone()),
            ..KeyMetrics::default()
        });
        update(entry.value_mut());
    }

    fn failed(&self, key: &TaskKey, err: EngineError, started: Instant) -> EngineError {
        let duration = started.elapsed();
        warn!(
            task_key = %key,
            code = err.code(),
            duration_ms = duration.as_millis() as u64,
            error = %err,
            "task failed"
        );
        self.record(key, |m| {
            match &err {
                EngineError::CircuitOpen { .. } => m.rejections += 1,
                EngineError::TaskTimeout { .. } => {
                    m.executions += 1;
                    m.timeouts += 1;
                    m.failures += 1;
                }
                EngineError::PoolTimeout { .. } | EngineError::PoolClosed => {}
                _ => {
                    m.executions += 1;
                    m.failures += 1;
                }
            }
            m.total_call_ms += duration.as_millis() as u64;
            m.last_error = Some(err.to_string());
        });
        err
    }
}

/// Spawned body: owns the slot until the call (and its retries) finish.
async fn run_call(
    call: Arc<dyn TaskCall>,
    breakers: Arc<BreakerRegistry>,
    retry: RetryPolicy,
    key: TaskKey,
    payload: Arc<Value>,
    mut slot: PoolSlot<Worker>,
    cancel: CancellationToken,
) -> EngineResult<Value> {
    let slot_id = slot.id();
    if let Some(worker) = slot.worker_mut() {
        worker.served += 1;
    }

    let result = breakers
        .call(&key, || {
            retry.execute(&cancel, |attempt| {
                let ctx = CallContext {
                    task_key: key.clone(),
                    attempt,
                    slot_id: Some(slot_id),
                    cancellation: cancel.clone(),
                };
                call.call(ctx, Arc::clone(&payload))
            })
        })
        .await;

    slot.release();
    result
}
