//! Logging setup and point-in-time status views.

use std::sync::OnceLock;

use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::cache::CacheStats;
use crate::executor::{KeyMetrics, TaskExecutor};
use crate::pool::PoolStats;
use crate::resilience::BreakerSnapshot;

static TRACING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Install the global `tracing` subscriber.
///
/// The filter comes from `RUST_LOG`, then `BULWARK_LOG`, then `info`.
/// Only the first call does anything; if another subscriber is already set
/// it is kept.
pub fn init_tracing(json: bool) {
    TRACING_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_from_env("BULWARK_LOG"))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true);
        let installed = if json {
            builder.json().try_init()
        } else {
            builder.try_init()
        };
        if installed.is_err() {
            tracing::debug!("global tracing subscriber already set, keeping it");
        }
    });
}

/// Everything the engine can report about itself at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub pool: PoolStats,
    pub cache: CacheStats,
    /// One entry per task key that has a breaker, sorted by key.
    pub breakers: Vec<BreakerSnapshot>,
    /// Execution counters per task key, sorted by key.
    pub tasks: Vec<KeyMetrics>,
    pub workflow_sessions: usize,
}

impl EngineSnapshot {
    pub fn collect(executor: &TaskExecutor, workflow_sessions: usize) -> Self {
        Self {
            pool: executor.pool().stats(),
            cache: executor.cache().stats(),
            breakers: executor.breakers().snapshots(),
            tasks: executor.all_metrics(),
            workflow_sessions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PriorityCache;
    use crate::config::{BreakerConfig, CacheConfig};
    use crate::domain::{Task, TaskError, TaskKey};
    use crate::executor::ExecuteOptions;
    use crate::pool::ResourcePool;
    use crate::ports::{SystemClock, task_fn};
    use crate::resilience::{BreakerRegistry, CircuitState, RetryPolicy};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn init_tracing_can_be_called_repeatedly() {
        init_tracing(false);
        init_tracing(true);
    }

    #[tokio::test]
    async fn snapshot_reflects_executions() {
        let clock = Arc::new(SystemClock);
        let call = task_fn(|ctx, _payload| async move {
            match ctx.task_key.as_str() {
                "bad" => Err(TaskError::validation("nope")),
                _ => Ok(json!("ok")),
            }
        });
        let executor = TaskExecutor::new(
            call,
            ResourcePool::with_workers(2),
            Arc::new(BreakerRegistry::new(BreakerConfig::default(), clock.clone())),
            Arc::new(PriorityCache::new(CacheConfig::default(), clock)),
        )
        .with_retry(RetryPolicy::no_retry());
        let options = ExecuteOptions::new(Duration::from_secs(1));

        executor.execute(&Task::new("good", json!(1)), &options).await.unwrap();
        executor.execute(&Task::new("good", json!(1)), &options).await.unwrap();
        executor.execute(&Task::new("bad", json!(1)), &options).await.unwrap_err();

        let snapshot = EngineSnapshot::collect(&executor, 3);
        assert_eq!(snapshot.pool.max_size, 2);
        assert_eq!(snapshot.pool.in_use, 0);
        assert_eq!(snapshot.cache.entries, 1);
        assert_eq!(snapshot.cache.hits, 1);
        assert_eq!(snapshot.workflow_sessions, 3);

        let keys: Vec<_> = snapshot.tasks.iter().map(|m| m.task_key.clone()).collect();
        assert_eq!(keys, vec![Some(TaskKey::new("bad")), Some(TaskKey::new("good"))]);
        assert_eq!(snapshot.tasks[0].failures, 1);
        assert_eq!(snapshot.tasks[1].cache_hits, 1);

        let bad = snapshot
            .breakers
            .iter()
            .find(|b| b.task_key.as_str() == "bad")
            .unwrap();
        assert_eq!(bad.state, CircuitState::Closed);
        assert_eq!(bad.failure_count, 1);

        let rendered = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(rendered["workflow_sessions"], json!(3));
    }
}
