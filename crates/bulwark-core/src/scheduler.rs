//! Execution planning for a batch.
//!
//! A `Scheduler` holds ranked `ExecutionStrategy`s. Each applicable strategy
//! edits the plan in rank order (lowest first): reorders keys, switches the
//! mode, scales the speedup estimate.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::domain::{Task, TaskKey};
use crate::executor::TaskExecutor;
use crate::pool::PoolStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Parallel,
    Sequential,
}

/// What the strategies see when planning a batch.
#[derive(Debug, Clone, Default)]
pub struct PlanContext {
    pub keys: Vec<TaskKey>,
    /// Keys whose result is already cached.
    pub cached: HashSet<TaskKey>,
    /// Keys whose circuit currently rejects calls.
    pub open_circuits: HashSet<TaskKey>,
    pub pool: PoolStats,
}

impl PlanContext {
    pub fn gather(executor: &TaskExecutor, tasks: &[Task]) -> Self {
        Self {
            keys: tasks.iter().map(|t| t.key().clone()).collect(),
            cached: tasks
                .iter()
                .filter(|t| executor.is_cached(t))
                .map(|t| t.key().clone())
                .collect(),
            open_circuits: executor.breakers().open_keys().into_iter().collect(),
            pool: executor.pool().stats(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionPlan {
    pub order: Vec<TaskKey>,
    pub mode: ExecutionMode,
    /// Rough wall-clock gain over running every key one by one uncached.
    pub estimated_speedup: f64,
    /// Names of the strategies that changed this plan.
    pub applied: Vec<&'static str>,
}

impl ExecutionPlan {
    /// Keys in input order, parallel, no estimate.
    pub fn baseline(keys: &[TaskKey]) -> Self {
        Self {
            order: keys.to_vec(),
            mode: ExecutionMode::Parallel,
            estimated_speedup: 1.0,
            applied: Vec::new(),
        }
    }
}

pub trait ExecutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lower runs first.
    fn rank(&self) -> u32;

    fn applies(&self, ctx: &PlanContext) -> bool;

    fn apply(&self, ctx: &PlanContext, plan: &mut ExecutionPlan);
}

/// Cached keys first: they finish instantly and free the caller early.
#[derive(Debug, Default)]
pub struct CacheFirstOrdering;

impl ExecutionStrategy for CacheFirstOrdering {
    fn name(&self) -> &'static str {
        "cache_first"
    }

    fn rank(&self) -> u32 {
        10
    }

    fn applies(&self, ctx: &PlanContext) -> bool {
        !ctx.cached.is_empty()
    }

    fn apply(&self, ctx: &PlanContext, plan: &mut ExecutionPlan) {
        plan.order.sort_by_key(|k| !ctx.cached.contains(k));
        let total = plan.order.len();
        let uncached = total - plan.order.iter().filter(|k| ctx.cached.contains(*k)).count();
        plan.estimated_speedup *= total as f64 / uncached.max(1) as f64;
    }
}

/// Keys with an open circuit last: they fail fast and should not hold up
/// the keys that can still run.
#[derive(Debug, Default)]
pub struct BreakerAwareOrdering;

impl ExecutionStrategy for BreakerAwareOrdering {
    fn name(&self) -> &'static str {
        "breaker_aware"
    }

    fn rank(&self) -> u32 {
        20
    }

    fn applies(&self, ctx: &PlanContext) -> bool {
        ctx.keys.iter().any(|k| ctx.open_circuits.contains(k))
    }

    fn apply(&self, ctx: &PlanContext, plan: &mut ExecutionPlan) {
        plan.order.sort_by_key(|k| ctx.open_circuits.contains(k));
    }
}

/// Parallel while the pool has room, sequential once it is saturated.
#[derive(Debug, Default)]
pub struct LoadBasedMode;

impl ExecutionStrategy for LoadBasedMode {
    fn name(&self) -> &'static str {
        "load_based"
    }

    fn rank(&self) -> u32 {
        30
    }

    fn applies(&self, _ctx: &PlanContext) -> bool {
        true
    }

    fn apply(&self, ctx: &PlanContext, plan: &mut ExecutionPlan) {
        let busy = ctx.pool.in_use + ctx.pool.waiting;
        let free = ctx.pool.max_size.saturating_sub(busy);
        if free == 0 {
            plan.mode = ExecutionMode::Sequential;
            return;
        }
        plan.mode = ExecutionMode::Parallel;
        let runnable = ctx
            .keys
            .iter()
            .filter(|k| !ctx.cached.contains(*k) && !ctx.open_circuits.contains(*k))
            .count();
        plan.estimated_speedup *= runnable.clamp(1, free) as f64;
    }
}

#[derive(Default)]
pub struct Scheduler {
    strategies: Vec<Arc<dyn ExecutionStrategy>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache-first, breaker-aware, load-based.
    pub fn with_defaults() -> Self {
        Self::new()
            .with_strategy(Arc::new(CacheFirstOrdering))
            .with_strategy(Arc::new(BreakerAwareOrdering))
            .with_strategy(Arc::new(LoadBasedMode))
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn ExecutionStrategy>) -> Self {
        self.strategies.push(strategy);
        self.strategies.sort_by_key(|s| s.rank());
        self
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn plan(&self, ctx: &PlanContext) -> ExecutionPlan {
        let mut plan = ExecutionPlan::baseline(&ctx.keys);
        for strategy in &self.strategies {
            if strategy.applies(ctx) {
                strategy.apply(ctx, &mut plan);
                plan.applied.push(strategy.name());
            }
        }
        debug!(
            keys = plan.order.len(),
            mode = ?plan.mode,
            speedup = plan.estimated_speedup,
            applied = ?plan.applied,
            "execution plan"
        );
        plan
    }
}
