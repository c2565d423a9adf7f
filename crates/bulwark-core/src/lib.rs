//! bulwark-core
//!
//! Resilient concurrent execution of keyed tasks against an unreliable
//! downstream service.
//!
//! # Modules
//! - **domain**: ids, task keys, payload hashing, task results, workflow states
//! - **ports**: seams to the outside (TaskCall, CacheLoader, Clock, IdGenerator)
//! - **pool**: bounded FIFO resource pool with slot guards
//! - **resilience**: per-key circuit breakers and retry with backoff
//! - **cache**: priority cache with TTL, tags, dependency cascade and warming
//! - **registry** / **typed**: handler routing by task key, typed payloads
//! - **executor**: cache → pool → breaker(retry(call)) with a timeout
//! - **scheduler**: ranked strategies that plan a batch
//! - **orchestrator**: one payload fanned out to many task keys
//! - **workflow**: sequential sessions, one task at a time
//! - **app**: `EngineBuilder` wiring everything together
//! - **config** / **observability** / **error**: ambient concerns

pub mod app;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod executor;
pub mod observability;
pub mod orchestrator;
pub mod pool;
pub mod ports;
pub mod registry;
pub mod resilience;
pub mod scheduler;
pub mod typed;
pub mod workflow;

pub use app::{BuildError, Engine, EngineBuilder};
pub use config::EngineConfig;
pub use domain::{Task, TaskError, TaskKey, TaskResult, WorkflowState};
pub use error::{EngineError, EngineResult};
pub use executor::{ExecuteOptions, TaskExecutor};
pub use orchestrator::{BatchOutcome, ParallelOrchestrator, RunOptions};
pub use workflow::{SequentialWorkflow, WorkflowStatus};
