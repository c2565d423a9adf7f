//! TaskCall port: the slow, unreliable external service.
//!
//! The engine is agnostic to what the call does. It only needs
//! `(context, payload) -> value | TaskError`.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::{TaskError, TaskKey};

/// Per-attempt context handed to the call.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub task_key: TaskKey,
    /// 1-based attempt number within the retry loop.
    pub attempt: u32,
    /// Pool slot executing this call, if any.
    pub slot_id: Option<u64>,
    /// Cancelled when the caller stops waiting (timeout lost, shutdown).
    /// Long calls should watch it and return `ErrorKind::Cancelled`.
    pub cancellation: CancellationToken,
}

impl CallContext {
    pub fn new(task_key: TaskKey) -> Self {
        Self {
            task_key,
            attempt: 1,
            slot_id: None,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

#[async_trait]
pub trait TaskCall: Send + Sync {
    async fn call(
        &self,
        ctx: CallContext,
        payload: Arc<serde_json::Value>,
    ) -> Result<serde_json::Value, TaskError>;
}

/// Adapts a closure into a `TaskCall`.
pub struct FnTaskCall<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TaskCall for FnTaskCall<F>
where
    F: Fn(CallContext, Arc<serde_json::Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, TaskError>> + Send,
{
    async fn call(
        &self,
        ctx: CallContext,
        payload: Arc<serde_json::Value>,
    ) -> Result<serde_json::Value, TaskError> {
        (self.f)(ctx, payload).await
    }
}

/// ```ignore
/// let call = task_fn(|ctx, payload| async move {
///     Ok(serde_json::json!({ "task": ctx.task_key.as_str(), "echo": *payload }))
/// });
/// ```
pub fn task_fn<F, Fut>(f: F) -> Arc<dyn TaskCall>
where
    F: Fn(CallContext, Arc<serde_json::Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, TaskError>> + Send + 'static,
{
    Arc::new(FnTaskCall { f })
}
