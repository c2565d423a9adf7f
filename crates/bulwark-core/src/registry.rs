use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{TaskError, TaskKey};
use crate::ports::{CallContext, TaskCall};
use crate::typed::{Handler, TypedHandler, TypedTask};

/// Executes the work behind one task key.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: &CallContext, payload: &Value) -> Result<Value, TaskError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for task_key={0} is already registered")]
    AlreadyRegistered(TaskKey),
}

/// Registry of handlers (task key -> handler).
///
/// Built during initialization (mutable), shared read-only afterwards, so no
/// locks. Implements `TaskCall`, which makes it a drop-in call target for the
/// executor.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKey, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        task_key: impl Into<TaskKey>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), RegistryError> {
        let task_key = task_key.into();
        if self.handlers.contains_key(&task_key) {
            return Err(RegistryError::AlreadyRegistered(task_key));
        }
        self.handlers.insert(task_key, handler);
        Ok(())
    }

    /// Register a typed handler under `T::KEY`.
    pub fn register_typed<T, H>(&mut self, handler: H) -> Result<(), RegistryError>
    where
        T: TypedTask,
        H: Handler<T> + 'static,
    {
        self.register(T::KEY, Arc::new(TypedHandler::<T, H>::new(handler)))
    }

    pub fn get(&self, task_key: &TaskKey) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(task_key)
    }

    pub fn contains(&self, task_key: &TaskKey) -> bool {
        self.handlers.contains_key(task_key)
    }

    /// Registered keys, sorted.
    pub fn task_keys(&self) -> Vec<TaskKey> {
        let mut keys: Vec<TaskKey> = self.handlers.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl TaskCall for HandlerRegistry {
    async fn call(&self, ctx: CallContext, payload: Arc<Value>) -> Result<Value, TaskError> {
        let handler = self.handlers.get(&ctx.task_key).ok_or_else(|| {
            TaskError::validation(format!("no handler registered for task_key={}", ctx.task_key))
        })?;
        handler.handle(&ctx, &payload).await
    }
}
