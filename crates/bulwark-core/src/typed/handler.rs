//! `Handler<T>`: the typed surface. `TypedHandler` erases `T` so that typed
//! handlers can sit in the `HandlerRegistry` next to untyped ones.

use std::marker::PhantomData;

use async_trait::async_trait;

use super::task::TypedTask;
use crate::domain::TaskError;
use crate::ports::CallContext;
use crate::registry::TaskHandler;

#[async_trait]
pub trait Handler<T: TypedTask>: Send + Sync {
    async fn handle(&self, ctx: &CallContext, task: T) -> Result<T::Output, TaskError>;
}

pub struct TypedHandler<T: TypedTask, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: TypedTask, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: TypedTask, H: Handler<T>> TaskHandler for TypedHandler<T, H> {
    async fn handle(
        &self,
        ctx: &CallContext,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, TaskError> {
        // a payload that does not decode will not decode on retry either
        let task: T = serde_json::from_value(payload.clone())
            .map_err(|e| TaskError::validation(format!("{}: json decode: {e}", T::KEY)))?;
        let output = self.handler.handle(ctx, task).await?;
        serde_json::to_value(output)
            .map_err(|e| TaskError::validation(format!("{}: json encode: {e}", T::KEY)))
    }
}
