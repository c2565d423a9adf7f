//! Typed task API.
//!
//! - Surface: `TypedTask` + `Handler<T>`, checked at compile time.
//! - Inside: `TypedHandler` turns a `Handler<T>` into a `TaskHandler`
//!   working on JSON, so the registry can store it behind `dyn`.

pub mod handler;
pub mod task;

pub use self::handler::{Handler, TypedHandler};
pub use self::task::TypedTask;
