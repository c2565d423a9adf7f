//! Ports: the seams between the engine and the outside world.
//!
//! - `TaskCall`: the external service the engine protects.
//! - `CacheLoader`: value source used when warming the cache.
//! - `Clock` / `IdGenerator`: time and identity, swappable in tests.

pub mod cache_loader;
pub mod clock;
pub mod id_generator;
pub mod task_call;

pub use self::cache_loader::{CacheLoader, FnLoader, loader_fn};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_call::{CallContext, FnTaskCall, TaskCall, task_fn};
