//! Resilience primitives wrapped around every task call.
//!
//! The executor nests them as `breaker(retry(call))`: the breaker only sees
//! the outcome once retries are done.

pub mod breaker;
pub mod retry;

pub use self::breaker::{BreakerRegistry, BreakerSnapshot, CircuitState};
pub use self::retry::RetryPolicy;
