//! Application layer: wiring of the shared components into an `Engine`.

pub mod builder;

pub use self::builder::{BuildError, Engine, EngineBuilder};
