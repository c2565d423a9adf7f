//! Priority cache for task results.
//!
//! - `priority`: the cache itself (TTL, tags, eviction, invalidation)
//! - `dependency`: key dependency graph used for cascade invalidation
//! - `warming`: bulk preload through a `CacheLoader`

pub mod dependency;
pub mod entry;
pub mod priority;
pub mod warming;

pub use self::dependency::{Cascade, DependencyGraph};
pub use self::entry::{CacheEntry, Priority, SetOptions};
pub use self::priority::{CacheStats, PriorityCache};
pub use self::warming::{WarmOptions, WarmReport};
