use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Retention tier. An entry is only ever evicted to make room for an entry
/// of strictly higher priority.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// 0.0 for `Low` up to 1.0 for `Critical`.
    pub fn normalized(self) -> f64 {
        match self {
            Priority::Low => 0.0,
            Priority::Normal => 1.0 / 3.0,
            Priority::High => 2.0 / 3.0,
            Priority::Critical => 1.0,
        }
    }
}

/// Options for `PriorityCache::set`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetOptions {
    /// `None` uses the cache's default TTL.
    pub ttl: Option<Duration>,
    /// Never expire, regardless of `ttl` and the default.
    pub no_expiry: bool,
    pub tags: Vec<String>,
    /// Keys this entry depends on; invalidating any of them removes it too.
    pub dependencies: Vec<String>,
    pub priority: Priority,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn no_expiry(mut self) -> Self {
        self.no_expiry = true;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn depends_on(mut self, key: impl Into<String>) -> Self {
        self.dependencies.push(key.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub ttl: Option<Duration>,
    pub tags: HashSet<String>,
    pub dependencies: HashSet<String>,
    pub priority: Priority,
    /// Serialized JSON size in bytes.
    pub size: usize,
}

impl<V> CacheEntry<V> {
    /// Expired once `now > created_at + ttl`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let Some(ttl) = self.ttl else {
            return false;
        };
        (now - self.created_at)
            .to_std()
            .is_ok_and(|age| age > ttl)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn idle(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_accessed_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}
