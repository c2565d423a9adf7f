//! Priority cache with TTL, tags, dependency cascade and score-based eviction.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use super::dependency::DependencyGraph;
use super::entry::{CacheEntry, Priority, SetOptions};
use crate::config::{CacheConfig, ScoreWeights};
use crate::error::{EngineError, EngineResult};
use crate::ports::Clock;

/// Internal tag carried by entries written by `warm`.
pub(crate) const WARMED_TAG: &str = "__warmed";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    /// Hits on entries loaded by warming.
    pub warmed_hits: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    /// Inserts refused because the cache was already one over `max_size`.
    pub rejections: u64,
    pub expirations: u64,
    pub invalidations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    warmed_hits: u64,
    evictions: u64,
    rejections: u64,
    expirations: u64,
    invalidations: u64,
}

struct Inner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    tags: HashMap<String, HashSet<String>>,
    graph: DependencyGraph,
    counters: Counters,
}

impl<V> Inner<V> {
    /// Remove one entry and its index entries. Dependents are untouched.
    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        for tag in &entry.tags {
            if let Some(keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
        self.graph.remove_key(key);
        Some(entry)
    }

    fn sweep_expired(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove_entry(key);
        }
        self.counters.expirations += expired.len() as u64;
        expired.len()
    }

    /// Remove `root` and everything depending on it. Returns the keys that
    /// were actually present.
    fn cascade(&mut self, root: &str) -> Vec<String> {
        let cascade = self.graph.cascade(root);
        if cascade.revisited {
            if let Some(cycle) = self.graph.detect_cycle() {
                warn!(root, cycle = ?cycle, "dependency cycle in cache, invalidating each key once");
            }
        }

        let mut removed = Vec::new();
        for key in cascade.keys {
            if self.remove_entry(&key).is_some() {
                self.counters.invalidations += 1;
                removed.push(key);
            }
        }
        removed
    }
}

pub struct PriorityCache<V> {
    inner: Mutex<Inner<V>>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
}

impl<V> PriorityCache<V>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                tags: HashMap::new(),
                graph: DependencyGraph::new(),
                counters: Counters::default(),
            }),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Live value for `key`. Expired entries are removed and count as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let expired = match inner.entries.get(key) {
            None => {
                inner.counters.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            inner.remove_entry(key);
            inner.counters.expirations += 1;
            inner.counters.misses += 1;
            debug!(key, "cache entry expired");
            return None;
        }

        let (value, warmed) = match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.access_count += 1;
                entry.last_accessed_at = now;
                (entry.value.clone(), entry.tags.contains(WARMED_TAG))
            }
            None => return None,
        };
        inner.counters.hits += 1;
        if warmed {
            inner.counters.warmed_hits += 1;
        }
        Some(value)
    }

    /// Present and not expired. Does not touch access stats.
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.inner
            .lock()
            .entries
            .get(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Insert or replace `key`. Returns `false` if the insert was refused.
    ///
    /// Inserting a new key into a full cache first drops expired entries,
    /// then evicts the lowest-scoring entry of strictly lower priority. If
    /// there is none, the insert still goes through as long as the cache is
    /// at most one entry over `max_size`; past that it is refused.
    pub fn set(&self, key: impl Into<String>, value: V, options: SetOptions) -> bool {
        let key = key.into();
        let now = self.clock.now();
        let size = serde_json::to_vec(&value).map(|b| b.len()).unwrap_or(0);
        let ttl = if options.no_expiry {
            None
        } else {
            options.ttl.or(self.config.default_ttl())
        };

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let max_size = self.config.max_size;
        if !inner.entries.contains_key(&key) && inner.entries.len() >= max_size {
            let swept = inner.sweep_expired(now);
            if swept > 0 {
                debug!(swept, incoming = %key, "expired entries dropped to make room");
            }
        }
        if !inner.entries.contains_key(&key) && inner.entries.len() >= max_size {
            match pick_victim(&inner.entries, options.priority, now, &self.config.weights) {
                Some(victim) => {
                    inner.remove_entry(&victim);
                    inner.counters.evictions += 1;
                    debug!(evicted = %victim, incoming = %key, "cache eviction");
                }
                None if inner.entries.len() > max_size => {
                    inner.counters.rejections += 1;
                    debug!(
                        incoming = %key,
                        size = inner.entries.len(),
                        "no lower-priority entry to evict, insert refused"
                    );
                    return false;
                }
                None => debug!(
                    incoming = %key,
                    size = inner.entries.len(),
                    "no lower-priority entry to evict, cache one over max_size"
                ),
            }
        }
        inner.remove_entry(&key);

        for tag in &options.tags {
            inner
                .tags
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }
        for dep in &options.dependencies {
            inner.graph.add_dependency(&key, dep);
        }
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
                last_accessed_at: now,
                access_count: 0,
                ttl,
                tags: options.tags.into_iter().collect(),
                dependencies: options.dependencies.into_iter().collect(),
                priority: options.priority,
                size,
            },
        );
        true
    }

    /// Remove `key` only. Entries depending on it stay.
    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().remove_entry(key).is_some()
    }

    /// Remove `key` and, transitively, every entry depending on it.
    /// Each key is visited once, even over a cyclic graph.
    pub fn invalidate(&self, key: &str) -> Vec<String> {
        let removed = self.inner.lock().cascade(key);
        debug!(key, removed = removed.len(), "cache invalidation");
        removed
    }

    /// Cascade-invalidate every entry tagged `tag`.
    pub fn invalidate_by_tag(&self, tag: &str) -> Vec<String> {
        let mut inner = self.inner.lock();
        let mut roots: Vec<String> = inner
            .tags
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        roots.sort();

        let mut removed = Vec::new();
        for root in roots {
            removed.extend(inner.cascade(&root));
        }
        debug!(tag, removed = removed.len(), "cache invalidation by tag");
        removed
    }

    /// Cascade-invalidate every key matching the regular expression.
    pub fn invalidate_by_pattern(&self, pattern: &str) -> EngineResult<Vec<String>> {
        let re = Regex::new(pattern)
            .map_err(|err| EngineError::InvalidPattern(format!("{pattern}: {err}")))?;

        let mut inner = self.inner.lock();
        let mut roots: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| re.is_match(k))
            .cloned()
            .collect();
        roots.sort();

        let mut removed = Vec::new();
        for root in roots {
            removed.extend(inner.cascade(&root));
        }
        debug!(pattern, removed = removed.len(), "cache invalidation by pattern");
        Ok(removed)
    }

    /// Eagerly drop every expired entry. Returns how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        self.inner.lock().sweep_expired(now)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry and index. Counters are kept.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.tags.clear();
        inner.graph.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let c = &inner.counters;
        let lookups = c.hits + c.misses;
        CacheStats {
            entries: inner.entries.len(),
            total_bytes: inner.entries.values().map(|e| e.size).sum(),
            hits: c.hits,
            misses: c.misses,
            warmed_hits: c.warmed_hits,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                c.hits as f64 / lookups as f64
            },
            evictions: c.evictions,
            rejections: c.rejections,
            expirations: c.expirations,
            invalidations: c.invalidations,
        }
    }

    /// Keys currently tagged `tag`.
    pub fn keys_with_tag(&self, tag: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .lock()
            .tags
            .get(tag)
            .map(|k| k.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

/// Lowest retention score among entries of priority strictly below
/// `incoming`.
///
/// retention = w.age * (1 - age) + w.frequency * frequency
///           + w.recency * (1 - idle) + w.priority * priority
///
/// Each term is normalized to 0..=1 across the candidates, so old, rarely
/// read, long-idle, low-priority entries go first.
fn pick_victim<V>(
    entries: &HashMap<String, CacheEntry<V>>,
    incoming: Priority,
    now: DateTime<Utc>,
    w: &ScoreWeights,
) -> Option<String> {
    let candidates: Vec<(&String, &CacheEntry<V>)> = entries
        .iter()
        .filter(|(_, e)| e.priority < incoming)
        .collect();
    if candidates.is_empty() {
        return None;
    }

    let max_age = candidates
        .iter()
        .map(|(_, e)| e.age(now).as_secs_f64())
        .fold(0.0, f64::max);
    let max_idle = candidates
        .iter()
        .map(|(_, e)| e.idle(now).as_secs_f64())
        .fold(0.0, f64::max);
    let max_hits = candidates
        .iter()
        .map(|(_, e)| e.access_count)
        .max()
        .unwrap_or(0) as f64;

    let ratio = |v: f64, max: f64| if max > 0.0 { v / max } else { 0.0 };

    candidates
        .into_iter()
        .map(|(key, e)| {
            let age = ratio(e.age(now).as_secs_f64(), max_age);
            let idle = ratio(e.idle(now).as_secs_f64(), max_idle);
            let frequency = ratio(e.access_count as f64, max_hits);
            let score = w.age * (1.0 - age)
                + w.frequency * frequency
                + w.recency * (1.0 - idle)
                + w.priority * e.priority.normalized();
            (key, score)
        })
        .min_by(|(ka, a), (kb, b)| a.total_cmp(b).then_with(|| ka.cmp(kb)))
        .map(|(key, _)| key.clone())
}
