//! Cache warming: preload keys from a `CacheLoader` in bounded batches.

use std::time::Duration;

use futures::future::join_all;
use serde::{Serialize, Serializer};
use tracing::{debug, info, warn};

use super::entry::{Priority, SetOptions};
use super::priority::{PriorityCache, WARMED_TAG};
use crate::config::CacheConfig;
use crate::domain::TaskError;
use crate::ports::CacheLoader;

#[derive(Debug, Clone, PartialEq)]
pub struct WarmOptions {
    /// Keys loaded concurrently per batch.
    pub batch_size: usize,
    /// Pause between batches.
    pub pause: Duration,
    /// `None` uses the cache default.
    pub ttl: Option<Duration>,
    pub priority: Priority,
    pub tags: Vec<String>,
}

impl WarmOptions {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            batch_size: config.warm_batch_size.max(1),
            pause: config.warm_pause(),
            ttl: None,
            priority: Priority::Normal,
            tags: Vec::new(),
        }
    }
}

impl Default for WarmOptions {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

fn failures<S: Serializer>(f: &[(String, TaskError)], s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(f.iter().map(|(key, err)| format!("{key}: {err}")))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WarmReport {
    pub loaded: Vec<String>,
    /// Already present, not reloaded.
    pub skipped: Vec<String>,
    /// Loader had no value.
    pub missing: Vec<String>,
    /// Loaded but refused by a full cache.
    pub rejected: Vec<String>,
    #[serde(serialize_with = "failures")]
    pub failed: Vec<(String, TaskError)>,
}

impl<V> PriorityCache<V>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    /// Load every key that is not already cached.
    ///
    /// Loads run concurrently within a batch. The cache lock is never held
    /// while the loader runs.
    pub async fn warm<I, K>(
        &self,
        keys: I,
        loader: &dyn CacheLoader<V>,
        options: &WarmOptions,
    ) -> WarmReport
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let mut report = WarmReport::default();
        let mut pending = Vec::new();
        for key in keys {
            let key: String = key.into();
            if self.contains(&key) {
                report.skipped.push(key);
            } else {
                pending.push(key);
            }
        }

        let batch_size = options.batch_size.max(1);
        let batches = pending.len().div_ceil(batch_size);
        for (i, batch) in pending.chunks(batch_size).enumerate() {
            if i > 0 && !options.pause.is_zero() {
                tokio::time::sleep(options.pause).await;
            }

            let loads = batch.iter().map(|key| async move { (key, loader.load(key).await) });
            for (key, result) in join_all(loads).await {
                match result {
                    Ok(Some(value)) => {
                        if self.set(key.clone(), value, warm_set_options(options)) {
                            report.loaded.push(key.clone());
                        } else {
                            report.rejected.push(key.clone());
                        }
                    }
                    Ok(None) => report.missing.push(key.clone()),
                    Err(err) => {
                        warn!(key = %key, error = %err, "cache warm load failed");
                        report.failed.push((key.clone(), err));
                    }
                }
            }
            debug!(batch = i + 1, batches, "cache warm batch done");
        }

        info!(
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            missing = report.missing.len(),
            rejected = report.rejected.len(),
            failed = report.failed.len(),
            "cache warmed"
        );
        report
    }
}

fn warm_set_options(options: &WarmOptions) -> SetOptions {
    let mut set = SetOptions {
        ttl: options.ttl,
        priority: options.priority,
        tags: options.tags.clone(),
        ..SetOptions::default()
    };
    set.tags.push(WARMED_TAG.to_string());
    set
}
