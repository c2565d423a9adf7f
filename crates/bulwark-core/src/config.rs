//! Engine configuration.
//!
//! Layering (later wins):
//! 1. built-in defaults (`EngineConfig::default()`)
//! 2. an optional file (TOML / YAML / JSON, picked by extension)
//! 3. environment variables, `BULWARK__<SECTION>__<FIELD>`,
//!    e.g. `BULWARK__POOL__MAX_SIZE=8`
//!
//! All durations are milliseconds.

use std::path::Path;
use std::time::Duration;

use ::config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_size: usize,
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 4,
            acquire_timeout_ms: 30_000,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failures (within the window) that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before a half-open trial.
    pub reset_timeout_ms: u64,
    /// Counting window. `None` counts consecutive failures without expiry.
    pub failure_window_ms: Option<u64>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            failure_window_ms: None,
        }
    }
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn failure_window(&self) -> Option<Duration> {
        self.failure_window_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Scale each delay by a uniform factor in [0.5, 1.0].
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Weights of the cache eviction score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub age: f64,
    pub frequency: f64,
    pub recency: f64,
    pub priority: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            age: 0.3,
            frequency: 0.4,
            recency: 0.2,
            priority: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry count that triggers eviction on insert.
    pub max_size: usize,
    /// TTL for entries set without one. `None` = never expire.
    pub default_ttl_ms: Option<u64>,
    pub weights: ScoreWeights,
    pub warm_batch_size: usize,
    pub warm_pause_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1_000,
            default_ttl_ms: Some(3_600_000),
            weights: ScoreWeights::default(),
            warm_batch_size: 10,
            warm_pause_ms: 100,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_ms.map(Duration::from_millis)
    }

    pub fn warm_pause(&self) -> Duration {
        Duration::from_millis(self.warm_pause_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub per_task_timeout_ms: u64,
    pub allow_partial_failure: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            per_task_timeout_ms: 120_000,
            allow_partial_failure: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn per_task_timeout(&self) -> Duration {
        Duration::from_millis(self.per_task_timeout_ms)
    }
}

impl EngineConfig {
    /// Defaults, then `path` (if any), then `BULWARK__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&EngineConfig::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let config: EngineConfig = builder
            .add_source(
                Environment::with_prefix("BULWARK")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with an in-memory document. No environment lookup.
    pub fn from_str_with_format(contents: &str, format: FileFormat) -> Result<Self, ConfigError> {
        let config: EngineConfig = Config::builder()
            .add_source(Config::try_from(&EngineConfig::default())?)
            .add_source(File::from_str(contents, format))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.pool.max_size == 0 {
            return invalid("pool.max_size must be at least 1");
        }
        if self.breaker.failure_threshold == 0 {
            return invalid("breaker.failure_threshold must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if !(self.retry.multiplier >= 1.0) {
            return invalid("retry.multiplier must be >= 1.0");
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return invalid("retry.max_delay_ms must be >= retry.base_delay_ms");
        }
        if self.cache.max_size == 0 {
            return invalid("cache.max_size must be at least 1");
        }
        if self.cache.warm_batch_size == 0 {
            return invalid("cache.warm_batch_size must be at least 1");
        }
        let w = self.cache.weights;
        if [w.age, w.frequency, w.recency, w.priority]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return invalid("cache.weights must be finite and non-negative");
        }
        if self.orchestrator.per_task_timeout_ms == 0 {
            return invalid("orchestrator.per_task_timeout_ms must be at least 1");
        }
        Ok(())
    }
}
