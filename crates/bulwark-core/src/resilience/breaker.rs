//! Per-task-key circuit breakers.
//!
//! Closed (calls pass) -> Open (fail fast) -> HalfOpen (one trial call).
//! Each key gets its own state machine on first use. The per-key lock is a
//! `parking_lot::Mutex` and is only held for bookkeeping, never across the
//! protected call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::domain::TaskKey;
use crate::error::{EngineError, EngineResult};
use crate::ports::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, failures are counted.
    Closed,
    /// Failing fast until the reset timeout elapses.
    Open,
    /// One trial call decides between Closed and Open.
    HalfOpen,
}

/// Serializable view of one key's breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub task_key: TaskKey,
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}

#[derive(Debug, Default)]
struct KeyBreaker {
    state: Option<CircuitState>,
    failure_count: u32,
    window_started_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    /// Bumped on every half-open admission; only the matching call may
    /// decide the next state.
    trial_generation: u64,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
}

impl KeyBreaker {
    fn state(&self) -> CircuitState {
        self.state.unwrap_or(CircuitState::Closed)
    }

    fn open(&mut self, now: DateTime<Utc>, reset_timeout: Duration) {
        self.state = Some(CircuitState::Open);
        self.opened_at = Some(now);
        self.next_attempt_at = Some(add(now, reset_timeout));
        self.trial_in_flight = false;
    }

    fn close(&mut self) {
        self.state = Some(CircuitState::Closed);
        self.failure_count = 0;
        self.window_started_at = None;
        self.opened_at = None;
        self.next_attempt_at = None;
        self.trial_in_flight = false;
    }

    fn is_current_trial(&self, trial: Option<u64>) -> bool {
        self.trial_in_flight && trial == Some(self.trial_generation)
    }

    fn snapshot(&self, task_key: &TaskKey) -> BreakerSnapshot {
        BreakerSnapshot {
            task_key: task_key.clone(),
            state: self.state(),
            failure_count: self.failure_count,
            opened_at: self.opened_at,
            next_attempt_at: self.next_attempt_at,
            last_success_at: self.last_success_at,
            last_failure_at: self.last_failure_at,
            total_calls: self.total_calls,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            total_rejections: self.total_rejections,
        }
    }
}

fn add(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub struct BreakerRegistry {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: DashMap<TaskKey, Arc<Mutex<KeyBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            breakers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn breaker(&self, key: &TaskKey) -> Arc<Mutex<KeyBreaker>> {
        if let Some(existing) = self.breakers.get(key) {
            return Arc::clone(existing.value());
        }
        Arc::clone(self.breakers.entry(key.clone()).or_default().value())
    }

    /// Run `f` under the breaker for `key`.
    ///
    /// Rejected calls return `CircuitOpen` without invoking `f`. Any error
    /// from `f` counts as one failure, and so does dropping the call before
    /// it completes.
    pub async fn call<T, F, Fut>(&self, key: &TaskKey, f: F) -> EngineResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let breaker = self.breaker(key);
        let trial = self.admit(key, &breaker)?;

        let mut pending = PendingCall {
            registry: self,
            key,
            breaker: &breaker,
            trial,
            finished: false,
        };
        let result = f().await;
        pending.finished = true;

        match &result {
            Ok(_) => self.record_success(key, &breaker, trial),
            Err(err) => self.record_failure(key, &breaker, trial, Some(err)),
        }
        result
    }

    /// Returns the trial generation when the call is the half-open trial.
    fn admit(&self, key: &TaskKey, breaker: &Mutex<KeyBreaker>) -> EngineResult<Option<u64>> {
        let now = self.clock.now();
        let mut b = breaker.lock();

        match b.state() {
            CircuitState::Closed => {}
            CircuitState::Open => {
                let next = b.next_attempt_at.unwrap_or(now);
                if now < next {
                    b.total_rejections += 1;
                    let retry_in = (next - now).to_std().unwrap_or(Duration::ZERO);
                    return Err(EngineError::CircuitOpen {
                        task_key: key.clone(),
                        retry_in,
                    });
                }
                b.state = Some(CircuitState::HalfOpen);
                info!(task_key = %key, "circuit half-open, letting one trial call through");
            }
            CircuitState::HalfOpen => {
                if b.trial_in_flight {
                    b.total_rejections += 1;
                    return Err(EngineError::CircuitOpen {
                        task_key: key.clone(),
                        retry_in: Duration::ZERO,
                    });
                }
            }
        }
        b.total_calls += 1;
        if b.state() == CircuitState::HalfOpen {
            b.trial_in_flight = true;
            b.trial_generation += 1;
            return Ok(Some(b.trial_generation));
        }
        Ok(None)
    }

    fn record_success(&self, key: &TaskKey, breaker: &Mutex<KeyBreaker>, trial: Option<u64>) {
        let now = self.clock.now();
        let mut b = breaker.lock();
        b.total_successes += 1;
        b.last_success_at = Some(now);

        match b.state() {
            CircuitState::Closed => {
                b.failure_count = 0;
                b.window_started_at = None;
            }
            CircuitState::HalfOpen if b.is_current_trial(trial) => {
                b.close();
                info!(task_key = %key, "circuit closed after successful trial");
            }
            CircuitState::HalfOpen => {
                debug!(task_key = %key, "success from before the trip, trial still decides");
            }
            CircuitState::Open => {
                // forced open while this call was running; stays open
                debug!(task_key = %key, "success recorded while circuit is open");
            }
        }
    }

    fn record_failure(
        &self,
        key: &TaskKey,
        breaker: &Mutex<KeyBreaker>,
        trial: Option<u64>,
        err: Option<&EngineError>,
    ) {
        let now = self.clock.now();
        let reset_timeout = self.config.reset_timeout();
        let mut b = breaker.lock();
        b.total_failures += 1;
        b.last_failure_at = Some(now);
        let reason = err.map(ToString::to_string).unwrap_or_else(|| "call dropped".to_string());

        match b.state() {
            CircuitState::Closed => {
                if let (Some(window), Some(started)) =
                    (self.config.failure_window(), b.window_started_at)
                {
                    if (now - started).to_std().unwrap_or(Duration::ZERO) > window {
                        b.failure_count = 0;
                    }
                }
                if b.failure_count == 0 {
                    b.window_started_at = Some(now);
                }
                b.failure_count += 1;

                if b.failure_count >= self.config.failure_threshold {
                    b.open(now, reset_timeout);
                    warn!(
                        task_key = %key,
                        failures = b.failure_count,
                        reset_timeout_ms = reset_timeout.as_millis() as u64,
                        error = %reason,
                        "circuit opened"
                    );
                } else {
                    debug!(task_key = %key, failures = b.failure_count, error = %reason, "failure recorded");
                }
            }
            CircuitState::HalfOpen if b.is_current_trial(trial) => {
                b.open(now, reset_timeout);
                warn!(task_key = %key, error = %reason, "trial call failed, circuit re-opened");
            }
            CircuitState::HalfOpen => {
                debug!(task_key = %key, error = %reason, "failure from before the trip, trial still decides");
            }
            CircuitState::Open => {}
        }
    }

    /// Current state; `Closed` for keys never seen.
    pub fn state(&self, key: &TaskKey) -> CircuitState {
        self.breakers
            .get(key)
            .map(|b| b.value().lock().state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, key: &TaskKey) -> Option<BreakerSnapshot> {
        self.breakers.get(key).map(|b| b.value().lock().snapshot(key))
    }

    /// All known breakers, ordered by task key.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut out: Vec<BreakerSnapshot> = self
            .breakers
            .iter()
            .map(|entry| entry.value().lock().snapshot(entry.key()))
            .collect();
        out.sort_by(|a, b| a.task_key.cmp(&b.task_key));
        out
    }

    /// Keys that would reject a call right now.
    pub fn open_keys(&self) -> Vec<TaskKey> {
        let now = self.clock.now();
        let mut keys: Vec<TaskKey> = self
            .breakers
            .iter()
            .filter(|entry| {
                let b = entry.value().lock();
                match b.state() {
                    CircuitState::Closed => false,
                    CircuitState::Open => b.next_attempt_at.is_none_or(|next| now < next),
                    CircuitState::HalfOpen => b.trial_in_flight,
                }
            })
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Operator override: open `key` now for one reset timeout.
    pub fn force_open(&self, key: &TaskKey) {
        let now = self.clock.now();
        self.breaker(key).lock().open(now, self.config.reset_timeout());
        warn!(task_key = %key, "circuit forced open");
    }

    /// Operator override: close `key` and clear its failure count.
    pub fn reset(&self, key: &TaskKey) {
        if let Some(b) = self.breakers.get(key) {
            b.value().lock().close();
            info!(task_key = %key, "circuit reset");
        }
    }
}

/// Counts a call as failed if its future is dropped before completing, so a
/// half-open trial can never stay in flight forever.
struct PendingCall<'a> {
    registry: &'a BreakerRegistry,
    key: &'a TaskKey,
    breaker: &'a Mutex<KeyBreaker>,
    trial: Option<u64>,
    finished: bool,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.registry
                .record_failure(self.key, self.breaker, self.trial, None);
        }
    }
}
