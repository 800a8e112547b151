//! Per-dependency circuit breakers
//!
//! Each external dependency gets its own breaker from the [`CircuitBreakerRegistry`].
//! A breaker is `closed` until `failure_threshold` consecutive failures, then `open`
//! for `cooldown`. After the cooldown exactly one trial call is admitted (`half_open`);
//! its outcome closes the breaker or re-opens it with a fresh cooldown.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub last_state_change: DateTime<Utc>,
    pub retry_after_secs: Option<u64>,
}

/// Returned when a call is refused without contacting the dependency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitOpen {
    pub dependency: String,
    pub retry_after: Duration,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
    last_state_change: DateTime<Utc>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
                total_successes: 0,
                total_failures: 0,
                total_rejections: 0,
                last_state_change: Utc::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, inner: &mut BreakerState, next: CircuitState) {
        if inner.state != next {
            info!(
                circuit = %self.name,
                from = ?inner.state,
                to = ?next,
                "circuit breaker state change"
            );
            inner.state = next;
            inner.last_state_change = Utc::now();
        }
    }

    /// Ask to place a call. The returned permit must be resolved with
    /// [`CallPermit::success`] or [`CallPermit::failure`].
    pub fn try_acquire(self: &Arc<Self>) -> Result<CallPermit, CircuitOpen> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {}
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(self.config.cooldown);
                if elapsed < self.config.cooldown {
                    inner.total_rejections += 1;
                    return Err(CircuitOpen {
                        dependency: self.name.clone(),
                        retry_after: self.config.cooldown - elapsed,
                    });
                }
                self.set_state(&mut inner, CircuitState::HalfOpen);
                inner.trial_in_flight = true;
                return Ok(CallPermit::new(self.clone(), true));
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.total_rejections += 1;
                    return Err(CircuitOpen {
                        dependency: self.name.clone(),
                        retry_after: Duration::from_secs(1),
                    });
                }
                inner.trial_in_flight = true;
                return Ok(CallPermit::new(self.clone(), true));
            }
        }
        Ok(CallPermit::new(self.clone(), false))
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        inner.total_successes += 1;
        inner.consecutive_failures = 0;
        if trial {
            inner.trial_in_flight = false;
        }
        if trial && inner.state != CircuitState::Closed {
            inner.opened_at = None;
            self.set_state(&mut inner, CircuitState::Closed);
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        inner.total_failures += 1;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        if trial {
            inner.trial_in_flight = false;
        }

        let should_open = match inner.state {
            CircuitState::HalfOpen => trial,
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if should_open {
            inner.opened_at = Some(Instant::now());
            warn!(
                circuit = %self.name,
                consecutive_failures = inner.consecutive_failures,
                cooldown_secs = self.config.cooldown.as_secs(),
                "circuit breaker opened"
            );
            self.set_state(&mut inner, CircuitState::Open);
        }
    }

    fn on_abandoned(&self, trial: bool) {
        if trial {
            self.lock().trial_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        let retry_after_secs = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened)) => Some(
                self.config
                    .cooldown
                    .saturating_sub(opened.elapsed())
                    .as_secs(),
            ),
            _ => None,
        };
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
            last_state_change: inner.last_state_change,
            retry_after_secs,
        }
    }
}

/// Admission for one call. Dropping it unresolved releases a half-open trial slot
/// without changing state.
#[derive(Debug)]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    resolved: bool,
}

impl CallPermit {
    fn new(breaker: Arc<CircuitBreaker>, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            resolved: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.on_abandoned(self.trial);
        }
    }
}

/// One breaker per named dependency, created on first use
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            return existing.clone();
        }
        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        self.breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|b| b.snapshot())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_secs: u64) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "gateway",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(cooldown_secs),
            },
        ))
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let cb = breaker(3, 30);
        for _ in 0..2 {
            cb.try_acquire().unwrap().failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.try_acquire().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_err());
        assert_eq!(cb.snapshot().total_rejections, 1);
    }

    #[test]
    fn success_resets_failure_count() {
        let cb = breaker(3, 30);
        cb.try_acquire().unwrap().failure();
        cb.try_acquire().unwrap().failure();
        cb.try_acquire().unwrap().success();
        cb.try_acquire().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_exactly_one_trial() {
        let cb = breaker(1, 10);
        cb.try_acquire().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(11)).await;
        let trial = cb.try_acquire().expect("trial admitted after cooldown");
        assert!(trial.is_trial());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().is_err());

        trial.success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_restarts_cooldown() {
        let cb = breaker(1, 10);
        cb.try_acquire().unwrap().failure();
        tokio::time::advance(Duration::from_secs(11)).await;

        cb.try_acquire().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        let err = cb.try_acquire().unwrap_err();
        assert!(err.retry_after <= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_trial_frees_the_slot() {
        let cb = breaker(1, 10);
        cb.try_acquire().unwrap().failure();
        tokio::time::advance(Duration::from_secs(11)).await;

        drop(cb.try_acquire().unwrap());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn registry_keeps_one_breaker_per_dependency() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let a = registry.get("adyen");
        let b = registry.get("adyen");
        let c = registry.get("notifications");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.snapshots().len(), 2);
    }
}
