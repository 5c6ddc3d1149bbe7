use metrics::counter;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::errors::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker outright.
    pub failure_threshold: usize,
    /// Failure ratio over the rolling window that trips the breaker once
    /// `min_requests` outcomes have been seen.
    pub failure_ratio: f64,
    /// Rolling window length, in outcomes.
    pub window_size: usize,
    /// Minimum outcomes in the window before the ratio applies.
    pub min_requests: usize,
    /// Consecutive half-open successes required to close.
    pub success_threshold: usize,
    /// How long the breaker stays open before probing.
    pub open_timeout: Duration,
    /// Probe calls admitted per half-open period.
    pub half_open_max_probes: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_ratio: 0.6,
            window_size: 20,
            min_requests: 10,
            success_threshold: 3,
            open_timeout: Duration::from_secs(30),
            half_open_max_probes: 3,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: usize,
    /// Rolling outcome window; `true` marks a failure.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    half_open_probes: usize,
    half_open_successes: usize,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            window: VecDeque::new(),
            opened_at: None,
            half_open_probes: 0,
            half_open_successes: 0,
        }
    }
}

/// Per-resource circuit breaker.
///
/// Opens on too many consecutive failures or on a high failure ratio over
/// a rolling window; after a cooldown it admits a bounded number of probe
/// calls, closing again only after enough consecutive probe successes.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admission check before a call. In the open state the call is
    /// rejected until the cooldown elapses; in half-open only the probe
    /// budget is admitted.
    pub async fn admit(&self) -> Result<(), ApiError> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.open_timeout)
                    .unwrap_or(true);
                if !cooled_down {
                    return Err(self.unavailable());
                }
                inner.state = BreakerState::HalfOpen;
                inner.half_open_probes = 1;
                inner.half_open_successes = 0;
                info!(breaker = %self.name, "circuit breaker half-open, probing");
                Ok(())
            }
            BreakerState::HalfOpen => {
                if inner.half_open_probes >= self.config.half_open_max_probes {
                    return Err(self.unavailable());
                }
                inner.half_open_probes += 1;
                Ok(())
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
                self.push_outcome(&mut inner, false);
            }
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    *inner = BreakerInner::new();
                    info!(breaker = %self.name, "circuit breaker closed");
                }
            }
            BreakerState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                self.push_outcome(&mut inner, true);
                if inner.consecutive_failures >= self.config.failure_threshold
                    || self.window_tripped(&inner)
                {
                    self.open(&mut inner);
                }
            }
            BreakerState::HalfOpen => {
                self.open(&mut inner);
            }
            BreakerState::Open => {}
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Administrative reset back to closed.
    pub async fn reset(&self) {
        let mut inner = self.lock();
        *inner = BreakerInner::new();
        info!(breaker = %self.name, "circuit breaker manually reset");
    }

    fn push_outcome(&self, inner: &mut BreakerInner, failed: bool) {
        inner.window.push_back(failed);
        while inner.window.len() > self.config.window_size {
            inner.window.pop_front();
        }
    }

    fn window_tripped(&self, inner: &BreakerInner) -> bool {
        if inner.window.len() < self.config.min_requests {
            return false;
        }
        let failures = inner.window.iter().filter(|failed| **failed).count();
        failures as f64 / inner.window.len() as f64 >= self.config.failure_ratio
    }

    fn open(&self, inner: &mut BreakerInner) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.half_open_probes = 0;
        inner.half_open_successes = 0;
        counter!("circuit_breaker.opened_total", 1);
        warn!(breaker = %self.name, "circuit breaker opened");
    }

    fn unavailable(&self) -> ApiError {
        counter!("circuit_breaker.rejected_total", 1);
        ApiError::ServiceUnavailable {
            resource: self.name.clone(),
        }
    }
}

/// Named breakers, created lazily. Lookups take the read lock; the write
/// lock re-checks before inserting so racing creators converge on one
/// instance.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().unwrap_or_else(|p| p.into_inner());
            if let Some(breaker) = breakers.get(name) {
                return breaker.clone();
            }
        }
        let mut breakers = self.breakers.write().unwrap_or_else(|p| p.into_inner());
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout: Duration::from_millis(50),
            half_open_max_probes: 2,
            ..CircuitBreakerConfig::default()
        }
    }

    #[tokio::test]
    async fn consecutive_failures_open_the_breaker() {
        let breaker = CircuitBreaker::new("test", config());

        for _ in 0..3 {
            breaker.admit().await.expect("closed admits");
            breaker.record_failure().await;
        }
        assert_eq!(breaker.state().await, BreakerState::Open);
        assert!(breaker.admit().await.is_err());
    }

    #[tokio::test]
    async fn success_resets_the_consecutive_count() {
        let breaker = CircuitBreaker::new("test", config());

        breaker.record_failure().await;
        breaker.record_failure().await;
        breaker.record_success().await;
        breaker.record_failure().await;
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn failure_ratio_over_window_opens_the_breaker() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 100,
                min_requests: 10,
                failure_ratio: 0.6,
                ..CircuitBreakerConfig::default()
            },
        );

        // Interleave so the consecutive count never trips: 8 failures and
        // 4 successes is a 0.66 ratio over 12 outcomes.
        for _ in 0..4 {
            breaker.record_failure().await;
            breaker.record_failure().await;
            breaker.record_success().await;
        }
        assert_eq!(breaker.state().await, BreakerState::Open);
    }

    #[tokio::test]
    async fn cooldown_leads_to_half_open_with_probe_budget() {
        let breaker = CircuitBreaker::new("test", config());
        for _ in 0..3 {
            breaker.record_failure().await;
        }
        assert!(breaker.admit().await.is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;

        breaker.admit().await.expect("first probe");
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);
        breaker.admit().await.expect("second probe");
        assert!(breaker.admit().await.is_err(), "probe budget exhausted");
    }

    #[tokio::test]
    async fn enough_probe_successes_close_the_breaker() {
        let breaker = CircuitBreaker::new("test", config());
        for _ in 0..3 {
            breaker.record_failure().await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        breaker.admit().await.expect("probe 1");
        breaker.record_success().await;
        breaker.admit().await.expect("probe 2");
        breaker.record_success().await;

        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn probe_failure_reopens_immediately() {
        let breaker = CircuitBreaker::new("test", config());
        for _ in 0..3 {
            breaker.record_failure().await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        breaker.admit().await.expect("probe");
        breaker.record_success().await;
        breaker.record_failure().await;

        assert_eq!(breaker.state().await, BreakerState::Open);
        assert!(breaker.admit().await.is_err());
    }

    #[tokio::test]
    async fn manual_reset_closes_the_breaker() {
        let breaker = CircuitBreaker::new("test", config());
        for _ in 0..3 {
            breaker.record_failure().await;
        }
        breaker.reset().await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
        breaker.admit().await.expect("admits after reset");
    }

    #[tokio::test]
    async fn registry_returns_one_instance_per_name() {
        let registry = CircuitBreakerRegistry::new(config());
        let a = registry.get("store");
        let b = registry.get("store");
        let c = registry.get("events");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
