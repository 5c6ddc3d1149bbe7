//! Resilience envelope around every outbound call.
//!
//! Layering from the inside out: deadline → retry → circuit breaker →
//! bulkhead. Retries run inside the breaker so each attempt feeds the
//! breaker's failure accounting; the bulkhead sits outermost so a flood
//! of callers cannot exhaust the breaker's half-open probe budget.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::errors::ApiError;

pub mod breaker;
pub mod bulkhead;
pub mod retry;

pub use breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry};
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadRegistry};
pub use retry::{with_retry, RetryConfig, RetryPolicy};

/// Outbound calls are classed by how long they may reasonably take; each
/// class carries its own deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationClass {
    Read,
    Write,
    External,
}

/// Per-class deadlines applied to every attempt.
#[derive(Debug, Clone)]
pub struct DeadlineConfig {
    pub read: Duration,
    pub write: Duration,
    pub external: Duration,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            read: Duration::from_millis(500),
            write: Duration::from_secs(1),
            external: Duration::from_secs(10),
        }
    }
}

impl DeadlineConfig {
    pub fn deadline(&self, class: OperationClass) -> Duration {
        match class {
            OperationClass::Read => self.read,
            OperationClass::Write => self.write,
            OperationClass::External => self.external,
        }
    }
}

/// Composition of the four resilience layers, shared by every caller.
pub struct ResiliencePipeline {
    breakers: CircuitBreakerRegistry,
    bulkheads: BulkheadRegistry,
    retry: RetryConfig,
    deadlines: DeadlineConfig,
    breaker_enabled: bool,
}

impl ResiliencePipeline {
    pub fn new(
        breaker_config: CircuitBreakerConfig,
        bulkhead_config: BulkheadConfig,
        retry: RetryConfig,
        deadlines: DeadlineConfig,
    ) -> Self {
        Self {
            breakers: CircuitBreakerRegistry::new(breaker_config),
            bulkheads: BulkheadRegistry::new(bulkhead_config),
            retry,
            deadlines,
            breaker_enabled: true,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let mut pipeline = Self::new(
            CircuitBreakerConfig {
                failure_threshold: config.circuit_breaker_failure_threshold,
                success_threshold: config.circuit_breaker_success_threshold,
                open_timeout: config.circuit_breaker_timeout(),
                ..CircuitBreakerConfig::default()
            },
            BulkheadConfig::default(),
            RetryConfig {
                max_attempts: config.retry_max_attempts,
                initial_delay: config.retry_initial_delay(),
                max_delay: config.retry_max_delay(),
                ..RetryConfig::default()
            },
            DeadlineConfig {
                read: config.dynamodb_read_timeout(),
                write: config.dynamodb_write_timeout(),
                ..DeadlineConfig::default()
            },
        );
        pipeline.breaker_enabled = config.circuit_breaker_enabled;
        pipeline
    }

    pub fn breaker(&self, resource: &str) -> Arc<CircuitBreaker> {
        self.breakers.get(resource)
    }

    /// Runs `op` under the full envelope for the named resource.
    ///
    /// Each attempt gets its own per-class deadline; an exhausted deadline
    /// is a transient persistence failure and feeds both retry and the
    /// breaker. `CONFLICT` and other non-transient errors stop the retry
    /// loop immediately.
    pub async fn execute<T, F, Fut>(
        &self,
        resource: &str,
        class: OperationClass,
        op: F,
    ) -> Result<T, ApiError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let bulkhead = self.bulkheads.get(resource);
        let _permit = bulkhead.acquire().await?;

        let breaker = self.breaker(resource);
        if self.breaker_enabled {
            breaker.admit().await?;
        }

        let deadline = self.deadlines.deadline(class);
        let attempt = || async {
            let outcome = match tokio::time::timeout(deadline, op()).await {
                Ok(result) => result,
                Err(_) => Err(ApiError::persistence(format!(
                    "deadline of {deadline:?} exceeded"
                ))),
            };
            if self.breaker_enabled {
                match &outcome {
                    // The backend answered; only transient failures count
                    // against the breaker.
                    Ok(_) => breaker.record_success().await,
                    Err(err) if err.is_retryable() => breaker.record_failure().await,
                    Err(_) => breaker.record_success().await,
                }
            }
            outcome
        };

        with_retry(&self.retry, ApiError::is_retryable, attempt).await
    }
}
