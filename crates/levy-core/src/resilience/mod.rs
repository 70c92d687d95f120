//! Retry, circuit breaking and rate limiting around calls to remote sites.
//!
//! One [`ResilienceController`] is shared by every job. A call goes through,
//! in order: the endpoint's rate limiter, its circuit breaker, the attempt
//! itself (bounded by `attempt_timeout`), and on failure classification and
//! backoff before the next attempt.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

use std::future::Future;
use std::time::Duration;

use url::Url;

use crate::error::AppError;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats,
    CircuitState,
};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use retry::{Backoff, RetryConfig};

/// Configuration for the resilience controller.
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    /// Deadline for a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl ResilienceConfig {
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }
}

/// Canonical key for breaker and limiter state.
///
/// Lowercase host of `url` without a leading `www.`. URLs without a host
/// fall back to `jurisdiction:<name>`.
pub fn endpoint_key(url: &str, jurisdiction: &str) -> String {
    Url::parse(url.trim())
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .filter(|host| !host.is_empty())
        .map(|host| match host.strip_prefix("www.") {
            Some(rest) if !rest.is_empty() => rest.to_string(),
            _ => host,
        })
        .unwrap_or_else(|| format!("jurisdiction:{}", jurisdiction.trim().to_lowercase()))
}

/// Hooks into the retry loop, used to surface the RETRYING state.
pub trait RetryObserver: Send + Sync {
    fn backoff_started(&self, key: &str, attempt: u32, delay: Duration, error: &AppError) {
        let _ = (key, attempt, delay, error);
    }

    fn backoff_finished(&self, key: &str) {
        let _ = key;
    }
}

/// Observer that ignores every hook.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RetryObserver for NoopObserver {}

/// Result of a resilient call plus the number of attempts it took.
#[derive(Debug)]
pub struct Execution<T> {
    pub result: Result<T, AppError>,
    pub attempts: u32,
}

/// Composes rate limiting, circuit breaking, per-attempt timeouts and retry.
#[derive(Clone)]
pub struct ResilienceController {
    config: ResilienceConfig,
    breakers: CircuitBreakerRegistry,
    limiter: RateLimiter,
}

impl ResilienceController {
    pub fn new(config: ResilienceConfig) -> Result<Self, AppError> {
        config.retry.validate()?;
        if config.circuit_breaker.failure_threshold == 0 {
            return Err(AppError::ConfigError(
                "circuit breaker failure_threshold must be at least 1".into(),
            ));
        }
        let limiter = RateLimiter::new(&config.rate_limit)?;
        Ok(Self {
            breakers: CircuitBreakerRegistry::new(config.circuit_breaker.clone()),
            limiter,
            config,
        })
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Run `operation` against endpoint `key` until it succeeds, fails with
    /// a non-retryable error, or runs out of attempts.
    pub async fn execute<T, F, Fut, O>(&self, key: &str, observer: &O, mut operation: F) -> Execution<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
        O: RetryObserver + ?Sized,
    {
        let breaker = self.breakers.get(key);
        let mut backoff = Backoff::new(&self.config.retry);
        let mut attempts = 0u32;

        loop {
            self.limiter.acquire(key).await;

            let admission = match breaker.try_acquire() {
                Ok(admission) => admission,
                Err(e) => {
                    tracing::debug!(domain = %key, error = %e, "Call rejected by circuit breaker");
                    return Execution {
                        result: Err(e),
                        attempts,
                    };
                }
            };

            attempts += 1;
            let outcome = match tokio::time::timeout(self.config.attempt_timeout, operation()).await
            {
                Ok(result) => result,
                Err(_) => Err(AppError::Timeout(self.config.attempt_timeout)),
            };

            let error = match outcome {
                Ok(value) => {
                    admission.success();
                    return Execution {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(e) => e,
            };
            admission.failure(&error);

            if !self.config.retry.should_retry(attempts, &error) {
                tracing::warn!(
                    domain = %key,
                    attempts,
                    kind = %error.kind(),
                    error = %error,
                    "Giving up on call"
                );
                return Execution {
                    result: Err(error),
                    attempts,
                };
            }

            let delay = backoff.next_delay(attempts - 1, error.kind());
            tracing::debug!(
                domain = %key,
                attempt = attempts,
                delay_ms = %delay.as_millis(),
                error = %error,
                "Backing off before retry"
            );
            observer.backoff_started(key, attempts, delay, &error);
            tokio::time::sleep(delay).await;
            observer.backoff_finished(key);
        }
    }
}
