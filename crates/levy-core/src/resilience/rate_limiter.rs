//! Per-endpoint request spacing.
//!
//! Each key gets its own lock, held across the wait, so two callers for the
//! same site are spaced even when they arrive together. Different keys
//! never contend.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::AppError;

/// Configuration for per-endpoint rate limiting.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 1.0,
        }
    }
}

impl RateLimitConfig {
    pub fn new(requests_per_second: f64) -> Self {
        Self {
            requests_per_second,
        }
    }

    /// Minimum spacing between two requests to the same endpoint.
    pub fn min_interval(&self) -> Result<Duration, AppError> {
        if !self.requests_per_second.is_finite() || self.requests_per_second <= 0.0 {
            return Err(AppError::ConfigError(format!(
                "requests_per_second must be positive, got {}",
                self.requests_per_second
            )));
        }
        Ok(Duration::from_secs_f64(1.0 / self.requests_per_second))
    }
}

/// Enforces a minimum interval between requests per endpoint key.
#[derive(Clone)]
pub struct RateLimiter {
    min_interval: Duration,
    last_request: Arc<DashMap<String, Arc<Mutex<Option<Instant>>>>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Result<Self, AppError> {
        Ok(Self {
            min_interval: config.min_interval()?,
            last_request: Arc::new(DashMap::new()),
        })
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    fn slot(&self, key: &str) -> Arc<Mutex<Option<Instant>>> {
        if let Some(slot) = self.last_request.get(key) {
            return Arc::clone(&slot);
        }
        Arc::clone(
            &self
                .last_request
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(None))),
        )
    }

    /// Suspend until `key` may be hit again, then record the request time.
    /// Returns how long the caller waited.
    pub async fn acquire(&self, key: &str) -> Duration {
        let slot = self.slot(key);
        let mut last = slot.lock().await;
        let start = Instant::now();

        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                tracing::debug!(
                    domain = %key,
                    sleep_ms = %wait.as_millis(),
                    "Rate limiting request"
                );
                tokio::time::sleep(wait).await;
            }
        }

        *last = Some(Instant::now());
        start.elapsed()
    }

    /// Number of endpoints seen so far.
    pub fn tracked_keys(&self) -> usize {
        self.last_request.len()
    }
}
