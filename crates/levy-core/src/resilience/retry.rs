use std::time::Duration;

use rand::Rng;

use crate::error::{AppError, ErrorKind};

/// Retry configuration with exponential backoff and jitter.
///
/// Delay after the n-th failed attempt (0-indexed):
/// `min(base_delay * m^n, max_delay)` plus up to `jitter_ratio` of that,
/// where `m` is 3 for rate-limit errors and 2 otherwise.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
    /// Parse failures rarely fix themselves; cap them lower.
    pub max_parse_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_ratio: 0.1,
            max_parse_attempts: 2,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    /// Reject settings that would make backoff meaningless or unsampleable.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_attempts == 0 {
            return Err(AppError::ConfigError(
                "retry max_attempts must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(AppError::ConfigError(format!(
                "retry jitter_ratio must be within 0.0..=1.0, got {}",
                self.jitter_ratio
            )));
        }
        Ok(())
    }

    /// Whether another attempt should follow `attempts_made` attempts that
    /// ended in `error`.
    pub fn should_retry(&self, attempts_made: u32, error: &AppError) -> bool {
        if !error.is_retryable() || attempts_made >= self.max_attempts {
            return false;
        }
        if error.kind() == ErrorKind::Parse {
            return attempts_made < self.max_parse_attempts;
        }
        true
    }

    /// Backoff before the retry following failed attempt `attempt`
    /// (0-indexed), without jitter.
    pub fn base_delay_for(&self, attempt: u32, kind: ErrorKind) -> Duration {
        let multiplier: f64 = if kind == ErrorKind::RateLimit { 3.0 } else { 2.0 };
        let factor = multiplier.powi(attempt.min(64) as i32);
        let secs = self.base_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Upper bound on any single delay, jitter included.
    pub fn max_jittered_delay(&self) -> Duration {
        self.max_delay.mul_f64(1.0 + self.jitter_ratio.max(0.0))
    }

    fn jitter(&self, delay: Duration) -> Duration {
        if self.jitter_ratio <= 0.0 || delay.is_zero() {
            return Duration::ZERO;
        }
        let max = delay.as_secs_f64() * self.jitter_ratio;
        Duration::from_secs_f64(rand::rng().random_range(0.0..=max))
    }
}

/// Delay generator for one retry sequence.
///
/// Emitted delays never decrease within a sequence, even when jitter on an
/// earlier step came out larger than the next step's.
#[derive(Debug)]
pub struct Backoff<'a> {
    config: &'a RetryConfig,
    last: Duration,
}

impl<'a> Backoff<'a> {
    pub fn new(config: &'a RetryConfig) -> Self {
        Self {
            config,
            last: Duration::ZERO,
        }
    }

    pub fn next_delay(&mut self, attempt: u32, kind: ErrorKind) -> Duration {
        let base = self.config.base_delay_for(attempt, kind);
        let delay = (base + self.config.jitter(base))
            .max(self.last)
            .min(self.config.max_jittered_delay());
        self.last = delay;
        delay
    }
}
