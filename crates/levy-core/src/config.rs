use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;
use crate::manager::ManagerConfig;
use crate::notify::NotifyConfig;
use crate::pool::PoolConfig;
use crate::resilience::ResilienceConfig;

/// Everything needed to assemble an engine: pool, resilience, manager and
/// notification settings plus the worker and blocking-thread defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub resilience: ResilienceConfig,
    pub manager: ManagerConfig,
    pub notify: NotifyConfig,
    /// Default per-job worker count.
    pub max_workers: usize,
    /// Upper bound on concurrent browser sessions.
    pub blocking_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            resilience: ResilienceConfig::default(),
            manager: ManagerConfig::default(),
            notify: NotifyConfig::default(),
            max_workers: 4,
            blocking_threads: 4,
        }
    }
}

impl EngineConfig {
    /// Read configuration from `LEVY_*` environment variables.
    ///
    /// Unset variables keep their defaults:
    /// - `LEVY_MAX_WORKERS` (4), `LEVY_BLOCKING_THREADS` (4)
    /// - `LEVY_POOL_MIN_SIZE` (2), `LEVY_POOL_MAX_SIZE` (10), `LEVY_POOL_MAX_OVERFLOW` (5)
    /// - `LEVY_POOL_ACQUIRE_TIMEOUT_SECS` (30)
    /// - `LEVY_REQUESTS_PER_SECOND` (1.0)
    /// - `LEVY_RETRY_MAX_ATTEMPTS` (3), `LEVY_RETRY_BASE_DELAY_MS` (1000),
    ///   `LEVY_RETRY_MAX_DELAY_MS` (60000)
    /// - `LEVY_ATTEMPT_TIMEOUT_SECS` (30)
    /// - `LEVY_BREAKER_THRESHOLD` (5), `LEVY_BREAKER_RECOVERY_SECS` (60)
    /// - `LEVY_NOTIFY_TIMEOUT_SECS` (10)
    /// - `LEVY_JOB_RETENTION_SECS` (86400)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        let mut config = Self::default();

        config.max_workers = vars.positive("LEVY_MAX_WORKERS", config.max_workers)?;
        config.blocking_threads = vars.positive("LEVY_BLOCKING_THREADS", config.blocking_threads)?;

        let pool = &mut config.pool;
        pool.min_size = vars.parse("LEVY_POOL_MIN_SIZE", pool.min_size)?;
        pool.max_size = vars.positive("LEVY_POOL_MAX_SIZE", pool.max_size)?;
        pool.max_overflow = vars.parse("LEVY_POOL_MAX_OVERFLOW", pool.max_overflow)?;
        pool.acquire_timeout = vars.secs("LEVY_POOL_ACQUIRE_TIMEOUT_SECS", pool.acquire_timeout)?;
        pool.validate()?;

        let resilience = &mut config.resilience;
        let rps = vars.parse("LEVY_REQUESTS_PER_SECOND", resilience.rate_limit.requests_per_second)?;
        if !rps.is_finite() || rps <= 0.0 {
            return Err(AppError::ConfigError(format!(
                "Invalid LEVY_REQUESTS_PER_SECOND '{rps}': must be a positive number"
            )));
        }
        resilience.rate_limit.requests_per_second = rps;

        let retry = &mut resilience.retry;
        retry.max_attempts = vars.positive("LEVY_RETRY_MAX_ATTEMPTS", retry.max_attempts)?;
        retry.base_delay = vars.millis("LEVY_RETRY_BASE_DELAY_MS", retry.base_delay)?;
        retry.max_delay = vars.millis("LEVY_RETRY_MAX_DELAY_MS", retry.max_delay)?;
        if retry.base_delay > retry.max_delay {
            return Err(AppError::ConfigError(
                "LEVY_RETRY_BASE_DELAY_MS must not exceed LEVY_RETRY_MAX_DELAY_MS".into(),
            ));
        }
        resilience.attempt_timeout = vars.secs("LEVY_ATTEMPT_TIMEOUT_SECS", resilience.attempt_timeout)?;
        if resilience.attempt_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "LEVY_ATTEMPT_TIMEOUT_SECS must be at least 1".into(),
            ));
        }

        let breaker = &mut resilience.circuit_breaker;
        breaker.failure_threshold = vars.positive("LEVY_BREAKER_THRESHOLD", breaker.failure_threshold)?;
        breaker.recovery_timeout = vars.secs("LEVY_BREAKER_RECOVERY_SECS", breaker.recovery_timeout)?;

        config.notify.timeout = vars.secs("LEVY_NOTIFY_TIMEOUT_SECS", config.notify.timeout)?;
        config.manager.retention = vars.secs("LEVY_JOB_RETENTION_SECS", config.manager.retention)?;

        if config.max_workers > config.manager.max_workers_limit {
            return Err(AppError::ConfigError(format!(
                "LEVY_MAX_WORKERS must be at most {}",
                config.manager.max_workers_limit
            )));
        }

        Ok(config)
    }
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, AppError> {
        match (self.0)(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| {
                AppError::ConfigError(format!("Invalid {key} '{raw}': could not parse value"))
            }),
        }
    }

    fn positive<T>(&self, key: &str, default: T) -> Result<T, AppError>
    where
        T: FromStr + PartialEq + Default,
    {
        let value = self.parse(key, default)?;
        if value == T::default() {
            return Err(AppError::ConfigError(format!("{key} must be at least 1")));
        }
        Ok(value)
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, AppError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, AppError> {
        let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse(key, default).map(Duration::from_millis)
    }
}
