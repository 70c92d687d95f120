use std::time::Duration;

use levy_core::AppError;
use levy_core::pool::PoolConfig;

/// Configuration for the PostgreSQL backing store.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    /// Upper bound on pooled store connections.
    pub max_connections: usize,
    pub connect_timeout: Duration,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 5,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Read configuration from environment variables.
    ///
    /// - `DATABASE_URL` (required)
    /// - `DATABASE_MAX_CONNECTIONS` (optional, defaults to 5)
    /// - `DATABASE_CONNECT_TIMEOUT_SECS` (optional, defaults to 10)
    pub fn from_env() -> Result<Self, AppError> {
        let url = std::env::var("DATABASE_URL").map_err(|_| {
            AppError::ConfigError("DATABASE_URL not set. Required for the Postgres store.".into())
        })?;
        let mut config = Self::new(url);

        if let Ok(raw) = std::env::var("DATABASE_MAX_CONNECTIONS") {
            config.max_connections = parse_positive("DATABASE_MAX_CONNECTIONS", &raw)?;
        }
        if let Ok(raw) = std::env::var("DATABASE_CONNECT_TIMEOUT_SECS") {
            let secs = parse_positive("DATABASE_CONNECT_TIMEOUT_SECS", &raw)?;
            config.connect_timeout = Duration::from_secs(secs as u64);
        }

        Ok(config)
    }

    /// `base` with its size limits clamped to this store's connection budget.
    pub fn pool_config(&self, base: PoolConfig) -> PoolConfig {
        let max_size = base.max_size.min(self.max_connections);
        let overflow = base
            .max_overflow
            .min(self.max_connections.saturating_sub(max_size));
        let min_size = base.min_size.min(max_size);
        base.with_sizes(min_size, max_size, overflow)
    }
}

fn parse_positive(key: &str, raw: &str) -> Result<usize, AppError> {
    let parsed: usize = raw.trim().parse().map_err(|_| {
        AppError::ConfigError(format!("Invalid {key} '{raw}': must be a positive integer"))
    })?;
    if parsed == 0 {
        return Err(AppError::ConfigError(format!("{key} must be at least 1")));
    }
    Ok(parsed)
}
