use levy_core::AppError;
use levy_core::job::Job;
use levy_core::models::ExtractionOutcome;
use levy_core::pool::{Pool, PoolConfig};
use levy_core::util::{job_key, outcome_key};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::store::PgConnectionManager;

/// Central database facade: runs migrations, opens the engine's record
/// pool, and answers read-side queries over persisted jobs.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    config: DatabaseConfig,
}

impl Database {
    /// Connect to PostgreSQL with the given configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(config.connect_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {e}")))?;

        Ok(Self {
            pool,
            config: config.clone(),
        })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Migration failed: {e}")))?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    /// Open the engine's resource pool over this database.
    pub async fn record_pool(&self, base: PoolConfig) -> Result<Pool<PgConnectionManager>, AppError> {
        let manager = PgConnectionManager::new(&self.config)?;
        Pool::open(manager, self.config.pool_config(base)).await
    }

    /// A persisted job record.
    pub async fn job(&self, job_id: Uuid) -> Result<Option<Job>, AppError> {
        let value = self.record(&job_key(&job_id)).await?;
        value
            .map(serde_json::from_value)
            .transpose()
            .map_err(AppError::from)
    }

    /// Persisted outcomes of one job, ordered by item id.
    pub async fn outcomes(&self, job_id: Uuid) -> Result<Vec<ExtractionOutcome>, AppError> {
        let prefix = outcome_key(&job_id, "");
        let rows = sqlx::query("SELECT value FROM records WHERE starts_with(key, $1) ORDER BY key")
            .bind(&prefix)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let value: Value = row
                    .try_get("value")
                    .map_err(|e| AppError::DatabaseError(e.to_string()))?;
                Ok(serde_json::from_value(value)?)
            })
            .collect()
    }

    async fn record(&self, key: &str) -> Result<Option<Value>, AppError> {
        sqlx::query_scalar("SELECT value FROM records WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
