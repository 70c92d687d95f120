use std::str::FromStr;
use std::time::Duration;

use levy_core::error::AppError;
use levy_core::traits::{ConnectionManager, RecordStore};
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Row};

use crate::config::DatabaseConfig;

fn db_error(context: &str) -> impl FnOnce(sqlx::Error) -> AppError + '_ {
    move |e| AppError::DatabaseError(format!("{context}: {e}"))
}

/// Opens single PostgreSQL connections for the engine's resource pool.
#[derive(Clone)]
pub struct PgConnectionManager {
    options: PgConnectOptions,
    connect_timeout: Duration,
}

impl PgConnectionManager {
    pub fn new(config: &DatabaseConfig) -> Result<Self, AppError> {
        let options = PgConnectOptions::from_str(&config.url)
            .map_err(|e| AppError::ConfigError(format!("Invalid DATABASE_URL: {e}")))?;
        Ok(Self {
            options,
            connect_timeout: config.connect_timeout,
        })
    }
}

impl ConnectionManager for PgConnectionManager {
    type Connection = PgRecordConnection;

    async fn connect(&self) -> Result<PgRecordConnection, AppError> {
        let conn = tokio::time::timeout(self.connect_timeout, PgConnection::connect_with(&self.options))
            .await
            .map_err(|_| AppError::DatabaseError(format!(
                "connect timed out after {:?}",
                self.connect_timeout
            )))?
            .map_err(db_error("Failed to connect"))?;
        tracing::debug!("Opened store connection");
        Ok(PgRecordConnection(conn))
    }

    async fn is_valid(&self, conn: &mut PgRecordConnection) -> Result<(), AppError> {
        conn.0.ping().await.map_err(db_error("Ping failed"))
    }
}

/// A pooled connection speaking the `records` table.
pub struct PgRecordConnection(PgConnection);

impl RecordStore for PgRecordConnection {
    async fn get(&mut self, key: &str) -> Result<Option<Value>, AppError> {
        let row = sqlx::query("SELECT value FROM records WHERE key = $1")
            .bind(key)
            .fetch_optional(&mut self.0)
            .await
            .map_err(db_error("Failed to read record"))?;

        row.map(|r| r.try_get::<Value, _>("value"))
            .transpose()
            .map_err(db_error("Failed to decode record"))
    }

    async fn put(&mut self, key: &str, record: &Value) -> Result<(), AppError> {
        sqlx::query(UPSERT)
            .bind(key)
            .bind(record)
            .execute(&mut self.0)
            .await
            .map_err(db_error("Failed to write record"))?;
        Ok(())
    }

    async fn upsert(&mut self, records: &[(String, Value)]) -> Result<u64, AppError> {
        let mut tx = self.0.begin().await.map_err(db_error("Failed to begin"))?;
        let mut written = 0;
        for (key, record) in records {
            written += sqlx::query(UPSERT)
                .bind(key)
                .bind(record)
                .execute(&mut *tx)
                .await
                .map_err(db_error("Failed to write record"))?
                .rows_affected();
        }
        tx.commit().await.map_err(db_error("Failed to commit"))?;
        Ok(written)
    }
}

const UPSERT: &str = r#"
    INSERT INTO records (key, value)
    VALUES ($1, $2)
    ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
"#;
