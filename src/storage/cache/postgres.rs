//! Persistent cache store using a PostgreSQL table.

use crate::error::{StoreError, StoreResult};
use crate::storage::backend::Row;
use crate::storage::cache::{CacheSaveOptions, CacheStore};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row as _};
use std::time::Duration;

/// A cache store that keeps rows in `record_cache`.
#[derive(Clone)]
pub struct PostgresCache {
    pool: PgPool,
    default_ttl: Option<Duration>,
}

impl PostgresCache {
    pub fn new(pool: PgPool, default_ttl: Option<Duration>) -> Self {
        Self { pool, default_ttl }
    }

    /// Creates the backing table if it does not exist yet.
    pub async fn install(&self) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS record_cache (
                cache_group TEXT NOT NULL,
                cache_key TEXT NOT NULL,
                row JSONB NOT NULL,
                expires_at TIMESTAMPTZ,
                PRIMARY KEY (cache_group, cache_key)
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CacheStore for PostgresCache {
    async fn get(&self, group: &str, key: &str) -> StoreResult<Option<Row>> {
        let row = sqlx::query(
            "SELECT row FROM record_cache
             WHERE cache_group = $1 AND cache_key = $2
               AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(group)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        match row.try_get::<JsonValue, _>("row")? {
            JsonValue::Object(map) => Ok(Some(map)),
            other => Err(StoreError::Decode(format!("cached row is not an object: {}", other))),
        }
    }

    async fn save(&self, group: &str, row: &Row, options: &CacheSaveOptions) -> StoreResult<()> {
        let keys = options.keys_for(row);
        if keys.is_empty() {
            return Err(StoreError::Invalid("row has no cacheable key".into()));
        }
        let expires_at = match options.ttl.or(self.default_ttl) {
            Some(ttl) => {
                let ttl = ChronoDuration::from_std(ttl).map_err(|e| StoreError::Invalid(e.to_string()))?;
                Some(Utc::now() + ttl)
            }
            None => None,
        };
        let payload = JsonValue::Object(row.clone());

        let mut tx = self.pool.begin().await?;
        for key in keys {
            sqlx::query(
                "INSERT INTO record_cache (cache_group, cache_key, row, expires_at) VALUES ($1, $2, $3, $4)
                 ON CONFLICT (cache_group, cache_key) DO UPDATE SET row = $3, expires_at = $4",
            )
            .bind(group)
            .bind(&key)
            .bind(&payload)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn flush(&self, group: &str, key: &str) -> StoreResult<()> {
        sqlx::query(
            "DELETE FROM record_cache
             WHERE cache_group = $1
               AND row = (SELECT row FROM record_cache WHERE cache_group = $1 AND cache_key = $2)",
        )
        .bind(group)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
