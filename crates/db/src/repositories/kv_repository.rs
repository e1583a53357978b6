use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::debug;

use crate::error::DbError;
use crate::models::{datetime_to_millis, KvEntryRow};
use crate::store::{compile_pattern, validate_key, KeyValueStore};

/// SQLite-backed [`KeyValueStore`]. Patterns map onto SQLite `GLOB`.
#[derive(Clone)]
pub struct KvRepository {
    pool: SqlitePool,
}

impl KvRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Physically remove expired rows. Reads already ignore them.
    pub async fn purge_expired(&self) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM kv_store WHERE expires_at IS NOT NULL AND expires_at <= ?")
            .bind(now_millis())
            .execute(&self.pool)
            .await?;

        let purged = result.rows_affected();
        if purged > 0 {
            debug!(purged, "Purged expired kv entries");
        }
        Ok(purged)
    }
}

fn now_millis() -> i64 {
    datetime_to_millis(Utc::now())
}

#[async_trait]
impl KeyValueStore for KvRepository {
    async fn get(&self, key: &str) -> Result<Option<Value>, DbError> {
        let row: Option<KvEntryRow> = sqlx::query_as(
            r#"
            SELECT key, value, expires_at, updated_at
            FROM kv_store
            WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(key)
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await?;

        row.map(KvEntryRow::into_value).transpose()
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), DbError> {
        validate_key(key)?;
        let expires_at = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| Utc::now() + ttl);
        let row = KvEntryRow::new(key, &value, expires_at)?;

        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, expires_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&row.key)
        .bind(&row.value)
        .bind(row.expires_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, DbError> {
        let result = sqlx::query(
            "DELETE FROM kv_store WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, DbError> {
        compile_pattern(pattern)?;
        let keys: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT key FROM kv_store
            WHERE key GLOB ? AND (expires_at IS NULL OR expires_at > ?)
            ORDER BY key ASC
            "#,
        )
        .bind(pattern)
        .bind(now_millis())
        .fetch_all(&self.pool)
        .await?;

        Ok(keys.into_iter().map(|(k,)| k).collect())
    }

    async fn clear(&self, pattern: &str) -> Result<usize, DbError> {
        compile_pattern(pattern)?;
        let result = sqlx::query(
            "DELETE FROM kv_store WHERE key GLOB ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(pattern)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() as usize)
    }

    async fn set_many(
        &self,
        entries: Vec<(String, Value)>,
        ttl: Option<Duration>,
    ) -> Result<(), DbError> {
        let expires_at = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| Utc::now() + ttl);

        let mut tx = self.pool.begin().await?;
        for (key, value) in entries {
            validate_key(&key)?;
            let row = KvEntryRow::new(&key, &value, expires_at)?;
            sqlx::query(
                r#"
                INSERT INTO kv_store (key, value, expires_at, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    expires_at = excluded.expires_at,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&row.key)
            .bind(&row.value)
            .bind(row.expires_at)
            .bind(row.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }
}
