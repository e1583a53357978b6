//! In-process [`KeyValueStore`] backed by a `BTreeMap`.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::DbError;
use crate::store::{compile_pattern, validate_key, KeyValueStore};

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Shared, cloneable in-memory store. Expired entries are dropped lazily.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<BTreeMap<String, Entry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, DbError> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), DbError> {
        validate_key(key)?;
        let entry = Entry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, DbError> {
        let now = Instant::now();
        let removed = self.entries.write().await.remove(key);
        Ok(removed.is_some_and(|e| e.is_live(now)))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, DbError> {
        let pattern = compile_pattern(pattern)?;
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| e.is_live(now));
        Ok(entries
            .keys()
            .filter(|k| pattern.matches(k))
            .cloned()
            .collect())
    }

    async fn clear(&self, pattern: &str) -> Result<usize, DbError> {
        let pattern = compile_pattern(pattern)?;
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let mut removed = 0;
        entries.retain(|k, e| {
            if !e.is_live(now) {
                return false;
            }
            if pattern.matches(k) {
                removed += 1;
                return false;
            }
            true
        });
        Ok(removed)
    }
}
