//! Key-value storage contract.
//!
//! The engine persists checkpoints and task history through this trait and
//! never depends on a concrete backend. Keys are plain strings; patterns use
//! glob syntax (`*` any run of characters, `?` exactly one character).

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::DbError;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, DbError>;

    /// Store a value, replacing any previous one. `ttl` of `None` never expires.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), DbError>;

    /// Returns whether a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool, DbError>;

    async fn exists(&self, key: &str) -> Result<bool, DbError> {
        Ok(self.get(key).await?.is_some())
    }

    /// Live keys matching `pattern`, sorted ascending.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, DbError>;

    /// Remove every key matching `pattern`; returns the number removed.
    async fn clear(&self, pattern: &str) -> Result<usize, DbError>;

    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Value>, DbError> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key).await? {
                found.insert(key.clone(), value);
            }
        }
        Ok(found)
    }

    async fn set_many(
        &self,
        entries: Vec<(String, Value)>,
        ttl: Option<Duration>,
    ) -> Result<(), DbError> {
        for (key, value) in entries {
            self.set(&key, value, ttl).await?;
        }
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize, DbError> {
        let mut removed = 0;
        for key in keys {
            if self.delete(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Compile a key pattern. Backends call this before touching storage so an
/// invalid pattern fails the same way everywhere.
pub fn compile_pattern(pattern: &str) -> Result<glob::Pattern, DbError> {
    glob::Pattern::new(pattern).map_err(|e| DbError::InvalidPattern(format!("{}: {}", pattern, e)))
}

/// Glob match used by backends without native pattern support.
pub fn pattern_matches(pattern: &str, key: &str) -> Result<bool, DbError> {
    compile_pattern(pattern).map(|p| p.matches(key))
}

pub(crate) fn validate_key(key: &str) -> Result<(), DbError> {
    if key.is_empty() {
        return Err(DbError::InvalidKey("key must not be empty".to_string()));
    }
    Ok(())
}
