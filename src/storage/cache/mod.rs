//! Best-effort row cache consulted before the backend on reads.
//!
//! Every failure of a cache store is advisory: records log and continue.

use crate::error::{StoreError, StoreResult};
use crate::storage::backend::Row;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

pub mod postgres;

pub use postgres::PostgresCache;

/// How a row should be indexed when cached.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheSaveOptions {
    /// Fields whose values also address the row.
    pub uniques: Vec<String>,
    /// Field used as the primary cache key instead of uuid/id.
    pub identifier: Option<String>,
    pub ttl: Option<Duration>,
}

impl CacheSaveOptions {
    /// Every key the row can be found under, identifier first. Keys are
    /// namespaced by field so `slug:1` never aliases `id:1`.
    pub fn keys_for(&self, row: &Row) -> Vec<String> {
        let mut fields: Vec<&str> = Vec::new();
        if let Some(identifier) = &self.identifier {
            fields.push(identifier);
        }
        fields.push("uuid");
        fields.push("id");
        fields.extend(self.uniques.iter().map(String::as_str));

        let mut keys: Vec<String> = Vec::new();
        for field in fields {
            if let Some(key) = row.get(field).and_then(|v| field_cache_key(field, v)) {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }
}

/// Renders a scalar JSON value as a cache key.
pub fn cache_key_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `field:value`, the key a row is addressed by through one of its fields.
pub fn field_cache_key(field: &str, value: &JsonValue) -> Option<String> {
    cache_key_text(value).map(|text| format!("{}:{}", field, text))
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, group: &str, key: &str) -> StoreResult<Option<Row>>;

    async fn save(&self, group: &str, row: &Row, options: &CacheSaveOptions) -> StoreResult<()>;

    /// Evicts the row stored under `key` together with all of its aliases.
    async fn flush(&self, group: &str, key: &str) -> StoreResult<()>;
}

/// Cache that never holds anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

#[async_trait]
impl CacheStore for NoCache {
    async fn get(&self, _group: &str, _key: &str) -> StoreResult<Option<Row>> {
        Ok(None)
    }

    async fn save(&self, _group: &str, _row: &Row, _options: &CacheSaveOptions) -> StoreResult<()> {
        Ok(())
    }

    async fn flush(&self, _group: &str, _key: &str) -> StoreResult<()> {
        Ok(())
    }
}

struct Entry {
    row: Arc<Row>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.expires_at.map(|at| Instant::now() < at).unwrap_or(true)
    }
}

/// Process-local cache keyed by `(group, key)`.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<(String, String), Entry>>,
    default_ttl: Option<Duration>,
    fail_all: Mutex<Option<StoreError>>,
    gets: AtomicUsize,
    saves: AtomicUsize,
    flushes: AtomicUsize,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Makes every subsequent call fail with `err` (or recover with `None`).
    pub async fn set_failure(&self, err: Option<StoreError>) {
        *self.fail_all.lock().await = err;
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn check(&self) -> StoreResult<()> {
        match self.fail_all.lock().await.as_ref() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, group: &str, key: &str) -> StoreResult<Option<Row>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.check().await?;

        let entries = self.entries.read().await;
        Ok(entries
            .get(&(group.to_string(), key.to_string()))
            .filter(|e| e.is_live())
            .map(|e| e.row.as_ref().clone()))
    }

    async fn save(&self, group: &str, row: &Row, options: &CacheSaveOptions) -> StoreResult<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.check().await?;

        let keys = options.keys_for(row);
        if keys.is_empty() {
            return Err(StoreError::Invalid("row has no cacheable key".into()));
        }
        let ttl = options.ttl.or(self.default_ttl);
        let shared = Arc::new(row.clone());
        let mut entries = self.entries.write().await;
        for key in keys {
            entries.insert(
                (group.to_string(), key),
                Entry {
                    row: shared.clone(),
                    expires_at: ttl.map(|t| Instant::now() + t),
                },
            );
        }
        Ok(())
    }

    async fn flush(&self, group: &str, key: &str) -> StoreResult<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.check().await?;

        let mut entries = self.entries.write().await;
        let Some(target) = entries
            .get(&(group.to_string(), key.to_string()))
            .map(|e| e.row.clone())
        else {
            return Ok(());
        };
        entries.retain(|(g, _), e| !(g == group && Arc::ptr_eq(&e.row, &target)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: JsonValue) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_save_indexes_all_aliases_and_flush_evicts_them() {
        let cache = MemoryCache::new();
        let r = row(json!({"id": 3, "uuid": "u-3", "slug": "news"}));
        let opts = CacheSaveOptions {
            uniques: vec!["slug".into()],
            ..Default::default()
        };
        cache.save("topic", &r, &opts).await.unwrap();
        assert_eq!(cache.get("topic", "id:3").await.unwrap(), Some(r.clone()));
        assert_eq!(cache.get("topic", "slug:news").await.unwrap(), Some(r.clone()));

        cache.flush("topic", "uuid:u-3").await.unwrap();
        assert!(cache.get("topic", "id:3").await.unwrap().is_none());
        assert!(cache.get("topic", "slug:news").await.unwrap().is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_groups_are_isolated() {
        let cache = MemoryCache::new();
        let r = row(json!({"id": 1}));
        cache.save("topic", &r, &CacheSaveOptions::default()).await.unwrap();
        assert!(cache.get("target", "id:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entries_miss() {
        let cache = MemoryCache::new().with_ttl(Some(Duration::from_millis(0)));
        let r = row(json!({"id": 1}));
        cache.save("topic", &r, &CacheSaveOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.get("topic", "id:1").await.unwrap().is_none());
    }

    #[test]
    fn test_identifier_key_comes_first() {
        let opts = CacheSaveOptions {
            identifier: Some("slug".into()),
            ..Default::default()
        };
        let keys = opts.keys_for(&row(json!({"id": 1, "uuid": "u", "slug": "s"})));
        assert_eq!(keys, vec!["slug:s", "uuid:u", "id:1"]);

        let opts = CacheSaveOptions {
            identifier: Some("uuid".into()),
            ..Default::default()
        };
        assert_eq!(opts.keys_for(&row(json!({"id": 1, "uuid": "u"}))), vec!["uuid:u", "id:1"]);
    }

    #[tokio::test]
    async fn test_unique_value_equal_to_an_id_does_not_alias_it() {
        let cache = MemoryCache::new();
        let opts = CacheSaveOptions {
            uniques: vec!["slug".into()],
            ..Default::default()
        };
        let first = row(json!({"id": 1, "uuid": "u-1", "slug": "alpha"}));
        let second = row(json!({"id": 2, "uuid": "u-2", "slug": "1"}));
        cache.save("topic", &first, &opts).await.unwrap();
        cache.save("topic", &second, &opts).await.unwrap();

        assert_eq!(cache.get("topic", "id:1").await.unwrap(), Some(first));
        assert_eq!(cache.get("topic", "slug:1").await.unwrap(), Some(second));
    }
}
