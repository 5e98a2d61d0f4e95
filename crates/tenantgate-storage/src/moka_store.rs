use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::future::Cache;

use crate::traits::{CacheStore, StorageError, key_matches_pattern};

#[derive(Debug, Clone)]
struct StoredValue {
    value: Arc<str>,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, StoredValue> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredValue,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Bounded in-process cache store with a TTL per entry.
#[derive(Clone)]
pub struct MokaCacheStore {
    cache: Cache<String, StoredValue>,
}

impl MokaCacheStore {
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }
}

impl CacheStore for MokaCacheStore {
    async fn connect(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.cache.get(key).await.map(|v| v.value.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        if ttl.is_zero() {
            return Err(StorageError::Internal("ttl must be positive".to_string()));
        }
        self.cache
            .insert(
                key.to_string(),
                StoredValue {
                    value: Arc::from(value),
                    ttl,
                },
            )
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.cache.remove(key).await.is_some())
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        self.cache.run_pending_tasks().await;
        let mut keys: Vec<String> = self
            .cache
            .iter()
            .filter(|(key, _)| key_matches_pattern(key, pattern))
            .map(|(key, _)| key.as_ref().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
