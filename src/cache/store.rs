//! Shared store contract and the in-process implementation.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use lru::LruCache;
use thiserror::Error;
use tokio::time::Instant;

use super::config::CacheConfig;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::store";

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("cache value could not be encoded: {0}")]
    Serialization(String),
    #[error("cache backend does not support {0}")]
    Unsupported(&'static str),
}

/// Key/value store shared by every process serving the tree.
///
/// `create_if_absent` must be atomic across all callers: it is the only
/// primitive the debounce scheduler relies on.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Store `value` for `ttl`. Tags are ignored by stores without tag support.
    async fn put(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        tags: &[String],
    ) -> Result<(), StoreError>;

    /// Returns whether anything was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Create a marker under `key` expiring after `ttl`, unless a live one
    /// exists. Returns `true` when this call created it.
    async fn create_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Drop every entry stored with `tag`, returning how many were removed.
    async fn forget_tag(&self, tag: &str) -> Result<usize, StoreError>;

    fn supports_tags(&self) -> bool;
}

struct StoredEntry {
    value: Bytes,
    expires_at: Instant,
}

/// In-process [`SharedStore`] bounded by an LRU.
///
/// Markers from `create_if_absent` live apart from cached values so LRU
/// pressure never drops a pending debounce window.
pub struct MemoryStore {
    entries: Mutex<LruCache<String, StoredEntry>>,
    markers: DashMap<String, Instant>,
    tags: Option<DashMap<String, HashSet<String>>>,
}

impl MemoryStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(config.memory_capacity_non_zero())),
            markers: DashMap::new(),
            tags: config.tagged_store.then(DashMap::new),
        }
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        mutex_lock(&self.entries, SOURCE, "contains")
            .peek(key)
            .is_some_and(|entry| entry.expires_at > now)
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let now = Instant::now();
        let mut entries = mutex_lock(&self.entries, SOURCE, "get");
        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn put(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        tags: &[String],
    ) -> Result<(), StoreError> {
        let entry = StoredEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        mutex_lock(&self.entries, SOURCE, "put").put(key.to_string(), entry);

        if let Some(index) = &self.tags {
            for tag in tags {
                index.entry(tag.clone()).or_default().insert(key.to_string());
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed_entry = mutex_lock(&self.entries, SOURCE, "delete")
            .pop(key)
            .is_some();
        let removed_marker = self.markers.remove(key).is_some();
        Ok(removed_entry || removed_marker)
    }

    async fn create_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        match self.markers.entry(key.to_string()) {
            Entry::Occupied(mut marker) => {
                if *marker.get() > now {
                    return Ok(false);
                }
                marker.insert(now + ttl);
                Ok(true)
            }
            Entry::Vacant(slot) => {
                slot.insert(now + ttl);
                Ok(true)
            }
        }
    }

    async fn forget_tag(&self, tag: &str) -> Result<usize, StoreError> {
        let Some(index) = &self.tags else {
            return Err(StoreError::Unsupported("tags"));
        };

        let Some((_, keys)) = index.remove(tag) else {
            return Ok(0);
        };

        let mut entries = mutex_lock(&self.entries, SOURCE, "forget_tag");
        Ok(keys
            .iter()
            .filter(|key| entries.pop(key.as_str()).is_some())
            .count())
    }

    fn supports_tags(&self) -> bool {
        self.tags.is_some()
    }
}
