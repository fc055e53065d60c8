//! Read-through category cache.
//!
//! Values are JSON-encoded and stored under `<namespace><query key>`, tagged
//! with every root shard they were computed from. Store failures never reach
//! the caller: reads fall back to computing, writes are dropped.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use metrics::{counter, histogram};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::config::CacheConfig;
use super::keys::{EntryTags, ShardTag, TreeCacheKey};
use super::registry::ShardRegistry;
use super::scope::{InvalidationScope, ScopeMode};
use super::store::{SharedStore, StoreError};
use crate::domain::node::NodeId;

/// How a read was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    Hit,
    Miss,
    /// Cache disabled or unreachable; computed without storing.
    Bypass,
}

pub struct CategoryCache {
    config: CacheConfig,
    store: Arc<dyn SharedStore>,
    registry: ShardRegistry,
}

impl CategoryCache {
    pub fn new(config: CacheConfig, store: Arc<dyn SharedStore>) -> Self {
        Self {
            config,
            store,
            registry: ShardRegistry::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    pub fn registry(&self) -> &ShardRegistry {
        &self.registry
    }

    pub fn storage_key(&self, key: &TreeCacheKey) -> String {
        key.storage_key(&self.config.namespace)
    }

    /// Return the cached value for `key`, or compute, store and return it.
    ///
    /// `compute` yields the value together with the shards it was built
    /// from. `Ok(None)` (not found) is passed through and never stored.
    pub async fn remember<T, E, F, Fut>(&self, key: TreeCacheKey, compute: F) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<(T, EntryTags)>, E>>,
    {
        self.remember_traced(key, compute)
            .await
            .map(|(value, _)| value)
    }

    /// [`remember`](Self::remember), also reporting whether it hit.
    pub async fn remember_traced<T, E, F, Fut>(
        &self,
        key: TreeCacheKey,
        compute: F,
    ) -> Result<(Option<T>, CacheLookup), E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<(T, EntryTags)>, E>>,
    {
        let query = key.query();
        let started = Instant::now();
        let result = self.read_through(key, compute).await;
        histogram!("query_duration_seconds", "query" => query)
            .record(started.elapsed().as_secs_f64());

        if let Ok((_, lookup)) = &result {
            match lookup {
                CacheLookup::Hit => counter!("cache_hit_total", "query" => query).increment(1),
                CacheLookup::Miss | CacheLookup::Bypass => {
                    counter!("cache_miss_total", "query" => query).increment(1)
                }
            }
        }
        result
    }

    async fn read_through<T, E, F, Fut>(
        &self,
        key: TreeCacheKey,
        compute: F,
    ) -> Result<(Option<T>, CacheLookup), E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<(T, EntryTags)>, E>>,
    {
        if !self.config.enabled {
            let value = compute().await?.map(|(value, _)| value);
            return Ok((value, CacheLookup::Bypass));
        }

        let storage_key = self.storage_key(&key);
        match self.store.get(&storage_key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => {
                    debug!(target = "cache::layer", key = %storage_key, "Cache hit");
                    return Ok((Some(value), CacheLookup::Hit));
                }
                Err(err) => {
                    warn!(
                        target = "cache::layer",
                        key = %storage_key,
                        error = %err,
                        "Dropping undecodable cache entry"
                    );
                    self.discard(&storage_key).await;
                }
            },
            Ok(None) => {}
            Err(err) => {
                warn!(
                    target = "cache::layer",
                    key = %storage_key,
                    error = %err,
                    "Cache backend unavailable; computing directly"
                );
                let value = compute().await?.map(|(value, _)| value);
                return Ok((value, CacheLookup::Bypass));
            }
        }

        let Some((value, tags)) = compute().await? else {
            return Ok((None, CacheLookup::Miss));
        };
        self.write_entry(&storage_key, &value, &tags).await;
        Ok((Some(value), CacheLookup::Miss))
    }

    async fn write_entry<T: Serialize>(&self, storage_key: &str, value: &T, tags: &EntryTags) {
        let encoded = match serde_json::to_vec(value) {
            Ok(encoded) => Bytes::from(encoded),
            Err(err) => {
                let err = StoreError::Serialization(err.to_string());
                warn!(target = "cache::layer", key = storage_key, error = %err, "Skipping cache write");
                return;
            }
        };

        let tag_names: Vec<String> = tags
            .shard_tags()
            .iter()
            .map(|tag| tag.storage_tag(&self.config.namespace))
            .collect();

        match self
            .store
            .put(storage_key, encoded, self.config.entry_ttl(), &tag_names)
            .await
        {
            Ok(()) => {
                if !self.store.supports_tags() {
                    self.registry.register(storage_key, &tag_names);
                }
            }
            Err(err) => warn!(
                target = "cache::layer",
                key = storage_key,
                error = %err,
                "Cache write failed; value served uncached"
            ),
        }
    }

    async fn discard(&self, storage_key: &str) {
        if let Err(err) = self.store.delete(storage_key).await {
            warn!(target = "cache::layer", key = storage_key, error = %err, "Cache delete failed");
        }
        self.registry.unregister(storage_key);
    }

    /// Drop every entry computed from `root`, plus forest-wide views.
    pub async fn forget_root_shard(&self, root: NodeId) -> Result<usize, StoreError> {
        let started = Instant::now();
        let removed = self.forget_tag(ShardTag::Root(root)).await?
            + self.forget_tag(ShardTag::Forest).await?;
        record_eviction(ScopeMode::RootShard, started, removed);
        Ok(removed)
    }

    /// Drop the breadcrumbs, ancestors and descendants entries of one node.
    pub async fn forget_key(&self, node_id: NodeId) -> Result<usize, StoreError> {
        let started = Instant::now();
        let mut removed = 0;
        for key in TreeCacheKey::for_node(node_id) {
            let storage_key = self.storage_key(&key);
            if self.store.delete(&storage_key).await? {
                removed += 1;
            }
            self.registry.unregister(&storage_key);
        }
        record_eviction(ScopeMode::SingleKey, started, removed);
        Ok(removed)
    }

    pub async fn forget_all(&self) -> Result<usize, StoreError> {
        let started = Instant::now();
        let removed = self.forget_tag(ShardTag::All).await?;
        record_eviction(ScopeMode::Full, started, removed);
        Ok(removed)
    }

    /// Evict whatever `scope` names. Stops at the first store failure so the
    /// caller can retry the whole scope.
    pub async fn forget_scope(&self, scope: &InvalidationScope) -> Result<usize, StoreError> {
        match scope.mode {
            ScopeMode::Full => self.forget_all().await,
            ScopeMode::RootShard => {
                let mut removed = 0;
                for root in &scope.affected_root_ids {
                    removed += self.forget_root_shard(*root).await?;
                }
                Ok(removed)
            }
            ScopeMode::SingleKey => {
                let mut removed = 0;
                for node in &scope.affected_node_ids {
                    removed += self.forget_key(*node).await?;
                }
                Ok(removed)
            }
        }
    }

    async fn forget_tag(&self, tag: ShardTag) -> Result<usize, StoreError> {
        let tag_name = tag.storage_tag(&self.config.namespace);
        if self.store.supports_tags() {
            return self.store.forget_tag(&tag_name).await;
        }

        let mut removed = 0;
        for key in self.registry.keys_for_tag(&tag_name) {
            if self.store.delete(&key).await? {
                removed += 1;
            }
            self.registry.unregister(&key);
        }
        Ok(removed)
    }
}

fn record_eviction(mode: ScopeMode, started: Instant, removed: usize) {
    let mode = mode.as_str();
    counter!("cache_eviction_total", "mode" => mode).increment(1);
    histogram!("cache_eviction_duration_seconds", "mode" => mode)
        .record(started.elapsed().as_secs_f64());
    debug!(target = "cache::layer", mode, removed, "Cache entries evicted");
}
