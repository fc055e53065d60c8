//! Cache configuration.
//!
//! Controls the category cache, the debounce window and the flush worker via
//! the `[cache]` table of `canopy.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_NAMESPACE: &str = "category_tree:";
const DEFAULT_ENTRY_TTL_SECS: u64 = 3600;
const DEFAULT_DEBOUNCE_WINDOW_MS: u64 = 2000;
const DEFAULT_MEMORY_CAPACITY: usize = 10_000;
const DEFAULT_FLUSH_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_FLUSH_BACKOFF_SECS: [u64; 3] = [5, 15, 30];
const DEFAULT_FLUSH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_WORKER_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Serve reads through the cache. When off, every read computes.
    pub enabled: bool,
    /// Prefix of every key and tag written to the shared store.
    pub namespace: String,
    pub entry_ttl_secs: u64,
    /// Identical invalidations inside this window collapse into one flush.
    pub debounce_window_ms: u64,
    /// Maximum entries kept by the in-process store.
    pub memory_capacity: usize,
    /// Whether the in-process store keeps tag indexes. Without them eviction
    /// goes through the shard registry.
    pub tagged_store: bool,
    pub flush_max_attempts: u32,
    /// Delay before each retry; the last value repeats.
    pub flush_backoff_secs: Vec<u64>,
    pub flush_timeout_secs: u64,
    pub worker_concurrency: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: DEFAULT_NAMESPACE.to_string(),
            entry_ttl_secs: DEFAULT_ENTRY_TTL_SECS,
            debounce_window_ms: DEFAULT_DEBOUNCE_WINDOW_MS,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            tagged_store: true,
            flush_max_attempts: DEFAULT_FLUSH_MAX_ATTEMPTS,
            flush_backoff_secs: DEFAULT_FLUSH_BACKOFF_SECS.to_vec(),
            flush_timeout_secs: DEFAULT_FLUSH_TIMEOUT_SECS,
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            namespace: settings.namespace.clone(),
            entry_ttl_secs: settings.entry_ttl_secs,
            debounce_window_ms: settings.debounce_window_ms,
            memory_capacity: settings.memory_capacity,
            tagged_store: settings.tagged_store,
            flush_max_attempts: settings.flush_max_attempts,
            flush_backoff_secs: settings.flush_backoff_secs.clone(),
            flush_timeout_secs: settings.flush_timeout_secs,
            worker_concurrency: settings.worker_concurrency,
        }
    }
}

impl CacheConfig {
    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_secs)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout_secs)
    }

    pub fn flush_backoff(&self) -> Vec<Duration> {
        self.flush_backoff_secs
            .iter()
            .copied()
            .map(Duration::from_secs)
            .collect()
    }

    /// Returns the memory capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn memory_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    /// At least one worker, whatever the configuration says.
    pub fn worker_concurrency(&self) -> usize {
        self.worker_concurrency.max(1)
    }
}
