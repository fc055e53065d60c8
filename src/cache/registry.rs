//! Bidirectional shard registry.
//!
//! Stores without tag support cannot drop "every entry of root 7" on their
//! own. The registry remembers which storage keys were written under which
//! tag so the cache layer can delete them one by one.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::registry";

#[derive(Default)]
struct Mappings {
    tag_to_keys: HashMap<String, HashSet<String>>,
    key_to_tags: HashMap<String, HashSet<String>>,
}

/// Tracks tag -> storage keys and storage key -> tags.
#[derive(Default)]
pub struct ShardRegistry {
    mappings: RwLock<Mappings>,
}

impl ShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `key` was written under `tags`. Repeated writes merge.
    pub fn register(&self, key: &str, tags: &[String]) {
        let mut mappings = rw_write(&self.mappings, SOURCE, "register");
        for tag in tags {
            mappings
                .tag_to_keys
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        mappings
            .key_to_tags
            .entry(key.to_string())
            .or_default()
            .extend(tags.iter().cloned());
    }

    pub fn keys_for_tag(&self, tag: &str) -> HashSet<String> {
        rw_read(&self.mappings, SOURCE, "keys_for_tag")
            .tag_to_keys
            .get(tag)
            .cloned()
            .unwrap_or_default()
    }

    pub fn tags_for_key(&self, key: &str) -> HashSet<String> {
        rw_read(&self.mappings, SOURCE, "tags_for_key")
            .key_to_tags
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Forget `key` under every tag it was registered with.
    pub fn unregister(&self, key: &str) {
        let mut mappings = rw_write(&self.mappings, SOURCE, "unregister");
        let Some(tags) = mappings.key_to_tags.remove(key) else {
            return;
        };
        for tag in tags {
            if let Some(keys) = mappings.tag_to_keys.get_mut(&tag) {
                keys.remove(key);
                if keys.is_empty() {
                    mappings.tag_to_keys.remove(&tag);
                }
            }
        }
    }

    pub fn clear(&self) {
        let mut mappings = rw_write(&self.mappings, SOURCE, "clear");
        mappings.tag_to_keys.clear();
        mappings.key_to_tags.clear();
    }

    pub fn tag_count(&self) -> usize {
        rw_read(&self.mappings, SOURCE, "tag_count").tag_to_keys.len()
    }

    pub fn key_count(&self) -> usize {
        rw_read(&self.mappings, SOURCE, "key_count").key_to_tags.len()
    }
}
