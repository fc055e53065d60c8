//! Category Tree Cache
//!
//! Read-through cache for tree queries plus the invalidation pipeline that
//! keeps it fresh:
//!
//! - **Layer**: tagged entries sharded by root ancestor, with a registry
//!   fallback for stores that cannot evict by tag
//! - **Notifier**: maps each committed mutation to the narrowest scope
//! - **Debounce**: collapses bursts of identical scopes into one flush
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! namespace = "category_tree:"
//! debounce_window_ms = 2000
//! # ... see config.rs for all options
//! ```

mod config;
mod debounce;
mod events;
mod keys;
mod layer;
pub(crate) mod lock;
mod notifier;
mod registry;
mod scope;
mod store;
mod trigger;

pub use config::CacheConfig;
pub use debounce::{DebounceScheduler, ScheduleReport};
pub use events::{Epoch, EventSequence, MutationEvent, NodeMutation};
pub use keys::{EntryTags, ShardTag, TreeCacheKey};
pub use layer::{CacheLookup, CategoryCache};
pub use notifier::ChangeNotifier;
pub use registry::ShardRegistry;
pub use scope::{InvalidationScope, ScopeMode};
pub use store::{MemoryStore, SharedStore, StoreError};
pub use trigger::CacheTrigger;
