//! Cache key and tag definitions.
//!
//! Keys name one query result; tags group keys by the shard (root ancestor)
//! they were computed from so a flush can drop a whole shard at once.

use std::collections::BTreeSet;
use std::fmt;

use crate::domain::node::NodeId;

/// One cacheable query and its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeCacheKey {
    Tree { active_only: bool },
    Breadcrumbs(NodeId),
    Ancestors(NodeId),
    Descendants(NodeId),
    DepthStats,
}

impl TreeCacheKey {
    /// Keys that belong to a single node.
    pub fn for_node(id: NodeId) -> [TreeCacheKey; 3] {
        [
            TreeCacheKey::Breadcrumbs(id),
            TreeCacheKey::Ancestors(id),
            TreeCacheKey::Descendants(id),
        ]
    }

    /// Query label used for metrics.
    pub fn query(&self) -> &'static str {
        match self {
            TreeCacheKey::Tree { .. } => "tree",
            TreeCacheKey::Breadcrumbs(_) => "breadcrumbs",
            TreeCacheKey::Ancestors(_) => "ancestors",
            TreeCacheKey::Descendants(_) => "descendants",
            TreeCacheKey::DepthStats => "depth_stats",
        }
    }

    pub fn storage_key(&self, namespace: &str) -> String {
        format!("{namespace}{self}")
    }
}

impl fmt::Display for TreeCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeCacheKey::Tree { active_only } => write!(f, "tree:active={active_only}"),
            TreeCacheKey::Breadcrumbs(id) => write!(f, "breadcrumbs:{id}"),
            TreeCacheKey::Ancestors(id) => write!(f, "ancestors:{id}"),
            TreeCacheKey::Descendants(id) => write!(f, "descendants:{id}"),
            TreeCacheKey::DepthStats => f.write_str("depth_stats"),
        }
    }
}

/// Invalidation group an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShardTag {
    /// Entries computed from the subtree under one root.
    Root(NodeId),
    /// Entries spanning the whole forest (tree views, depth statistics).
    /// Dropped together with any root shard.
    Forest,
    /// Every entry in the namespace.
    All,
}

impl ShardTag {
    pub fn storage_tag(&self, namespace: &str) -> String {
        format!("{namespace}tag:{self}")
    }
}

impl fmt::Display for ShardTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardTag::Root(id) => write!(f, "root:{id}"),
            ShardTag::Forest => f.write_str("forest"),
            ShardTag::All => f.write_str("all"),
        }
    }
}

/// Tags attached to a freshly computed entry. Always includes [`ShardTag::All`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryTags {
    roots: BTreeSet<NodeId>,
    forest: bool,
}

impl EntryTags {
    pub fn forest() -> Self {
        Self {
            roots: BTreeSet::new(),
            forest: true,
        }
    }

    pub fn roots(roots: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            roots: roots.into_iter().collect(),
            forest: false,
        }
    }

    pub fn with_forest(mut self) -> Self {
        self.forest = true;
        self
    }

    pub fn root_ids(&self) -> &BTreeSet<NodeId> {
        &self.roots
    }

    pub fn shard_tags(&self) -> Vec<ShardTag> {
        let mut tags: Vec<ShardTag> = self.roots.iter().copied().map(ShardTag::Root).collect();
        if self.forest {
            tags.push(ShardTag::Forest);
        }
        tags.push(ShardTag::All);
        tags
    }
}
