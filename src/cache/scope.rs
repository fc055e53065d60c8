//! Invalidation scopes: what a mutation made stale.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::node::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeMode {
    /// Drop the whole namespace.
    Full,
    /// Drop the shards of the affected roots (and forest-wide views).
    RootShard,
    /// Drop the node-scoped entries of the affected nodes only.
    SingleKey,
}

impl ScopeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeMode::Full => "full",
            ScopeMode::RootShard => "root_shard",
            ScopeMode::SingleKey => "single_key",
        }
    }
}

impl fmt::Display for ScopeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationScope {
    pub mode: ScopeMode,
    pub affected_root_ids: BTreeSet<NodeId>,
    pub affected_node_ids: BTreeSet<NodeId>,
}

impl InvalidationScope {
    pub fn full(affected_node_ids: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            mode: ScopeMode::Full,
            affected_root_ids: BTreeSet::new(),
            affected_node_ids: affected_node_ids.into_iter().collect(),
        }
    }

    /// A root shard scope. An empty root set degrades to [`ScopeMode::Full`].
    pub fn root_shard(
        roots: impl IntoIterator<Item = NodeId>,
        affected_node_ids: impl IntoIterator<Item = NodeId>,
    ) -> Self {
        let affected_root_ids: BTreeSet<NodeId> = roots.into_iter().collect();
        if affected_root_ids.is_empty() {
            return Self::full(affected_node_ids);
        }
        Self {
            mode: ScopeMode::RootShard,
            affected_root_ids,
            affected_node_ids: affected_node_ids.into_iter().collect(),
        }
    }

    pub fn single_key(node_ids: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            mode: ScopeMode::SingleKey,
            affected_root_ids: BTreeSet::new(),
            affected_node_ids: node_ids.into_iter().collect(),
        }
    }

    /// Ids the scope is keyed by: roots for shard scopes, nodes for single
    /// keys, nothing for a full flush.
    pub fn key_ids(&self) -> &BTreeSet<NodeId> {
        static EMPTY: BTreeSet<NodeId> = BTreeSet::new();
        match self.mode {
            ScopeMode::Full => &EMPTY,
            ScopeMode::RootShard => &self.affected_root_ids,
            ScopeMode::SingleKey => &self.affected_node_ids,
        }
    }

    /// Split into one scope per shard so each debounces on its own.
    pub fn units(&self) -> Vec<InvalidationScope> {
        match self.mode {
            ScopeMode::Full => vec![self.clone()],
            ScopeMode::RootShard => self
                .affected_root_ids
                .iter()
                .map(|root| Self {
                    mode: ScopeMode::RootShard,
                    affected_root_ids: BTreeSet::from([*root]),
                    affected_node_ids: self.affected_node_ids.clone(),
                })
                .collect(),
            ScopeMode::SingleKey => self
                .affected_node_ids
                .iter()
                .map(|node| Self::single_key([*node]))
                .collect(),
        }
    }

    /// Stable digest of the mode and key ids. Affected node ids do not take
    /// part: two edits in the same shard are the same flush.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.mode.as_str().as_bytes());
        for id in self.key_ids() {
            hasher.update(b":");
            hasher.update(id.to_string().as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn debounce_key(&self, namespace: &str) -> String {
        format!("{namespace}debounce:{}:{}", self.mode, self.fingerprint())
    }
}
