//! Mutation to invalidation scope translation.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use super::events::NodeMutation;
use super::scope::InvalidationScope;
use crate::application::repos::NodeStore;
use crate::domain::node::{Node, NodeId};
use crate::domain::tree::MAX_TREE_DEPTH;

/// Computes the narrowest scope that covers everything a mutation made stale.
///
/// The only I/O is the parent-chain walk for nodes whose path cannot be read.
#[derive(Clone)]
pub struct ChangeNotifier {
    nodes: Arc<dyn NodeStore>,
}

impl ChangeNotifier {
    pub fn new(nodes: Arc<dyn NodeStore>) -> Self {
        Self { nodes }
    }

    pub async fn scope_for(&self, mutation: &NodeMutation) -> InvalidationScope {
        let touched = mutation.node_ids();

        match mutation {
            NodeMutation::Created { node } | NodeMutation::Restored { node } => {
                self.shard_of(node, touched).await
            }
            NodeMutation::Updated { node, previous } if node.parent_id != previous.parent_id => {
                self.move_scope(node, previous, touched).await
            }
            NodeMutation::Updated { node, .. } => self.shard_of(node, touched).await,
            NodeMutation::Moved { node, previous } => {
                self.move_scope(node, previous, touched).await
            }
            NodeMutation::Deleted { node } | NodeMutation::ForceDeleted { node } => {
                if node.is_root() {
                    return InvalidationScope::full(touched);
                }
                self.shard_of(node, touched).await
            }
            NodeMutation::Reordered { parent_id, nodes } => {
                let mut roots = BTreeSet::new();
                for node in nodes {
                    match self.resolve_root(node).await {
                        Some(root) => roots.insert(root),
                        None => return InvalidationScope::full(touched),
                    };
                }
                if roots.is_empty()
                    && let Some(parent_id) = parent_id
                {
                    match self.root_of_id(*parent_id).await {
                        Some(root) => {
                            roots.insert(root);
                        }
                        None => return InvalidationScope::full(touched),
                    }
                }
                InvalidationScope::root_shard(roots, touched)
            }
            NodeMutation::Bulk { root_ids: None } => InvalidationScope::full(touched),
            NodeMutation::Bulk {
                root_ids: Some(roots),
            } => InvalidationScope::root_shard(roots.iter().copied(), touched),
            NodeMutation::Forget { node_ids } => {
                InvalidationScope::single_key(node_ids.iter().copied())
            }
        }
    }

    async fn shard_of(&self, node: &Node, touched: BTreeSet<NodeId>) -> InvalidationScope {
        match self.resolve_root(node).await {
            Some(root) => InvalidationScope::root_shard([root], touched),
            None => InvalidationScope::full(touched),
        }
    }

    async fn move_scope(
        &self,
        node: &Node,
        previous: &Node,
        touched: BTreeSet<NodeId>,
    ) -> InvalidationScope {
        let (Some(old_root), Some(new_root)) = (
            self.resolve_root(previous).await,
            self.resolve_root(node).await,
        ) else {
            return InvalidationScope::full(touched);
        };
        InvalidationScope::root_shard([old_root, new_root], touched)
    }

    /// Root ancestor from the first path segment, falling back to walking
    /// `parent_id` links when the path is unreadable.
    async fn resolve_root(&self, node: &Node) -> Option<NodeId> {
        if let Some(root) = node.root_ancestor_id() {
            return Some(root);
        }

        debug!(
            target = "cache::notifier",
            node_id = node.id,
            path = %node.path,
            "Malformed path; walking parent chain"
        );
        match node.parent_id {
            None => Some(node.id),
            Some(parent_id) => self.walk_to_root(node.id, parent_id).await,
        }
    }

    async fn root_of_id(&self, id: NodeId) -> Option<NodeId> {
        match self.nodes.get_by_id(id).await {
            Ok(Some(node)) => self.resolve_root(&node).await,
            Ok(None) => None,
            Err(err) => {
                warn!(
                    target = "cache::notifier",
                    node_id = id,
                    error = %err,
                    "Node lookup failed while resolving root"
                );
                None
            }
        }
    }

    async fn walk_to_root(&self, origin: NodeId, mut parent_id: NodeId) -> Option<NodeId> {
        for _ in 0..MAX_TREE_DEPTH {
            let parent = match self.nodes.get_by_id(parent_id).await {
                Ok(Some(parent)) => parent,
                Ok(None) => {
                    warn!(
                        target = "cache::notifier",
                        node_id = origin,
                        missing = parent_id,
                        "Parent chain is broken"
                    );
                    return None;
                }
                Err(err) => {
                    warn!(
                        target = "cache::notifier",
                        node_id = origin,
                        error = %err,
                        "Parent chain lookup failed"
                    );
                    return None;
                }
            };

            match parent.parent_id {
                None => return Some(parent.id),
                Some(next) => parent_id = next,
            }
        }

        warn!(
            target = "cache::notifier",
            node_id = origin,
            max_depth = MAX_TREE_DEPTH,
            "Parent chain exceeds maximum depth"
        );
        None
    }
}
