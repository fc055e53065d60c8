//! Read-only tree views computed from the flat node store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use crate::application::repos::{NodeStore, RepoError};
use crate::domain::error::TreeError;
use crate::domain::node::{Node, NodeId, TreeNode};
use crate::domain::tree::{OrphanPolicy, build_forest};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// Node counts per depth level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthStatistics {
    pub max_depth: Option<i32>,
    pub count_by_depth: BTreeMap<i32, u64>,
    pub total_nodes: u64,
}

#[derive(Clone)]
pub struct TreeQueryEngine {
    store: Arc<dyn NodeStore>,
}

impl TreeQueryEngine {
    pub fn new(store: Arc<dyn NodeStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    /// Whole forest with children attached in position order.
    ///
    /// With `active_only`, anything below an inactive node is hidden as well.
    #[instrument(skip(self))]
    pub async fn build_tree(&self, active_only: bool) -> Result<Vec<TreeNode>, QueryError> {
        let nodes = self.store.list_nodes(active_only).await?;
        let policy = if active_only {
            OrphanPolicy::Prune
        } else {
            OrphanPolicy::Reject
        };
        Ok(build_forest(nodes, policy)?)
    }

    /// Chain from the root down to and including `id`.
    #[instrument(skip(self))]
    pub async fn breadcrumbs(&self, id: NodeId) -> Result<Option<Vec<Node>>, QueryError> {
        let Some(node) = self.store.get_by_id(id).await? else {
            return Ok(None);
        };

        let mut chain = self.resolve_ancestors(&node).await?;
        chain.push(node);
        Ok(Some(chain))
    }

    /// Chain from the root down to the parent of `id`.
    #[instrument(skip(self))]
    pub async fn ancestors(&self, id: NodeId) -> Result<Option<Vec<Node>>, QueryError> {
        let Some(node) = self.store.get_by_id(id).await? else {
            return Ok(None);
        };

        Ok(Some(self.resolve_ancestors(&node).await?))
    }

    /// Every non-deleted node below `id`, shallowest first.
    #[instrument(skip(self))]
    pub async fn descendants(&self, id: NodeId) -> Result<Option<Vec<Node>>, QueryError> {
        let Some(node) = self.store.get_by_id(id).await? else {
            return Ok(None);
        };

        Ok(Some(self.descendants_of(&node).await?))
    }

    /// [`descendants`](Self::descendants) for an already loaded node.
    pub async fn descendants_of(&self, node: &Node) -> Result<Vec<Node>, QueryError> {
        let prefix = node.materialized_path()?.descendant_prefix();
        let mut nodes: Vec<Node> = self
            .store
            .get_by_path_prefix(&prefix)
            .await?
            .into_iter()
            .filter(|candidate| !candidate.is_deleted() && candidate.id != node.id)
            .collect();
        nodes.sort_by_key(|candidate| (candidate.depth, candidate.position, candidate.id));

        Ok(nodes)
    }

    #[instrument(skip(self))]
    pub async fn depth_statistics(&self) -> Result<DepthStatistics, QueryError> {
        let nodes = self.store.list_nodes(false).await?;

        let mut stats = DepthStatistics::default();
        for node in &nodes {
            *stats.count_by_depth.entry(node.depth).or_default() += 1;
            stats.max_depth = Some(stats.max_depth.map_or(node.depth, |max| max.max(node.depth)));
        }
        stats.total_nodes = nodes.len() as u64;

        Ok(stats)
    }

    /// Resolve every ancestor listed in the node's path with a single lookup.
    async fn resolve_ancestors(&self, node: &Node) -> Result<Vec<Node>, QueryError> {
        let path = node.materialized_path()?;
        if path.leaf_id() != node.id {
            return Err(TreeError::PathMismatch {
                id: node.id,
                path: node.path.clone(),
                expected: format!(".../{}", node.id),
            }
            .into());
        }

        let ancestor_ids = path.ancestor_ids();
        if ancestor_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut fetched: HashMap<NodeId, Node> = self
            .store
            .get_many(ancestor_ids)
            .await?
            .into_iter()
            .map(|ancestor| (ancestor.id, ancestor))
            .collect();

        ancestor_ids
            .iter()
            .map(|ancestor_id| {
                fetched
                    .remove(ancestor_id)
                    .ok_or(QueryError::Tree(TreeError::BrokenAncestry {
                        id: node.id,
                        ancestor: *ancestor_id,
                    }))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use super::*;
    use crate::infra::memory::MemoryNodeStore;

    fn catalog() -> Arc<MemoryNodeStore> {
        let electronics = Node::root(1, "Electronics", 1);
        let books = Node::root(3, "Books", 2);
        let phones = Node::child_of(&electronics, 2, "Phones", 1);
        let mut laptops = Node::child_of(&electronics, 4, "Laptops", 2);
        laptops.active = false;
        let cases = Node::child_of(&phones, 5, "Cases", 1);
        let gaming = Node::child_of(&laptops, 6, "Gaming", 1);
        Arc::new(MemoryNodeStore::with_nodes(vec![
            electronics,
            books,
            phones,
            laptops,
            cases,
            gaming,
        ]))
    }

    #[tokio::test]
    async fn empty_store_builds_empty_forest() {
        let engine = TreeQueryEngine::new(Arc::new(MemoryNodeStore::new()));

        assert!(engine.build_tree(false).await.expect("tree").is_empty());
        let stats = engine.depth_statistics().await.expect("stats");
        assert_eq!(stats.max_depth, None);
        assert_eq!(stats.total_nodes, 0);
    }

    #[tokio::test]
    async fn active_only_tree_hides_inactive_subtrees() {
        let engine = TreeQueryEngine::new(catalog());

        let full = engine.build_tree(false).await.expect("full tree");
        assert_eq!(full.iter().map(TreeNode::size).sum::<usize>(), 6);

        let active = engine.build_tree(true).await.expect("active tree");
        let mut ids = Vec::new();
        for root in &active {
            root.walk(&mut |node| ids.push(node.id()));
        }
        assert_eq!(ids, vec![1, 2, 5, 3]);
    }

    #[tokio::test]
    async fn breadcrumbs_run_root_to_target() {
        let engine = TreeQueryEngine::new(catalog());

        let crumbs = engine.breadcrumbs(5).await.expect("query").expect("found");
        let ids: Vec<NodeId> = crumbs.iter().map(|node| node.id).collect();
        assert_eq!(ids, vec![1, 2, 5]);

        let ancestors = engine.ancestors(5).await.expect("query").expect("found");
        let ids: Vec<NodeId> = ancestors.iter().map(|node| node.id).collect();
        assert_eq!(ids, vec![1, 2]);

        let root_ancestors = engine.ancestors(1).await.expect("query").expect("found");
        assert!(root_ancestors.is_empty());
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let engine = TreeQueryEngine::new(catalog());

        assert!(engine.breadcrumbs(99).await.expect("query").is_none());
        assert!(engine.ancestors(99).await.expect("query").is_none());
        assert!(engine.descendants(99).await.expect("query").is_none());
    }

    #[tokio::test]
    async fn descendants_use_path_prefix_and_skip_deleted() {
        let store = catalog();
        let mut cases = store.get_by_id(5).await.expect("lookup").expect("cases");
        cases.deleted_at = Some(OffsetDateTime::now_utc());
        store.put(cases);
        let engine = TreeQueryEngine::new(store);

        let below = engine.descendants(1).await.expect("query").expect("found");
        let ids: Vec<NodeId> = below.iter().map(|node| node.id).collect();
        assert_eq!(ids, vec![2, 4, 6]);
    }

    #[tokio::test]
    async fn broken_ancestry_is_surfaced() {
        let store = catalog();
        let mut cases = store.get_by_id(5).await.expect("lookup").expect("cases");
        cases.path = "/1/77/5".to_string();
        store.put(cases);
        let engine = TreeQueryEngine::new(store);

        let err = engine.breadcrumbs(5).await.expect_err("broken");
        assert!(matches!(
            err,
            QueryError::Tree(TreeError::BrokenAncestry { id: 5, ancestor: 77 })
        ));
    }

    #[tokio::test]
    async fn malformed_path_is_surfaced() {
        let store = catalog();
        let mut phones = store.get_by_id(2).await.expect("lookup").expect("phones");
        phones.path = "1-2".to_string();
        store.put(phones);
        let engine = TreeQueryEngine::new(store);

        let err = engine.descendants(2).await.expect_err("malformed");
        assert!(matches!(
            err,
            QueryError::Tree(TreeError::MalformedPath { id: 2, .. })
        ));
    }

    #[tokio::test]
    async fn depth_statistics_count_every_level() {
        let engine = TreeQueryEngine::new(catalog());

        let stats = engine.depth_statistics().await.expect("stats");
        assert_eq!(stats.max_depth, Some(2));
        assert_eq!(stats.total_nodes, 6);
        assert_eq!(stats.count_by_depth.get(&0), Some(&2));
        assert_eq!(stats.count_by_depth.get(&1), Some(&2));
        assert_eq!(stats.count_by_depth.get(&2), Some(&2));
    }
}
