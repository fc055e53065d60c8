//! In-process node store, used by tests and by embedders without a database.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::application::repos::{NewNodeRecord, NodeStore, NodeWriteRepo, RepoError};
use crate::cache::lock::{rw_read, rw_write};
use crate::domain::node::{Node, NodeId};

const LOCK_TARGET: &str = "infra::memory";

#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    nodes: RwLock<BTreeMap<NodeId, Node>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let nodes = nodes.into_iter().map(|node| (node.id, node)).collect();
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    /// Insert or overwrite a node verbatim, bypassing every invariant.
    pub fn put(&self, node: Node) {
        rw_write(&self.nodes, LOCK_TARGET, "put").insert(node.id, node);
    }

    pub fn len(&self) -> usize {
        rw_read(&self.nodes, LOCK_TARGET, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update_with(
        &self,
        id: NodeId,
        op: &'static str,
        apply: impl FnOnce(&mut Node),
    ) -> Result<Node, RepoError> {
        let mut nodes = rw_write(&self.nodes, LOCK_TARGET, op);
        let node = nodes.get_mut(&id).ok_or(RepoError::NotFound)?;
        apply(node);
        Ok(node.clone())
    }
}

fn live(node: &&Node) -> bool {
    !node.is_deleted()
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn get_by_id(&self, id: NodeId) -> Result<Option<Node>, RepoError> {
        Ok(rw_read(&self.nodes, LOCK_TARGET, "get_by_id").get(&id).cloned())
    }

    async fn get_many(&self, ids: &[NodeId]) -> Result<Vec<Node>, RepoError> {
        let nodes = rw_read(&self.nodes, LOCK_TARGET, "get_many");
        Ok(ids.iter().filter_map(|id| nodes.get(id).cloned()).collect())
    }

    async fn get_children(&self, parent_id: Option<NodeId>) -> Result<Vec<Node>, RepoError> {
        let nodes = rw_read(&self.nodes, LOCK_TARGET, "get_children");
        let mut children: Vec<Node> = nodes
            .values()
            .filter(live)
            .filter(|node| node.parent_id == parent_id)
            .cloned()
            .collect();
        children.sort_by_key(|node| (node.position, node.id));
        Ok(children)
    }

    async fn get_by_path_prefix(&self, prefix: &str) -> Result<Vec<Node>, RepoError> {
        let nodes = rw_read(&self.nodes, LOCK_TARGET, "get_by_path_prefix");
        Ok(nodes
            .values()
            .filter(live)
            .filter(|node| node.path.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn get_subtree(&self, prefix: &str) -> Result<Vec<Node>, RepoError> {
        let nodes = rw_read(&self.nodes, LOCK_TARGET, "get_subtree");
        Ok(nodes
            .values()
            .filter(|node| node.path.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn list_nodes(&self, active_only: bool) -> Result<Vec<Node>, RepoError> {
        let nodes = rw_read(&self.nodes, LOCK_TARGET, "list_nodes");
        Ok(nodes
            .values()
            .filter(live)
            .filter(|node| !active_only || node.active)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl NodeWriteRepo for MemoryNodeStore {
    async fn insert_node(&self, record: NewNodeRecord) -> Result<Node, RepoError> {
        let mut nodes = rw_write(&self.nodes, LOCK_TARGET, "insert_node");

        let id = match record.id {
            Some(id) if nodes.contains_key(&id) => return Err(RepoError::Duplicate { id }),
            Some(id) => id,
            None => nodes.keys().next_back().map_or(1, |max| max + 1),
        };

        let node = Node {
            id,
            parent_id: record.parent_id,
            name: record.name,
            position: record.position,
            depth: record.depth,
            path: format!("{}/{id}", record.path_prefix),
            active: record.active,
            deleted_at: None,
        };
        nodes.insert(id, node.clone());
        Ok(node)
    }

    async fn update_node(&self, node: Node) -> Result<Node, RepoError> {
        self.update_with(node.id, "update_node", |stored| {
            stored.name = node.name.clone();
            stored.active = node.active;
        })
    }

    async fn save_nodes(&self, batch: Vec<Node>) -> Result<(), RepoError> {
        let mut nodes = rw_write(&self.nodes, LOCK_TARGET, "save_nodes");
        if let Some(missing) = batch.iter().find(|node| !nodes.contains_key(&node.id)) {
            return Err(RepoError::integrity(format!(
                "cannot save unknown node `{}`",
                missing.id
            )));
        }
        for node in batch {
            nodes.insert(node.id, node);
        }
        Ok(())
    }

    async fn soft_delete(&self, id: NodeId) -> Result<Node, RepoError> {
        let now = OffsetDateTime::now_utc();
        self.update_with(id, "soft_delete", |node| {
            node.deleted_at.get_or_insert(now);
        })
    }

    async fn restore(&self, id: NodeId) -> Result<Node, RepoError> {
        self.update_with(id, "restore", |node| node.deleted_at = None)
    }

    async fn force_delete(&self, id: NodeId) -> Result<Node, RepoError> {
        let mut nodes = rw_write(&self.nodes, LOCK_TARGET, "force_delete");
        let node = nodes.get(&id).ok_or(RepoError::NotFound)?;
        let prefix = format!("{}/", node.path);

        if let Some(child) = nodes
            .values()
            .find(|other| other.parent_id == Some(id) && !other.is_deleted())
        {
            return Err(RepoError::integrity(format!(
                "category `{id}` is still referenced by live child `{}`",
                child.id
            )));
        }

        nodes.retain(|_, other| !(other.is_deleted() && other.path.starts_with(&prefix)));
        nodes.remove(&id).ok_or(RepoError::NotFound)
    }
}
