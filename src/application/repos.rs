//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::node::{Node, NodeId};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("resource not found")]
    NotFound,
    #[error("duplicate record `{id}`")]
    Duplicate { id: NodeId },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }
}

/// Read contract of the node store.
///
/// Lookups by id return deleted nodes too (they stay addressable for audit);
/// listings skip them.
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn get_by_id(&self, id: NodeId) -> Result<Option<Node>, RepoError>;

    /// Batched lookup; missing ids are simply absent from the result.
    async fn get_many(&self, ids: &[NodeId]) -> Result<Vec<Node>, RepoError>;

    /// Non-deleted children ordered by position. `None` lists the roots.
    async fn get_children(&self, parent_id: Option<NodeId>) -> Result<Vec<Node>, RepoError>;

    /// Non-deleted nodes whose path starts with `prefix`.
    async fn get_by_path_prefix(&self, prefix: &str) -> Result<Vec<Node>, RepoError>;

    /// Every node under `prefix`, soft-deleted ones included. Used when a
    /// subtree is rewritten so deleted rows keep matching their ancestors.
    async fn get_subtree(&self, prefix: &str) -> Result<Vec<Node>, RepoError>;

    /// Every non-deleted node, optionally only active ones, in one pass.
    async fn list_nodes(&self, active_only: bool) -> Result<Vec<Node>, RepoError>;
}

#[derive(Debug, Clone)]
pub struct NewNodeRecord {
    pub id: Option<NodeId>,
    pub parent_id: Option<NodeId>,
    pub name: String,
    pub position: i32,
    pub depth: i32,
    pub path_prefix: String,
    pub active: bool,
}

/// Write contract used by the category write path.
#[async_trait]
pub trait NodeWriteRepo: Send + Sync {
    /// Insert a node; the store assigns the id when none is given and
    /// appends it to `path_prefix` to form the stored path.
    async fn insert_node(&self, record: NewNodeRecord) -> Result<Node, RepoError>;

    /// Persist name/active changes of an existing node.
    async fn update_node(&self, node: Node) -> Result<Node, RepoError>;

    /// Persist a batch of nodes whose structural fields changed
    /// (relocated subtrees, resequenced siblings).
    async fn save_nodes(&self, nodes: Vec<Node>) -> Result<(), RepoError>;

    async fn soft_delete(&self, id: NodeId) -> Result<Node, RepoError>;

    async fn restore(&self, id: NodeId) -> Result<Node, RepoError>;

    /// Remove the row together with its soft-deleted descendants. Fails with
    /// `Integrity` while a live child still references it.
    async fn force_delete(&self, id: NodeId) -> Result<Node, RepoError>;
}
