use thiserror::Error;

use super::node::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("node `{id}` has malformed path `{path}`")]
    MalformedPath { id: NodeId, path: String },
    #[error("node `{id}` path `{path}` does not match its parent chain (expected `{expected}`)")]
    PathMismatch {
        id: NodeId,
        path: String,
        expected: String,
    },
    #[error("node `{id}` has depth {depth}, expected {expected}")]
    DepthMismatch {
        id: NodeId,
        depth: i32,
        expected: i32,
    },
    #[error("node `{id}` references itself as a parent")]
    SelfParent { id: NodeId },
    #[error("moving node `{node}` under `{candidate_parent}` would create a cycle")]
    CycleDetected {
        node: NodeId,
        candidate_parent: NodeId,
    },
    #[error("node `{id}` still has {children} non-deleted children")]
    HasChildren { id: NodeId, children: usize },
    #[error("node `{child}` references missing parent `{parent}`")]
    MissingParent { child: NodeId, parent: NodeId },
    #[error("path of node `{id}` references missing ancestor `{ancestor}`")]
    BrokenAncestry { id: NodeId, ancestor: NodeId },
    #[error("duplicate node id `{id}` detected")]
    DuplicateId { id: NodeId },
    #[error("node `{id}` exceeds maximum depth {max_depth}")]
    DepthExceeded { id: NodeId, max_depth: usize },
    #[error("node `{id}` uses invalid position `{position}`")]
    InvalidPosition { id: NodeId, position: i32 },
    #[error("node `{id}` is deleted")]
    Deleted { id: NodeId },
}
