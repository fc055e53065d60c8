use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::error::TreeError;

pub type NodeId = i64;

const PATH_SEPARATOR: char = '/';

/// A category in the catalog forest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub name: String,
    pub position: i32,
    pub depth: i32,
    pub path: String,
    pub active: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl Node {
    /// Build a root node at the given sibling position.
    pub fn root(id: NodeId, name: impl Into<String>, position: i32) -> Self {
        Self {
            id,
            parent_id: None,
            name: name.into(),
            position,
            depth: 0,
            path: MaterializedPath::root(id).to_string(),
            active: true,
            deleted_at: None,
        }
    }

    /// Build a child of `parent` at the given sibling position.
    pub fn child_of(parent: &Node, id: NodeId, name: impl Into<String>, position: i32) -> Self {
        Self {
            id,
            parent_id: Some(parent.id),
            name: name.into(),
            position,
            depth: parent.depth + 1,
            path: format!("{}{PATH_SEPARATOR}{id}", parent.path),
            active: true,
            deleted_at: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn materialized_path(&self) -> Result<MaterializedPath, TreeError> {
        MaterializedPath::parse(&self.path).map_err(|_| TreeError::MalformedPath {
            id: self.id,
            path: self.path.clone(),
        })
    }

    /// Root ancestor id read from the first path segment.
    pub fn root_ancestor_id(&self) -> Option<NodeId> {
        self.materialized_path().ok().map(|path| path.root_id())
    }

    /// True when `self` sits strictly above `other` in the same tree.
    pub fn is_ancestor_of(&self, other: &Node) -> bool {
        other.path.len() > self.path.len()
            && other.path.starts_with(self.path.as_str())
            && other.path[self.path.len()..].starts_with(PATH_SEPARATOR)
    }
}

/// Parsed `/1/7/42` style path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MaterializedPath {
    segments: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathParseError(pub String);

impl fmt::Display for PathParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid materialized path `{}`", self.0)
    }
}

impl std::error::Error for PathParseError {}

impl MaterializedPath {
    pub fn root(id: NodeId) -> Self {
        Self { segments: vec![id] }
    }

    pub fn parse(raw: &str) -> Result<Self, PathParseError> {
        let Some(body) = raw.strip_prefix(PATH_SEPARATOR) else {
            return Err(PathParseError(raw.to_string()));
        };

        let segments = body
            .split(PATH_SEPARATOR)
            .map(|segment| segment.parse::<NodeId>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| PathParseError(raw.to_string()))?;

        if segments.is_empty() {
            return Err(PathParseError(raw.to_string()));
        }

        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[NodeId] {
        &self.segments
    }

    pub fn root_id(&self) -> NodeId {
        self.segments[0]
    }

    pub fn leaf_id(&self) -> NodeId {
        self.segments[self.segments.len() - 1]
    }

    /// Ids strictly above the leaf, root first.
    pub fn ancestor_ids(&self) -> &[NodeId] {
        &self.segments[..self.segments.len() - 1]
    }

    pub fn depth(&self) -> i32 {
        (self.segments.len() - 1) as i32
    }

    pub fn child(&self, id: NodeId) -> Self {
        let mut segments = self.segments.clone();
        segments.push(id);
        Self { segments }
    }

    /// Prefix that matches every strict descendant (`/1/7/`).
    pub fn descendant_prefix(&self) -> String {
        format!("{self}{PATH_SEPARATOR}")
    }
}

impl fmt::Display for MaterializedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            write!(f, "{PATH_SEPARATOR}{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for MaterializedPath {
    type Err = PathParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A node with its children attached, in position order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    #[serde(flatten)]
    pub node: Node,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn leaf(node: Node) -> Self {
        Self {
            node,
            children: Vec::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.node.id
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(TreeNode::size).sum::<usize>()
    }

    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a TreeNode)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }
}
