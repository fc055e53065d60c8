//! Forest assembly and the structural invariants every write must keep.

use std::collections::HashMap;

use super::error::TreeError;
use super::node::{MaterializedPath, Node, NodeId, TreeNode};

pub const MAX_TREE_DEPTH: usize = 64;

/// How `build_forest` treats nodes whose parent is not in the input set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanPolicy {
    /// Drop the orphan and its subtree (active-only views hide everything
    /// under an inactive node).
    Prune,
    /// Report the orphan as a malformed tree.
    Reject,
}

/// Assemble a flat node list into a forest ordered by `position` at every level.
pub fn build_forest(nodes: Vec<Node>, orphans: OrphanPolicy) -> Result<Vec<TreeNode>, TreeError> {
    let mut by_id: HashMap<NodeId, Node> = HashMap::with_capacity(nodes.len());
    let mut children: HashMap<Option<NodeId>, Vec<(i32, NodeId)>> = HashMap::new();

    for node in nodes {
        if node.parent_id == Some(node.id) {
            return Err(TreeError::SelfParent { id: node.id });
        }
        if by_id.contains_key(&node.id) {
            return Err(TreeError::DuplicateId { id: node.id });
        }

        children
            .entry(node.parent_id)
            .or_default()
            .push((node.position, node.id));
        by_id.insert(node.id, node);
    }

    if orphans == OrphanPolicy::Reject {
        let mut missing: Vec<(NodeId, NodeId)> = by_id
            .values()
            .filter_map(|node| {
                node.parent_id
                    .filter(|parent| !by_id.contains_key(parent))
                    .map(|parent| (node.id, parent))
            })
            .collect();
        missing.sort_unstable();
        if let Some(&(child, parent)) = missing.first() {
            return Err(TreeError::MissingParent { child, parent });
        }
    }

    for siblings in children.values_mut() {
        siblings.sort_unstable();
    }

    let mut roots = Vec::new();
    if let Some(root_ids) = children.get(&None) {
        for &(_, root_id) in root_ids {
            roots.push(assemble(root_id, 0, &mut by_id, &children)?);
        }
    }

    if orphans == OrphanPolicy::Reject
        && let Some(&id) = by_id.keys().min()
    {
        let parent = by_id
            .get(&id)
            .and_then(|node| node.parent_id)
            .unwrap_or(id);
        return Err(TreeError::CycleDetected {
            node: id,
            candidate_parent: parent,
        });
    }

    Ok(roots)
}

fn assemble(
    id: NodeId,
    depth: usize,
    nodes: &mut HashMap<NodeId, Node>,
    children: &HashMap<Option<NodeId>, Vec<(i32, NodeId)>>,
) -> Result<TreeNode, TreeError> {
    if depth >= MAX_TREE_DEPTH {
        return Err(TreeError::DepthExceeded {
            id,
            max_depth: MAX_TREE_DEPTH,
        });
    }

    let node = nodes
        .remove(&id)
        .ok_or(TreeError::MissingParent { child: id, parent: id })?;
    let mut tree = TreeNode::leaf(node);

    if let Some(child_ids) = children.get(&Some(id)) {
        for &(_, child_id) in child_ids {
            tree.children
                .push(assemble(child_id, depth + 1, nodes, children)?);
        }
    }

    Ok(tree)
}

/// Check the depth and path invariants of `node` against its parent.
pub fn verify_placement(node: &Node, parent: Option<&Node>) -> Result<(), TreeError> {
    if node.parent_id == Some(node.id) {
        return Err(TreeError::SelfParent { id: node.id });
    }

    let expected = expected_path(node.id, parent)?;
    let expected_depth = expected.depth();

    if node.depth != expected_depth {
        return Err(TreeError::DepthMismatch {
            id: node.id,
            depth: node.depth,
            expected: expected_depth,
        });
    }

    let expected = expected.to_string();
    if node.path != expected {
        return Err(TreeError::PathMismatch {
            id: node.id,
            path: node.path.clone(),
            expected,
        });
    }

    Ok(())
}

fn expected_path(id: NodeId, parent: Option<&Node>) -> Result<MaterializedPath, TreeError> {
    match parent {
        None => Ok(MaterializedPath::root(id)),
        Some(parent) => Ok(parent.materialized_path()?.child(id)),
    }
}

/// Reject a move of `node` under `candidate_parent` that would create a cycle.
///
/// `None` moves the node to the root set, which is always acyclic.
pub fn ensure_can_move(node: &Node, candidate_parent: Option<&Node>) -> Result<(), TreeError> {
    let Some(parent) = candidate_parent else {
        return Ok(());
    };

    if parent.id == node.id || node.is_ancestor_of(parent) {
        return Err(TreeError::CycleDetected {
            node: node.id,
            candidate_parent: parent.id,
        });
    }

    if parent.is_deleted() {
        return Err(TreeError::Deleted { id: parent.id });
    }

    Ok(())
}

/// A node may only be deleted once all of its children are deleted.
pub fn ensure_deletable(node: &Node, live_children: usize) -> Result<(), TreeError> {
    if live_children > 0 {
        return Err(TreeError::HasChildren {
            id: node.id,
            children: live_children,
        });
    }
    Ok(())
}

/// Recompute `parent_id`, `depth` and `path` for a subtree moved under `new_parent`.
///
/// `subtree` must contain the moved node and every descendant of it.
pub fn relocate(
    moved: &Node,
    subtree: Vec<Node>,
    new_parent: Option<&Node>,
    position: i32,
) -> Result<Vec<Node>, TreeError> {
    let old_prefix = moved.path.clone();
    let new_path = expected_path(moved.id, new_parent)?.to_string();
    let depth_shift = new_parent.map_or(0, |parent| parent.depth + 1) - moved.depth;

    subtree
        .into_iter()
        .map(|mut node| {
            if node.id == moved.id {
                node.parent_id = new_parent.map(|parent| parent.id);
                node.position = position;
                node.path = new_path.clone();
                node.depth = moved.depth + depth_shift;
                return Ok(node);
            }

            let Some(suffix) = node.path.strip_prefix(old_prefix.as_str()) else {
                return Err(TreeError::PathMismatch {
                    id: node.id,
                    path: node.path.clone(),
                    expected: format!("{old_prefix}/..."),
                });
            };
            node.path = format!("{new_path}{suffix}");
            node.depth += depth_shift;
            Ok(node)
        })
        .collect()
}

/// Assign dense positions `1..=n` following `order`; siblings missing from
/// `order` keep their relative order after the listed ones.
pub fn resequence(mut siblings: Vec<Node>, order: &[NodeId]) -> Vec<Node> {
    let rank = |id: NodeId| order.iter().position(|candidate| *candidate == id);

    siblings.sort_by_key(|node| {
        (
            rank(node.id).unwrap_or(usize::MAX),
            node.position,
            node.id,
        )
    });

    for (index, node) in siblings.iter_mut().enumerate() {
        node.position = index as i32 + 1;
    }

    siblings
}

/// Position for a node appended after `siblings`.
pub fn next_position(siblings: &[Node]) -> i32 {
    siblings.iter().map(|node| node.position).max().unwrap_or(0) + 1
}

/// True when sibling positions are exactly `1..=n`.
pub fn positions_are_dense(siblings: &[Node]) -> bool {
    let mut positions: Vec<i32> = siblings.iter().map(|node| node.position).collect();
    positions.sort_unstable();
    positions
        .iter()
        .enumerate()
        .all(|(index, position)| *position == index as i32 + 1)
}
