//! Category write path.
//!
//! Enforces the tree invariants before anything is persisted and reports
//! every committed mutation to the cache trigger. A rejected operation
//! leaves the store untouched and schedules nothing. Once the first write of
//! an operation has landed the trigger fires even if a follow-up write fails.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::application::repos::{NewNodeRecord, NodeStore, NodeWriteRepo, RepoError};
use crate::cache::CacheTrigger;
use crate::domain::error::TreeError;
use crate::domain::node::{Node, NodeId};
use crate::domain::tree::{
    MAX_TREE_DEPTH, ensure_can_move, ensure_deletable, next_position, relocate, resequence,
    verify_placement,
};

#[derive(Debug, Error)]
pub enum CategoryAdminError {
    #[error("{0}")]
    ConstraintViolation(&'static str),
    #[error("category `{0}` not found")]
    NotFound(NodeId),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

#[derive(Debug, Clone)]
pub struct CreateCategoryCommand {
    /// Explicit id, or `None` to let the store assign one.
    pub id: Option<NodeId>,
    pub parent_id: Option<NodeId>,
    pub name: String,
    pub active: bool,
    /// 1-based slot among the siblings; appended when absent.
    pub position: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct UpdateCategoryCommand {
    pub id: NodeId,
    pub name: String,
    pub active: bool,
}

#[derive(Clone)]
pub struct CategoryAdminService {
    reader: Arc<dyn NodeStore>,
    writer: Arc<dyn NodeWriteRepo>,
    cache_trigger: Option<Arc<CacheTrigger>>,
}

impl CategoryAdminService {
    pub fn new(reader: Arc<dyn NodeStore>, writer: Arc<dyn NodeWriteRepo>) -> Self {
        Self {
            reader,
            writer,
            cache_trigger: None,
        }
    }

    /// Set the cache trigger for this service.
    pub fn with_cache_trigger(mut self, trigger: Arc<CacheTrigger>) -> Self {
        self.cache_trigger = Some(trigger);
        self
    }

    /// Set the cache trigger for this service (optional).
    pub fn with_cache_trigger_opt(mut self, trigger: Option<Arc<CacheTrigger>>) -> Self {
        self.cache_trigger = trigger;
        self
    }

    #[instrument(skip(self, command), fields(parent_id = ?command.parent_id))]
    pub async fn create(&self, command: CreateCategoryCommand) -> Result<Node, CategoryAdminError> {
        let name = ensure_non_empty(&command.name, "name")?;
        let parent = match command.parent_id {
            Some(parent_id) => Some(self.live_node(parent_id).await?),
            None => None,
        };
        let depth = parent.as_ref().map_or(0, |parent| parent.depth + 1);
        if depth as usize >= MAX_TREE_DEPTH {
            return Err(TreeError::DepthExceeded {
                id: command.id.unwrap_or_default(),
                max_depth: MAX_TREE_DEPTH,
            }
            .into());
        }

        let siblings = self.reader.get_children(command.parent_id).await?;
        let slot = clamp_position(command.position, siblings.len())?;

        let inserted = self
            .writer
            .insert_node(NewNodeRecord {
                id: command.id,
                parent_id: command.parent_id,
                name,
                position: next_position(&siblings),
                depth,
                path_prefix: parent.as_ref().map(|parent| parent.path.clone()).unwrap_or_default(),
                active: command.active,
            })
            .await?;

        let placed = match verify_placement(&inserted, parent.as_ref()) {
            Ok(()) => self.place_among(siblings, inserted.clone(), slot).await,
            Err(err) => Err(err.into()),
        };
        log_follow_up_failure(&placed, "create", inserted.id);
        if let Some(trigger) = &self.cache_trigger {
            let current = placed.as_ref().unwrap_or(&inserted).clone();
            trigger.node_created(current).await;
        }

        let node = placed?;
        info!(
            target = "application::categories",
            node_id = node.id,
            path = %node.path,
            "Category created"
        );
        Ok(node)
    }

    /// Rename or toggle `active`. Structure is untouched.
    #[instrument(skip(self, command), fields(node_id = command.id))]
    pub async fn update(&self, command: UpdateCategoryCommand) -> Result<Node, CategoryAdminError> {
        let name = ensure_non_empty(&command.name, "name")?;
        let previous = self.live_node(command.id).await?;

        let mut changed = previous.clone();
        changed.name = name;
        changed.active = command.active;
        let node = self.writer.update_node(changed).await?;

        if let Some(trigger) = &self.cache_trigger {
            trigger.node_updated(previous, node.clone()).await;
        }
        Ok(node)
    }

    /// Re-parent `id` (with its whole subtree) under `new_parent_id`.
    #[instrument(skip(self))]
    pub async fn move_node(
        &self,
        id: NodeId,
        new_parent_id: Option<NodeId>,
        position: Option<i32>,
    ) -> Result<Node, CategoryAdminError> {
        let previous = self.live_node(id).await?;
        if previous.parent_id == new_parent_id {
            return self.move_within(previous, position).await;
        }

        let new_parent = match new_parent_id {
            Some(parent_id) => Some(self.live_node(parent_id).await?),
            None => None,
        };
        ensure_can_move(&previous, new_parent.as_ref())?;

        let prefix = previous.materialized_path()?.descendant_prefix();
        let mut subtree = vec![previous.clone()];
        subtree.extend(self.reader.get_subtree(&prefix).await?);

        let target_siblings = self.reader.get_children(new_parent_id).await?;
        let slot = clamp_position(position, target_siblings.len())?;
        let mut relocated = relocate(
            &previous,
            subtree,
            new_parent.as_ref(),
            next_position(&target_siblings),
        )?;
        if let Some(deepest) = relocated.iter().max_by_key(|node| node.depth)
            && deepest.depth as usize >= MAX_TREE_DEPTH
        {
            return Err(TreeError::DepthExceeded {
                id: deepest.id,
                max_depth: MAX_TREE_DEPTH,
            }
            .into());
        }

        let old_siblings: Vec<Node> = self
            .reader
            .get_children(previous.parent_id)
            .await?
            .into_iter()
            .filter(|sibling| sibling.id != id)
            .collect();

        let moved_index = relocated
            .iter()
            .position(|node| node.id == id)
            .ok_or(CategoryAdminError::NotFound(id))?;
        let order = slot_order(&target_siblings, id, slot);
        let mut new_siblings = target_siblings;
        new_siblings.push(relocated[moved_index].clone());
        let mut new_siblings = resequence(new_siblings, &order);
        if let Some(placed) = new_siblings.iter().position(|node| node.id == id) {
            relocated[moved_index] = new_siblings.swap_remove(placed);
        }
        let moved = relocated[moved_index].clone();

        // One batch: subtree, new siblings and old siblings land together.
        let mut batch = relocated;
        batch.extend(new_siblings);
        batch.extend(resequence(old_siblings, &[]));
        self.writer.save_nodes(batch).await?;
        info!(
            target = "application::categories",
            node_id = id,
            from = %previous.path,
            to = %moved.path,
            "Category moved"
        );

        if let Some(trigger) = &self.cache_trigger {
            trigger.node_moved(previous, moved.clone()).await;
        }
        Ok(moved)
    }

    /// Give the children of `parent_id` positions following `order`, which
    /// must name every live child exactly once.
    #[instrument(skip(self, order))]
    pub async fn reorder(
        &self,
        parent_id: Option<NodeId>,
        order: &[NodeId],
    ) -> Result<Vec<Node>, CategoryAdminError> {
        let siblings = self.reader.get_children(parent_id).await?;

        let expected: HashSet<NodeId> = siblings.iter().map(|node| node.id).collect();
        let given: HashSet<NodeId> = order.iter().copied().collect();
        if given.len() != order.len() || given != expected {
            return Err(CategoryAdminError::ConstraintViolation("order"));
        }

        let reordered = resequence(siblings, order);
        self.writer.save_nodes(reordered.clone()).await?;

        if let Some(trigger) = &self.cache_trigger {
            trigger
                .siblings_reordered(parent_id, reordered.clone())
                .await;
        }
        Ok(reordered)
    }

    /// Soft delete. Rejected while the node has live children.
    #[instrument(skip(self))]
    pub async fn soft_delete(&self, id: NodeId) -> Result<Node, CategoryAdminError> {
        let node = self.node(id).await?;
        if node.is_deleted() {
            return Ok(node);
        }

        let children = self.reader.get_children(Some(id)).await?;
        ensure_deletable(&node, children.len())?;

        let deleted = self.writer.soft_delete(id).await?;
        let closed = self.close_gap(node.parent_id).await;
        log_follow_up_failure(&closed, "soft_delete", id);
        if let Some(trigger) = &self.cache_trigger {
            trigger.node_deleted(deleted.clone()).await;
        }

        closed?;
        info!(target = "application::categories", node_id = id, "Category deleted");
        Ok(deleted)
    }

    /// Undo a soft delete, re-appending the node under its (live) parent.
    #[instrument(skip(self))]
    pub async fn restore(&self, id: NodeId) -> Result<Node, CategoryAdminError> {
        let node = self.node(id).await?;
        if !node.is_deleted() {
            return Ok(node);
        }

        let parent = match node.parent_id {
            Some(parent_id) => Some(self.live_node(parent_id).await?),
            None => None,
        };
        let siblings = self.reader.get_children(node.parent_id).await?;
        let placed = relocate(
            &node,
            vec![node.clone()],
            parent.as_ref(),
            next_position(&siblings),
        )?;
        let relocated = placed.first().cloned().unwrap_or_else(|| node.clone());
        self.writer.save_nodes(placed).await?;

        let restored = self.writer.restore(id).await.map_err(CategoryAdminError::from);
        log_follow_up_failure(&restored, "restore", id);
        if let Some(trigger) = &self.cache_trigger {
            let current = restored.as_ref().unwrap_or(&relocated).clone();
            trigger.node_restored(current).await;
        }

        let restored = restored?;
        info!(target = "application::categories", node_id = id, "Category restored");
        Ok(restored)
    }

    /// Remove the row for good. Rejected while the node has live children.
    #[instrument(skip(self))]
    pub async fn force_delete(&self, id: NodeId) -> Result<Node, CategoryAdminError> {
        let node = self.node(id).await?;
        let children = self.reader.get_children(Some(id)).await?;
        ensure_deletable(&node, children.len())?;

        let removed = self.writer.force_delete(id).await?;
        let closed = if node.is_deleted() {
            Ok(())
        } else {
            self.close_gap(node.parent_id).await
        };
        log_follow_up_failure(&closed, "force_delete", id);
        if let Some(trigger) = &self.cache_trigger {
            trigger.node_force_deleted(removed.clone()).await;
        }

        closed?;
        info!(target = "application::categories", node_id = id, "Category force deleted");
        Ok(removed)
    }

    /// Evict the cached breadcrumbs/ancestors/descendants of the given nodes.
    pub async fn forget_nodes(&self, node_ids: BTreeSet<NodeId>) {
        if let Some(trigger) = &self.cache_trigger {
            trigger.forget_nodes(node_ids).await;
        }
    }

    /// Report an out-of-band mass edit (imports, SQL fixes). `None` when the
    /// touched roots are unknown.
    pub async fn bulk_changed(&self, root_ids: Option<BTreeSet<NodeId>>) {
        if let Some(trigger) = &self.cache_trigger {
            trigger.bulk_changed(root_ids).await;
        }
    }

    async fn move_within(
        &self,
        node: Node,
        position: Option<i32>,
    ) -> Result<Node, CategoryAdminError> {
        let siblings: Vec<Node> = self
            .reader
            .get_children(node.parent_id)
            .await?
            .into_iter()
            .filter(|sibling| sibling.id != node.id)
            .collect();
        let slot = clamp_position(position, siblings.len())?;
        let order = slot_order(&siblings, node.id, slot);

        let reordered = self.reorder(node.parent_id, &order).await?;
        reordered
            .into_iter()
            .find(|candidate| candidate.id == node.id)
            .ok_or(CategoryAdminError::NotFound(node.id))
    }

    /// Move `node` (already stored last among `siblings`) into `slot`.
    async fn place_among(
        &self,
        siblings: Vec<Node>,
        node: Node,
        slot: Option<usize>,
    ) -> Result<Node, CategoryAdminError> {
        let Some(slot) = slot.filter(|slot| *slot < siblings.len()) else {
            return Ok(node);
        };

        let order = slot_order(&siblings, node.id, Some(slot));
        let mut all = siblings;
        all.push(node.clone());
        let placed = resequence(all, &order);
        self.writer.save_nodes(placed.clone()).await?;

        placed
            .into_iter()
            .find(|candidate| candidate.id == node.id)
            .ok_or(CategoryAdminError::NotFound(node.id))
    }

    /// Re-densify positions after a child of `parent_id` went away.
    async fn close_gap(&self, parent_id: Option<NodeId>) -> Result<(), CategoryAdminError> {
        let siblings = self.reader.get_children(parent_id).await?;
        let before: Vec<(NodeId, i32)> = siblings
            .iter()
            .map(|node| (node.id, node.position))
            .collect();
        let resequenced = resequence(siblings, &[]);
        let changed: Vec<Node> = resequenced
            .into_iter()
            .filter(|node| !before.contains(&(node.id, node.position)))
            .collect();
        if !changed.is_empty() {
            self.writer.save_nodes(changed).await?;
        }
        Ok(())
    }

    async fn node(&self, id: NodeId) -> Result<Node, CategoryAdminError> {
        self.reader
            .get_by_id(id)
            .await?
            .ok_or(CategoryAdminError::NotFound(id))
    }

    async fn live_node(&self, id: NodeId) -> Result<Node, CategoryAdminError> {
        let node = self.node(id).await?;
        if node.is_deleted() {
            return Err(TreeError::Deleted { id }.into());
        }
        Ok(node)
    }
}

fn log_follow_up_failure<T>(
    result: &Result<T, CategoryAdminError>,
    operation: &'static str,
    node_id: NodeId,
) {
    if let Err(err) = result {
        warn!(
            target = "application::categories",
            operation,
            node_id,
            error = %err,
            "Follow-up write failed after commit; invalidating anyway"
        );
    }
}

fn ensure_non_empty(value: &str, field: &'static str) -> Result<String, CategoryAdminError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CategoryAdminError::ConstraintViolation(field));
    }
    Ok(trimmed.to_string())
}

/// Zero-based slot for a 1-based requested position among `len` siblings.
/// `None` appends.
fn clamp_position(position: Option<i32>, len: usize) -> Result<Option<usize>, CategoryAdminError> {
    match position {
        None => Ok(None),
        Some(position) if position < 1 => Err(CategoryAdminError::ConstraintViolation("position")),
        Some(position) => Ok(Some((position as usize - 1).min(len))),
    }
}

/// Sibling ids in position order with `id` inserted at `slot`.
fn slot_order(siblings: &[Node], id: NodeId, slot: Option<usize>) -> Vec<NodeId> {
    let mut ordered: Vec<&Node> = siblings.iter().collect();
    ordered.sort_by_key(|node| (node.position, node.id));
    let mut order: Vec<NodeId> = ordered.into_iter().map(|node| node.id).collect();
    let slot = slot.unwrap_or(order.len()).min(order.len());
    order.insert(slot, id);
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::memory::MemoryNodeStore;

    fn service() -> (CategoryAdminService, Arc<MemoryNodeStore>) {
        let store = Arc::new(MemoryNodeStore::new());
        (CategoryAdminService::new(store.clone(), store.clone()), store)
    }

    fn create(id: NodeId, parent_id: Option<NodeId>, name: &str) -> CreateCategoryCommand {
        CreateCategoryCommand {
            id: Some(id),
            parent_id,
            name: name.to_string(),
            active: true,
            position: None,
        }
    }

    async fn positions(store: &MemoryNodeStore, parent: Option<NodeId>) -> Vec<(NodeId, i32)> {
        store
            .get_children(parent)
            .await
            .expect("children")
            .into_iter()
            .map(|node| (node.id, node.position))
            .collect()
    }

    #[tokio::test]
    async fn create_appends_with_dense_positions() {
        let (service, store) = service();
        service.create(create(1, None, "Electronics")).await.expect("root");
        service.create(create(2, Some(1), "Phones")).await.expect("child");
        let laptops = service
            .create(CreateCategoryCommand {
                position: Some(1),
                ..create(4, Some(1), "Laptops")
            })
            .await
            .expect("child at front");

        assert_eq!(laptops.position, 1);
        assert_eq!(laptops.path, "/1/4");
        assert_eq!(positions(&store, Some(1)).await, vec![(4, 1), (2, 2)]);
    }

    #[tokio::test]
    async fn create_rejects_blank_names_and_deleted_parents() {
        let (service, _) = service();
        service.create(create(1, None, "Electronics")).await.expect("root");

        assert!(matches!(
            service.create(create(2, Some(1), "   ")).await,
            Err(CategoryAdminError::ConstraintViolation("name"))
        ));

        service.soft_delete(1).await.expect("delete");
        assert!(matches!(
            service.create(create(2, Some(1), "Phones")).await,
            Err(CategoryAdminError::Tree(TreeError::Deleted { id: 1 }))
        ));
    }

    #[tokio::test]
    async fn move_rewrites_subtree_paths() {
        let (service, store) = service();
        service.create(create(1, None, "Electronics")).await.expect("root");
        service.create(create(2, Some(1), "Phones")).await.expect("child");
        service.create(create(5, Some(2), "Cases")).await.expect("grandchild");
        service.create(create(3, None, "Books")).await.expect("root 3");

        let moved = service.move_node(2, Some(3), None).await.expect("move");

        assert_eq!(moved.path, "/3/2");
        let cases = store.get_by_id(5).await.expect("lookup").expect("cases");
        assert_eq!(cases.path, "/3/2/5");
        assert_eq!(cases.depth, 2);
        assert!(store.get_children(Some(1)).await.expect("children").is_empty());
    }

    #[tokio::test]
    async fn move_carries_soft_deleted_descendants() {
        let (service, store) = service();
        service.create(create(1, None, "Electronics")).await.expect("root");
        service.create(create(2, Some(1), "Phones")).await.expect("child");
        service.create(create(5, Some(2), "Cases")).await.expect("grandchild");
        service.create(create(3, None, "Books")).await.expect("root 3");
        service.soft_delete(5).await.expect("delete cases");

        service.move_node(2, Some(3), None).await.expect("move");

        let cases = store.get_by_id(5).await.expect("lookup").expect("cases");
        assert!(cases.is_deleted());
        assert_eq!(cases.path, "/3/2/5");

        let restored = service.restore(5).await.expect("restore");
        assert_eq!(restored.path, "/3/2/5");
        assert_eq!(restored.root_ancestor_id(), Some(3));
    }

    #[tokio::test]
    async fn move_under_deleted_parent_is_rejected() {
        let (service, _) = service();
        service.create(create(1, None, "Electronics")).await.expect("root");
        service.create(create(3, None, "Books")).await.expect("root 3");
        service.soft_delete(3).await.expect("delete");

        assert!(matches!(
            service.move_node(1, Some(3), None).await,
            Err(CategoryAdminError::Tree(TreeError::Deleted { id: 3 }))
        ));
    }

    #[tokio::test]
    async fn move_places_node_at_requested_slot() {
        let (service, store) = service();
        service.create(create(1, None, "Electronics")).await.expect("root");
        service.create(create(2, Some(1), "Phones")).await.expect("a");
        service.create(create(4, Some(1), "Laptops")).await.expect("b");
        service.create(create(3, None, "Books")).await.expect("root 3");

        let moved = service.move_node(3, Some(1), Some(2)).await.expect("move");

        assert_eq!(moved.position, 2);
        assert_eq!(moved.path, "/1/3");
        assert_eq!(
            positions(&store, Some(1)).await,
            vec![(2, 1), (3, 2), (4, 3)]
        );
        assert_eq!(positions(&store, None).await, vec![(1, 1)]);
    }

    #[tokio::test]
    async fn move_under_own_descendant_is_rejected() {
        let (service, store) = service();
        service.create(create(1, None, "Electronics")).await.expect("root");
        service.create(create(2, Some(1), "Phones")).await.expect("child");
        service.create(create(5, Some(2), "Cases")).await.expect("grandchild");

        let err = service.move_node(1, Some(5), None).await.expect_err("cycle");
        assert!(matches!(
            err,
            CategoryAdminError::Tree(TreeError::CycleDetected {
                node: 1,
                candidate_parent: 5
            })
        ));
        let root = store.get_by_id(1).await.expect("lookup").expect("root");
        assert!(root.is_root());
    }

    #[tokio::test]
    async fn moving_to_the_root_set_closes_the_gap() {
        let (service, store) = service();
        service.create(create(1, None, "Electronics")).await.expect("root");
        service.create(create(2, Some(1), "Phones")).await.expect("a");
        service.create(create(4, Some(1), "Laptops")).await.expect("b");

        let moved = service.move_node(2, None, None).await.expect("move");

        assert_eq!(moved.path, "/2");
        assert_eq!(moved.depth, 0);
        assert_eq!(moved.position, 2);
        assert_eq!(positions(&store, Some(1)).await, vec![(4, 1)]);
    }

    #[tokio::test]
    async fn reorder_requires_exact_permutation() {
        let (service, store) = service();
        service.create(create(1, None, "Electronics")).await.expect("root");
        service.create(create(2, Some(1), "Phones")).await.expect("a");
        service.create(create(4, Some(1), "Laptops")).await.expect("b");

        assert!(matches!(
            service.reorder(Some(1), &[2]).await,
            Err(CategoryAdminError::ConstraintViolation("order"))
        ));
        assert!(matches!(
            service.reorder(Some(1), &[2, 2]).await,
            Err(CategoryAdminError::ConstraintViolation("order"))
        ));

        service.reorder(Some(1), &[4, 2]).await.expect("reorder");
        assert_eq!(positions(&store, Some(1)).await, vec![(4, 1), (2, 2)]);
    }

    #[tokio::test]
    async fn move_within_parent_reorders() {
        let (service, store) = service();
        service.create(create(1, None, "Electronics")).await.expect("root");
        service.create(create(2, Some(1), "Phones")).await.expect("a");
        service.create(create(4, Some(1), "Laptops")).await.expect("b");
        service.create(create(6, Some(1), "Audio")).await.expect("c");

        let moved = service.move_node(6, Some(1), Some(1)).await.expect("move");

        assert_eq!(moved.position, 1);
        assert_eq!(
            positions(&store, Some(1)).await,
            vec![(6, 1), (2, 2), (4, 3)]
        );
    }

    #[tokio::test]
    async fn delete_with_live_children_is_rejected() {
        let (service, store) = service();
        service.create(create(1, None, "Electronics")).await.expect("root");
        service.create(create(2, Some(1), "Phones")).await.expect("child");

        let err = service.soft_delete(1).await.expect_err("has children");
        assert!(matches!(
            err,
            CategoryAdminError::Tree(TreeError::HasChildren { id: 1, children: 1 })
        ));
        assert!(matches!(
            service.force_delete(1).await,
            Err(CategoryAdminError::Tree(TreeError::HasChildren { .. }))
        ));
        assert!(!store.get_by_id(1).await.expect("lookup").expect("root").is_deleted());
    }

    #[tokio::test]
    async fn delete_and_restore_keep_positions_dense() {
        let (service, store) = service();
        service.create(create(1, None, "Electronics")).await.expect("root");
        service.create(create(2, Some(1), "Phones")).await.expect("a");
        service.create(create(4, Some(1), "Laptops")).await.expect("b");

        service.soft_delete(2).await.expect("delete");
        assert_eq!(positions(&store, Some(1)).await, vec![(4, 1)]);

        let restored = service.restore(2).await.expect("restore");
        assert!(!restored.is_deleted());
        assert_eq!(positions(&store, Some(1)).await, vec![(4, 1), (2, 2)]);
    }

    #[tokio::test]
    async fn restore_under_deleted_parent_is_rejected() {
        let (service, _) = service();
        service.create(create(1, None, "Electronics")).await.expect("root");
        service.create(create(2, Some(1), "Phones")).await.expect("child");
        service.soft_delete(2).await.expect("delete child");
        service.soft_delete(1).await.expect("delete root");

        assert!(matches!(
            service.restore(2).await,
            Err(CategoryAdminError::Tree(TreeError::Deleted { id: 1 }))
        ));
    }
}
