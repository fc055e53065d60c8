//! Cache trigger service.
//!
//! Entry point for the write path: turns a committed mutation into an
//! invalidation scope and hands it to the debounce scheduler. Nothing here
//! can fail the caller's write.

use std::collections::BTreeSet;

use tracing::{debug, info, instrument};

use super::config::CacheConfig;
use super::debounce::{DebounceScheduler, ScheduleReport};
use super::events::{EventSequence, NodeMutation};
use super::notifier::ChangeNotifier;
use crate::domain::node::{Node, NodeId};

/// Publishes node mutations to the invalidation pipeline.
///
/// ```ignore
/// // After a successful move has been committed:
/// trigger.node_moved(previous, moved).await;
/// ```
pub struct CacheTrigger {
    config: CacheConfig,
    notifier: ChangeNotifier,
    scheduler: DebounceScheduler,
    sequence: EventSequence,
}

impl CacheTrigger {
    pub fn new(config: CacheConfig, notifier: ChangeNotifier, scheduler: DebounceScheduler) -> Self {
        Self {
            config,
            notifier,
            scheduler,
            sequence: EventSequence::new(),
        }
    }

    #[instrument(skip_all, fields(kind = mutation.kind()))]
    pub async fn trigger(&self, mutation: NodeMutation) -> ScheduleReport {
        if !self.config.enabled {
            debug!(
                target = "cache::trigger",
                kind = mutation.kind(),
                "Cache trigger skipped: cache disabled"
            );
            return ScheduleReport::default();
        }

        let event = self.sequence.next(mutation);
        let scope = self.notifier.scope_for(&event.mutation).await;
        info!(
            target = "cache::trigger",
            event_id = %event.id,
            event_epoch = event.epoch,
            kind = event.mutation.kind(),
            mode = %scope.mode,
            roots = ?scope.affected_root_ids,
            nodes = ?scope.affected_node_ids,
            "Node mutation published"
        );

        self.scheduler.schedule(&scope, Some(event.id)).await
    }

    pub async fn node_created(&self, node: Node) -> ScheduleReport {
        self.trigger(NodeMutation::Created { node }).await
    }

    pub async fn node_updated(&self, previous: Node, node: Node) -> ScheduleReport {
        self.trigger(NodeMutation::Updated { node, previous }).await
    }

    pub async fn node_moved(&self, previous: Node, node: Node) -> ScheduleReport {
        self.trigger(NodeMutation::Moved { node, previous }).await
    }

    pub async fn node_deleted(&self, node: Node) -> ScheduleReport {
        self.trigger(NodeMutation::Deleted { node }).await
    }

    pub async fn node_restored(&self, node: Node) -> ScheduleReport {
        self.trigger(NodeMutation::Restored { node }).await
    }

    pub async fn node_force_deleted(&self, node: Node) -> ScheduleReport {
        self.trigger(NodeMutation::ForceDeleted { node }).await
    }

    pub async fn siblings_reordered(
        &self,
        parent_id: Option<NodeId>,
        nodes: Vec<Node>,
    ) -> ScheduleReport {
        self.trigger(NodeMutation::Reordered { parent_id, nodes }).await
    }

    pub async fn bulk_changed(&self, root_ids: Option<BTreeSet<NodeId>>) -> ScheduleReport {
        self.trigger(NodeMutation::Bulk { root_ids }).await
    }

    pub async fn forget_nodes(&self, node_ids: BTreeSet<NodeId>) -> ScheduleReport {
        self.trigger(NodeMutation::Forget { node_ids }).await
    }
}
