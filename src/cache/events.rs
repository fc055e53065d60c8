//! Node mutation events.
//!
//! Every committed write produces exactly one [`NodeMutation`]. The trigger
//! wraps it in a [`MutationEvent`] for ordering and log correlation.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::node::{Node, NodeId};

/// Monotonic epoch for ordering events within this process.
pub type Epoch = u64;

/// A committed change to the node store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeMutation {
    Created {
        node: Node,
    },
    /// Status or content edit. A changed parent is handled as a move.
    Updated {
        node: Node,
        previous: Node,
    },
    Moved {
        node: Node,
        previous: Node,
    },
    Deleted {
        node: Node,
    },
    Restored {
        node: Node,
    },
    ForceDeleted {
        node: Node,
    },
    /// Siblings under `parent_id` got new positions.
    Reordered {
        parent_id: Option<NodeId>,
        nodes: Vec<Node>,
    },
    /// Import or mass edit. `None` means the touched roots are unknown.
    Bulk {
        root_ids: Option<BTreeSet<NodeId>>,
    },
    /// Explicit eviction of node-scoped entries, no store change.
    Forget {
        node_ids: BTreeSet<NodeId>,
    },
}

impl NodeMutation {
    pub fn kind(&self) -> &'static str {
        match self {
            NodeMutation::Created { .. } => "created",
            NodeMutation::Updated { .. } => "updated",
            NodeMutation::Moved { .. } => "moved",
            NodeMutation::Deleted { .. } => "deleted",
            NodeMutation::Restored { .. } => "restored",
            NodeMutation::ForceDeleted { .. } => "force_deleted",
            NodeMutation::Reordered { .. } => "reordered",
            NodeMutation::Bulk { .. } => "bulk",
            NodeMutation::Forget { .. } => "forget",
        }
    }

    /// Ids of the nodes the mutation names directly.
    pub fn node_ids(&self) -> BTreeSet<NodeId> {
        match self {
            NodeMutation::Created { node }
            | NodeMutation::Updated { node, .. }
            | NodeMutation::Moved { node, .. }
            | NodeMutation::Deleted { node }
            | NodeMutation::Restored { node }
            | NodeMutation::ForceDeleted { node } => BTreeSet::from([node.id]),
            NodeMutation::Reordered { nodes, .. } => nodes.iter().map(|node| node.id).collect(),
            NodeMutation::Bulk { .. } => BTreeSet::new(),
            NodeMutation::Forget { node_ids } => node_ids.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MutationEvent {
    pub id: Uuid,
    pub epoch: Epoch,
    pub mutation: NodeMutation,
    pub timestamp: OffsetDateTime,
}

/// Hands out events with unique ids and increasing epochs.
#[derive(Debug, Default)]
pub struct EventSequence {
    epoch_counter: AtomicU64,
}

impl EventSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, mutation: NodeMutation) -> MutationEvent {
        MutationEvent {
            id: Uuid::new_v4(),
            epoch: self.epoch_counter.fetch_add(1, Ordering::SeqCst),
            mutation,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}
