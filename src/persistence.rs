//! Collaborator contracts between the cache core and the record store.
//!
//! The cache never reads record files itself. Everything it needs from the store goes through
//! [`PersistenceManager`], and committed changes flow back out through
//! [`CacheUpdateListener`].

use crate::props::PropValue;
use crate::types::{EntityRef, LabelId, NodeId, PropId, RelDir, RelId, Result, TypeId};

/// Node record header as seen by the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeRecord {
    /// Node id.
    pub id: NodeId,
    /// Whether the store keeps this node's relationships in per-(type, direction) chains.
    pub dense: bool,
}

/// Relationship record header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RelationshipRecord {
    /// Relationship id.
    pub id: RelId,
    /// Relationship type.
    pub ty: TypeId,
    /// Start node.
    pub start: NodeId,
    /// End node.
    pub end: NodeId,
}

impl RelationshipRecord {
    /// Slot this relationship occupies in `node`'s chain.
    pub fn slot_for(&self, node: NodeId) -> Option<RelDir> {
        RelDir::of(node, self.start, self.end)
    }

    /// The endpoint that is not `node`; `node` itself for loops.
    pub fn other_node(&self, node: NodeId) -> NodeId {
        if self.start == node {
            self.end
        } else {
            self.start
        }
    }
}

/// Resume point handed to [`PersistenceManager::more_relationships`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainCursor {
    /// The single chain of a sparse node; `from: None` starts at the chain head.
    Sparse {
        /// Next unread record.
        from: Option<RelId>,
    },
    /// One `(type, slot)` chain of a dense node.
    Dense {
        /// Relationship type of the chain.
        ty: TypeId,
        /// Direction slot of the chain.
        slot: RelDir,
        /// Next unread record.
        from: Option<RelId>,
    },
}

/// One page of a relationship chain.
#[derive(Clone, Debug, Default)]
pub struct RelationshipBatch {
    /// Records in chain order.
    pub records: Vec<RelationshipRecord>,
    /// First record not included in this batch, `None` once the chain end was reached.
    pub next: Option<RelId>,
}

/// Handle of the transaction bound to the calling thread, if the store tracks one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReadTransaction(pub u64);

/// A property set (`Some`) or removal (`None`).
#[derive(Clone, Debug, PartialEq)]
pub struct PropertyChange {
    /// Owner of the property.
    pub entity: EntityRef,
    /// Property key.
    pub key: PropId,
    /// New value, `None` for a removal.
    pub value: Option<PropValue>,
}

/// Label added to (`added == true`) or removed from a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LabelChange {
    /// Node being relabelled.
    pub node: NodeId,
    /// Label token.
    pub label: LabelId,
    /// Whether the label is added.
    pub added: bool,
}

/// Everything one transaction writes, in the order the store should apply it.
#[derive(Clone, Debug, Default)]
pub struct TransactionBatch {
    /// Nodes created by the transaction.
    pub created_nodes: Vec<NodeId>,
    /// Relationships created, in creation order.
    pub created_relationships: Vec<RelationshipRecord>,
    /// Relationships deleted.
    pub deleted_relationships: Vec<RelId>,
    /// Nodes deleted; their relationships are listed in `deleted_relationships`.
    pub deleted_nodes: Vec<NodeId>,
    /// Property writes.
    pub properties: Vec<PropertyChange>,
    /// Label writes.
    pub labels: Vec<LabelChange>,
}

impl TransactionBatch {
    /// True when the batch writes nothing.
    pub fn is_empty(&self) -> bool {
        self.created_nodes.is_empty()
            && self.created_relationships.is_empty()
            && self.deleted_relationships.is_empty()
            && self.deleted_nodes.is_empty()
            && self.properties.is_empty()
            && self.labels.is_empty()
    }
}

/// A deleted relationship that was linked into `node`'s chain at the time of the commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainHole {
    /// Chain owner.
    pub node: NodeId,
    /// Deleted relationship.
    pub rel: RelId,
    /// Record that followed `rel` in the chain, `None` when it was the last one.
    pub next: Option<RelId>,
}

/// What the store reports back after durably applying a [`TransactionBatch`].
#[derive(Clone, Debug, Default)]
pub struct CommitOutcome {
    /// Nodes whose relationship layout switched to dense while applying the batch.
    pub dense_nodes: Vec<NodeId>,
    /// Chain links removed by relationship deletions.
    pub holes: Vec<ChainHole>,
}

/// Record store as seen by the cache core.
pub trait PersistenceManager: Send + Sync {
    /// Node header, `None` when the node does not exist.
    fn load_node(&self, node: NodeId) -> Result<Option<NodeRecord>>;

    /// Relationship types that have a chain on a dense node.
    fn relationship_types(&self, node: NodeId) -> Result<Vec<TypeId>>;

    /// Reads at most `grab` records of a chain starting at `cursor`.
    ///
    /// A record linked into the chain that no longer exists is reported as
    /// [`crate::CacheError::RecordNotFound`].
    fn more_relationships(
        &self,
        node: NodeId,
        cursor: ChainCursor,
        grab: usize,
    ) -> Result<RelationshipBatch>;

    /// Relationship header, `None` when it does not exist.
    fn load_relationship(&self, rel: RelId) -> Result<Option<RelationshipRecord>>;

    /// Property chain of an entity in store order.
    fn load_properties(&self, entity: EntityRef) -> Result<Vec<(PropId, PropValue)>>;

    /// Labels of a node in store order.
    fn load_labels(&self, node: NodeId) -> Result<Vec<LabelId>>;

    /// Degree above which later writes lay a node out as per-(type, direction) chains.
    ///
    /// Nodes already laid out keep their layout. Stores with a fixed threshold ignore this.
    fn set_dense_threshold(&self, _degree: usize) {}

    /// Durably applies one transaction.
    fn write_transaction(&self, batch: &TransactionBatch) -> Result<CommitOutcome>;

    /// Transaction bound to the calling thread.
    fn current_transaction_for_reading(&self) -> Option<ReadTransaction> {
        None
    }
}

/// Receives notifications when committed data replaced a cached record.
pub trait CacheUpdateListener: Send + Sync {
    /// A cached node was refreshed by a commit.
    fn node_refreshed(&self, node: NodeId);

    /// A cached relationship was refreshed or dropped by a commit.
    fn relationship_refreshed(&self, _rel: RelId) {}
}
