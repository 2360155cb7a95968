//! Private write overlay of one transaction.
//!
//! A [`TxState`] records creations, deletions, property and label writes without touching
//! the shared cache. Reads through [`crate::cache::CacheManager`] compose it over the cached
//! base; [`crate::cache::CacheManager::commit`] hands it to the store and publishes the
//! result. Dropping an uncommitted state is the rollback: the ids it allocated go back to
//! their generators.

use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::id::IdGenerator;
use crate::persistence::{LabelChange, PropertyChange, RelationshipRecord, TransactionBatch};
use crate::props::PropValue;
use crate::relids::{AcceptAll, RelIdArray};
use crate::types::{
    CacheError, EntityKind, EntityRef, LabelId, NodeId, PropId, RelDir, RelId, Result, TypeId,
};

/// Relationship ids a transaction added to one node, per type.
pub type NodeAdds = BTreeMap<TypeId, RelIdArray>;

/// Uncommitted changes of one transaction.
pub struct TxState {
    node_ids: Arc<IdGenerator>,
    rel_ids: Arc<IdGenerator>,
    created_nodes: Vec<NodeId>,
    deleted_nodes: Vec<NodeId>,
    created_rels: Vec<RelationshipRecord>,
    deleted_rels: Vec<RelationshipRecord>,
    rel_adds: FxHashMap<NodeId, NodeAdds>,
    rel_removes: FxHashMap<NodeId, FxHashSet<RelId>>,
    props: FxHashMap<EntityRef, BTreeMap<PropId, Option<PropValue>>>,
    labels: FxHashMap<NodeId, BTreeMap<LabelId, bool>>,
    committed: bool,
}

impl TxState {
    /// Empty overlay allocating ids from the given generators.
    pub fn new(node_ids: Arc<IdGenerator>, rel_ids: Arc<IdGenerator>) -> Self {
        Self {
            node_ids,
            rel_ids,
            created_nodes: Vec::new(),
            deleted_nodes: Vec::new(),
            created_rels: Vec::new(),
            deleted_rels: Vec::new(),
            rel_adds: FxHashMap::default(),
            rel_removes: FxHashMap::default(),
            props: FxHashMap::default(),
            labels: FxHashMap::default(),
            committed: false,
        }
    }

    /// Creates a node.
    pub fn create_node(&mut self) -> Result<NodeId> {
        let id = NodeId(self.node_ids.next_id()?);
        self.created_nodes.push(id);
        Ok(id)
    }

    /// Creates a relationship `start -> end` of type `ty`.
    pub fn create_relationship(
        &mut self,
        start: NodeId,
        end: NodeId,
        ty: TypeId,
    ) -> Result<RelId> {
        for node in [start, end] {
            if self.is_node_deleted(node) {
                return Err(CacheError::NotFound(node.into()));
            }
        }
        let id = RelId(self.rel_ids.next_id()?);
        let record = RelationshipRecord { id, ty, start, end };
        self.created_rels.push(record);
        if start == end {
            self.add_to(start, ty, id, RelDir::Loop);
        } else {
            self.add_to(start, ty, id, RelDir::Out);
            self.add_to(end, ty, id, RelDir::In);
        }
        Ok(id)
    }

    fn add_to(&mut self, node: NodeId, ty: TypeId, id: RelId, slot: RelDir) {
        self.rel_adds
            .entry(node)
            .or_default()
            .entry(ty)
            .or_insert_with(|| RelIdArray::new(ty))
            .add(id, slot);
    }

    /// Deletes a relationship. One created by this transaction simply disappears.
    pub fn delete_relationship(&mut self, record: &RelationshipRecord) -> Result<()> {
        if let Some(at) = self.created_rels.iter().position(|r| r.id == record.id) {
            self.created_rels.remove(at);
            for node in [record.start, record.end] {
                self.drop_added(node, record.ty, record.id);
            }
            self.props.remove(&EntityRef::Relationship(record.id));
            self.rel_ids.free_id(record.id.0)?;
            return Ok(());
        }
        if self.is_relationship_deleted(record.id) {
            return Err(CacheError::NotFound(record.id.into()));
        }
        self.deleted_rels.push(*record);
        for node in [record.start, record.end] {
            self.rel_removes.entry(node).or_default().insert(record.id);
        }
        self.props.remove(&EntityRef::Relationship(record.id));
        Ok(())
    }

    fn drop_added(&mut self, node: NodeId, ty: TypeId, id: RelId) {
        let Some(adds) = self.rel_adds.get_mut(&node) else {
            return;
        };
        let Some(array) = adds.get(&ty) else {
            return;
        };
        let without: FxHashSet<RelId> = std::iter::once(id).collect();
        match RelIdArray::from_diff(Some(array), None, Some(&without), &AcceptAll) {
            Some(rest) if !rest.is_empty() => {
                adds.insert(ty, rest);
            }
            _ => {
                adds.remove(&ty);
            }
        }
        if adds.is_empty() {
            self.rel_adds.remove(&node);
        }
    }

    /// Deletes a node. Its relationships must be deleted in the same transaction or the
    /// commit fails.
    pub fn delete_node(&mut self, node: NodeId) -> Result<()> {
        if let Some(at) = self.created_nodes.iter().position(|n| *n == node) {
            if self.rel_adds.contains_key(&node) {
                return Err(CacheError::Invalid("node still has relationships"));
            }
            self.created_nodes.remove(at);
            self.props.remove(&EntityRef::Node(node));
            self.labels.remove(&node);
            self.node_ids.free_id(node.0)?;
            return Ok(());
        }
        if self.is_node_deleted(node) {
            return Err(CacheError::NotFound(node.into()));
        }
        self.deleted_nodes.push(node);
        self.props.remove(&EntityRef::Node(node));
        self.labels.remove(&node);
        Ok(())
    }

    /// Sets `key` on `entity`, replacing any previous value.
    pub fn set_property(
        &mut self,
        entity: EntityRef,
        key: PropId,
        value: PropValue,
    ) -> Result<()> {
        self.check_live(entity)?;
        self.props.entry(entity).or_default().insert(key, Some(value));
        Ok(())
    }

    /// Removes `key` from `entity`.
    pub fn remove_property(&mut self, entity: EntityRef, key: PropId) -> Result<()> {
        self.check_live(entity)?;
        self.props.entry(entity).or_default().insert(key, None);
        Ok(())
    }

    /// Adds `label` to `node`.
    pub fn add_label(&mut self, node: NodeId, label: LabelId) -> Result<()> {
        self.check_live(node.into())?;
        self.labels.entry(node).or_default().insert(label, true);
        Ok(())
    }

    /// Removes `label` from `node`.
    pub fn remove_label(&mut self, node: NodeId, label: LabelId) -> Result<()> {
        self.check_live(node.into())?;
        self.labels.entry(node).or_default().insert(label, false);
        Ok(())
    }

    fn check_live(&self, entity: EntityRef) -> Result<()> {
        let deleted = match entity {
            EntityRef::Node(node) => self.is_node_deleted(node),
            EntityRef::Relationship(rel) => self.is_relationship_deleted(rel),
        };
        if deleted {
            Err(CacheError::NotFound(entity))
        } else {
            Ok(())
        }
    }

    /// Whether `node` was created by this transaction.
    pub fn is_node_created(&self, node: NodeId) -> bool {
        self.created_nodes.contains(&node)
    }

    /// Whether `node` was deleted by this transaction.
    pub fn is_node_deleted(&self, node: NodeId) -> bool {
        self.deleted_nodes.contains(&node)
    }

    /// Record of a relationship created by this transaction.
    pub fn created_relationship(&self, rel: RelId) -> Option<&RelationshipRecord> {
        self.created_rels.iter().find(|record| record.id == rel)
    }

    /// Whether `rel` was deleted by this transaction.
    pub fn is_relationship_deleted(&self, rel: RelId) -> bool {
        self.deleted_rels.iter().any(|record| record.id == rel)
    }

    /// Relationship ids this transaction added to `node`.
    pub fn added(&self, node: NodeId) -> Option<&NodeAdds> {
        self.rel_adds.get(&node)
    }

    /// Every node with added relationships.
    pub fn added_nodes(&self) -> impl Iterator<Item = (NodeId, &NodeAdds)> + '_ {
        self.rel_adds.iter().map(|(node, adds)| (*node, adds))
    }

    /// Relationship ids this transaction removed from `node`.
    pub fn removed(&self, node: NodeId) -> Option<&FxHashSet<RelId>> {
        self.rel_removes.get(&node)
    }

    /// Pending write of `key` on `entity`: `Some(None)` is a removal, `None` means untouched.
    pub fn property(&self, entity: EntityRef, key: PropId) -> Option<Option<&PropValue>> {
        self.props
            .get(&entity)
            .and_then(|changes| changes.get(&key))
            .map(Option::as_ref)
    }

    /// Pending property writes of `entity` in key order.
    pub fn property_changes(
        &self,
        entity: EntityRef,
    ) -> impl Iterator<Item = (PropId, Option<&PropValue>)> + '_ {
        self.props
            .get(&entity)
            .into_iter()
            .flat_map(|changes| changes.iter().map(|(key, value)| (*key, value.as_ref())))
    }

    /// Pending label writes of `node` in label order; `true` adds.
    pub fn label_changes(&self, node: NodeId) -> impl Iterator<Item = (LabelId, bool)> + '_ {
        self.labels
            .get(&node)
            .into_iter()
            .flat_map(|changes| changes.iter().map(|(label, added)| (*label, *added)))
    }

    /// True when nothing was written.
    pub fn is_empty(&self) -> bool {
        self.created_nodes.is_empty()
            && self.deleted_nodes.is_empty()
            && self.created_rels.is_empty()
            && self.deleted_rels.is_empty()
            && self.props.is_empty()
            && self.labels.is_empty()
    }

    /// Store-facing form of the overlay.
    pub fn to_batch(&self) -> TransactionBatch {
        let mut entities: Vec<&EntityRef> = self.props.keys().collect();
        entities.sort_by_key(|entity| (entity.kind() == EntityKind::Relationship, entity.raw()));
        let properties = entities
            .into_iter()
            .flat_map(|entity| {
                self.property_changes(*entity).map(|(key, value)| PropertyChange {
                    entity: *entity,
                    key,
                    value: value.cloned(),
                })
            })
            .collect();
        let mut nodes: Vec<&NodeId> = self.labels.keys().collect();
        nodes.sort_unstable();
        let labels = nodes
            .into_iter()
            .flat_map(|node| {
                self.label_changes(*node).map(|(label, added)| LabelChange {
                    node: *node,
                    label,
                    added,
                })
            })
            .collect();
        TransactionBatch {
            created_nodes: self.created_nodes.clone(),
            created_relationships: self.created_rels.clone(),
            deleted_relationships: self.deleted_rels.iter().map(|record| record.id).collect(),
            deleted_nodes: self.deleted_nodes.clone(),
            properties,
            labels,
        }
    }

    /// Relationships deleted by this transaction.
    pub fn deleted_relationships(&self) -> &[RelationshipRecord] {
        &self.deleted_rels
    }

    /// Nodes deleted by this transaction.
    pub fn deleted_nodes(&self) -> &[NodeId] {
        &self.deleted_nodes
    }

    pub(crate) fn mark_committed(&mut self) {
        self.committed = true;
    }
}

impl Drop for TxState {
    fn drop(&mut self) {
        if self.committed || (self.created_nodes.is_empty() && self.created_rels.is_empty()) {
            return;
        }
        debug!(
            nodes = self.created_nodes.len(),
            relationships = self.created_rels.len(),
            "tx.rollback"
        );
        let nodes = self.created_nodes.iter().map(|node| (&self.node_ids, node.0));
        let rels = self.created_rels.iter().map(|record| (&self.rel_ids, record.id.0));
        for (ids, id) in nodes.chain(rels) {
            if let Err(err) = ids.free_id(id) {
                warn!(id, error = %err, "tx.rollback.free_failed");
            }
        }
    }
}
