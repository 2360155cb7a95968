//! In-memory record store for tests and benchmarks.
//!
//! [`MemoryStore`] links relationships into per-node chains the way a record store does:
//! new relationships are prepended, so chains read newest first. Once a node's degree exceeds
//! the dense threshold its chain is split into one chain per (type, direction).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::chain::ChainKey;
use crate::id::{IdGeneratorFactory, MemoryIdGeneratorFactory};
use crate::options::CacheOptions;
use crate::persistence::{
    ChainCursor, ChainHole, CommitOutcome, NodeRecord, PersistenceManager, RelationshipBatch,
    RelationshipRecord, TransactionBatch,
};
use crate::props::PropValue;
use crate::types::{
    CacheError, EntityRef, IdSpace, LabelId, NodeId, PropId, RelId, Result, TypeId,
};

#[derive(Clone, Default)]
struct NodeRow {
    dense: bool,
    degree: usize,
    head: Option<RelId>,
    groups: BTreeMap<ChainKey, RelId>,
    props: Vec<(PropId, PropValue)>,
    labels: Vec<LabelId>,
}

#[derive(Clone)]
struct RelRow {
    record: RelationshipRecord,
    start_next: Option<RelId>,
    end_next: Option<RelId>,
    props: Vec<(PropId, PropValue)>,
}

impl RelRow {
    fn next_for(&self, node: NodeId) -> Option<RelId> {
        if self.record.start == node {
            self.start_next
        } else {
            self.end_next
        }
    }

    fn set_next_for(&mut self, node: NodeId, next: Option<RelId>) {
        if self.record.start == node {
            self.start_next = next;
        } else {
            self.end_next = next;
        }
    }
}

#[derive(Clone, Default)]
struct State {
    nodes: BTreeMap<NodeId, NodeRow>,
    rels: BTreeMap<RelId, RelRow>,
    next_node: u64,
    next_rel: u64,
}

impl State {
    fn node(&self, id: NodeId) -> Result<&NodeRow> {
        self.nodes.get(&id).ok_or(CacheError::RecordNotFound {
            space: IdSpace::Node,
            id: id.0,
        })
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut NodeRow> {
        self.nodes.get_mut(&id).ok_or(CacheError::RecordNotFound {
            space: IdSpace::Node,
            id: id.0,
        })
    }

    fn rel(&self, id: RelId) -> Result<&RelRow> {
        self.rels.get(&id).ok_or(CacheError::RecordNotFound {
            space: IdSpace::Relationship,
            id: id.0,
        })
    }

    fn key_of(record: &RelationshipRecord, node: NodeId) -> Result<ChainKey> {
        let slot = record
            .slot_for(node)
            .ok_or(CacheError::Corruption("relationship not attached to node"))?;
        Ok(ChainKey::new(record.ty, slot))
    }

    fn head(&self, node: NodeId, key: ChainKey) -> Result<Option<RelId>> {
        let row = self.node(node)?;
        Ok(if row.dense {
            row.groups.get(&key).copied()
        } else {
            row.head
        })
    }

    fn set_head(&mut self, node: NodeId, key: ChainKey, head: Option<RelId>) -> Result<()> {
        let row = self.node_mut(node)?;
        if row.dense {
            match head {
                Some(head) => {
                    row.groups.insert(key, head);
                }
                None => {
                    row.groups.remove(&key);
                }
            }
        } else {
            row.head = head;
        }
        Ok(())
    }

    fn link(&mut self, node: NodeId, rel: RelId) -> Result<()> {
        let record = self.rel(rel)?.record;
        let key = Self::key_of(&record, node)?;
        let head = self.head(node, key)?;
        if let Some(row) = self.rels.get_mut(&rel) {
            row.set_next_for(node, head);
        }
        self.set_head(node, key, Some(rel))
    }

    fn unlink(&mut self, node: NodeId, rel: RelId) -> Result<ChainHole> {
        let record = self.rel(rel)?.record;
        let key = Self::key_of(&record, node)?;
        let next = self.rel(rel)?.next_for(node);
        let mut prev: Option<RelId> = None;
        let mut cursor = self.head(node, key)?;
        while let Some(current) = cursor {
            if current == rel {
                break;
            }
            prev = Some(current);
            cursor = self.rel(current)?.next_for(node);
        }
        if cursor.is_none() {
            return Err(CacheError::Corruption("relationship missing from its chain"));
        }
        match prev {
            None => self.set_head(node, key, next)?,
            Some(prev) => {
                if let Some(row) = self.rels.get_mut(&prev) {
                    row.set_next_for(node, next);
                }
            }
        }
        self.node_mut(node)?.degree -= 1;
        Ok(ChainHole { node, rel, next })
    }

    fn walk(&self, node: NodeId, mut cursor: Option<RelId>) -> Result<Vec<RelId>> {
        let mut out = Vec::new();
        while let Some(rel) = cursor {
            out.push(rel);
            cursor = self.rel(rel)?.next_for(node);
        }
        Ok(out)
    }

    fn densify(&mut self, node: NodeId) -> Result<()> {
        let head = self.node(node)?.head;
        let chain = self.walk(node, head)?;
        {
            let row = self.node_mut(node)?;
            row.dense = true;
            row.head = None;
        }
        for rel in chain.into_iter().rev() {
            self.link(node, rel)?;
        }
        Ok(())
    }

    fn endpoints(record: &RelationshipRecord) -> impl Iterator<Item = NodeId> {
        let end = (record.end != record.start).then_some(record.end);
        std::iter::once(record.start).chain(end)
    }

    fn create_relationship(
        &mut self,
        record: RelationshipRecord,
        threshold: usize,
        densified: &mut Vec<NodeId>,
    ) -> Result<()> {
        for node in Self::endpoints(&record) {
            self.node(node)?;
        }
        self.rels.insert(
            record.id,
            RelRow {
                record,
                start_next: None,
                end_next: None,
                props: Vec::new(),
            },
        );
        self.next_rel = self.next_rel.max(record.id.0 + 1);
        for node in Self::endpoints(&record) {
            self.link(node, record.id)?;
            let row = self.node_mut(node)?;
            row.degree += 1;
            if !row.dense && row.degree > threshold {
                self.densify(node)?;
                densified.push(node);
            }
        }
        Ok(())
    }

    fn props_mut(&mut self, entity: EntityRef) -> Result<&mut Vec<(PropId, PropValue)>> {
        match entity {
            EntityRef::Node(id) => Ok(&mut self.node_mut(id)?.props),
            EntityRef::Relationship(id) => self
                .rels
                .get_mut(&id)
                .map(|row| &mut row.props)
                .ok_or(CacheError::RecordNotFound {
                    space: IdSpace::Relationship,
                    id: id.0,
                }),
        }
    }
}

/// In-memory [`PersistenceManager`] with corruption and latency hooks.
pub struct MemoryStore {
    state: Mutex<State>,
    dense_threshold: AtomicUsize,
    node_loads: AtomicUsize,
    chain_reads: AtomicUsize,
    load_delay: Mutex<Option<Duration>>,
}

impl MemoryStore {
    /// Empty store; nodes with more than `dense_threshold` relationships become dense.
    pub fn new(dense_threshold: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            dense_threshold: AtomicUsize::new(dense_threshold),
            node_loads: AtomicUsize::new(0),
            chain_reads: AtomicUsize::new(0),
            load_delay: Mutex::new(None),
        }
    }

    /// Empty store using the dense threshold of `options`.
    pub fn from_options(options: &CacheOptions) -> Self {
        Self::new(options.dense_threshold)
    }

    /// Creates a node directly in the store.
    pub fn add_node(&self) -> NodeId {
        let mut state = self.state.lock();
        let id = NodeId(state.next_node);
        state.next_node += 1;
        state.nodes.insert(id, NodeRow::default());
        id
    }

    /// Creates a relationship directly in the store.
    pub fn add_relationship(&self, start: NodeId, end: NodeId, ty: TypeId) -> Result<RelId> {
        let mut state = self.state.lock();
        let id = RelId(state.next_rel);
        let mut densified = Vec::new();
        state.create_relationship(
            RelationshipRecord { id, ty, start, end },
            self.dense_threshold.load(Ordering::Relaxed),
            &mut densified,
        )?;
        Ok(id)
    }

    /// Appends a property without checking for an existing key; repeated keys model a
    /// corrupted chain.
    pub fn inject_property(&self, entity: EntityRef, key: PropId, value: PropValue) -> Result<()> {
        self.state.lock().props_mut(entity)?.push((key, value));
        Ok(())
    }

    /// Adds a label directly in the store.
    pub fn add_label(&self, node: NodeId, label: LabelId) -> Result<()> {
        let mut state = self.state.lock();
        let row = state.node_mut(node)?;
        if !row.labels.contains(&label) {
            row.labels.push(label);
        }
        Ok(())
    }

    /// Removes a relationship record while leaving it linked into its chains, as a concurrent
    /// deleter would between a reader's page reads.
    pub fn vanish_relationship(&self, rel: RelId) -> bool {
        self.state.lock().rels.remove(&rel).is_some()
    }

    /// Node header.
    pub fn node_record(&self, node: NodeId) -> Option<NodeRecord> {
        self.state.lock().nodes.get(&node).map(|row| NodeRecord {
            id: node,
            dense: row.dense,
        })
    }

    /// Number of relationships attached to `node`.
    pub fn degree(&self, node: NodeId) -> usize {
        self.state
            .lock()
            .nodes
            .get(&node)
            .map_or(0, |row| row.degree)
    }

    /// Number of `load_node` calls served so far.
    pub fn node_loads(&self) -> usize {
        self.node_loads.load(Ordering::SeqCst)
    }

    /// Number of chain pages served so far.
    pub fn chain_reads(&self) -> usize {
        self.chain_reads.load(Ordering::SeqCst)
    }

    /// Makes every `load_node` sleep for `delay`.
    pub fn set_load_delay(&self, delay: Option<Duration>) {
        *self.load_delay.lock() = delay;
    }

    /// Id generators whose high ids continue after the records in this store.
    pub fn id_factory(&self) -> Result<MemoryIdGeneratorFactory> {
        let (nodes, rels) = {
            let state = self.state.lock();
            (state.next_node, state.next_rel)
        };
        let factory = MemoryIdGeneratorFactory::default();
        factory.create(IdSpace::Node, nodes)?;
        factory.create(IdSpace::Relationship, rels)?;
        Ok(factory)
    }
}

impl PersistenceManager for MemoryStore {
    fn load_node(&self, node: NodeId) -> Result<Option<NodeRecord>> {
        self.node_loads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.load_delay.lock();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        Ok(self.node_record(node))
    }

    fn relationship_types(&self, node: NodeId) -> Result<Vec<TypeId>> {
        let state = self.state.lock();
        let mut types: Vec<TypeId> = state.node(node)?.groups.keys().map(|key| key.ty).collect();
        types.dedup();
        Ok(types)
    }

    fn more_relationships(
        &self,
        node: NodeId,
        cursor: ChainCursor,
        grab: usize,
    ) -> Result<RelationshipBatch> {
        self.chain_reads.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        let row = state.node(node)?;
        let mut next = match cursor {
            ChainCursor::Sparse { from } => {
                if row.dense {
                    return Err(CacheError::Corruption("sparse read of a dense node"));
                }
                from.or(row.head)
            }
            ChainCursor::Dense { ty, slot, from } => {
                if !row.dense {
                    return Err(CacheError::Corruption("dense read of a sparse node"));
                }
                from.or_else(|| row.groups.get(&ChainKey::new(ty, slot)).copied())
            }
        };
        let mut records = Vec::new();
        while let Some(rel) = next {
            if records.len() == grab {
                break;
            }
            let row = state.rel(rel)?;
            records.push(row.record);
            next = row.next_for(node);
        }
        Ok(RelationshipBatch { records, next })
    }

    fn load_relationship(&self, rel: RelId) -> Result<Option<RelationshipRecord>> {
        Ok(self.state.lock().rels.get(&rel).map(|row| row.record))
    }

    fn load_properties(&self, entity: EntityRef) -> Result<Vec<(PropId, PropValue)>> {
        let state = self.state.lock();
        match entity {
            EntityRef::Node(id) => Ok(state.node(id)?.props.clone()),
            EntityRef::Relationship(id) => Ok(state.rel(id)?.props.clone()),
        }
    }

    fn load_labels(&self, node: NodeId) -> Result<Vec<LabelId>> {
        Ok(self.state.lock().node(node)?.labels.clone())
    }

    fn set_dense_threshold(&self, degree: usize) {
        self.dense_threshold.store(degree, Ordering::Relaxed);
    }

    fn write_transaction(&self, batch: &TransactionBatch) -> Result<CommitOutcome> {
        let mut guard = self.state.lock();
        // Applied to a copy so a rejected batch leaves the store untouched.
        let mut state = guard.clone();
        let mut outcome = CommitOutcome::default();
        let threshold = self.dense_threshold.load(Ordering::Relaxed);
        for node in &batch.created_nodes {
            state.nodes.insert(*node, NodeRow::default());
            state.next_node = state.next_node.max(node.0 + 1);
        }
        for record in &batch.created_relationships {
            state.create_relationship(*record, threshold, &mut outcome.dense_nodes)?;
        }
        for rel in &batch.deleted_relationships {
            let record = state.rel(*rel)?.record;
            for node in State::endpoints(&record) {
                outcome.holes.push(state.unlink(node, *rel)?);
            }
            state.rels.remove(rel);
        }
        for change in &batch.properties {
            let props = state.props_mut(change.entity)?;
            let existing = props.iter().position(|(key, _)| *key == change.key);
            match (existing, &change.value) {
                (Some(at), Some(value)) => props[at].1 = value.clone(),
                (Some(at), None) => {
                    props.remove(at);
                }
                (None, Some(value)) => props.push((change.key, value.clone())),
                (None, None) => {}
            }
        }
        for change in &batch.labels {
            let row = state.node_mut(change.node)?;
            let at = row.labels.iter().position(|label| *label == change.label);
            match (at, change.added) {
                (None, true) => row.labels.push(change.label),
                (Some(at), false) => {
                    row.labels.remove(at);
                }
                _ => {}
            }
        }
        for node in &batch.deleted_nodes {
            if state.node(*node)?.degree > 0 {
                return Err(CacheError::Invalid("node still has relationships"));
            }
            state.nodes.remove(node);
        }
        *guard = state;
        Ok(outcome)
    }
}
