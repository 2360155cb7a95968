use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace, warn};

use super::entry::{load_properties, CachedEntity, NodeEntry, RelEntry};
use super::iter::{single, RelationshipIter};
use super::policy::policy_for;
use super::store::{EntityCache, Weighted};
use crate::chain::{ChainKey, LoadState, RelChains, RelationshipLoader};
use crate::id::{IdGenerator, IdGeneratorFactory};
use crate::metrics::{default_metrics, CacheMetrics};
use crate::options::{CacheOptions, CacheType};
use crate::persistence::{
    CacheUpdateListener, ChainHole, CommitOutcome, PersistenceManager, RelationshipRecord,
    TransactionBatch,
};
use crate::props::{
    LoggingObserver, PropValue, PropertyChain, PropertyChainObserver, PropertyChainObservers,
    RateLimitedObserver,
};
use crate::relids::{AcceptAll, RelIdArray, RelationshipFilter};
use crate::tx::{NodeAdds, TxState};
use crate::types::{
    CacheError, Dir, EntityKind, EntityRef, IdSpace, LabelId, NodeId, PropId, RelDir, RelId,
    Result, TypeId,
};

/// Shared cache of nodes and relationships in front of a [`PersistenceManager`].
///
/// One instance is owned by the database and shared by reference between transactions.
/// Each entity cache, each cached entry, the token registries and the id generators are
/// guarded independently; no lock spans two of them.
pub struct CacheManager {
    options: CacheOptions,
    store: Arc<dyn PersistenceManager>,
    loader: RelationshipLoader,
    nodes: EntityCache<NodeEntry>,
    relationships: EntityCache<RelEntry>,
    node_ids: Arc<IdGenerator>,
    rel_ids: Arc<IdGenerator>,
    observers: PropertyChainObservers,
    listeners: RwLock<Vec<Arc<dyn CacheUpdateListener>>>,
    commit: Mutex<()>,
    metrics: Arc<dyn CacheMetrics>,
}

impl CacheManager {
    /// Builds a cache over `store`, opening the node and relationship id generators of `ids`.
    pub fn new(
        options: CacheOptions,
        store: Arc<dyn PersistenceManager>,
        ids: &dyn IdGeneratorFactory,
    ) -> Result<Self> {
        let metrics = options.metrics.clone().unwrap_or_else(default_metrics);
        let node_ids = ids.open(IdSpace::Node)?;
        let rel_ids = ids.open(IdSpace::Relationship)?;
        let observers = PropertyChainObservers::default();
        if options.log_duplicate_properties {
            observers.register(Arc::new(RateLimitedObserver::new(
                LoggingObserver,
                options.duplicate_property_cooldown,
            )));
        }
        let loader = RelationshipLoader::new(
            Arc::clone(&store),
            options.grab_size,
            Arc::clone(&metrics),
        );
        let nodes = EntityCache::new(
            EntityKind::Node,
            policy_for(options.node_cache, EntityKind::Node, &options),
            Arc::clone(&metrics),
        );
        let relationships = EntityCache::new(
            EntityKind::Relationship,
            policy_for(options.relationship_cache, EntityKind::Relationship, &options),
            Arc::clone(&metrics),
        );
        store.set_dense_threshold(options.dense_threshold);
        debug!(
            node_cache = %options.node_cache,
            relationship_cache = %options.relationship_cache,
            grab_size = options.grab_size,
            dense_threshold = options.dense_threshold,
            "cache.open"
        );
        Ok(Self {
            options,
            store,
            loader,
            nodes,
            relationships,
            node_ids,
            rel_ids,
            observers,
            listeners: RwLock::new(Vec::new()),
            commit: Mutex::new(()),
            metrics,
        })
    }

    /// Options the cache was built with.
    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub(crate) fn loader(&self) -> &RelationshipLoader {
        &self.loader
    }

    /// Cached record of `(kind, id)`, loading it on a miss.
    ///
    /// Concurrent callers for the same key share a single store read.
    pub fn get_or_load(&self, kind: EntityKind, id: u64) -> Result<CachedEntity> {
        match kind {
            EntityKind::Node => self.node(NodeId(id)).map(CachedEntity::Node),
            EntityKind::Relationship => self
                .relationship_entry(RelId(id))
                .map(CachedEntity::Relationship),
        }
    }

    /// Cached node entry.
    pub fn node(&self, node: NodeId) -> Result<Arc<NodeEntry>> {
        self.nodes.get_or_load(node.0, || {
            let record = self
                .store
                .load_node(node)?
                .ok_or(CacheError::NotFound(node.into()))?;
            let position = self.loader.initial_position(&record)?;
            trace!(node = node.0, dense = record.dense, "cache.node.load");
            Ok(NodeEntry::new(node, RelChains::new(position)))
        })
    }

    fn relationship_entry(&self, rel: RelId) -> Result<Arc<RelEntry>> {
        self.relationships.get_or_load(rel.0, || {
            let record = self
                .store
                .load_relationship(rel)?
                .ok_or(CacheError::NotFound(rel.into()))?;
            trace!(rel = rel.0, "cache.relationship.load");
            Ok(RelEntry::new(record))
        })
    }

    /// Relationship header as seen by `tx`.
    pub fn relationship(&self, tx: &TxState, rel: RelId) -> Result<RelationshipRecord> {
        if let Some(record) = tx.created_relationship(rel) {
            return Ok(*record);
        }
        if tx.is_relationship_deleted(rel) {
            return Err(CacheError::NotFound(rel.into()));
        }
        Ok(self.relationship_entry(rel)?.record())
    }

    /// Relationship ids of `node` of the given types (all when `None`) in `dir`, as seen by
    /// `tx`.
    pub fn relationships<'a>(
        &'a self,
        tx: &'a TxState,
        node: NodeId,
        types: Option<&[TypeId]>,
        dir: Dir,
    ) -> Result<RelationshipIter<'a>> {
        if tx.is_node_deleted(node) {
            return Err(CacheError::NotFound(node.into()));
        }
        let entry = if tx.is_node_created(node) {
            None
        } else {
            Some(self.node(node)?)
        };
        Ok(RelationshipIter::new(self, tx, node, types, dir, entry))
    }

    /// The only relationship of type `ty` in `dir`, `None` when there is none.
    pub fn single_relationship(
        &self,
        tx: &TxState,
        node: NodeId,
        ty: TypeId,
        dir: Dir,
    ) -> Result<Option<RelId>> {
        let types = std::slice::from_ref(&ty);
        single(node, ty, dir, self.relationships(tx, node, Some(types), dir)?)
    }

    /// Property `key` of `node` as seen by `tx`.
    pub fn node_property(
        &self,
        tx: &TxState,
        node: NodeId,
        key: PropId,
    ) -> Result<Option<PropValue>> {
        let entity = EntityRef::Node(node);
        if tx.is_node_deleted(node) {
            return Err(CacheError::NotFound(entity));
        }
        if let Some(pending) = tx.property(entity, key) {
            return Ok(pending.cloned());
        }
        if tx.is_node_created(node) {
            return Ok(None);
        }
        Ok(self.node_properties(node)?.get(key).cloned())
    }

    /// Committed property chain of `node`, loading and verifying it on first use.
    pub fn node_properties(&self, node: NodeId) -> Result<Arc<PropertyChain>> {
        let entry = self.node(node)?;
        let loaded = entry.cached_properties().is_none();
        let chain = load_properties(
            node.into(),
            &entry.props,
            &entry.load,
            self.store.as_ref(),
            &self.observers,
            self.metrics.as_ref(),
        )?;
        if loaded {
            self.nodes.reweigh(node.0, entry.weight());
        }
        Ok(chain)
    }

    /// Property `key` of `rel` as seen by `tx`.
    pub fn relationship_property(
        &self,
        tx: &TxState,
        rel: RelId,
        key: PropId,
    ) -> Result<Option<PropValue>> {
        let entity = EntityRef::Relationship(rel);
        if tx.is_relationship_deleted(rel) {
            return Err(CacheError::NotFound(entity));
        }
        if let Some(pending) = tx.property(entity, key) {
            return Ok(pending.cloned());
        }
        if tx.created_relationship(rel).is_some() {
            return Ok(None);
        }
        Ok(self.relationship_properties(rel)?.get(key).cloned())
    }

    /// Committed property chain of `rel`.
    pub fn relationship_properties(&self, rel: RelId) -> Result<Arc<PropertyChain>> {
        let entry = self.relationship_entry(rel)?;
        let loaded = entry.cached_properties().is_none();
        let chain = load_properties(
            rel.into(),
            &entry.props,
            &entry.load,
            self.store.as_ref(),
            &self.observers,
            self.metrics.as_ref(),
        )?;
        if loaded {
            self.relationships.reweigh(rel.0, entry.weight());
        }
        Ok(chain)
    }

    /// Sorted labels of `node` as seen by `tx`.
    pub fn node_labels(&self, tx: &TxState, node: NodeId) -> Result<Vec<LabelId>> {
        if tx.is_node_deleted(node) {
            return Err(CacheError::NotFound(node.into()));
        }
        let mut labels = if tx.is_node_created(node) {
            Vec::new()
        } else {
            self.node(node)?.labels(self.store.as_ref())?.to_vec()
        };
        for (label, added) in tx.label_changes(node) {
            match (labels.binary_search(&label), added) {
                (Err(at), true) => labels.insert(at, label),
                (Ok(at), false) => {
                    labels.remove(at);
                }
                _ => {}
            }
        }
        Ok(labels)
    }

    /// Whether `node` carries `label` as seen by `tx`.
    pub fn has_label(&self, tx: &TxState, node: NodeId, label: LabelId) -> Result<bool> {
        if tx.is_node_deleted(node) {
            return Err(CacheError::NotFound(node.into()));
        }
        if let Some((_, added)) = tx.label_changes(node).find(|(l, _)| *l == label) {
            return Ok(added);
        }
        if tx.is_node_created(node) {
            return Ok(false);
        }
        let labels = self.node(node)?.labels(self.store.as_ref())?;
        Ok(labels.binary_search(&label).is_ok())
    }

    /// Drops every cached entry; later reads load from the store again.
    pub fn clear_cache(&self) {
        self.nodes.clear();
        self.relationships.clear();
        debug!("cache.clear");
    }

    /// Switches both caches to `cache_type`, emptying them.
    pub fn apply_cache_type(&self, cache_type: CacheType) {
        self.apply_cache_type_for(EntityKind::Node, cache_type);
        self.apply_cache_type_for(EntityKind::Relationship, cache_type);
    }

    /// Switches the cache of `kind` to `cache_type`, emptying it.
    pub fn apply_cache_type_for(&self, kind: EntityKind, cache_type: CacheType) {
        let policy = policy_for(cache_type, kind, &self.options);
        match kind {
            EntityKind::Node => self.nodes.set_policy(policy),
            EntityKind::Relationship => self.relationships.set_policy(policy),
        }
    }

    /// Active discipline of the cache of `kind`.
    pub fn cache_type(&self, kind: EntityKind) -> CacheType {
        match kind {
            EntityKind::Node => self.nodes.cache_type(),
            EntityKind::Relationship => self.relationships.cache_type(),
        }
    }

    /// Number of cached entries of `kind`.
    pub fn cached_len(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Node => self.nodes.len(),
            EntityKind::Relationship => self.relationships.len(),
        }
    }

    /// Registers a listener for commit-time refreshes.
    pub fn add_listener(&self, listener: Arc<dyn CacheUpdateListener>) {
        self.listeners.write().push(listener);
    }

    /// Registers an additional duplicate property key observer.
    pub fn register_observer(&self, observer: Arc<dyn PropertyChainObserver>) {
        self.observers.register(observer);
    }

    /// Starts a transaction overlay.
    pub fn begin_tx(&self) -> TxState {
        TxState::new(Arc::clone(&self.node_ids), Arc::clone(&self.rel_ids))
    }

    /// Writes `tx` to the store and publishes the result to the cache.
    ///
    /// On failure nothing is published and the ids `tx` allocated are released.
    pub fn commit(&self, mut tx: TxState) -> Result<()> {
        if tx.is_empty() {
            tx.mark_committed();
            return Ok(());
        }
        let batch = tx.to_batch();
        let _commit = self.commit.lock();
        let outcome = self.store.write_transaction(&batch)?;
        tx.mark_committed();
        self.apply_commit(&tx, &batch, &outcome);

        for node in &batch.deleted_nodes {
            if let Err(err) = self.node_ids.free_id(node.0) {
                warn!(node = node.0, error = %err, "cache.commit.free_failed");
            }
        }
        for rel in &batch.deleted_relationships {
            if let Err(err) = self.rel_ids.free_id(rel.0) {
                warn!(rel = rel.0, error = %err, "cache.commit.free_failed");
            }
        }
        Ok(())
    }

    fn apply_commit(&self, tx: &TxState, batch: &TransactionBatch, outcome: &CommitOutcome) {
        let mut refreshed_nodes: FxHashSet<NodeId> = FxHashSet::default();
        let mut refreshed_rels: FxHashSet<RelId> = FxHashSet::default();

        for node in outcome.dense_nodes.iter().chain(&batch.deleted_nodes) {
            if let Some(entry) = self.nodes.get(node.0) {
                entry.invalidate();
                refreshed_nodes.insert(*node);
            }
            self.nodes.remove(node.0);
        }
        for rel in &batch.deleted_relationships {
            self.relationships.remove(rel.0);
            refreshed_rels.insert(*rel);
        }

        let mut holes: FxHashMap<NodeId, Vec<ChainHole>> = FxHashMap::default();
        for hole in &outcome.holes {
            holes.entry(hole.node).or_default().push(*hole);
        }
        let mut touched: FxHashSet<NodeId> = tx.added_nodes().map(|(node, _)| node).collect();
        touched.extend(holes.keys().copied());
        for record in tx.deleted_relationships() {
            touched.insert(record.start);
            touched.insert(record.end);
        }
        for node in touched {
            let Some(entry) = self.nodes.get(node.0) else {
                continue;
            };
            let holes = holes.get(&node).map(Vec::as_slice).unwrap_or_default();
            self.apply_relationships(&entry, tx.added(node), tx.removed(node), holes);
            self.nodes.reweigh(node.0, entry.weight());
            refreshed_nodes.insert(node);
        }

        let mut props: FxHashMap<EntityRef, Vec<(PropId, Option<&PropValue>)>> =
            FxHashMap::default();
        for change in &batch.properties {
            props
                .entry(change.entity)
                .or_default()
                .push((change.key, change.value.as_ref()));
        }
        for (entity, changes) in props {
            match entity {
                EntityRef::Node(node) => {
                    if let Some(entry) = self.nodes.get(node.0) {
                        refresh_props(&entry.props, &entry.load, changes);
                        self.nodes.reweigh(node.0, entry.weight());
                        refreshed_nodes.insert(node);
                    }
                }
                EntityRef::Relationship(rel) => {
                    if let Some(entry) = self.relationships.get(rel.0) {
                        refresh_props(&entry.props, &entry.load, changes);
                        self.relationships.reweigh(rel.0, entry.weight());
                        refreshed_rels.insert(rel);
                    }
                }
            }
        }

        for change in &batch.labels {
            let Some(entry) = self.nodes.get(change.node.0) else {
                continue;
            };
            let _load = entry.load.lock();
            let mut slot = entry.labels.write();
            if let Some(current) = slot.as_ref() {
                let mut labels = current.to_vec();
                match (labels.binary_search(&change.label), change.added) {
                    (Err(at), true) => labels.insert(at, change.label),
                    (Ok(at), false) => {
                        labels.remove(at);
                    }
                    _ => {}
                }
                *slot = Some(labels.into());
            }
            refreshed_nodes.insert(change.node);
        }

        debug!(
            nodes = refreshed_nodes.len(),
            relationships = refreshed_rels.len(),
            dense = outcome.dense_nodes.len(),
            "cache.commit.apply"
        );
        let listeners = self.listeners.read();
        if listeners.is_empty() {
            return;
        }
        for node in &refreshed_nodes {
            for listener in listeners.iter() {
                listener.node_refreshed(*node);
            }
        }
        for rel in &refreshed_rels {
            for listener in listeners.iter() {
                listener.relationship_refreshed(*rel);
            }
        }
    }

    fn apply_relationships(
        &self,
        entry: &NodeEntry,
        adds: Option<&NodeAdds>,
        removes: Option<&FxHashSet<RelId>>,
        holes: &[ChainHole],
    ) {
        let _load = entry.load.lock();
        let current = entry.chains();
        let mut next = (*current).clone();

        if let Some(adds) = adds {
            for (ty, add) in adds {
                next.position_mut().add_type(*ty);
                let filter = CommitFilter {
                    chains: &current,
                    add,
                };
                let merged = RelIdArray::from_diff(
                    current.array(*ty).map(Arc::as_ref),
                    Some(add),
                    removes,
                    &filter,
                );
                next.replace_array(*ty, merged);
            }
        }
        if let Some(removes) = removes.filter(|removes| !removes.is_empty()) {
            for ty in current.types() {
                if adds.is_some_and(|adds| adds.contains_key(&ty)) {
                    continue;
                }
                let merged = RelIdArray::from_diff(
                    current.array(ty).map(Arc::as_ref),
                    None,
                    Some(removes),
                    &AcceptAll,
                );
                next.replace_array(ty, merged);
            }
        }
        for hole in holes {
            next.position_mut().patch_hole(hole.rel, hole.next);
        }
        *entry.chains.write() = Arc::new(next);
    }

    /// Bookkeeping after a node entry published a new chain page.
    pub(crate) fn page_loaded(&self, entry: &NodeEntry, records: &[RelationshipRecord]) {
        for record in records {
            self.relationships
                .insert_if_absent(record.id.0, RelEntry::new(*record));
        }
        self.nodes.reweigh(entry.id().0, entry.weight());
    }
}

/// Accepts the committed ids of one `(type, slot)` only where the cached chain has been read
/// and a reader has not already picked them up from the store.
struct CommitFilter<'a> {
    chains: &'a RelChains,
    add: &'a RelIdArray,
}

impl RelationshipFilter for CommitFilter<'_> {
    fn accept(&self, ty: TypeId, slot: RelDir) -> bool {
        if self.chains.position().state(ChainKey::new(ty, slot)) == LoadState::NotLoaded {
            return false;
        }
        // The store prepends, so a page that saw this commit starts with its newest id.
        let newest = self.add.last_id(slot);
        newest.is_none() || self.chains.first_id(ty, slot) != newest
    }
}

fn refresh_props(
    slot: &RwLock<Option<Arc<PropertyChain>>>,
    load: &Mutex<()>,
    changes: Vec<(PropId, Option<&PropValue>)>,
) {
    let _load = load.lock();
    let mut slot = slot.write();
    if let Some(current) = slot.as_ref() {
        *slot = Some(Arc::new(current.with_changes(changes)));
    }
}
