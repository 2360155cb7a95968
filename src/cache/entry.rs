//! Cached node and relationship records.
//!
//! Every mutable part of an entry sits behind its own `RwLock<Arc<..>>` and is replaced, never
//! edited: readers clone the `Arc` and keep a consistent snapshot for as long as they need it.
//! The per-entry `load` mutex serializes store reads against commit application so a page read
//! before a commit and one read after it cannot both be published.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::store::Weighted;
use crate::chain::{ChainKey, RelChains, RelationshipLoader};
use crate::metrics::CacheMetrics;
use crate::persistence::{PersistenceManager, RelationshipRecord};
use crate::props::{PropertyChain, PropertyChainObserver};
use crate::types::{CacheError, EntityRef, LabelId, NodeId, Result};

/// Outcome of asking a node entry for more relationships.
#[derive(Debug)]
pub(crate) enum LoadMore {
    /// A new page was published; these are its records.
    Loaded(Vec<RelationshipRecord>),
    /// Someone else published a newer snapshot first; re-read it.
    Refreshed,
    /// The requested chains are fully loaded.
    Exhausted,
    /// The entry was invalidated; fetch a fresh one from the cache.
    Stale,
}

/// Cached node.
pub struct NodeEntry {
    id: NodeId,
    dense: bool,
    stale: AtomicBool,
    pub(crate) load: Mutex<()>,
    pub(crate) chains: RwLock<Arc<RelChains>>,
    pub(crate) props: RwLock<Option<Arc<PropertyChain>>>,
    pub(crate) labels: RwLock<Option<Arc<[LabelId]>>>,
}

impl NodeEntry {
    pub(crate) fn new(id: NodeId, chains: RelChains) -> Self {
        Self {
            id,
            dense: chains.position().is_dense(),
            stale: AtomicBool::new(false),
            load: Mutex::new(()),
            chains: RwLock::new(Arc::new(chains)),
            props: RwLock::new(None),
            labels: RwLock::new(None),
        }
    }

    /// Node id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Whether relationships are loaded per (type, direction).
    pub fn is_dense(&self) -> bool {
        self.dense
    }

    /// Current relationship snapshot.
    pub fn chains(&self) -> Arc<RelChains> {
        Arc::clone(&self.chains.read())
    }

    /// Property chain, if it has been loaded.
    pub fn cached_properties(&self) -> Option<Arc<PropertyChain>> {
        self.props.read().clone()
    }

    /// Sorted labels, if they have been loaded.
    pub fn cached_labels(&self) -> Option<Arc<[LabelId]>> {
        self.labels.read().clone()
    }

    /// True once the entry was dropped from the cache by a commit.
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Marks the entry invalid; later loads report [`LoadMore::Stale`].
    pub(crate) fn invalidate(&self) {
        let _load = self.load.lock();
        self.stale.store(true, Ordering::Release);
    }

    /// Reads the next page of the chains in `keys`, starting from the snapshot `seen`.
    pub(crate) fn load_more(
        &self,
        seen: &Arc<RelChains>,
        keys: &[ChainKey],
        loader: &RelationshipLoader,
    ) -> Result<LoadMore> {
        let _load = self.load.lock();
        if self.is_stale() {
            return Ok(LoadMore::Stale);
        }
        let current = self.chains();
        if !Arc::ptr_eq(&current, seen) {
            return Ok(LoadMore::Refreshed);
        }
        match loader.load_more(self.id, &current, keys)? {
            Some(chunk) => {
                *self.chains.write() = Arc::new(chunk.chains);
                Ok(LoadMore::Loaded(chunk.records))
            }
            None => Ok(LoadMore::Exhausted),
        }
    }

    /// Labels, loading them on first use.
    pub(crate) fn labels(&self, store: &dyn PersistenceManager) -> Result<Arc<[LabelId]>> {
        if let Some(labels) = self.cached_labels() {
            return Ok(labels);
        }
        let _load = self.load.lock();
        if let Some(labels) = self.cached_labels() {
            return Ok(labels);
        }
        let mut labels = store
            .load_labels(self.id)
            .map_err(|err| vanished(err, self.id.into()))?;
        labels.sort_unstable();
        labels.dedup();
        let labels: Arc<[LabelId]> = labels.into();
        *self.labels.write() = Some(Arc::clone(&labels));
        Ok(labels)
    }
}

impl Weighted for NodeEntry {
    fn weight(&self) -> usize {
        let props = self
            .props
            .read()
            .as_ref()
            .map_or(0, |chain| chain.size_in_bytes());
        let labels = self.labels.read().as_ref().map_or(0, |labels| labels.len() * 4);
        96 + self.chains.read().size_in_bytes() + props + labels
    }
}

/// Cached relationship.
pub struct RelEntry {
    record: RelationshipRecord,
    pub(crate) load: Mutex<()>,
    pub(crate) props: RwLock<Option<Arc<PropertyChain>>>,
}

impl RelEntry {
    pub(crate) fn new(record: RelationshipRecord) -> Self {
        Self {
            record,
            load: Mutex::new(()),
            props: RwLock::new(None),
        }
    }

    /// Relationship header.
    pub fn record(&self) -> RelationshipRecord {
        self.record
    }

    /// Property chain, if it has been loaded.
    pub fn cached_properties(&self) -> Option<Arc<PropertyChain>> {
        self.props.read().clone()
    }
}

impl Weighted for RelEntry {
    fn weight(&self) -> usize {
        64 + self
            .props
            .read()
            .as_ref()
            .map_or(0, |chain| chain.size_in_bytes())
    }
}

/// A cached node or relationship.
#[derive(Clone)]
pub enum CachedEntity {
    /// Node entry.
    Node(Arc<NodeEntry>),
    /// Relationship entry.
    Relationship(Arc<RelEntry>),
}

impl CachedEntity {
    /// Reference to the cached entity.
    pub fn entity(&self) -> EntityRef {
        match self {
            CachedEntity::Node(entry) => EntityRef::Node(entry.id()),
            CachedEntity::Relationship(entry) => EntityRef::Relationship(entry.record().id),
        }
    }
}

/// Property chain in `slot`, loading, sorting and verifying it on first use.
pub(crate) fn load_properties(
    entity: EntityRef,
    slot: &RwLock<Option<Arc<PropertyChain>>>,
    load: &Mutex<()>,
    store: &dyn PersistenceManager,
    observer: &dyn PropertyChainObserver,
    metrics: &dyn CacheMetrics,
) -> Result<Arc<PropertyChain>> {
    if let Some(chain) = slot.read().clone() {
        return Ok(chain);
    }
    let _load = load.lock();
    if let Some(chain) = slot.read().clone() {
        return Ok(chain);
    }
    let raw = store
        .load_properties(entity)
        .map_err(|err| vanished(err, entity))?;
    let (chain, duplicates) = PropertyChain::from_unsorted(entity, raw, observer);
    for _ in 0..duplicates {
        metrics.duplicate_property();
    }
    let chain = Arc::new(chain);
    *slot.write() = Some(Arc::clone(&chain));
    Ok(chain)
}

/// Maps a missing record to the typed concurrent-deletion condition.
pub(crate) fn vanished(err: CacheError, entity: EntityRef) -> CacheError {
    match err {
        CacheError::RecordNotFound { .. } => CacheError::ConcurrentlyDeleted(entity),
        other => other,
    }
}
