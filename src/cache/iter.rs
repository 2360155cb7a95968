//! Relationship iteration over the cached base plus a transaction's overlay.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use super::entry::{vanished, LoadMore, NodeEntry};
use super::CacheManager;
use crate::chain::{ChainKey, ChainKeys, ChainPosition, RelChains};
use crate::tx::TxState;
use crate::types::{CacheError, Dir, NodeId, RelId, Result, TypeId};

type Types = SmallVec<[TypeId; 4]>;

/// Read cursor over one node entry.
///
/// Offsets count how many ids of each `(type, slot)` array of `snapshot` have been stepped
/// over. A replaced snapshot may have lost ids or been rebuilt in another order, so offsets
/// are recomputed from the ids already visited instead of being carried over.
struct BaseCursor {
    entry: Arc<NodeEntry>,
    snapshot: Arc<RelChains>,
    scan: Types,
    offsets: FxHashMap<ChainKey, usize>,
}

impl BaseCursor {
    fn new(entry: Arc<NodeEntry>, types: Option<&[TypeId]>) -> Self {
        let snapshot = entry.chains();
        let mut cursor = Self {
            entry,
            scan: Types::new(),
            snapshot,
            offsets: FxHashMap::default(),
        };
        cursor.scan = scan_types(&cursor.snapshot, types);
        cursor
    }

    fn next_loaded(
        &mut self,
        dir: Dir,
        removed: Option<&FxHashSet<RelId>>,
        visited: &mut FxHashSet<RelId>,
    ) -> Option<RelId> {
        for ty in &self.scan {
            let Some(array) = self.snapshot.array(*ty) else {
                continue;
            };
            for slot in dir.slots() {
                let offset = self.offsets.entry(ChainKey::new(*ty, *slot)).or_insert(0);
                while let Some(id) = array.get(*slot, *offset) {
                    *offset += 1;
                    if !visited.insert(id) {
                        continue;
                    }
                    if removed.is_some_and(|removed| removed.contains(&id)) {
                        continue;
                    }
                    return Some(id);
                }
            }
        }
        None
    }

    fn load_keys(&self, types: Option<&[TypeId]>, dir: Dir) -> ChainKeys {
        self.snapshot.position().keys_for(types, dir)
    }

    fn refresh(&mut self, types: Option<&[TypeId]>, visited: &FxHashSet<RelId>) {
        self.snapshot = self.entry.chains();
        self.scan = scan_types(&self.snapshot, types);
        for (key, offset) in self.offsets.iter_mut() {
            *offset = match self.snapshot.array(key.ty) {
                Some(array) => (0..array.slot_len(key.slot))
                    .take_while(|at| {
                        array
                            .get(key.slot, *at)
                            .is_some_and(|id| visited.contains(&id))
                    })
                    .count(),
                None => 0,
            };
        }
    }
}

fn scan_types(snapshot: &RelChains, types: Option<&[TypeId]>) -> Types {
    match types {
        Some(types) => types.iter().copied().collect(),
        None => {
            let mut scan: Types = snapshot.types().into_iter().collect();
            if let ChainPosition::Dense { types: known, .. } = snapshot.position() {
                for ty in known {
                    if let Err(at) = scan.binary_search(ty) {
                        scan.insert(at, *ty);
                    }
                }
            }
            scan
        }
    }
}

/// Lazily loading iterator over a node's relationship ids.
///
/// Cached ids come first, loading further pages from the store as the cached ones run out,
/// then the ids the transaction added. Ids the transaction removed are skipped and no id is
/// yielded twice. A relationship record vanishing under the iterator ends it with
/// [`CacheError::ConcurrentlyDeleted`]; after any error the iterator is exhausted.
pub struct RelationshipIter<'a> {
    cache: &'a CacheManager,
    tx: &'a TxState,
    node: NodeId,
    types: Option<Types>,
    dir: Dir,
    base: Option<BaseCursor>,
    added: Option<std::vec::IntoIter<RelId>>,
    visited: FxHashSet<RelId>,
    done: bool,
}

impl<'a> RelationshipIter<'a> {
    pub(crate) fn new(
        cache: &'a CacheManager,
        tx: &'a TxState,
        node: NodeId,
        types: Option<&[TypeId]>,
        dir: Dir,
        entry: Option<Arc<NodeEntry>>,
    ) -> Self {
        Self {
            cache,
            tx,
            node,
            types: types.map(|types| types.iter().copied().collect()),
            dir,
            base: entry.map(|entry| BaseCursor::new(entry, types)),
            added: None,
            visited: FxHashSet::default(),
            done: false,
        }
    }

    /// Node being iterated.
    pub fn node(&self) -> NodeId {
        self.node
    }

    fn advance(&mut self) -> Result<Option<RelId>> {
        let cache: &CacheManager = self.cache;
        let tx: &TxState = self.tx;
        let node = self.node;
        let dir = self.dir;
        let types = self.types.as_deref();
        let base = &mut self.base;
        let visited = &mut self.visited;
        let removed = tx.removed(node);

        while let Some(cursor) = base.as_mut() {
            if let Some(id) = cursor.next_loaded(dir, removed, visited) {
                return Ok(Some(id));
            }
            let keys = cursor.load_keys(types, dir);
            if !cursor.snapshot.position().has_more(&keys) {
                *base = None;
                break;
            }
            let loaded = cursor
                .entry
                .load_more(&cursor.snapshot, &keys, cache.loader())
                .map_err(|err| vanished(err, node.into()))?;
            match loaded {
                LoadMore::Loaded(records) => {
                    cache.page_loaded(&cursor.entry, &records);
                    cursor.refresh(types, visited);
                }
                LoadMore::Refreshed => cursor.refresh(types, visited),
                LoadMore::Exhausted => {
                    *base = None;
                }
                LoadMore::Stale => {
                    cursor.entry = cache.node(node).map_err(|err| match err {
                        CacheError::NotFound(entity) => CacheError::ConcurrentlyDeleted(entity),
                        other => other,
                    })?;
                    cursor.refresh(types, visited);
                }
            }
        }

        let added = self.added.get_or_insert_with(|| {
            let mut ids = Vec::new();
            if let Some(adds) = tx.added(node) {
                for (ty, array) in adds {
                    if types.is_some_and(|types| !types.contains(ty)) {
                        continue;
                    }
                    ids.extend(array.iter(dir));
                }
            }
            ids.into_iter()
        });
        Ok(added.find(|id| visited.insert(*id)))
    }
}

impl Iterator for RelationshipIter<'_> {
    type Item = Result<RelId>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(id)) => Some(Ok(id)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// The only relationship among `ids`.
///
/// Repeats of one id collapse; two distinct ids are reported as
/// [`CacheError::MoreThanOneRelationship`].
pub(crate) fn single(
    node: NodeId,
    ty: TypeId,
    dir: Dir,
    ids: impl IntoIterator<Item = Result<RelId>>,
) -> Result<Option<RelId>> {
    let mut found: Option<RelId> = None;
    for id in ids {
        let id = id?;
        match found {
            None => found = Some(id),
            Some(first) if first == id => {}
            Some(_) => return Err(CacheError::MoreThanOneRelationship { node, ty, dir }),
        }
    }
    Ok(found)
}
