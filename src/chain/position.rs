use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::types::{Dir, RelDir, RelId, TypeId};

/// How far one chain has been read into the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoadState {
    /// Never probed; the chain may or may not hold records.
    NotLoaded,
    /// Partially read; the wrapped id is the next unread record.
    Partial(RelId),
    /// Every record has been read. Terminal.
    FullyLoaded,
}

impl LoadState {
    /// Whether another load may return records.
    pub fn has_more(self) -> bool {
        !matches!(self, LoadState::FullyLoaded)
    }

    /// Resume point for the store, `None` when nothing is left to read.
    pub fn cursor(self) -> Option<Option<RelId>> {
        match self {
            LoadState::NotLoaded => Some(None),
            LoadState::Partial(next) => Some(Some(next)),
            LoadState::FullyLoaded => None,
        }
    }

    /// State after a page ending before `next` was read.
    pub fn after_page(next: Option<RelId>) -> LoadState {
        match next {
            Some(next) => LoadState::Partial(next),
            None => LoadState::FullyLoaded,
        }
    }

    fn patch_hole(&mut self, rel: RelId, next: Option<RelId>) -> bool {
        if *self == LoadState::Partial(rel) {
            *self = LoadState::after_page(next);
            true
        } else {
            false
        }
    }
}

/// One per-(type, direction) chain of a dense node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainKey {
    /// Relationship type.
    pub ty: TypeId,
    /// Direction slot.
    pub slot: RelDir,
}

impl ChainKey {
    /// Builds a key.
    pub fn new(ty: TypeId, slot: RelDir) -> Self {
        Self { ty, slot }
    }
}

/// Key list sized for the common case of one or two types.
pub type ChainKeys = SmallVec<[ChainKey; 6]>;

/// Resumable load cursor of a node's relationships.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainPosition {
    /// Sparse node: one chain holding every type and direction.
    Sparse(LoadState),
    /// Dense node: an independent chain per (type, direction).
    ///
    /// A key missing from `states` has never been probed and reads as
    /// [`LoadState::NotLoaded`]; it never reads as empty.
    Dense {
        /// Types that have chains on this node.
        types: SmallVec<[TypeId; 4]>,
        /// Probed chains.
        states: FxHashMap<ChainKey, LoadState>,
    },
}

impl ChainPosition {
    /// Fresh dense position over `types`.
    pub fn dense(types: impl IntoIterator<Item = TypeId>) -> Self {
        let mut types: SmallVec<[TypeId; 4]> = types.into_iter().collect();
        types.sort_unstable();
        types.dedup();
        ChainPosition::Dense {
            types,
            states: FxHashMap::default(),
        }
    }

    /// Whether the node uses per-(type, direction) chains.
    pub fn is_dense(&self) -> bool {
        matches!(self, ChainPosition::Dense { .. })
    }

    /// State of the chain holding `key`.
    pub fn state(&self, key: ChainKey) -> LoadState {
        match self {
            ChainPosition::Sparse(state) => *state,
            ChainPosition::Dense { states, .. } => {
                states.get(&key).copied().unwrap_or(LoadState::NotLoaded)
            }
        }
    }

    /// Records the state of one dense chain; ignored for sparse positions.
    pub fn set_state(&mut self, key: ChainKey, state: LoadState) {
        if let ChainPosition::Dense { types, states } = self {
            if let Err(at) = types.binary_search(&key.ty) {
                types.insert(at, key.ty);
            }
            states.insert(key, state);
        }
    }

    /// Notes a type that gained a chain after the position was created.
    pub fn add_type(&mut self, ty: TypeId) {
        if let ChainPosition::Dense { types, .. } = self {
            if let Err(at) = types.binary_search(&ty) {
                types.insert(at, ty);
            }
        }
    }

    /// Chains a read of `types` (all known types when `None`) in `dir` has to cover.
    ///
    /// Sparse positions have no per-key chains and return an empty list.
    pub fn keys_for(&self, types: Option<&[TypeId]>, dir: Dir) -> ChainKeys {
        let ChainPosition::Dense { types: known, .. } = self else {
            return ChainKeys::new();
        };
        let types = types.unwrap_or(known.as_slice());
        let mut keys = ChainKeys::new();
        for ty in types {
            for slot in dir.slots() {
                keys.push(ChainKey::new(*ty, *slot));
            }
        }
        keys
    }

    /// Whether loading may still produce records for `keys`.
    pub fn has_more(&self, keys: &[ChainKey]) -> bool {
        match self {
            ChainPosition::Sparse(state) => state.has_more(),
            ChainPosition::Dense { .. } => keys.iter().any(|key| self.state(*key).has_more()),
        }
    }

    /// Whether every chain of the node has been read.
    pub fn is_fully_loaded(&self) -> bool {
        match self {
            ChainPosition::Sparse(state) => !state.has_more(),
            ChainPosition::Dense { types, .. } => {
                let keys = self.keys_for(Some(types.as_slice()), Dir::Both);
                !self.has_more(&keys)
            }
        }
    }

    /// Moves any cursor parked on the deleted `rel` to its successor.
    pub fn patch_hole(&mut self, rel: RelId, next: Option<RelId>) -> bool {
        match self {
            ChainPosition::Sparse(state) => state.patch_hole(rel, next),
            ChainPosition::Dense { states, .. } => states
                .values_mut()
                .fold(false, |patched, state| state.patch_hole(rel, next) || patched),
        }
    }
}
