//! Incremental relationship chain loading.
//!
//! A node's relationships are pulled from the store a page at a time. [`RelChains`] is the
//! immutable snapshot a cache entry publishes: one [`RelIdArray`] per type plus the
//! [`ChainPosition`] saying how far each chain has been read. Loading never mutates a
//! published snapshot; [`RelationshipLoader::load_more`] returns a successor.

mod loader;
mod position;

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::relids::RelIdArray;
use crate::types::{Dir, RelDir, RelId, TypeId};

pub use loader::{LoadedChunk, RelationshipLoader};
pub use position::{ChainKey, ChainKeys, ChainPosition, LoadState};

/// Loaded relationship ids of one node together with its load position.
#[derive(Clone, Debug)]
pub struct RelChains {
    arrays: FxHashMap<TypeId, Arc<RelIdArray>>,
    position: ChainPosition,
}

impl RelChains {
    /// Nothing loaded yet.
    pub fn new(position: ChainPosition) -> Self {
        Self {
            arrays: FxHashMap::default(),
            position,
        }
    }

    /// Load position.
    pub fn position(&self) -> &ChainPosition {
        &self.position
    }

    pub(crate) fn position_mut(&mut self) -> &mut ChainPosition {
        &mut self.position
    }

    /// Loaded ids of `ty`, if any.
    pub fn array(&self, ty: TypeId) -> Option<&Arc<RelIdArray>> {
        self.arrays.get(&ty)
    }

    /// Types with at least one loaded array, in ascending order.
    pub fn types(&self) -> Vec<TypeId> {
        let mut types: Vec<TypeId> = self.arrays.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Mutable access to the array of `ty`, cloning it first if another snapshot shares it.
    pub(crate) fn array_mut(&mut self, ty: TypeId) -> &mut RelIdArray {
        Arc::make_mut(
            self.arrays
                .entry(ty)
                .or_insert_with(|| Arc::new(RelIdArray::new(ty))),
        )
    }

    pub(crate) fn replace_array(&mut self, ty: TypeId, array: Option<RelIdArray>) {
        match array {
            Some(array) if !array.is_empty() => {
                self.arrays.insert(ty, Arc::new(array));
            }
            _ => {
                self.arrays.remove(&ty);
            }
        }
    }

    /// First loaded id of the chain `(ty, slot)`.
    pub fn first_id(&self, ty: TypeId, slot: RelDir) -> Option<RelId> {
        self.arrays.get(&ty).and_then(|array| array.first_id(slot))
    }

    /// Number of loaded ids visible in `dir`.
    pub fn loaded_len(&self, dir: Dir) -> usize {
        self.arrays.values().map(|array| array.len(dir)).sum()
    }

    /// Approximate heap footprint in bytes.
    pub fn size_in_bytes(&self) -> usize {
        let position = match &self.position {
            ChainPosition::Sparse(_) => 16,
            ChainPosition::Dense { states, .. } => 48 + states.len() * 24,
        };
        position
            + self
                .arrays
                .values()
                .map(|array| 24 + array.size_in_bytes())
                .sum::<usize>()
    }
}
