//! Compact relationship id storage for cached chains.
//!
//! A [`RelIdArray`] holds the ids of one relationship type for one node, split into
//! outgoing, incoming and loop slots. Arrays published to the shared cache are immutable;
//! transactions describe their changes as separate add arrays and remove sets, and readers
//! compose the three lazily through [`RelIdView`].

mod block;
mod view;

use rustc_hash::FxHashSet;

use crate::types::{Dir, RelDir, RelId, TypeId};

use block::IdChunks;

pub use view::{merge, MergeIter, RelIdView};

/// Decides whether the ids of one `(type, slot)` of an add array are applied by
/// [`RelIdArray::from_diff`].
pub trait RelationshipFilter {
    /// Returns true when the ids of `slot` for `ty` should be added.
    fn accept(&self, ty: TypeId, slot: RelDir) -> bool;
}

/// Filter that accepts every slot.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAll;

impl RelationshipFilter for AcceptAll {
    fn accept(&self, _ty: TypeId, _slot: RelDir) -> bool {
        true
    }
}

/// Append-only ordered relationship ids of a single type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelIdArray {
    ty: TypeId,
    slots: [Option<IdChunks>; 3],
}

impl RelIdArray {
    /// Creates an empty array for `ty`.
    pub fn new(ty: TypeId) -> Self {
        Self {
            ty,
            slots: [None, None, None],
        }
    }

    /// Relationship type of every id in this array.
    pub fn ty(&self) -> TypeId {
        self.ty
    }

    /// Appends `id` to the `slot` block.
    pub fn add(&mut self, id: RelId, slot: RelDir) {
        self.slots[slot.index()]
            .get_or_insert_with(|| IdChunks::for_id(id.0))
            .push(id.0);
    }

    /// Appends every id of `other` slot by slot.
    pub fn add_all(&mut self, other: &RelIdArray) {
        self.add_all_filtered(other, &AcceptAll);
    }

    /// Appends the slots of `other` that `filter` accepts.
    pub fn add_all_filtered(&mut self, other: &RelIdArray, filter: &dyn RelationshipFilter) {
        for slot in [RelDir::Out, RelDir::In, RelDir::Loop] {
            let Some(src) = other.slots[slot.index()].as_ref() else {
                continue;
            };
            if !filter.accept(self.ty, slot) {
                continue;
            }
            match self.slots[slot.index()].as_mut() {
                Some(dst) => dst.append(src),
                None => {
                    let mut copy = src.clone();
                    copy.shrink();
                    self.slots[slot.index()] = Some(copy);
                }
            }
        }
    }

    /// Iterates the ids visible for `dir` in slot order, each slot in insertion order.
    pub fn iter(&self, dir: Dir) -> RelIdIter<'_> {
        RelIdIter {
            array: self,
            slots: dir.slots(),
            slot: 0,
            pos: 0,
        }
    }

    /// Iterates one slot.
    pub fn slot_iter(&self, slot: RelDir) -> impl Iterator<Item = RelId> + '_ {
        self.slots[slot.index()]
            .iter()
            .flat_map(|block| block.iter().map(RelId))
    }

    /// Number of ids in `slot`.
    pub fn slot_len(&self, slot: RelDir) -> usize {
        self.slots[slot.index()].as_ref().map_or(0, IdChunks::len)
    }

    /// Id at `index` of `slot`.
    pub fn get(&self, slot: RelDir, index: usize) -> Option<RelId> {
        self.slots[slot.index()]
            .as_ref()
            .filter(|block| index < block.len())
            .map(|block| RelId(block.get(index)))
    }

    /// First id of `slot`, if any.
    pub fn first_id(&self, slot: RelDir) -> Option<RelId> {
        self.slots[slot.index()]
            .as_ref()
            .and_then(IdChunks::first)
            .map(RelId)
    }

    /// Last id of `slot`, if any.
    pub fn last_id(&self, slot: RelDir) -> Option<RelId> {
        self.slots[slot.index()]
            .as_ref()
            .filter(|block| block.len() > 0)
            .map(|block| RelId(block.get(block.len() - 1)))
    }

    /// Number of ids visible for `dir`.
    pub fn len(&self, dir: Dir) -> usize {
        dir.slots()
            .iter()
            .filter_map(|slot| self.slots[slot.index()].as_ref())
            .map(IdChunks::len)
            .sum()
    }

    /// True when no slot holds an id.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().flatten().all(|block| block.len() == 0)
    }

    /// Releases spare capacity; called once a chain is fully loaded.
    pub fn shrink(&mut self) {
        for block in self.slots.iter_mut().flatten() {
            block.shrink();
        }
    }

    /// Approximate heap footprint in bytes.
    pub fn size_in_bytes(&self) -> usize {
        16 + self
            .slots
            .iter()
            .map(|slot| 8 + slot.as_ref().map_or(0, IdChunks::size_in_bytes))
            .sum::<usize>()
    }

    /// True when `slot` of both arrays is backed by the same sealed chunks.
    #[cfg(test)]
    pub(crate) fn shares_storage_with(&self, other: &RelIdArray, slot: RelDir) -> bool {
        match (&self.slots[slot.index()], &other.slots[slot.index()]) {
            (Some(ours), Some(theirs)) => ours.shares_chunks_with(theirs),
            _ => false,
        }
    }

    /// Materializes `(src ∪ add) \ remove` into a new array without touching the inputs.
    ///
    /// Slots of `add` rejected by `filter` are skipped. Returns `None` when both inputs are
    /// absent. Relative order of the surviving ids is preserved.
    pub fn from_diff(
        src: Option<&RelIdArray>,
        add: Option<&RelIdArray>,
        remove: Option<&FxHashSet<RelId>>,
        filter: &dyn RelationshipFilter,
    ) -> Option<RelIdArray> {
        let ty = src.or(add)?.ty;
        let mut out = RelIdArray::new(ty);
        if let Some(src) = src {
            out.extend_except(src, remove, &AcceptAll);
        }
        if let Some(add) = add {
            out.extend_except(add, remove, filter);
        }
        Some(out)
    }

    fn extend_except(
        &mut self,
        from: &RelIdArray,
        remove: Option<&FxHashSet<RelId>>,
        filter: &dyn RelationshipFilter,
    ) {
        let Some(remove) = remove.filter(|set| !set.is_empty()) else {
            self.add_all_filtered(from, filter);
            return;
        };
        for slot in [RelDir::Out, RelDir::In, RelDir::Loop] {
            if !filter.accept(self.ty, slot) {
                continue;
            }
            for id in from.slot_iter(slot) {
                if !remove.contains(&id) {
                    self.add(id, slot);
                }
            }
        }
    }
}

/// Borrowing iterator over a [`RelIdArray`] for one direction.
pub struct RelIdIter<'a> {
    array: &'a RelIdArray,
    slots: &'static [RelDir],
    slot: usize,
    pos: usize,
}

impl<'a> RelIdIter<'a> {
    /// Restarts the iteration from the first slot.
    pub fn rewind(&mut self) {
        self.slot = 0;
        self.pos = 0;
    }
}

impl<'a> Iterator for RelIdIter<'a> {
    type Item = RelId;

    fn next(&mut self) -> Option<RelId> {
        while self.slot < self.slots.len() {
            if let Some(block) = self.array.slots[self.slots[self.slot].index()].as_ref() {
                if self.pos < block.len() {
                    let id = block.get(self.pos);
                    self.pos += 1;
                    return Some(RelId(id));
                }
            }
            self.slot += 1;
            self.pos = 0;
        }
        None
    }
}
