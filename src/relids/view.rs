//! Lazy `source + add - remove` composition used by transaction reads.

use rustc_hash::FxHashSet;

use super::{RelIdArray, RelIdIter};
use crate::types::{Dir, RelId};

/// Read-only view over a shared base array, a transaction's added ids and its removed ids.
///
/// None of the inputs is copied or mutated; every call to [`RelIdView::iter`] starts a fresh
/// pass, so the view can be iterated any number of times.
#[derive(Clone, Copy)]
pub struct RelIdView<'a> {
    src: Option<&'a RelIdArray>,
    add: Option<&'a RelIdArray>,
    remove: Option<&'a FxHashSet<RelId>>,
}

impl<'a> RelIdView<'a> {
    /// Composes the three parts; any of them may be absent.
    pub fn new(
        src: Option<&'a RelIdArray>,
        add: Option<&'a RelIdArray>,
        remove: Option<&'a FxHashSet<RelId>>,
    ) -> Self {
        Self { src, add, remove }
    }

    /// Iterates source ids then added ids for `dir`, skipping removed ids.
    pub fn iter(&self, dir: Dir) -> MergeIter<'a> {
        MergeIter {
            src: self.src.map(|array| array.iter(dir)),
            add: self.add.map(|array| array.iter(dir)),
            remove: self.remove,
        }
    }
}

/// Shorthand for `RelIdView::new(src, add, remove).iter(dir)`.
pub fn merge<'a>(
    src: Option<&'a RelIdArray>,
    add: Option<&'a RelIdArray>,
    remove: Option<&'a FxHashSet<RelId>>,
    dir: Dir,
) -> MergeIter<'a> {
    RelIdView::new(src, add, remove).iter(dir)
}

/// Iterator produced by [`RelIdView::iter`].
pub struct MergeIter<'a> {
    src: Option<RelIdIter<'a>>,
    add: Option<RelIdIter<'a>>,
    remove: Option<&'a FxHashSet<RelId>>,
}

impl<'a> MergeIter<'a> {
    fn removed(&self, id: RelId) -> bool {
        self.remove.is_some_and(|set| set.contains(&id))
    }
}

impl<'a> Iterator for MergeIter<'a> {
    type Item = RelId;

    fn next(&mut self) -> Option<RelId> {
        loop {
            let next = match self.src.as_mut().and_then(Iterator::next) {
                Some(id) => Some(id),
                None => {
                    self.src = None;
                    self.add.as_mut().and_then(Iterator::next)
                }
            };
            let id = next?;
            if !self.removed(id) {
                return Some(id);
            }
        }
    }
}
