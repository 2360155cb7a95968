//! Growable id blocks backing one direction slot of a [`super::RelIdArray`].

use std::sync::Arc;

/// Ids per sealed chunk of an [`IdChunks`].
pub(crate) const CHUNK_LEN: usize = 512;

const HIGH_MASK: u64 = 0xFF_0000_0000;
const MAX_BLOCK_ID: u64 = 0xFF_FFFF_FFFF;

/// Ids below 2^32 are stored as plain `u32`; the first id above that upgrades the block to
/// carry an extra high byte per entry (40-bit ids).
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum IdBlock {
    Low(Vec<u32>),
    High { low: Vec<u32>, high: Vec<u8> },
}

pub(crate) fn id_is_low(id: u64) -> bool {
    id & HIGH_MASK == 0
}

impl IdBlock {
    pub(crate) fn for_id(id: u64) -> Self {
        if id_is_low(id) {
            IdBlock::Low(Vec::with_capacity(3))
        } else {
            IdBlock::High {
                low: Vec::with_capacity(3),
                high: Vec::with_capacity(3),
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            IdBlock::Low(ids) => ids.len(),
            IdBlock::High { low, .. } => low.len(),
        }
    }

    pub(crate) fn get(&self, index: usize) -> u64 {
        match self {
            IdBlock::Low(ids) => u64::from(ids[index]),
            IdBlock::High { low, high } => (u64::from(high[index]) << 32) | u64::from(low[index]),
        }
    }

    pub(crate) fn first(&self) -> Option<u64> {
        (self.len() > 0).then(|| self.get(0))
    }

    fn accepts(&self, id: u64) -> bool {
        match self {
            IdBlock::Low(_) => id_is_low(id),
            IdBlock::High { .. } => true,
        }
    }

    fn upgrade(&mut self) {
        if let IdBlock::Low(ids) = self {
            let low = std::mem::take(ids);
            let high = vec![0u8; low.len()];
            *self = IdBlock::High { low, high };
        }
    }

    pub(crate) fn push(&mut self, id: u64) {
        debug_assert!(id <= MAX_BLOCK_ID, "relationship id {id} exceeds 40 bits");
        if !self.accepts(id) {
            self.upgrade();
        }
        match self {
            IdBlock::Low(ids) => ids.push(id as u32),
            IdBlock::High { low, high } => {
                low.push(id as u32);
                high.push(((id & HIGH_MASK) >> 32) as u8);
            }
        }
    }

    pub(crate) fn shrink(&mut self) {
        match self {
            IdBlock::Low(ids) => ids.shrink_to_fit(),
            IdBlock::High { low, high } => {
                low.shrink_to_fit();
                high.shrink_to_fit();
            }
        }
    }

    pub(crate) fn size_in_bytes(&self) -> usize {
        match self {
            IdBlock::Low(ids) => 24 + ids.capacity() * 4,
            IdBlock::High { low, high } => 48 + low.capacity() * 4 + high.capacity(),
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }
}

/// One slot's ids as full, shared chunks of [`CHUNK_LEN`] ids plus an open tail.
///
/// Cloning copies the chunk pointers and the tail only, so a successor snapshot that appends
/// a page does not copy the ids its predecessor already holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct IdChunks {
    sealed: Vec<Arc<IdBlock>>,
    tail: IdBlock,
}

impl IdChunks {
    pub(crate) fn for_id(id: u64) -> Self {
        Self {
            sealed: Vec::new(),
            tail: IdBlock::for_id(id),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.sealed.len() * CHUNK_LEN + self.tail.len()
    }

    pub(crate) fn get(&self, index: usize) -> u64 {
        match self.sealed.get(index / CHUNK_LEN) {
            Some(chunk) => chunk.get(index % CHUNK_LEN),
            None => self.tail.get(index - self.sealed.len() * CHUNK_LEN),
        }
    }

    pub(crate) fn first(&self) -> Option<u64> {
        match self.sealed.first() {
            Some(chunk) => chunk.first(),
            None => self.tail.first(),
        }
    }

    pub(crate) fn push(&mut self, id: u64) {
        self.tail.push(id);
        if self.tail.len() == CHUNK_LEN {
            let mut full = std::mem::replace(&mut self.tail, IdBlock::Low(Vec::new()));
            full.shrink();
            self.sealed.push(Arc::new(full));
        }
    }

    pub(crate) fn append(&mut self, other: &IdChunks) {
        if self.len() == 0 {
            *self = other.clone();
            return;
        }
        for id in other.iter() {
            self.push(id);
        }
    }

    pub(crate) fn shrink(&mut self) {
        self.tail.shrink();
    }

    pub(crate) fn size_in_bytes(&self) -> usize {
        24 + self.sealed.len() * 8
            + self
                .sealed
                .iter()
                .map(|chunk| chunk.size_in_bytes())
                .sum::<usize>()
            + self.tail.size_in_bytes()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.sealed
            .iter()
            .flat_map(|chunk| chunk.iter())
            .chain(self.tail.iter())
    }

    #[cfg(test)]
    pub(crate) fn shares_chunks_with(&self, other: &IdChunks) -> bool {
        !self.sealed.is_empty()
            && self
                .sealed
                .iter()
                .zip(&other.sealed)
                .all(|(a, b)| Arc::ptr_eq(a, b))
    }
}
