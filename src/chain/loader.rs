use std::sync::Arc;

use smallvec::SmallVec;
use tracing::trace;

use super::{ChainKey, ChainPosition, LoadState, RelChains};
use crate::metrics::CacheMetrics;
use crate::persistence::{ChainCursor, NodeRecord, PersistenceManager, RelationshipRecord};
use crate::types::{CacheError, NodeId, Result, TypeId};

/// Result of one [`RelationshipLoader::load_more`] call.
#[derive(Debug)]
pub struct LoadedChunk {
    /// Successor snapshot holding the previously loaded ids plus the new page.
    pub chains: RelChains,
    /// Records read in this page, for relationship cache population.
    pub records: Vec<RelationshipRecord>,
}

/// Turns "need more relationships" into bounded page reads from the store.
pub struct RelationshipLoader {
    store: Arc<dyn PersistenceManager>,
    grab_size: usize,
    metrics: Arc<dyn CacheMetrics>,
}

impl RelationshipLoader {
    /// Loader reading at most `grab_size` records per page.
    pub fn new(
        store: Arc<dyn PersistenceManager>,
        grab_size: usize,
        metrics: Arc<dyn CacheMetrics>,
    ) -> Self {
        Self {
            store,
            grab_size: grab_size.max(1),
            metrics,
        }
    }

    /// Records per page.
    pub fn grab_size(&self) -> usize {
        self.grab_size
    }

    /// Position of a node whose relationships have not been read yet.
    ///
    /// The dense/sparse decision is taken here, from the store's node header, and is kept for
    /// the lifetime of the cache entry.
    pub fn initial_position(&self, node: &NodeRecord) -> Result<ChainPosition> {
        if node.dense {
            let types = self.store.relationship_types(node.id)?;
            Ok(ChainPosition::dense(types))
        } else {
            Ok(ChainPosition::Sparse(LoadState::NotLoaded))
        }
    }

    /// Reads the next page for `node`.
    ///
    /// Dense nodes read from the first chain among `keys` that still has records; sparse
    /// nodes ignore `keys`. Returns `None` when nothing is left to read. A record the chain
    /// links to but the store cannot find surfaces as [`CacheError::RecordNotFound`].
    pub fn load_more(
        &self,
        node: NodeId,
        chains: &RelChains,
        keys: &[ChainKey],
    ) -> Result<Option<LoadedChunk>> {
        let (cursor, key) = match chains.position() {
            ChainPosition::Sparse(state) => match state.cursor() {
                Some(from) => (ChainCursor::Sparse { from }, None),
                None => return Ok(None),
            },
            position => {
                let next = keys.iter().find_map(|key| {
                    position
                        .state(*key)
                        .cursor()
                        .map(|from| (*key, from))
                });
                match next {
                    Some((key, from)) => (
                        ChainCursor::Dense {
                            ty: key.ty,
                            slot: key.slot,
                            from,
                        },
                        Some(key),
                    ),
                    None => return Ok(None),
                }
            }
        };

        let batch = self
            .store
            .more_relationships(node, cursor, self.grab_size)?;
        self.metrics.chain_load(key.is_some(), batch.records.len());
        trace!(
            node = node.0,
            records = batch.records.len(),
            dense = key.is_some(),
            done = batch.next.is_none(),
            "chain.load.more"
        );

        let mut next = chains.clone();
        let mut touched: SmallVec<[TypeId; 4]> = SmallVec::new();
        for record in &batch.records {
            let slot = record
                .slot_for(node)
                .ok_or(CacheError::Corruption("relationship chain links a foreign record"))?;
            next.array_mut(record.ty).add(record.id, slot);
            if !touched.contains(&record.ty) {
                touched.push(record.ty);
            }
        }

        let state = LoadState::after_page(batch.next);
        match key {
            Some(key) => next.position_mut().set_state(key, state),
            None => *next.position_mut() = ChainPosition::Sparse(state),
        }
        if next.position().is_fully_loaded() {
            for ty in &touched {
                next.array_mut(*ty).shrink();
            }
        }

        Ok(Some(LoadedChunk {
            chains: next,
            records: batch.records,
        }))
    }
}
