use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::trace;

use crate::metrics::{default_metrics, CacheMetrics};
use crate::types::{CacheError, IdSpace, Result};

/// Persistable state of one generator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdGeneratorState {
    /// Next fresh id.
    pub high_id: u64,
    /// Freed ids, oldest first.
    pub free_ids: Vec<u64>,
}

#[derive(Default)]
struct Pool {
    high: u64,
    free: VecDeque<u64>,
    freed: FxHashSet<u64>,
}

/// Hands out ids of one id space, reusing freed ids before growing the high id.
///
/// The space's reserved id is never returned. Callers only free an id once no reader can
/// observe the old record any more, i.e. after the deleting transaction committed.
pub struct IdGenerator {
    space: IdSpace,
    pool: Mutex<Pool>,
    metrics: Arc<dyn CacheMetrics>,
}

impl IdGenerator {
    /// Generator whose next fresh id is `high_id`.
    pub fn new(space: IdSpace, high_id: u64) -> Self {
        Self::with_metrics(space, high_id, default_metrics())
    }

    /// Like [`IdGenerator::new`] with an explicit metrics sink.
    pub fn with_metrics(space: IdSpace, high_id: u64, metrics: Arc<dyn CacheMetrics>) -> Self {
        Self {
            space,
            pool: Mutex::new(Pool {
                high: high_id,
                ..Pool::default()
            }),
            metrics,
        }
    }

    /// Restores a generator from persisted state.
    pub fn from_state(
        space: IdSpace,
        state: IdGeneratorState,
        metrics: Arc<dyn CacheMetrics>,
    ) -> Result<Self> {
        let generator = Self::with_metrics(space, state.high_id, metrics);
        for id in state.free_ids {
            generator.free_id(id)?;
        }
        Ok(generator)
    }

    /// Id space served by this generator.
    pub fn space(&self) -> IdSpace {
        self.space
    }

    /// Next id: the oldest freed id if any, otherwise the high id.
    pub fn next_id(&self) -> Result<u64> {
        let mut pool = self.pool.lock();
        if let Some(id) = pool.free.pop_front() {
            pool.freed.remove(&id);
            self.metrics.id_allocated(true);
            trace!(space = self.space.name(), id, "ids.next.reused");
            return Ok(id);
        }
        loop {
            let id = pool.high;
            if id > self.space.max_id() {
                return Err(CacheError::IdSpaceExhausted {
                    space: self.space,
                    max: self.space.max_id(),
                });
            }
            pool.high = id + 1;
            if self.space.is_reserved(id) {
                continue;
            }
            self.metrics.id_allocated(false);
            return Ok(id);
        }
    }

    /// Contiguous range of `size` fresh ids; the free pool is not consulted.
    pub fn next_id_batch(&self, size: u64) -> Result<Range<u64>> {
        if !self.space.supports_batch() {
            return Err(CacheError::Unsupported("batch allocation of token ids"));
        }
        let mut pool = self.pool.lock();
        let mut start = pool.high;
        let reserved = self.space.reserved_id();
        if (start..start.saturating_add(size)).contains(&reserved) {
            start = reserved + 1;
        }
        let end = start.saturating_add(size);
        if end > self.space.max_id().saturating_add(1) {
            return Err(CacheError::IdSpaceExhausted {
                space: self.space,
                max: self.space.max_id(),
            });
        }
        pool.high = end;
        trace!(space = self.space.name(), start, end, "ids.next.batch");
        Ok(start..end)
    }

    /// Returns `id` to the free pool.
    pub fn free_id(&self, id: u64) -> Result<()> {
        let mut pool = self.pool.lock();
        if id >= pool.high || self.space.is_reserved(id) {
            return Err(CacheError::Invalid("freed id was never allocated"));
        }
        if !pool.freed.insert(id) {
            return Err(CacheError::Invalid("id freed twice"));
        }
        pool.free.push_back(id);
        Ok(())
    }

    /// Moves the high id, used on open and recovery.
    pub fn set_high_id(&self, high_id: u64) -> Result<()> {
        if high_id > self.space.max_id().saturating_add(1) {
            return Err(CacheError::IdSpaceExhausted {
                space: self.space,
                max: self.space.max_id(),
            });
        }
        let mut pool = self.pool.lock();
        pool.high = high_id;
        let Pool { free, freed, .. } = &mut *pool;
        free.retain(|id| *id < high_id);
        freed.retain(|id| *id < high_id);
        Ok(())
    }

    /// Next fresh id.
    pub fn high_id(&self) -> u64 {
        self.pool.lock().high
    }

    /// Number of freed ids waiting for reuse.
    pub fn defrag_count(&self) -> usize {
        self.pool.lock().free.len()
    }

    /// Forgets every freed id without reusing it.
    pub fn clear_free_ids(&self) {
        let mut pool = self.pool.lock();
        pool.free.clear();
        pool.freed.clear();
    }

    /// Snapshot for persistence.
    pub fn state(&self) -> IdGeneratorState {
        let pool = self.pool.lock();
        IdGeneratorState {
            high_id: pool.high,
            free_ids: pool.free.iter().copied().collect(),
        }
    }
}
