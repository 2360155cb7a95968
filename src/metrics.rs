use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::types::EntityKind;

/// Counters reported by the cache core.
///
/// Implementations must be cheap: every method is called on hot paths, some of them while a
/// per-node load lock is held.
pub trait CacheMetrics: Send + Sync {
    /// A lookup was served from the cache.
    fn cache_hit(&self, kind: EntityKind);

    /// A lookup missed the cache and a load was started.
    fn cache_miss(&self, kind: EntityKind);

    /// A concurrent lookup waited for another thread's in-flight load.
    fn load_shared(&self, kind: EntityKind);

    /// The eviction policy dropped an entry.
    fn evicted(&self, kind: EntityKind);

    /// One page of a relationship chain was read from the store.
    ///
    /// # Parameters
    /// * `dense` - Whether the page belongs to a per-(type, direction) chain.
    /// * `records` - Number of records in the page.
    fn chain_load(&self, dense: bool, records: usize);

    /// The property verifier found a duplicated key.
    fn duplicate_property(&self);

    /// An id was served from a free pool (`reused`) or by advancing the high id.
    fn id_allocated(&self, reused: bool);
}

/// Discards everything.
#[derive(Default)]
pub struct NoopMetrics;

impl CacheMetrics for NoopMetrics {
    fn cache_hit(&self, _kind: EntityKind) {}
    fn cache_miss(&self, _kind: EntityKind) {}
    fn load_shared(&self, _kind: EntityKind) {}
    fn evicted(&self, _kind: EntityKind) {}
    fn chain_load(&self, _dense: bool, _records: usize) {}
    fn duplicate_property(&self) {}
    fn id_allocated(&self, _reused: bool) {}
}

/// Atomic counters, safe to read from any thread while the cache is running.
#[derive(Default)]
pub struct CounterMetrics {
    /// Node cache hits.
    pub node_hits: AtomicU64,
    /// Node cache misses.
    pub node_misses: AtomicU64,
    /// Relationship cache hits.
    pub relationship_hits: AtomicU64,
    /// Relationship cache misses.
    pub relationship_misses: AtomicU64,
    /// Lookups that joined an in-flight load.
    pub shared_loads: AtomicU64,
    /// Entries dropped by eviction policies.
    pub evictions: AtomicU64,
    /// Sparse chain pages loaded.
    pub sparse_chain_loads: AtomicU64,
    /// Dense chain pages loaded.
    pub dense_chain_loads: AtomicU64,
    /// Relationship records read while loading chains.
    pub chain_records: AtomicU64,
    /// Duplicate property keys detected.
    pub duplicate_properties: AtomicU64,
    /// Ids served from free pools.
    pub ids_reused: AtomicU64,
    /// Ids served by advancing a high id.
    pub ids_fresh: AtomicU64,
}

impl CounterMetrics {
    /// Hit ratio over both entity kinds, `0.0` before the first lookup.
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.node_hits.load(Ordering::Relaxed)
            + self.relationship_hits.load(Ordering::Relaxed);
        let misses = self.node_misses.load(Ordering::Relaxed)
            + self.relationship_misses.load(Ordering::Relaxed);
        if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        }
    }
}

impl CacheMetrics for CounterMetrics {
    fn cache_hit(&self, kind: EntityKind) {
        match kind {
            EntityKind::Node => self.node_hits.fetch_add(1, Ordering::Relaxed),
            EntityKind::Relationship => self.relationship_hits.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn cache_miss(&self, kind: EntityKind) {
        match kind {
            EntityKind::Node => self.node_misses.fetch_add(1, Ordering::Relaxed),
            EntityKind::Relationship => self.relationship_misses.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn load_shared(&self, _kind: EntityKind) {
        self.shared_loads.fetch_add(1, Ordering::Relaxed);
    }

    fn evicted(&self, _kind: EntityKind) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    fn chain_load(&self, dense: bool, records: usize) {
        if dense {
            self.dense_chain_loads.fetch_add(1, Ordering::Relaxed);
        } else {
            self.sparse_chain_loads.fetch_add(1, Ordering::Relaxed);
        }
        self.chain_records
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    fn duplicate_property(&self) {
        self.duplicate_properties.fetch_add(1, Ordering::Relaxed);
    }

    fn id_allocated(&self, reused: bool) {
        if reused {
            self.ids_reused.fetch_add(1, Ordering::Relaxed);
        } else {
            self.ids_fresh.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// The default metrics sink, a shared [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn CacheMetrics> {
    Arc::new(NoopMetrics)
}
