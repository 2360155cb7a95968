//! Pluggable eviction disciplines.
//!
//! A policy only tracks keys and weights; the cache keeps the values and asks the policy
//! whether to hold them strongly or weakly and which key to drop next.

use lru::LruCache;

use crate::options::{CacheOptions, CacheType};
use crate::types::EntityKind;

/// How the cache holds the values of tracked keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retention {
    /// Values are not stored at all.
    None,
    /// Values are stored as weak references.
    Weak,
    /// Values are stored as strong references.
    Strong,
}

/// Uniform interface of every eviction discipline.
pub trait EvictionPolicy: Send {
    /// Configuration name of the discipline.
    fn cache_type(&self) -> CacheType;

    /// How values are held.
    fn retention(&self) -> Retention;

    /// Starts tracking `key` with the given approximate weight in bytes.
    fn insert(&mut self, key: u64, weight: usize);

    /// Records an access to `key` and its current weight.
    fn touch(&mut self, key: u64, weight: usize);

    /// Stops tracking `key`.
    fn remove(&mut self, key: u64);

    /// Next key to drop, already untracked, or `None` while within budget.
    fn eviction_candidate(&mut self) -> Option<u64>;

    /// Forgets every key.
    fn clear(&mut self);
}

/// Retains nothing.
#[derive(Debug, Default)]
pub struct NoCache;

impl EvictionPolicy for NoCache {
    fn cache_type(&self) -> CacheType {
        CacheType::None
    }

    fn retention(&self) -> Retention {
        Retention::None
    }

    fn insert(&mut self, _key: u64, _weight: usize) {}
    fn touch(&mut self, _key: u64, _weight: usize) {}
    fn remove(&mut self, _key: u64) {}

    fn eviction_candidate(&mut self) -> Option<u64> {
        None
    }

    fn clear(&mut self) {}
}

/// Retains everything until cleared.
#[derive(Debug, Default)]
pub struct StrongPolicy;

impl EvictionPolicy for StrongPolicy {
    fn cache_type(&self) -> CacheType {
        CacheType::Strong
    }

    fn retention(&self) -> Retention {
        Retention::Strong
    }

    fn insert(&mut self, _key: u64, _weight: usize) {}
    fn touch(&mut self, _key: u64, _weight: usize) {}
    fn remove(&mut self, _key: u64) {}

    fn eviction_candidate(&mut self) -> Option<u64> {
        None
    }

    fn clear(&mut self) {}
}

/// Holds values weakly; an entry disappears once no reader holds it.
#[derive(Debug, Default)]
pub struct WeakPolicy;

impl EvictionPolicy for WeakPolicy {
    fn cache_type(&self) -> CacheType {
        CacheType::Weak
    }

    fn retention(&self) -> Retention {
        Retention::Weak
    }

    fn insert(&mut self, _key: u64, _weight: usize) {}
    fn touch(&mut self, _key: u64, _weight: usize) {}
    fn remove(&mut self, _key: u64) {}

    fn eviction_candidate(&mut self) -> Option<u64> {
        None
    }

    fn clear(&mut self) {}
}

/// Least recently used eviction within a byte budget.
pub struct SoftPolicy {
    order: LruCache<u64, usize>,
    budget: usize,
    total: usize,
}

impl SoftPolicy {
    /// Policy keeping at most `budget` bytes.
    pub fn new(budget: usize) -> Self {
        Self {
            order: LruCache::unbounded(),
            budget,
            total: 0,
        }
    }

    /// Tracked weight in bytes.
    pub fn total_weight(&self) -> usize {
        self.total
    }
}

impl EvictionPolicy for SoftPolicy {
    fn cache_type(&self) -> CacheType {
        CacheType::Soft
    }

    fn retention(&self) -> Retention {
        Retention::Strong
    }

    fn insert(&mut self, key: u64, weight: usize) {
        if let Some(old) = self.order.put(key, weight) {
            self.total -= old;
        }
        self.total += weight;
    }

    fn touch(&mut self, key: u64, weight: usize) {
        if let Some(current) = self.order.get_mut(&key) {
            self.total = self.total - *current + weight;
            *current = weight;
        }
    }

    fn remove(&mut self, key: u64) {
        if let Some(weight) = self.order.pop(&key) {
            self.total -= weight;
        }
    }

    fn eviction_candidate(&mut self) -> Option<u64> {
        if self.total <= self.budget || self.order.len() <= 1 {
            return None;
        }
        let (key, weight) = self.order.pop_lru()?;
        self.total -= weight;
        Some(key)
    }

    fn clear(&mut self) {
        self.order.clear();
        self.total = 0;
    }
}

/// Segmented replacement: new keys enter the young generation and are promoted to the old
/// generation on their second access. Eviction drains the young generation first, so a
/// single scan cannot flush frequently used entries.
pub struct GenerationalPolicy {
    young: LruCache<u64, usize>,
    old: LruCache<u64, usize>,
    budget: usize,
    old_budget: usize,
    young_total: usize,
    old_total: usize,
}

impl GenerationalPolicy {
    /// Policy keeping at most `budget` bytes, up to 80% of it in the old generation.
    pub fn new(budget: usize) -> Self {
        Self {
            young: LruCache::unbounded(),
            old: LruCache::unbounded(),
            budget,
            old_budget: budget / 5 * 4,
            young_total: 0,
            old_total: 0,
        }
    }

    /// Number of keys in the old generation.
    pub fn old_len(&self) -> usize {
        self.old.len()
    }

    fn demote_overflow(&mut self) {
        while self.old_total > self.old_budget && self.old.len() > 1 {
            let Some((key, weight)) = self.old.pop_lru() else {
                break;
            };
            self.old_total -= weight;
            self.young.put(key, weight);
            self.young_total += weight;
        }
    }
}

impl EvictionPolicy for GenerationalPolicy {
    fn cache_type(&self) -> CacheType {
        CacheType::Gcr
    }

    fn retention(&self) -> Retention {
        Retention::Strong
    }

    fn insert(&mut self, key: u64, weight: usize) {
        self.remove(key);
        self.young.put(key, weight);
        self.young_total += weight;
    }

    fn touch(&mut self, key: u64, weight: usize) {
        if let Some(previous) = self.young.pop(&key) {
            self.young_total -= previous;
            self.old.put(key, weight);
            self.old_total += weight;
            self.demote_overflow();
        } else if let Some(current) = self.old.get_mut(&key) {
            self.old_total = self.old_total - *current + weight;
            *current = weight;
            self.demote_overflow();
        }
    }

    fn remove(&mut self, key: u64) {
        if let Some(weight) = self.young.pop(&key) {
            self.young_total -= weight;
        }
        if let Some(weight) = self.old.pop(&key) {
            self.old_total -= weight;
        }
    }

    fn eviction_candidate(&mut self) -> Option<u64> {
        if self.young_total + self.old_total <= self.budget
            || self.young.len() + self.old.len() <= 1
        {
            return None;
        }
        if let Some((key, weight)) = self.young.pop_lru() {
            self.young_total -= weight;
            return Some(key);
        }
        let (key, weight) = self.old.pop_lru()?;
        self.old_total -= weight;
        Some(key)
    }

    fn clear(&mut self) {
        self.young.clear();
        self.old.clear();
        self.young_total = 0;
        self.old_total = 0;
    }
}

/// Builds the policy for `cache_type` using the budget configured for `kind`.
pub fn policy_for(
    cache_type: CacheType,
    kind: EntityKind,
    options: &CacheOptions,
) -> Box<dyn EvictionPolicy> {
    let budget = match kind {
        EntityKind::Node => options.node_cache_bytes,
        EntityKind::Relationship => options.relationship_cache_bytes,
    };
    match cache_type {
        CacheType::None => Box::new(NoCache),
        CacheType::Weak => Box::new(WeakPolicy),
        CacheType::Soft => Box::new(SoftPolicy::new(budget)),
        CacheType::Strong => Box::new(StrongPolicy),
        CacheType::Gcr => Box::new(GenerationalPolicy::new(budget)),
    }
}
