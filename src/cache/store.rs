//! One entity cache: a key map, its eviction policy and single-flight loading.

use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use super::policy::{EvictionPolicy, Retention};
use crate::metrics::CacheMetrics;
use crate::options::CacheType;
use crate::types::{CacheError, EntityKind, Result};

/// Values stored in an [`EntityCache`] report their approximate size.
pub trait Weighted {
    /// Approximate heap footprint in bytes.
    fn weight(&self) -> usize;
}

enum FlightState<V> {
    Pending,
    Done(Result<Arc<V>>),
    Abandoned,
}

/// An in-flight load that concurrent callers wait on.
struct Flight<V> {
    state: Mutex<FlightState<V>>,
    done: Condvar,
}

impl<V> Flight<V> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FlightState::Pending),
            done: Condvar::new(),
        })
    }

    fn complete(&self, state: FlightState<V>) {
        *self.state.lock() = state;
        self.done.notify_all();
    }

    /// Blocks until the loader finished; `None` when it unwound without an outcome.
    fn wait(&self) -> Option<Result<Arc<V>>> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                FlightState::Pending => self.done.wait(&mut state),
                FlightState::Done(result) => return Some(result.clone()),
                FlightState::Abandoned => return None,
            }
        }
    }
}

/// Marks the flight abandoned if the loader unwinds before completing it.
struct FlightGuard<V> {
    flight: Arc<Flight<V>>,
    armed: bool,
}

impl<V> Drop for FlightGuard<V> {
    fn drop(&mut self) {
        if self.armed {
            self.flight.complete(FlightState::Abandoned);
        }
    }
}

enum Slot<V> {
    Strong(Arc<V>),
    Weak(Weak<V>),
    Loading(Arc<Flight<V>>),
}

/// Slot count below which dead weak slots are left for lookups to reap.
const MIN_SWEEP: usize = 64;

struct Inner<V> {
    slots: FxHashMap<u64, Slot<V>>,
    policy: Box<dyn EvictionPolicy>,
    /// Slot count at which the next store sweeps dead weak slots.
    sweep_at: usize,
}

impl<V> Inner<V> {
    /// Live value of `key`; a dead weak slot is dropped on the way.
    fn live(&mut self, key: u64) -> Option<Arc<V>> {
        let value = match self.slots.get(&key)? {
            Slot::Strong(value) => return Some(Arc::clone(value)),
            Slot::Weak(weak) => weak.upgrade(),
            Slot::Loading(_) => return None,
        };
        if value.is_none() {
            self.slots.remove(&key);
            self.policy.remove(key);
        }
        value
    }

    /// Drops every weak slot whose value is gone; returns how many.
    fn sweep(&mut self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| match slot {
            Slot::Weak(weak) => weak.strong_count() > 0,
            _ => true,
        });
        let swept = before - self.slots.len();
        self.sweep_at = (self.slots.len() * 2).max(MIN_SWEEP);
        swept
    }
}

enum Action<V> {
    Hit(Arc<V>),
    Wait(Arc<Flight<V>>),
    Load(Arc<Flight<V>>),
}

/// Concurrent cache of one entity kind.
///
/// At most one load per key is in flight; concurrent callers for the same key block on the
/// flight and share its outcome, errors included. Loads never run under the map lock.
pub(crate) struct EntityCache<V> {
    kind: EntityKind,
    inner: Mutex<Inner<V>>,
    metrics: Arc<dyn CacheMetrics>,
}

impl<V: Weighted + Send + Sync> EntityCache<V> {
    pub(crate) fn new(
        kind: EntityKind,
        policy: Box<dyn EvictionPolicy>,
        metrics: Arc<dyn CacheMetrics>,
    ) -> Self {
        Self {
            kind,
            inner: Mutex::new(Inner {
                slots: FxHashMap::default(),
                policy,
                sweep_at: MIN_SWEEP,
            }),
            metrics,
        }
    }

    /// Cached value for `key` without loading.
    pub(crate) fn get(&self, key: u64) -> Option<Arc<V>> {
        let mut inner = self.inner.lock();
        let value = inner.live(key);
        if let Some(value) = &value {
            inner.policy.touch(key, value.weight());
        }
        value
    }

    /// Cached value for `key`, loading it with `load` on a miss.
    pub(crate) fn get_or_load<F>(&self, key: u64, load: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Result<V>,
    {
        let mut load = Some(load);
        loop {
            let action = {
                let mut inner = self.inner.lock();
                let found = match inner.slots.get(&key) {
                    Some(Slot::Loading(flight)) => Some(Action::Wait(Arc::clone(flight))),
                    Some(_) => inner.live(key).map(Action::Hit),
                    None => None,
                };
                match found {
                    Some(Action::Hit(value)) => {
                        inner.policy.touch(key, value.weight());
                        Action::Hit(value)
                    }
                    Some(other) => other,
                    None => {
                        let flight = Flight::new();
                        inner
                            .slots
                            .insert(key, Slot::Loading(Arc::clone(&flight)));
                        Action::Load(flight)
                    }
                }
            };

            match action {
                Action::Hit(value) => {
                    self.metrics.cache_hit(self.kind);
                    trace!(kind = ?self.kind, id = key, "cache.hit");
                    return Ok(value);
                }
                Action::Wait(flight) => {
                    self.metrics.load_shared(self.kind);
                    match flight.wait() {
                        Some(result) => return result,
                        None => {
                            // The loader unwound without publishing; drop its slot and retry.
                            let mut inner = self.inner.lock();
                            let orphaned = matches!(
                                inner.slots.get(&key),
                                Some(Slot::Loading(current)) if Arc::ptr_eq(current, &flight)
                            );
                            if orphaned {
                                inner.slots.remove(&key);
                            }
                        }
                    }
                }
                Action::Load(flight) => {
                    self.metrics.cache_miss(self.kind);
                    trace!(kind = ?self.kind, id = key, "cache.miss");
                    let mut guard = FlightGuard {
                        flight: Arc::clone(&flight),
                        armed: true,
                    };
                    let result = match load.take() {
                        Some(load) => load().map(Arc::new),
                        None => Err(CacheError::Invalid("cache loader reused")),
                    };
                    self.finish_load(key, &flight, &result);
                    guard.armed = false;
                    flight.complete(FlightState::Done(result.clone()));
                    return result;
                }
            }
        }
    }

    fn finish_load(&self, key: u64, flight: &Arc<Flight<V>>, result: &Result<Arc<V>>) {
        let mut inner = self.inner.lock();
        let ours = matches!(
            inner.slots.get(&key),
            Some(Slot::Loading(current)) if Arc::ptr_eq(current, flight)
        );
        if !ours {
            // Evicted or cleared while loading; the caller keeps the value uncached.
            return;
        }
        inner.slots.remove(&key);
        if let Ok(value) = result {
            self.store(&mut inner, key, value);
        }
    }

    fn store(&self, inner: &mut Inner<V>, key: u64, value: &Arc<V>) {
        let slot = match inner.policy.retention() {
            Retention::None => return,
            Retention::Weak => Slot::Weak(Arc::downgrade(value)),
            Retention::Strong => Slot::Strong(Arc::clone(value)),
        };
        if inner.slots.len() >= inner.sweep_at {
            let swept = inner.sweep();
            if swept > 0 {
                trace!(kind = ?self.kind, swept, "cache.weak.sweep");
            }
        }
        inner.slots.insert(key, slot);
        inner.policy.insert(key, value.weight());
        while let Some(victim) = inner.policy.eviction_candidate() {
            if inner.slots.remove(&victim).is_some() {
                self.metrics.evicted(self.kind);
                trace!(kind = ?self.kind, id = victim, "cache.evict");
            }
        }
    }

    /// Inserts `value` unless `key` is already cached or loading.
    pub(crate) fn insert_if_absent(&self, key: u64, value: V) {
        let mut inner = self.inner.lock();
        let live = match inner.slots.get(&key) {
            Some(Slot::Weak(weak)) => weak.strong_count() > 0,
            Some(_) => true,
            None => false,
        };
        if !live {
            self.store(&mut inner, key, &Arc::new(value));
        }
    }

    /// Reports a changed weight of a cached value.
    pub(crate) fn reweigh(&self, key: u64, weight: usize) {
        let mut inner = self.inner.lock();
        if matches!(inner.slots.get(&key), Some(Slot::Strong(_))) {
            inner.policy.touch(key, weight);
            while let Some(victim) = inner.policy.eviction_candidate() {
                if inner.slots.remove(&victim).is_some() {
                    self.metrics.evicted(self.kind);
                }
            }
        }
    }

    /// Drops `key`, including an in-flight load's claim on it.
    pub(crate) fn remove(&self, key: u64) {
        let mut inner = self.inner.lock();
        inner.slots.remove(&key);
        inner.policy.remove(key);
    }

    /// Drops everything.
    pub(crate) fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.slots.clear();
        inner.policy.clear();
        inner.sweep_at = MIN_SWEEP;
    }

    /// Replaces the eviction policy; the cache starts empty.
    pub(crate) fn set_policy(&self, policy: Box<dyn EvictionPolicy>) {
        let mut inner = self.inner.lock();
        debug!(
            kind = ?self.kind,
            from = %inner.policy.cache_type(),
            to = %policy.cache_type(),
            "cache.policy.switch"
        );
        inner.slots.clear();
        inner.sweep_at = MIN_SWEEP;
        inner.policy = policy;
    }

    /// Active discipline.
    pub(crate) fn cache_type(&self) -> CacheType {
        self.inner.lock().policy.cache_type()
    }

    /// Number of cached (not loading) values.
    pub(crate) fn len(&self) -> usize {
        self.inner
            .lock()
            .slots
            .values()
            .filter(|slot| match slot {
                Slot::Strong(_) => true,
                Slot::Weak(weak) => weak.strong_count() > 0,
                Slot::Loading(_) => false,
            })
            .count()
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.inner.lock().slots.len()
    }
}
