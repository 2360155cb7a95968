//! Duplicate key detection for sorted property chains.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::types::{EntityRef, PropId};

/// Default quiet period between two reports of the same key on the same entity.
pub const DEFAULT_DUPLICATE_COOLDOWN: Duration = Duration::from_secs(2 * 60 * 60);

/// Stamp count at which expired cooldowns are pruned.
const PRUNE_AT: usize = 1024;

/// Receives duplicate property key reports.
pub trait PropertyChainObserver: Send + Sync {
    /// `key` occurs more than once in the property chain of `entity`.
    fn duplicate_property_key(&self, entity: EntityRef, key: PropId);
}

/// Emits a `warn` event per report.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingObserver;

impl PropertyChainObserver for LoggingObserver {
    fn duplicate_property_key(&self, entity: EntityRef, key: PropId) {
        warn!(
            entity = %entity,
            key = key.0,
            "props.chain.duplicate_key"
        );
    }
}

/// Forwards at most one report per (entity, key) pair within `cooldown`.
pub struct RateLimitedObserver<O> {
    inner: O,
    cooldown: Duration,
    last: Mutex<FxHashMap<(EntityRef, PropId), Instant>>,
}

impl<O: PropertyChainObserver> RateLimitedObserver<O> {
    /// Wraps `inner` with the given cooldown.
    pub fn new(inner: O, cooldown: Duration) -> Self {
        Self {
            inner,
            cooldown,
            last: Mutex::new(FxHashMap::default()),
        }
    }

    /// Wrapped observer.
    pub fn inner(&self) -> &O {
        &self.inner
    }

    fn admit(&self, entity: EntityRef, key: PropId, now: Instant) -> bool {
        let mut last = self.last.lock();
        // Expired stamps would otherwise accumulate one per corrupted entity.
        if last.len() >= PRUNE_AT {
            last.retain(|_, at| now.saturating_duration_since(*at) < self.cooldown);
        }
        match last.get(&(entity, key)) {
            Some(at) if now.saturating_duration_since(*at) < self.cooldown => false,
            _ => {
                last.insert((entity, key), now);
                true
            }
        }
    }
}

impl<O: PropertyChainObserver> PropertyChainObserver for RateLimitedObserver<O> {
    fn duplicate_property_key(&self, entity: EntityRef, key: PropId) {
        if self.admit(entity, key, Instant::now()) {
            self.inner.duplicate_property_key(entity, key);
        }
    }
}

/// Fan-out to every registered observer.
#[derive(Default)]
pub struct PropertyChainObservers {
    observers: RwLock<Vec<Arc<dyn PropertyChainObserver>>>,
}

impl PropertyChainObservers {
    /// Adds an observer; it receives every later report.
    pub fn register(&self, observer: Arc<dyn PropertyChainObserver>) {
        self.observers.write().push(observer);
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    /// True when nobody listens.
    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }
}

impl PropertyChainObserver for PropertyChainObservers {
    fn duplicate_property_key(&self, entity: EntityRef, key: PropId) {
        for observer in self.observers.read().iter() {
            observer.duplicate_property_key(entity, key);
        }
    }
}

/// Scans a chain sorted by key for adjacent equal keys.
///
/// Every distinct duplicated key is reported once, however often it repeats; scanning always
/// runs to the end. Returns the number of distinct duplicated keys.
pub fn verify_sorted_property_chain<V>(
    entity: EntityRef,
    entries: &[(PropId, V)],
    observer: &dyn PropertyChainObserver,
) -> usize {
    let mut reported: Option<PropId> = None;
    let mut duplicates = 0;
    for pair in entries.windows(2) {
        let key = pair[0].0;
        debug_assert!(key <= pair[1].0, "property chain is not sorted");
        if key == pair[1].0 && reported != Some(key) {
            observer.duplicate_property_key(entity, key);
            reported = Some(key);
            duplicates += 1;
        }
    }
    duplicates
}
