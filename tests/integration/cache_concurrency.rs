#![allow(missing_docs)]

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use graphcache::cache::CachedEntity;
use graphcache::metrics::CounterMetrics;
use graphcache::persistence::CacheUpdateListener;
use graphcache::testkit::MemoryStore;
use graphcache::{
    CacheError, CacheManager, CacheOptions, CacheType, Dir, EntityKind, EntityRef, NodeId, RelId,
    Result, TypeId,
};

const KNOWS: TypeId = TypeId(1);

fn cache_with(
    store: &Arc<MemoryStore>,
    options: CacheOptions,
) -> Result<(CacheManager, Arc<CounterMetrics>)> {
    let metrics = Arc::new(CounterMetrics::default());
    let ids = store.id_factory()?;
    let cache = CacheManager::new(options.metrics(metrics.clone()), store.clone(), &ids)?;
    Ok((cache, metrics))
}

#[derive(Default)]
struct Recorder {
    nodes: Mutex<Vec<NodeId>>,
    rels: Mutex<Vec<RelId>>,
}

impl CacheUpdateListener for Recorder {
    fn node_refreshed(&self, node: NodeId) {
        self.nodes.lock().push(node);
    }

    fn relationship_refreshed(&self, rel: RelId) {
        self.rels.lock().push(rel);
    }
}

#[test]
fn concurrent_misses_share_one_load() -> Result<()> {
    const THREADS: usize = 8;
    let store = Arc::new(MemoryStore::new(50));
    let node = store.add_node();
    store.set_load_delay(Some(Duration::from_millis(50)));
    let (cache, metrics) = cache_with(&store, CacheOptions::new())?;
    let barrier = Barrier::new(THREADS);

    let entries = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    cache.node(node)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("reader panicked"))
            .collect::<Result<Vec<_>>>()
    })?;

    assert_eq!(store.node_loads(), 1, "one store read for all callers");
    assert!(entries.iter().all(|entry| Arc::ptr_eq(entry, &entries[0])));
    assert_eq!(metrics.node_misses.load(Ordering::Relaxed), 1);
    assert_eq!(
        metrics.node_hits.load(Ordering::Relaxed) + metrics.shared_loads.load(Ordering::Relaxed),
        (THREADS - 1) as u64
    );
    Ok(())
}

#[test]
fn failed_loads_are_not_cached() -> Result<()> {
    let store = Arc::new(MemoryStore::new(50));
    store.set_load_delay(Some(Duration::from_millis(20)));
    let (cache, _) = cache_with(&store, CacheOptions::new())?;
    let missing = NodeId(42);

    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4).map(|_| scope.spawn(|| cache.node(missing))).collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("reader panicked"))
            .collect()
    });
    for result in results {
        assert!(matches!(result, Err(CacheError::NotFound(_))));
    }
    assert_eq!(cache.cached_len(EntityKind::Node), 0);

    let loads = store.node_loads();
    assert!(cache.node(missing).is_err());
    assert_eq!(store.node_loads(), loads + 1, "a failure is retried on the next lookup");
    Ok(())
}

#[test]
fn cache_types_control_retention() -> Result<()> {
    let store = Arc::new(MemoryStore::new(50));
    let a = store.add_node();
    let b = store.add_node();
    let (cache, _) = cache_with(&store, CacheOptions::new().cache_type(CacheType::Strong))?;

    cache.node(a)?;
    cache.node(a)?;
    assert_eq!(store.node_loads(), 1);

    cache.apply_cache_type(CacheType::None);
    assert_eq!(cache.cache_type(EntityKind::Node), CacheType::None);
    assert_eq!(cache.cache_type(EntityKind::Relationship), CacheType::None);
    cache.node(a)?;
    cache.node(a)?;
    assert_eq!(store.node_loads(), 3, "nothing is retained");
    assert_eq!(cache.cached_len(EntityKind::Node), 0);

    cache.apply_cache_type_for(EntityKind::Node, CacheType::Weak);
    let held = cache.node(a)?;
    cache.node(a)?;
    assert_eq!(store.node_loads(), 4, "weak entries live while referenced");
    drop(held);
    cache.node(a)?;
    assert_eq!(store.node_loads(), 5, "and are reloaded once dropped");

    cache.apply_cache_type_for(EntityKind::Node, CacheType::Gcr);
    cache.node(a)?;
    cache.node(b)?;
    cache.node(a)?;
    assert_eq!(store.node_loads(), 7);
    assert_eq!(cache.cached_len(EntityKind::Node), 2);
    Ok(())
}

#[test]
fn soft_budget_evicts_least_recent() -> Result<()> {
    let store = Arc::new(MemoryStore::new(50));
    let a = store.add_node();
    let b = store.add_node();
    let (cache, metrics) = cache_with(
        &store,
        CacheOptions::new()
            .cache_type(CacheType::Soft)
            .node_cache_bytes(1),
    )?;

    cache.node(a)?;
    cache.node(b)?;
    assert_eq!(cache.cached_len(EntityKind::Node), 1);
    assert_eq!(metrics.evictions.load(Ordering::Relaxed), 1);
    cache.node(b)?;
    assert_eq!(store.node_loads(), 2);
    cache.node(a)?;
    assert_eq!(store.node_loads(), 3, "the older entry was evicted");
    Ok(())
}

#[test]
fn generic_lookup_by_kind() -> Result<()> {
    let store = Arc::new(MemoryStore::new(50));
    let a = store.add_node();
    let rel = store.add_relationship(a, a, KNOWS)?;
    let (cache, _) = cache_with(&store, CacheOptions::new())?;

    match cache.get_or_load(EntityKind::Node, a.0)? {
        CachedEntity::Node(entry) => assert_eq!(entry.id(), a),
        CachedEntity::Relationship(_) => panic!("node lookup returned a relationship"),
    }
    let entity = cache.get_or_load(EntityKind::Relationship, rel.0)?;
    assert_eq!(entity.entity(), EntityRef::Relationship(rel));
    assert!(matches!(
        cache.get_or_load(EntityKind::Relationship, 99),
        Err(CacheError::NotFound(_))
    ));
    Ok(())
}

#[test]
fn listeners_hear_about_cached_entries_only() -> Result<()> {
    let store = Arc::new(MemoryStore::new(50));
    let a = store.add_node();
    let b = store.add_node();
    let old = store.add_relationship(a, b, KNOWS)?;
    let (cache, _) = cache_with(&store, CacheOptions::new())?;
    let recorder = Arc::new(Recorder::default());
    cache.add_listener(recorder.clone());
    cache.node(a)?;

    let mut tx = cache.begin_tx();
    let record = cache.relationship(&tx, old)?;
    tx.delete_relationship(&record)?;
    tx.create_relationship(a, b, KNOWS)?;
    cache.commit(tx)?;

    assert_eq!(*recorder.nodes.lock(), vec![a]);
    assert_eq!(*recorder.rels.lock(), vec![old]);

    cache.commit(cache.begin_tx())?;
    assert_eq!(recorder.nodes.lock().len(), 1, "empty commits notify nobody");
    Ok(())
}

#[test]
fn readers_during_commits() -> Result<()> {
    const READERS: usize = 4;
    const WRITES: usize = 40;
    let store = Arc::new(MemoryStore::new(16));
    let hub = store.add_node();
    let leaf = store.add_node();
    for _ in 0..20 {
        store.add_relationship(hub, leaf, KNOWS)?;
    }
    let (cache, _) = cache_with(&store, CacheOptions::new().grab_size(3).dense_threshold(16))?;

    thread::scope(|scope| -> Result<()> {
        let readers: Vec<_> = (0..READERS)
            .map(|_| {
                scope.spawn(|| -> Result<usize> {
                    let mut last = 0;
                    for _ in 0..25 {
                        let tx = cache.begin_tx();
                        let ids: Vec<RelId> = cache
                            .relationships(&tx, hub, Some(&[KNOWS][..]), Dir::Both)?
                            .collect::<Result<_>>()?;
                        let unique: HashSet<_> = ids.iter().collect();
                        assert_eq!(unique.len(), ids.len(), "repeated ids in one pass");
                        assert!(ids.len() >= last, "a later pass lost relationships");
                        last = ids.len();
                    }
                    Ok(last)
                })
            })
            .collect();

        for _ in 0..WRITES {
            let mut tx = cache.begin_tx();
            tx.create_relationship(hub, leaf, KNOWS)?;
            cache.commit(tx)?;
        }
        for reader in readers {
            let seen = reader.join().expect("reader panicked")?;
            assert!(seen >= 20);
        }
        Ok(())
    })?;

    let tx = cache.begin_tx();
    let all = cache
        .relationships(&tx, hub, None, Dir::Out)?
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(all.len(), 20 + WRITES);
    assert_eq!(cache.node(hub)?.chains().loaded_len(Dir::Both), 20 + WRITES);
    Ok(())
}
