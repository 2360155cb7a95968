#![allow(missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use graphcache::metrics::CounterMetrics;
use graphcache::props::{PropValue, PropertyChainObserver, RateLimitedObserver};
use graphcache::testkit::MemoryStore;
use graphcache::{
    CacheError, CacheManager, CacheOptions, EntityRef, LabelId, NodeId, PropId, Result, TypeId,
};

const NAME: PropId = PropId(1);
const AGE: PropId = PropId(2);
const PERSON: LabelId = LabelId(3);
const ADMIN: LabelId = LabelId(7);

#[derive(Clone, Default)]
struct Reports {
    count: Arc<AtomicUsize>,
    last: Arc<parking_lot::Mutex<Option<(EntityRef, PropId)>>>,
}

impl Reports {
    fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl PropertyChainObserver for Reports {
    fn duplicate_property_key(&self, entity: EntityRef, key: PropId) {
        self.count.fetch_add(1, Ordering::SeqCst);
        *self.last.lock() = Some((entity, key));
    }
}

fn quiet_cache(store: &Arc<MemoryStore>, metrics: Option<Arc<CounterMetrics>>) -> Result<CacheManager> {
    let ids = store.id_factory()?;
    let mut options = CacheOptions::new().log_duplicate_properties(false);
    if let Some(metrics) = metrics {
        options = options.metrics(metrics);
    }
    CacheManager::new(options, store.clone(), &ids)
}

fn node_with(store: &MemoryStore, props: &[(PropId, PropValue)]) -> Result<NodeId> {
    let node = store.add_node();
    for (key, value) in props {
        store.inject_property(node.into(), *key, value.clone())?;
    }
    Ok(node)
}

#[test]
fn duplicate_key_is_reported_once() -> Result<()> {
    let store = Arc::new(MemoryStore::new(50));
    let node = node_with(
        &store,
        &[
            (AGE, PropValue::Int(40)),
            (NAME, "first".into()),
            (NAME, "second".into()),
            (NAME, "third".into()),
        ],
    )?;
    let metrics = Arc::new(CounterMetrics::default());
    let cache = quiet_cache(&store, Some(metrics.clone()))?;
    let reports = Reports::default();
    cache.register_observer(Arc::new(reports.clone()));

    let chain = cache.node_properties(node)?;
    assert_eq!(reports.count(), 1, "one report per duplicated key");
    assert_eq!(*reports.last.lock(), Some((EntityRef::Node(node), NAME)));
    assert_eq!(metrics.duplicate_properties.load(Ordering::Relaxed), 1);
    assert_eq!(chain.len(), 2);
    assert_eq!(chain.get(NAME), Some(&PropValue::from("first")), "first entry wins");
    assert_eq!(chain.keys().collect::<Vec<_>>(), vec![NAME, AGE]);

    cache.node_properties(node)?;
    assert_eq!(reports.count(), 1, "cached chains are not verified again");
    Ok(())
}

#[test]
fn clean_chain_is_silent() -> Result<()> {
    let store = Arc::new(MemoryStore::new(50));
    let node = node_with(&store, &[(AGE, PropValue::Int(3)), (NAME, "n".into())])?;
    let cache = quiet_cache(&store, None)?;
    let reports = Reports::default();
    cache.register_observer(Arc::new(reports.clone()));

    let tx = cache.begin_tx();
    assert_eq!(cache.node_property(&tx, node, AGE)?, Some(PropValue::Int(3)));
    assert_eq!(cache.node_property(&tx, node, PropId(99))?, None);
    assert_eq!(reports.count(), 0);
    Ok(())
}

#[test]
fn rate_limited_reports_survive_reloads() -> Result<()> {
    let store = Arc::new(MemoryStore::new(50));
    let node = node_with(&store, &[(NAME, "a".into()), (NAME, "b".into())])?;
    let other = node_with(&store, &[(NAME, "c".into()), (NAME, "d".into())])?;
    let cache = quiet_cache(&store, None)?;
    let reports = Reports::default();
    cache.register_observer(Arc::new(RateLimitedObserver::new(
        reports.clone(),
        Duration::from_secs(3600),
    )));

    for _ in 0..3 {
        cache.node_properties(node)?;
        cache.clear_cache();
    }
    assert_eq!(reports.count(), 1);

    cache.node_properties(other)?;
    assert_eq!(reports.count(), 2, "the same key on another node is its own report");
    assert_eq!(*reports.last.lock(), Some((EntityRef::Node(other), NAME)));
    Ok(())
}

#[test]
fn relationship_properties_are_verified_too() -> Result<()> {
    let store = Arc::new(MemoryStore::new(50));
    let a = store.add_node();
    let b = store.add_node();
    let rel = store.add_relationship(a, b, TypeId(1))?;
    store.inject_property(rel.into(), AGE, PropValue::Int(1))?;
    store.inject_property(rel.into(), AGE, PropValue::Int(2))?;
    let cache = quiet_cache(&store, None)?;
    let reports = Reports::default();
    cache.register_observer(Arc::new(reports.clone()));

    let tx = cache.begin_tx();
    assert_eq!(cache.relationship_property(&tx, rel, AGE)?, Some(PropValue::Int(1)));
    assert_eq!(reports.count(), 1);
    assert_eq!(*reports.last.lock(), Some((EntityRef::Relationship(rel), AGE)));
    Ok(())
}

#[test]
fn transaction_property_overlay() -> Result<()> {
    let store = Arc::new(MemoryStore::new(50));
    let node = node_with(&store, &[(NAME, "old".into()), (AGE, PropValue::Int(1))])?;
    let cache = quiet_cache(&store, None)?;
    let loaded = cache.node_properties(node)?;

    let mut tx = cache.begin_tx();
    tx.set_property(node.into(), NAME, "new".into())?;
    tx.remove_property(node.into(), AGE)?;
    assert_eq!(cache.node_property(&tx, node, NAME)?, Some(PropValue::from("new")));
    assert_eq!(cache.node_property(&tx, node, AGE)?, None);

    let other = cache.begin_tx();
    assert_eq!(cache.node_property(&other, node, NAME)?, Some(PropValue::from("old")));

    cache.commit(tx)?;
    let refreshed = cache.node_properties(node)?;
    assert!(!Arc::ptr_eq(&loaded, &refreshed), "commit publishes a new chain");
    assert_eq!(refreshed.get(NAME), Some(&PropValue::from("new")));
    assert_eq!(refreshed.get(AGE), None);
    assert_eq!(loaded.get(AGE), Some(&PropValue::Int(1)), "old snapshot is untouched");

    cache.clear_cache();
    assert_eq!(*cache.node_properties(node)?, *refreshed, "store agrees with the cache");
    Ok(())
}

#[test]
fn properties_of_deleted_entities() -> Result<()> {
    let store = Arc::new(MemoryStore::new(50));
    let node = node_with(&store, &[(NAME, "x".into())])?;
    let cache = quiet_cache(&store, None)?;

    let mut tx = cache.begin_tx();
    tx.delete_node(node)?;
    assert!(matches!(
        cache.node_property(&tx, node, NAME),
        Err(CacheError::NotFound(EntityRef::Node(id))) if id == node
    ));
    assert!(matches!(
        tx.set_property(node.into(), NAME, PropValue::Null),
        Err(CacheError::NotFound(_))
    ));

    let created = tx.create_node()?;
    tx.set_property(created.into(), AGE, PropValue::Bool(true))?;
    assert_eq!(cache.node_property(&tx, created, AGE)?, Some(PropValue::Bool(true)));
    assert_eq!(cache.node_property(&tx, created, NAME)?, None);
    Ok(())
}

#[test]
fn labels_follow_the_transaction() -> Result<()> {
    let store = Arc::new(MemoryStore::new(50));
    let node = store.add_node();
    store.add_label(node, ADMIN)?;
    store.add_label(node, PERSON)?;
    let cache = quiet_cache(&store, None)?;

    let mut tx = cache.begin_tx();
    assert_eq!(cache.node_labels(&tx, node)?, vec![PERSON, ADMIN]);
    assert!(cache.has_label(&tx, node, ADMIN)?);

    tx.remove_label(node, ADMIN)?;
    tx.add_label(node, LabelId(5))?;
    assert_eq!(cache.node_labels(&tx, node)?, vec![PERSON, LabelId(5)]);
    assert!(!cache.has_label(&tx, node, ADMIN)?);

    let other = cache.begin_tx();
    assert!(cache.has_label(&other, node, ADMIN)?);

    cache.commit(tx)?;
    let reader = cache.begin_tx();
    assert_eq!(cache.node_labels(&reader, node)?, vec![PERSON, LabelId(5)]);
    cache.clear_cache();
    assert_eq!(cache.node_labels(&reader, node)?, vec![PERSON, LabelId(5)]);
    Ok(())
}
