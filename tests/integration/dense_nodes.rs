#![allow(missing_docs)]

use std::collections::HashSet;
use std::sync::Arc;

use graphcache::chain::{ChainKey, LoadState};
use graphcache::testkit::MemoryStore;
use graphcache::{CacheManager, CacheOptions, Dir, NodeId, RelDir, RelId, Result, TypeId};

const THRESHOLD: usize = 50;
const KNOWS: TypeId = TypeId(1);
const LIKES: TypeId = TypeId(2);

fn cache_over(store: &Arc<MemoryStore>, grab: usize) -> Result<CacheManager> {
    let ids = store.id_factory()?;
    CacheManager::new(
        CacheOptions::new().grab_size(grab).dense_threshold(THRESHOLD),
        store.clone(),
        &ids,
    )
}

fn hub_with_outgoing(store: &MemoryStore, count: usize, ty: TypeId) -> Result<NodeId> {
    let hub = store.add_node();
    for _ in 0..count {
        let leaf = store.add_node();
        store.add_relationship(hub, leaf, ty)?;
    }
    Ok(hub)
}

fn ids(
    cache: &CacheManager,
    node: NodeId,
    types: Option<&[TypeId]>,
    dir: Dir,
) -> Result<Vec<RelId>> {
    let tx = cache.begin_tx();
    let ids = cache.relationships(&tx, node, types, dir)?.collect::<Result<Vec<_>>>()?;
    Ok(ids)
}

#[test]
fn incoming_on_outgoing_only_hub_is_empty() -> Result<()> {
    for count in [THRESHOLD + 1, THRESHOLD + 2, THRESHOLD + 37, THRESHOLD + 500, THRESHOLD + 1000] {
        let store = Arc::new(MemoryStore::new(THRESHOLD));
        let hub = hub_with_outgoing(&store, count, KNOWS)?;
        let cache = cache_over(&store, 100)?;

        let incoming = ids(&cache, hub, Some(&[KNOWS][..]), Dir::In)?;
        assert!(incoming.is_empty(), "hub of {count} reported incoming {incoming:?}");

        let entry = cache.node(hub)?;
        assert!(entry.is_dense());
        assert_eq!(
            entry.chains().position().state(ChainKey::new(KNOWS, RelDir::In)),
            LoadState::FullyLoaded,
            "incoming chain should be probed"
        );

        let outgoing = ids(&cache, hub, Some(&[KNOWS][..]), Dir::Out)?;
        assert_eq!(outgoing.len(), count);
        let unique: HashSet<_> = outgoing.iter().copied().collect();
        assert_eq!(unique.len(), count, "no relationship may repeat");

        let incoming = ids(&cache, hub, Some(&[KNOWS][..]), Dir::In)?;
        assert!(incoming.is_empty());
    }
    Ok(())
}

#[test]
fn outgoing_first_then_incoming() -> Result<()> {
    let store = Arc::new(MemoryStore::new(THRESHOLD));
    let hub = hub_with_outgoing(&store, THRESHOLD + 10, KNOWS)?;
    let cache = cache_over(&store, 7)?;

    assert_eq!(ids(&cache, hub, Some(&[KNOWS][..]), Dir::Out)?.len(), THRESHOLD + 10);
    assert!(ids(&cache, hub, Some(&[KNOWS][..]), Dir::In)?.is_empty());
    assert_eq!(ids(&cache, hub, None, Dir::Both)?.len(), THRESHOLD + 10);
    Ok(())
}

#[test]
fn untyped_reads_cover_every_chain() -> Result<()> {
    let store = Arc::new(MemoryStore::from_options(
        &CacheOptions::new().dense_threshold(THRESHOLD),
    ));
    let hub = hub_with_outgoing(&store, THRESHOLD, KNOWS)?;
    let fan = store.add_node();
    for _ in 0..5 {
        store.add_relationship(fan, hub, LIKES)?;
    }
    store.add_relationship(hub, hub, LIKES)?;
    let cache = cache_over(&store, 16)?;
    assert!(cache.node(hub)?.is_dense());

    assert_eq!(ids(&cache, hub, None, Dir::In)?.len(), 6, "five incoming plus the loop");
    assert_eq!(ids(&cache, hub, None, Dir::Out)?.len(), THRESHOLD + 1);
    assert_eq!(ids(&cache, hub, None, Dir::Both)?.len(), THRESHOLD + 6);
    assert_eq!(ids(&cache, hub, Some(&[LIKES][..]), Dir::Out)?.len(), 1);
    Ok(())
}

#[test]
fn unknown_type_reads_nothing() -> Result<()> {
    let store = Arc::new(MemoryStore::new(THRESHOLD));
    let hub = hub_with_outgoing(&store, THRESHOLD + 1, KNOWS)?;
    let cache = cache_over(&store, 100)?;
    let before = store.chain_reads();
    assert!(ids(&cache, hub, Some(&[TypeId(9)][..]), Dir::Both)?.is_empty());
    assert_eq!(
        store.chain_reads() - before,
        3,
        "each slot of the unknown type is probed once"
    );
    assert!(ids(&cache, hub, Some(&[TypeId(9)][..]), Dir::Both)?.is_empty());
    assert_eq!(store.chain_reads() - before, 3, "probed chains are not read again");
    Ok(())
}

#[test]
fn node_turning_dense_mid_iteration() -> Result<()> {
    let store = Arc::new(MemoryStore::new(5));
    let hub = hub_with_outgoing(&store, 5, KNOWS)?;
    let leaf = store.add_node();
    let ids_store = store.id_factory()?;
    let cache = CacheManager::new(
        CacheOptions::new().grab_size(2).dense_threshold(5),
        store.clone(),
        &ids_store,
    )?;

    let reader = cache.begin_tx();
    let mut iter = cache.relationships(&reader, hub, None, Dir::Both)?;
    let mut seen = Vec::new();
    for _ in 0..2 {
        seen.push(iter.next().expect("first page")?);
    }
    assert!(!cache.node(hub)?.is_dense());

    let mut writer = cache.begin_tx();
    let added = writer.create_relationship(hub, leaf, KNOWS)?;
    cache.commit(writer)?;
    assert!(store.node_record(hub).is_some_and(|record| record.dense));

    for id in iter {
        seen.push(id?);
    }
    let unique: HashSet<_> = seen.iter().copied().collect();
    assert_eq!(unique.len(), seen.len(), "ids repeated across the switch: {seen:?}");
    assert_eq!(seen.len(), 6);
    assert!(unique.contains(&added));
    assert!(cache.node(hub)?.is_dense());
    Ok(())
}

#[test]
fn cache_options_set_the_threshold() -> Result<()> {
    let store = Arc::new(MemoryStore::new(10_000));
    let hub = store.add_node();
    let leaf = store.add_node();
    let cache = cache_over(&store, 16)?;

    let mut tx = cache.begin_tx();
    for _ in 0..=THRESHOLD {
        tx.create_relationship(hub, leaf, KNOWS)?;
    }
    cache.commit(tx)?;

    assert!(store.node_record(hub).is_some_and(|record| record.dense));
    assert!(cache.node(hub)?.is_dense());
    assert_eq!(ids(&cache, hub, Some(&[KNOWS][..]), Dir::Out)?.len(), THRESHOLD + 1);
    Ok(())
}
