#![allow(missing_docs)]

use std::collections::HashSet;
use std::sync::Arc;

use graphcache::testkit::MemoryStore;
use graphcache::{
    CacheError, CacheManager, CacheOptions, CacheType, Dir, EntityKind, EntityRef, NodeId, RelId,
    Result, TxState, TypeId,
};

const KNOWS: TypeId = TypeId(1);
const FOLLOWS: TypeId = TypeId(2);

fn cache_over(store: &Arc<MemoryStore>, grab: usize) -> Result<CacheManager> {
    let ids = store.id_factory()?;
    CacheManager::new(
        CacheOptions::new()
            .grab_size(grab)
            .dense_threshold(10_000)
            .cache_type(CacheType::Strong),
        store.clone(),
        &ids,
    )
}

/// `count` relationships `a -> b`, oldest first.
fn pair_with(store: &MemoryStore, count: usize) -> Result<(NodeId, NodeId, Vec<RelId>)> {
    let a = store.add_node();
    let b = store.add_node();
    let mut rels = Vec::new();
    for _ in 0..count {
        rels.push(store.add_relationship(a, b, KNOWS)?);
    }
    Ok((a, b, rels))
}

fn collect(cache: &CacheManager, tx: &TxState, node: NodeId, dir: Dir) -> Result<Vec<RelId>> {
    cache.relationships(tx, node, None, dir)?.collect()
}

fn as_set(ids: &[RelId]) -> HashSet<RelId> {
    ids.iter().copied().collect()
}

#[test]
fn chains_load_in_pages() -> Result<()> {
    let store = Arc::new(MemoryStore::new(10_000));
    let (a, b, rels) = pair_with(&store, 250)?;
    let cache = cache_over(&store, 100)?;
    let tx = cache.begin_tx();

    let out = collect(&cache, &tx, a, Dir::Out)?;
    assert_eq!(out.len(), 250);
    assert_eq!(as_set(&out), as_set(&rels));
    assert_eq!(store.chain_reads(), 3, "pages of 100, 100 and 50");
    assert_eq!(out.first(), rels.last(), "chains read newest first");

    assert_eq!(collect(&cache, &tx, a, Dir::Both)?, out);
    assert_eq!(store.chain_reads(), 3, "a loaded chain is served from the cache");
    assert!(collect(&cache, &tx, a, Dir::In)?.is_empty());
    assert_eq!(collect(&cache, &tx, b, Dir::In)?.len(), 250);
    assert_eq!(cache.cached_len(EntityKind::Relationship), 250);
    Ok(())
}

#[test]
fn transaction_sees_its_own_changes_only() -> Result<()> {
    let store = Arc::new(MemoryStore::new(10_000));
    let (a, b, rels) = pair_with(&store, 3)?;
    let cache = cache_over(&store, 2)?;

    let mut tx = cache.begin_tx();
    let gone = cache.relationship(&tx, rels[1])?;
    tx.delete_relationship(&gone)?;
    let first = tx.create_relationship(a, b, KNOWS)?;
    let second = tx.create_relationship(b, a, KNOWS)?;

    let out = collect(&cache, &tx, a, Dir::Out)?;
    assert_eq!(out, vec![rels[2], rels[0], first]);
    let incoming = collect(&cache, &tx, a, Dir::In)?;
    assert_eq!(incoming, vec![second]);
    assert!(matches!(
        cache.relationship(&tx, rels[1]),
        Err(CacheError::NotFound(EntityRef::Relationship(id))) if id == rels[1]
    ));
    assert_eq!(cache.relationship(&tx, first)?.start, a);

    let other = cache.begin_tx();
    assert_eq!(as_set(&collect(&cache, &other, a, Dir::Both)?), as_set(&rels));
    Ok(())
}

#[test]
fn commit_updates_loaded_chains_in_place() -> Result<()> {
    let store = Arc::new(MemoryStore::new(10_000));
    let (a, b, rels) = pair_with(&store, 4)?;
    let cache = cache_over(&store, 10)?;
    let reader = cache.begin_tx();
    assert_eq!(collect(&cache, &reader, a, Dir::Both)?.len(), 4);
    let reads = store.chain_reads();

    let mut tx = cache.begin_tx();
    let gone = cache.relationship(&tx, rels[0])?;
    tx.delete_relationship(&gone)?;
    let added = [
        tx.create_relationship(a, b, KNOWS)?,
        tx.create_relationship(a, b, FOLLOWS)?,
    ];
    cache.commit(tx)?;

    let after = collect(&cache, &reader, a, Dir::Both)?;
    assert_eq!(store.chain_reads(), reads, "commit refreshed the cached chain");
    let expected: HashSet<RelId> = rels[1..].iter().chain(&added).copied().collect();
    assert_eq!(as_set(&after), expected);
    assert_eq!(after.len(), 5);
    assert_eq!(cache.node(a)?.chains().loaded_len(Dir::Both), 5);
    assert!(matches!(
        cache.relationship(&reader, rels[0]),
        Err(CacheError::NotFound(_))
    ));
    Ok(())
}

#[test]
fn commit_leaves_unread_chains_to_the_store() -> Result<()> {
    let store = Arc::new(MemoryStore::new(10_000));
    let (a, b, _) = pair_with(&store, 3)?;
    let cache = cache_over(&store, 10)?;
    cache.node(a)?;

    let mut tx = cache.begin_tx();
    tx.create_relationship(a, b, KNOWS)?;
    cache.commit(tx)?;

    let reader = cache.begin_tx();
    let out = collect(&cache, &reader, a, Dir::Out)?;
    assert_eq!(out.len(), 4);
    assert_eq!(cache.node(a)?.chains().loaded_len(Dir::Both), 4);
    Ok(())
}

#[test]
fn commit_during_partial_load() -> Result<()> {
    let store = Arc::new(MemoryStore::new(10_000));
    let (a, b, rels) = pair_with(&store, 5)?;
    let cache = cache_over(&store, 2)?;

    let reader = cache.begin_tx();
    let mut iter = cache.relationships(&reader, a, None, Dir::Out)?;
    let mut seen = vec![iter.next().expect("first id")?];

    let mut tx = cache.begin_tx();
    let added = tx.create_relationship(a, b, KNOWS)?;
    cache.commit(tx)?;

    for id in iter {
        seen.push(id?);
    }
    let unique = as_set(&seen);
    assert_eq!(unique.len(), seen.len(), "repeated ids: {seen:?}");
    let mut expected = as_set(&rels);
    expected.insert(added);
    assert_eq!(unique, expected);
    assert_eq!(cache.node(a)?.chains().loaded_len(Dir::Both), 6);
    Ok(())
}

#[test]
fn vanished_record_stops_iteration() -> Result<()> {
    let store = Arc::new(MemoryStore::new(10_000));
    let (a, _, rels) = pair_with(&store, 5)?;
    let cache = cache_over(&store, 2)?;
    let tx = cache.begin_tx();

    let mut iter = cache.relationships(&tx, a, None, Dir::Out)?;
    assert_eq!(iter.next().transpose()?, Some(rels[4]));
    assert_eq!(iter.next().transpose()?, Some(rels[3]));
    assert!(store.vanish_relationship(rels[2]));

    match iter.next() {
        Some(Err(err)) => {
            assert!(err.is_concurrent_deletion(), "unexpected error {err}");
            assert!(matches!(err, CacheError::ConcurrentlyDeleted(EntityRef::Node(node)) if node == a));
        }
        other => panic!("expected a concurrent deletion, got {other:?}"),
    }
    assert!(iter.next().is_none(), "iterator is exhausted after an error");
    Ok(())
}

#[test]
fn deleted_cursor_record_is_skipped() -> Result<()> {
    let store = Arc::new(MemoryStore::new(10_000));
    let (a, _, rels) = pair_with(&store, 5)?;
    let cache = cache_over(&store, 2)?;

    {
        let reader = cache.begin_tx();
        let first: Vec<RelId> = cache
            .relationships(&reader, a, None, Dir::Out)?
            .take(2)
            .collect::<Result<_>>()?;
        assert_eq!(first, vec![rels[4], rels[3]]);
    }

    let mut tx = cache.begin_tx();
    let parked = cache.relationship(&tx, rels[2])?;
    tx.delete_relationship(&parked)?;
    cache.commit(tx)?;

    let reader = cache.begin_tx();
    let all = collect(&cache, &reader, a, Dir::Out)?;
    assert_eq!(all, vec![rels[4], rels[3], rels[1], rels[0]]);
    Ok(())
}

#[test]
fn single_relationship_lookup() -> Result<()> {
    let store = Arc::new(MemoryStore::new(10_000));
    let a = store.add_node();
    let b = store.add_node();
    let follows = store.add_relationship(a, b, FOLLOWS)?;
    let cache = cache_over(&store, 10)?;

    let mut tx = cache.begin_tx();
    assert_eq!(cache.single_relationship(&tx, a, FOLLOWS, Dir::Out)?, Some(follows));
    assert_eq!(cache.single_relationship(&tx, a, FOLLOWS, Dir::In)?, None);
    assert_eq!(cache.single_relationship(&tx, a, KNOWS, Dir::Both)?, None);

    tx.create_relationship(a, b, FOLLOWS)?;
    assert!(matches!(
        cache.single_relationship(&tx, a, FOLLOWS, Dir::Out),
        Err(CacheError::MoreThanOneRelationship { node, ty: FOLLOWS, dir: Dir::Out }) if node == a
    ));
    Ok(())
}

#[test]
fn loops_are_reported_once() -> Result<()> {
    let store = Arc::new(MemoryStore::new(10_000));
    let a = store.add_node();
    let b = store.add_node();
    let self_loop = store.add_relationship(a, a, KNOWS)?;
    let out = store.add_relationship(a, b, KNOWS)?;
    let cache = cache_over(&store, 10)?;
    let tx = cache.begin_tx();

    assert_eq!(as_set(&collect(&cache, &tx, a, Dir::Out)?), as_set(&[self_loop, out]));
    assert_eq!(collect(&cache, &tx, a, Dir::In)?, vec![self_loop]);
    assert_eq!(collect(&cache, &tx, a, Dir::Both)?.len(), 2);
    Ok(())
}

#[test]
fn created_nodes_and_their_relationships() -> Result<()> {
    let store = Arc::new(MemoryStore::new(10_000));
    let existing = store.add_node();
    let cache = cache_over(&store, 10)?;

    let mut tx = cache.begin_tx();
    let fresh = tx.create_node()?;
    let rel = tx.create_relationship(fresh, existing, KNOWS)?;
    assert_eq!(collect(&cache, &tx, fresh, Dir::Out)?, vec![rel]);
    assert_eq!(collect(&cache, &tx, existing, Dir::In)?, vec![rel]);
    assert!(matches!(cache.node(fresh), Err(CacheError::NotFound(_))));
    cache.commit(tx)?;

    let reader = cache.begin_tx();
    assert_eq!(collect(&cache, &reader, fresh, Dir::Both)?, vec![rel]);
    assert_eq!(collect(&cache, &reader, existing, Dir::Both)?, vec![rel]);
    Ok(())
}

#[test]
fn deleting_a_connected_node_fails_atomically() -> Result<()> {
    let store = Arc::new(MemoryStore::new(10_000));
    let (a, b, rels) = pair_with(&store, 2)?;
    let cache = cache_over(&store, 10)?;

    let mut tx = cache.begin_tx();
    let first = cache.relationship(&tx, rels[0])?;
    tx.delete_relationship(&first)?;
    tx.delete_node(a)?;
    assert!(matches!(cache.commit(tx), Err(CacheError::Invalid(_))));
    assert!(store.node_record(a).is_some());
    assert_eq!(store.degree(a), 2, "rejected batch left the store untouched");

    let mut tx = cache.begin_tx();
    for rel in &rels {
        let record = cache.relationship(&tx, *rel)?;
        tx.delete_relationship(&record)?;
    }
    tx.delete_node(a)?;
    cache.commit(tx)?;
    assert!(matches!(cache.node(a), Err(CacheError::NotFound(_))));
    let reader = cache.begin_tx();
    assert!(collect(&cache, &reader, b, Dir::Both)?.is_empty());
    Ok(())
}
