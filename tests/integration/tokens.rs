#![allow(missing_docs)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use graphcache::id::IdGenerator;
use graphcache::token::{GeneratorTokenCreator, Token, TokenCreator, TokenRegistry};
use graphcache::types::TokenKind;
use graphcache::{CacheError, IdSpace, Result};

/// Hands out increasing ids and counts how often it was asked.
#[derive(Default)]
struct CountingCreator {
    next: AtomicU32,
    calls: AtomicUsize,
}

impl TokenCreator for CountingCreator {
    fn create_token(&self, _kind: TokenKind, _name: &str) -> Result<u32> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

#[test]
fn names_are_unique() -> Result<()> {
    let registry = TokenRegistry::new(TokenKind::RelationshipType);
    registry.put(Token::new("inbound1", 1))?;
    registry.put(Token::new("inbound2", 2))?;

    let err = registry
        .put(Token::new("inbound1", 3))
        .expect_err("a second id for a known name must be rejected");
    assert!(matches!(
        err,
        CacheError::NonUniqueToken {
            kind: TokenKind::RelationshipType,
            existing: 1,
            rejected: 3,
            ..
        }
    ));
    assert!(err.to_string().contains("inbound1"));

    assert_eq!(registry.get_id("inbound1"), Some(1));
    assert_eq!(registry.get_id("inbound2"), Some(2));
    assert_eq!(registry.get_token(3), None);
    assert_eq!(registry.len(), 2);
    Ok(())
}

#[test]
fn initial_tokens_replace_everything() -> Result<()> {
    let registry = TokenRegistry::new(TokenKind::Label);
    registry.put(Token::new("Stale", 9))?;
    registry.set_initial_tokens([Token::new("Person", 0), Token::new("Company", 1)])?;
    assert_eq!(registry.get_id("Stale"), None);
    assert_eq!(
        registry.all(),
        vec![Token::new("Person", 0), Token::new("Company", 1)]
    );

    let conflicting = [Token::new("A", 4), Token::new("A", 5)];
    assert!(registry.set_initial_tokens(conflicting).is_err());
    assert_eq!(registry.len(), 2, "a rejected batch keeps the old content");
    Ok(())
}

#[test]
fn lookup_without_creator() {
    let registry = TokenRegistry::new(TokenKind::PropertyKey);
    assert!(matches!(
        registry.get_or_create_id("name"),
        Err(CacheError::Unsupported(_))
    ));
}

#[test]
fn racing_creators_agree() -> Result<()> {
    const THREADS: usize = 8;
    let creator = Arc::new(CountingCreator::default());
    let registry = Arc::new(TokenRegistry::with_creator(
        TokenKind::PropertyKey,
        creator.clone(),
    ));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let name = registry.get_or_create_id("name")?;
                let age = registry.get_or_create_id("age")?;
                Ok::<_, CacheError>((name, age))
            })
        })
        .collect();
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.join().expect("token thread panicked")?);
    }

    assert!(results.windows(2).all(|pair| pair[0] == pair[1]), "{results:?}");
    assert_eq!(creator.calls.load(Ordering::SeqCst), 2);
    assert_eq!(registry.len(), 2);
    Ok(())
}

#[test]
fn generator_backed_creation() -> Result<()> {
    let ids = Arc::new(IdGenerator::new(IdSpace::RelationshipTypeToken, 0));
    let registry = TokenRegistry::with_creator(
        TokenKind::RelationshipType,
        Arc::new(GeneratorTokenCreator::new(ids.clone())),
    );
    assert_eq!(registry.get_or_create_id("KNOWS")?, 0);
    assert_eq!(registry.get_or_create_id("LIKES")?, 1);
    assert_eq!(registry.get_or_create_id("KNOWS")?, 0);
    assert_eq!(ids.high_id(), 2);

    let labels = TokenRegistry::with_creator(
        TokenKind::Label,
        Arc::new(GeneratorTokenCreator::new(ids)),
    );
    assert!(matches!(
        labels.get_or_create_id("Person"),
        Err(CacheError::Invalid(_))
    ));
    Ok(())
}
