//! Name tokens for labels, relationship types and property keys.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::id::IdGenerator;
use crate::types::{CacheError, Result, TokenKind};

/// Immutable `(id, name)` pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Token {
    /// Token id.
    pub id: u32,
    /// Token name.
    pub name: Arc<str>,
}

impl Token {
    /// Builds a token.
    pub fn new(name: &str, id: u32) -> Self {
        Self {
            id,
            name: Arc::from(name),
        }
    }
}

/// Allocates the persistent id of a genuinely new token.
pub trait TokenCreator: Send + Sync {
    /// Persists `name` and returns its id.
    fn create_token(&self, kind: TokenKind, name: &str) -> Result<u32>;
}

/// Token creator drawing ids from the token's id space.
pub struct GeneratorTokenCreator {
    ids: Arc<IdGenerator>,
}

impl GeneratorTokenCreator {
    /// Creator allocating from `ids`.
    pub fn new(ids: Arc<IdGenerator>) -> Self {
        Self { ids }
    }
}

impl TokenCreator for GeneratorTokenCreator {
    fn create_token(&self, kind: TokenKind, _name: &str) -> Result<u32> {
        if self.ids.space() != kind.id_space() {
            return Err(CacheError::Invalid("token creator bound to another id space"));
        }
        let id = self.ids.next_id()?;
        u32::try_from(id).map_err(|_| CacheError::Corruption("token id exceeds u32 range"))
    }
}

#[derive(Default)]
struct Tokens {
    by_name: FxHashMap<Arc<str>, u32>,
    by_id: FxHashMap<u32, Token>,
}

impl Tokens {
    fn insert(&mut self, kind: TokenKind, token: Token) -> Result<()> {
        if let Some(existing) = self.by_name.get(&token.name) {
            if *existing == token.id {
                return Ok(());
            }
            return Err(CacheError::NonUniqueToken {
                kind,
                name: token.name.to_string(),
                existing: *existing,
                rejected: token.id,
            });
        }
        if self.by_id.contains_key(&token.id) {
            return Err(CacheError::Invalid("token id already bound to another name"));
        }
        self.by_name.insert(Arc::clone(&token.name), token.id);
        self.by_id.insert(token.id, token);
        Ok(())
    }
}

/// Bidirectional id/name map of one token kind.
///
/// Lookups take a read lock only. New names are created under a dedicated mutex so two
/// threads racing on the same name agree on a single id.
pub struct TokenRegistry {
    kind: TokenKind,
    tokens: RwLock<Tokens>,
    creation: Mutex<()>,
    creator: Option<Arc<dyn TokenCreator>>,
}

impl TokenRegistry {
    /// Registry without a creator; only [`TokenRegistry::put`] adds tokens.
    pub fn new(kind: TokenKind) -> Self {
        Self {
            kind,
            tokens: RwLock::new(Tokens::default()),
            creation: Mutex::new(()),
            creator: None,
        }
    }

    /// Registry that creates unknown names through `creator`.
    pub fn with_creator(kind: TokenKind, creator: Arc<dyn TokenCreator>) -> Self {
        Self {
            creator: Some(creator),
            ..Self::new(kind)
        }
    }

    /// Token kind held by this registry.
    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    /// Registers `token`. A name already bound to another id is rejected and the existing
    /// binding kept.
    pub fn put(&self, token: Token) -> Result<()> {
        self.tokens.write().insert(self.kind, token)
    }

    /// Id bound to `name`.
    pub fn get_id(&self, name: &str) -> Option<u32> {
        self.tokens.read().by_name.get(name).copied()
    }

    /// Token bound to `id`.
    pub fn get_token(&self, id: u32) -> Option<Token> {
        self.tokens.read().by_id.get(&id).cloned()
    }

    /// Replaces the whole content with `tokens`; names absent from `tokens` are forgotten.
    ///
    /// The swap is all or nothing: conflicting input leaves the registry unchanged.
    pub fn set_initial_tokens(&self, tokens: impl IntoIterator<Item = Token>) -> Result<()> {
        let mut next = Tokens::default();
        for token in tokens {
            next.insert(self.kind, token)?;
        }
        let count = next.by_id.len();
        *self.tokens.write() = next;
        debug!(kind = ?self.kind, count, "tokens.initial.set");
        Ok(())
    }

    /// Id of `name`, creating the token on first use.
    pub fn get_or_create_id(&self, name: &str) -> Result<u32> {
        if let Some(id) = self.get_id(name) {
            trace!(kind = ?self.kind, id, "tokens.lookup.hit");
            return Ok(id);
        }
        let creator = self
            .creator
            .as_ref()
            .ok_or(CacheError::Unsupported("token registry has no creator"))?;
        let _creating = self.creation.lock();
        if let Some(id) = self.get_id(name) {
            return Ok(id);
        }
        let id = creator.create_token(self.kind, name)?;
        self.put(Token::new(name, id))?;
        trace!(kind = ?self.kind, id, "tokens.create");
        Ok(id)
    }

    /// Every token ordered by id.
    pub fn all(&self) -> Vec<Token> {
        let mut tokens: Vec<Token> = self.tokens.read().by_id.values().cloned().collect();
        tokens.sort_by_key(|token| token.id);
        tokens
    }

    /// Number of tokens.
    pub fn len(&self) -> usize {
        self.tokens.read().by_id.len()
    }

    /// True when no token is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
