//! Caching and relationship traversal core of an embedded graph kernel.
//!
//! The crate sits between a record store, reached through
//! [`persistence::PersistenceManager`], and the graph API. It caches nodes, relationships and
//! their property chains, loads relationship chains a page at a time (switching to
//! per-(type, direction) chains for dense nodes), maps token names to ids and allocates
//! entity ids with free-list reuse.

#![warn(missing_docs)]

pub mod cache;
pub mod chain;
pub mod id;
pub mod logging;
pub mod metrics;
pub mod options;
pub mod persistence;
pub mod props;
pub mod relids;
pub mod testkit;
pub mod token;
pub mod tx;
pub mod types;

pub use cache::CacheManager;
pub use options::{CacheConfig, CacheOptions, CacheType};
pub use tx::TxState;
pub use types::{
    CacheError, Dir, EntityKind, EntityRef, IdSpace, LabelId, NodeId, PropId, RelDir, RelId,
    Result, TypeId,
};
