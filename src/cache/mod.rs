//! Node and relationship caches and the coordinator that ties them to the store.
//!
//! [`CacheManager`] is the single entry point. Lookups go through one entity cache
//! per kind: a miss starts exactly one store read per key, concurrent callers wait
//! for it, and the configured [`EvictionPolicy`] decides what stays. Relationship reads merge
//! the cached chains with a transaction's overlay through [`RelationshipIter`].

mod entry;
mod iter;
mod manager;
mod policy;
mod store;

pub use entry::{CachedEntity, NodeEntry, RelEntry};
pub use iter::RelationshipIter;
pub use manager::CacheManager;
pub use policy::{
    policy_for, EvictionPolicy, GenerationalPolicy, NoCache, Retention, SoftPolicy, StrongPolicy,
    WeakPolicy,
};
pub use store::Weighted;
