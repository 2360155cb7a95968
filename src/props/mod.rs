//! Sorted, verified property chains.

mod verify;

use std::fmt;

use crate::types::{EntityRef, PropId};

pub use verify::{
    verify_sorted_property_chain, LoggingObserver, PropertyChainObserver, PropertyChainObservers,
    RateLimitedObserver, DEFAULT_DUPLICATE_COOLDOWN,
};

/// Property value with owned data.
#[derive(Clone, Debug, PartialEq)]
pub enum PropValue {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit floating point number.
    Float(f64),
    /// Owned string.
    Str(String),
    /// Owned byte vector.
    Bytes(Vec<u8>),
}

impl PropValue {
    /// Approximate heap footprint in bytes, including the enum itself.
    pub fn size_in_bytes(&self) -> usize {
        let heap = match self {
            PropValue::Str(v) => v.capacity(),
            PropValue::Bytes(v) => v.capacity(),
            _ => 0,
        };
        std::mem::size_of::<PropValue>() + heap
    }
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValue::Null => write!(f, "null"),
            PropValue::Bool(v) => write!(f, "{v}"),
            PropValue::Int(v) => write!(f, "{v}"),
            PropValue::Float(v) => write!(f, "{v}"),
            PropValue::Str(v) => write!(f, "{v}"),
            PropValue::Bytes(v) => write!(f, "bytes(len={})", v.len()),
        }
    }
}

impl From<i64> for PropValue {
    fn from(value: i64) -> Self {
        PropValue::Int(value)
    }
}

impl From<&str> for PropValue {
    fn from(value: &str) -> Self {
        PropValue::Str(value.to_owned())
    }
}

impl From<bool> for PropValue {
    fn from(value: bool) -> Self {
        PropValue::Bool(value)
    }
}

/// Properties of one entity sorted ascending by key, each key present once.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PropertyChain {
    entries: Vec<(PropId, PropValue)>,
}

impl PropertyChain {
    /// Empty chain.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Sorts a chain read from the store and verifies it.
    ///
    /// Duplicated keys are reported to `observer` and then collapsed; the entry that came
    /// first in store order wins. Returns the chain and the number of distinct duplicated keys.
    pub fn from_unsorted(
        entity: EntityRef,
        mut entries: Vec<(PropId, PropValue)>,
        observer: &dyn PropertyChainObserver,
    ) -> (Self, usize) {
        entries.sort_by_key(|(key, _)| *key);
        let duplicates = verify_sorted_property_chain(entity, &entries, observer);
        if duplicates > 0 {
            entries.dedup_by(|later, earlier| later.0 == earlier.0);
        }
        (Self { entries }, duplicates)
    }

    /// Value stored under `key`.
    pub fn get(&self, key: PropId) -> Option<&PropValue> {
        self.entries
            .binary_search_by_key(&key, |(k, _)| *k)
            .ok()
            .map(|at| &self.entries[at].1)
    }

    /// Keys in ascending order.
    pub fn keys(&self) -> impl Iterator<Item = PropId> + '_ {
        self.entries.iter().map(|(key, _)| *key)
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (PropId, &PropValue)> + '_ {
        self.entries.iter().map(|(key, value)| (*key, value))
    }

    /// Number of properties.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the entity has no properties.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of this chain with `changes` applied; `None` values remove the key.
    pub fn with_changes<'a>(
        &self,
        changes: impl IntoIterator<Item = (PropId, Option<&'a PropValue>)>,
    ) -> PropertyChain {
        let mut entries = self.entries.clone();
        for (key, value) in changes {
            match (entries.binary_search_by_key(&key, |(k, _)| *k), value) {
                (Ok(at), Some(value)) => entries[at].1 = value.clone(),
                (Ok(at), None) => {
                    entries.remove(at);
                }
                (Err(at), Some(value)) => entries.insert(at, (key, value.clone())),
                (Err(_), None) => {}
            }
        }
        PropertyChain { entries }
    }

    /// Approximate heap footprint in bytes.
    pub fn size_in_bytes(&self) -> usize {
        24 + self
            .entries
            .iter()
            .map(|(_, value)| 8 + value.size_in_bytes())
            .sum::<usize>()
    }
}
