//! Identifier newtypes, directions and the crate-wide error type.

#![forbid(unsafe_code)]

use std::fmt;
use std::io;
use std::sync::Arc;

/// Identifier of a node record.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeId(pub u64);
/// Identifier of a relationship record.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RelId(pub u64);
/// Relationship type token id.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TypeId(pub u32);
/// Label token id.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct LabelId(pub u32);
/// Property key token id.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PropId(pub u32);

/// Direction requested by a traversal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Dir {
    /// Relationships starting at the node (loops included).
    Out,
    /// Relationships ending at the node (loops included).
    In,
    /// Every relationship of the node.
    Both,
}

/// Physical slot a relationship occupies relative to one of its nodes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RelDir {
    /// The node is the start node.
    Out,
    /// The node is the end node.
    In,
    /// Start and end node are the same node.
    Loop,
}

const SLOTS_OUT: [RelDir; 2] = [RelDir::Out, RelDir::Loop];
const SLOTS_IN: [RelDir; 2] = [RelDir::In, RelDir::Loop];
const SLOTS_BOTH: [RelDir; 3] = [RelDir::Out, RelDir::In, RelDir::Loop];

impl Dir {
    /// Returns true when outgoing relationships are part of this direction.
    pub fn includes_out(self) -> bool {
        matches!(self, Dir::Out | Dir::Both)
    }

    /// Returns true when incoming relationships are part of this direction.
    pub fn includes_in(self) -> bool {
        matches!(self, Dir::In | Dir::Both)
    }

    /// Storage slots visited, in iteration order, when reading this direction.
    pub fn slots(self) -> &'static [RelDir] {
        match self {
            Dir::Out => &SLOTS_OUT,
            Dir::In => &SLOTS_IN,
            Dir::Both => &SLOTS_BOTH,
        }
    }

    /// Lowercase label used by metrics and log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Dir::Out => "out",
            Dir::In => "in",
            Dir::Both => "both",
        }
    }
}

impl RelDir {
    /// Slot of a relationship `start -> end` as seen from `node`, if `node` is an endpoint.
    pub fn of(node: NodeId, start: NodeId, end: NodeId) -> Option<RelDir> {
        if start == node && end == node {
            Some(RelDir::Loop)
        } else if start == node {
            Some(RelDir::Out)
        } else if end == node {
            Some(RelDir::In)
        } else {
            None
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            RelDir::Out => 0,
            RelDir::In => 1,
            RelDir::Loop => 2,
        }
    }
}

/// Kind of a cached entity.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EntityKind {
    /// Node entity.
    Node,
    /// Relationship entity.
    Relationship,
}

/// Reference to a node or a relationship.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EntityRef {
    /// A node.
    Node(NodeId),
    /// A relationship.
    Relationship(RelId),
}

impl EntityRef {
    /// Builds a reference from a kind and a raw id.
    pub fn new(kind: EntityKind, id: u64) -> Self {
        match kind {
            EntityKind::Node => EntityRef::Node(NodeId(id)),
            EntityKind::Relationship => EntityRef::Relationship(RelId(id)),
        }
    }

    /// Kind of the referenced entity.
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRef::Node(_) => EntityKind::Node,
            EntityRef::Relationship(_) => EntityKind::Relationship,
        }
    }

    /// Raw id of the referenced entity.
    pub fn raw(&self) -> u64 {
        match self {
            EntityRef::Node(id) => id.0,
            EntityRef::Relationship(id) => id.0,
        }
    }
}

/// Kind of a name token.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TokenKind {
    /// Node labels.
    Label,
    /// Relationship types.
    RelationshipType,
    /// Property keys.
    PropertyKey,
}

impl TokenKind {
    /// Id space the token ids are allocated from.
    pub fn id_space(self) -> IdSpace {
        match self {
            TokenKind::Label => IdSpace::LabelToken,
            TokenKind::RelationshipType => IdSpace::RelationshipTypeToken,
            TokenKind::PropertyKey => IdSpace::PropertyKeyToken,
        }
    }
}

/// An independently allocated id space.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum IdSpace {
    /// Node records.
    Node,
    /// Relationship records.
    Relationship,
    /// Relationship group records of dense nodes.
    RelationshipGroup,
    /// Property records.
    Property,
    /// Dynamic string blocks.
    StringBlock,
    /// Dynamic array blocks.
    ArrayBlock,
    /// Label tokens.
    LabelToken,
    /// Property key tokens.
    PropertyKeyToken,
    /// Relationship type tokens.
    RelationshipTypeToken,
}

/// Sentinel used as "no next record" in 32-bit chain encodings.
pub const INTEGER_MINUS_ONE: u64 = 0xFFFF_FFFF;

impl IdSpace {
    /// Every id space, in file-name order.
    pub const ALL: [IdSpace; 9] = [
        IdSpace::Node,
        IdSpace::Relationship,
        IdSpace::RelationshipGroup,
        IdSpace::Property,
        IdSpace::StringBlock,
        IdSpace::ArrayBlock,
        IdSpace::LabelToken,
        IdSpace::PropertyKeyToken,
        IdSpace::RelationshipTypeToken,
    ];

    /// Width of the id space in bits.
    pub fn bits(self) -> u32 {
        match self {
            IdSpace::Node | IdSpace::Relationship | IdSpace::RelationshipGroup => 35,
            IdSpace::Property | IdSpace::StringBlock | IdSpace::ArrayBlock => 36,
            IdSpace::LabelToken => 31,
            IdSpace::PropertyKeyToken => 24,
            IdSpace::RelationshipTypeToken => 16,
        }
    }

    /// Highest id that may be handed out.
    pub fn max_id(self) -> u64 {
        (1u64 << self.bits()) - 1
    }

    /// Id that is never handed out because chain encodings use it as a terminator.
    ///
    /// For spaces at least 32 bits wide this is `0xFFFF_FFFF`; narrower spaces reserve their
    /// own all-ones pattern.
    pub fn reserved_id(self) -> u64 {
        self.max_id().min(INTEGER_MINUS_ONE)
    }

    /// Returns true when `id` must be skipped by allocators.
    pub fn is_reserved(self, id: u64) -> bool {
        id == self.reserved_id()
    }

    /// Whether contiguous batch ranges may be allocated from this space.
    pub fn supports_batch(self) -> bool {
        !matches!(
            self,
            IdSpace::LabelToken | IdSpace::PropertyKeyToken | IdSpace::RelationshipTypeToken
        )
    }

    /// Stable short name, used for id file names and log fields.
    pub fn name(self) -> &'static str {
        match self {
            IdSpace::Node => "node",
            IdSpace::Relationship => "relationship",
            IdSpace::RelationshipGroup => "relationship_group",
            IdSpace::Property => "property",
            IdSpace::StringBlock => "string_block",
            IdSpace::ArrayBlock => "array_block",
            IdSpace::LabelToken => "label_token",
            IdSpace::PropertyKeyToken => "property_key_token",
            IdSpace::RelationshipTypeToken => "relationship_type_token",
        }
    }
}

/// Errors raised by the cache core.
#[derive(thiserror::Error, Debug, Clone)]
pub enum CacheError {
    /// I/O failure in a store-backed component.
    #[error("IO: {0}")]
    Io(Arc<io::Error>),
    /// Persistent data failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The entity does not exist.
    #[error("{0} not found")]
    NotFound(EntityRef),
    /// The entity, or a record in its chain, was deleted while it was being traversed.
    #[error("{0} concurrently deleted while loading its relationships")]
    ConcurrentlyDeleted(EntityRef),
    /// A record the caller expected to find is missing from the store.
    #[error("{} record {id} not found", .space.name())]
    RecordNotFound {
        /// Id space of the record.
        space: IdSpace,
        /// Record id.
        id: u64,
    },
    /// A token name is already bound to another id.
    #[error("{kind:?} token {name:?} already has id {existing}, rejected id {rejected}")]
    NonUniqueToken {
        /// Registry the token was offered to.
        kind: TokenKind,
        /// Token name.
        name: String,
        /// Id the name is bound to.
        existing: u32,
        /// Id that was refused.
        rejected: u32,
    },
    /// Allocation would exceed the width of the id space.
    #[error("{} id space exhausted (max id {max})", .space.name())]
    IdSpaceExhausted {
        /// Id space that ran out.
        space: IdSpace,
        /// Highest allowed id.
        max: u64,
    },
    /// The operation is not supported by this component.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    /// More than one distinct relationship matched a single-relationship lookup.
    #[error("node {node} has more than one {dir:?} relationship of type {ty}")]
    MoreThanOneRelationship {
        /// Node being queried.
        node: NodeId,
        /// Requested type.
        ty: TypeId,
        /// Requested direction.
        dir: Dir,
    },
}

impl CacheError {
    /// True for the typed "stop iterating, entity concurrently modified" condition.
    pub fn is_concurrent_deletion(&self) -> bool {
        matches!(self, CacheError::ConcurrentlyDeleted(_))
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self {
        CacheError::Io(Arc::new(err))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CacheError>;

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PropId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Node(id) => write!(f, "Node[{id}]"),
            EntityRef::Relationship(id) => write!(f, "Relationship[{id}]"),
        }
    }
}

impl From<NodeId> for EntityRef {
    fn from(value: NodeId) -> Self {
        EntityRef::Node(value)
    }
}

impl From<RelId> for EntityRef {
    fn from(value: RelId) -> Self {
        EntityRef::Relationship(value)
    }
}

impl From<u32> for TypeId {
    fn from(value: u32) -> Self {
        TypeId(value)
    }
}

impl From<TypeId> for u32 {
    fn from(value: TypeId) -> Self {
        value.0
    }
}

impl From<u32> for LabelId {
    fn from(value: u32) -> Self {
        LabelId(value)
    }
}

impl From<LabelId> for u32 {
    fn from(value: LabelId) -> Self {
        value.0
    }
}

impl From<u32> for PropId {
    fn from(value: u32) -> Self {
        PropId(value)
    }
}

impl From<PropId> for u32 {
    fn from(value: PropId) -> Self {
        value.0
    }
}
