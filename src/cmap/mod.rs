//! Module `cmap` implement a concurrent, latched B+ tree.
//!
//! [CMap] indexes live blobs by key and supports reads, inserts, erases
//! and status-driven lifecycle transitions under many concurrent readers
//! and writers. Nodes can be split, merged and reclaimed without blocking
//! lookups: every traversal step takes and releases a per-node latch, and
//! a reader whose cached node pointer went stale because of a racing
//! split recovers by following the node's right-sibling link instead of
//! restarting from the root.
//!
//! Unlinked nodes are not freed immediately. A reader that saw a node
//! before it was unlinked may still be dereferencing it, so nodes are
//! handed to a deferred [reclaimer][reclaim], which frees them only after
//! [DELETION_DELAY] heartbeats have passed.

mod map;
mod node;
mod reclaim;

pub use map::CMap;

/// Number of child slots in every tree node.
pub const SLOTS_PER_NODE: usize = 8;

/// Hard bound on the height of the tree. With [SLOTS_PER_NODE] = 8 this
/// covers a keyspace well beyond any practical cache size. Exceeding it
/// is a logic failure and panics.
pub const MAX_TREE_HEIGHT: usize = 16;

/// Number of heartbeat generations an unlinked node is kept alive before
/// it is finally freed. Two is sufficient, three gives margin for
/// scheduling jitter.
pub const DELETION_DELAY: usize = 3;

/// Initial capacity of each reclaimer generation.
pub const DEL_STORE_CAPACITY: usize = 20;

/// Tree level at which leaf nodes live. Levels grow from the leaf up.
pub const LEAF_LEVEL: u8 = 1;

/// Lifecycle status of a slot within a tree node.
///
/// `Deleted` must be ZERO so that a zero-initialized slot array reads as
/// all-holes.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    Deleted = 0,
    Passive,
    Active,
}

/// Which slot statuses the read side of [CMap::put_or_get] treats as
/// present.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GetKind {
    /// A slot whose status is not `Active` is treated as absent.
    OnlyActive,
    /// Both `Active` and `Passive` slots are treated as present.
    ActiveAndPassive,
}
