//! Tree node layout and the slot-level mechanics: ordered binary search
//! over keys with holes, hole salvage for inserts, and the half-and-half
//! slot migration used by node splits.

use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::{cell::UnsafeCell, ptr, sync::Arc};

use crate::cmap::{Status, LEAF_LEVEL, SLOTS_PER_NODE};
use crate::util::Latch;

/// A key held by a node slot. `None` stands for "+infinity" and is carried
/// only by the rightmost spine of the tree. Keys are interned: the `Arc`
/// keeps the counter inline with the payload and every slot or in-flight
/// operation that observed the key holds one reference.
pub(crate) type KeyRef<K> = Option<Arc<K>>;

/// Payload of a node slot: a child pointer in internal nodes, a value in
/// leaf nodes. `Vacant` marks slots whose payload was released.
pub(crate) enum Payload<K, V> {
    Child(*mut Node<K, V>),
    Value(V),
    Vacant,
}

pub(crate) struct Slot<K, V> {
    pub key: KeyRef<K>,
    pub status: Status,
    pub payload: Payload<K, V>,
}

impl<K, V> Default for Slot<K, V> {
    fn default() -> Slot<K, V> {
        Slot {
            key: None,
            status: Status::Deleted,
            payload: Payload::Vacant,
        }
    }
}

impl<K, V> Slot<K, V> {
    pub fn as_child(&self) -> *mut Node<K, V> {
        match &self.payload {
            Payload::Child(node) => *node,
            _ => ptr::null_mut(),
        }
    }

    pub fn as_value(&self) -> &V {
        match &self.payload {
            Payload::Value(value) => value,
            _ => unreachable!(),
        }
    }
}

/// A fixed-capacity tree node.
///
/// `level` is immutable after creation and `filled` is atomic because the
/// tree-shrink check reads it without holding the node latch. Everything
/// else lives behind [Node::latch]: a reader must hold the latch in read
/// mode to call [Node::as_inner], a writer must hold it in write mode to
/// call [Node::as_inner_mut].
pub(crate) struct Node<K, V> {
    pub latch: Latch,
    pub level: u8,
    filled: AtomicUsize,
    inner: UnsafeCell<Inner<K, V>>,
}

pub(crate) struct Inner<K, V> {
    /// Upper bound (inclusive) for every live key in this node; `None`
    /// means "+infinity". The rightmost node at each level carries `None`.
    pub max_key: KeyRef<K>,
    /// Sibling link used by concurrent traversals to recover from splits.
    pub right: *mut Node<K, V>,
    pub slots: [Slot<K, V>; SLOTS_PER_NODE],
}

impl<K, V> Node<K, V> {
    /// Allocate a node. Every slot starts as a hole carrying a reference
    /// to `max_key`, so that binary search stays well defined over the
    /// unfilled portion of the slot array.
    pub fn alloc(max_key: KeyRef<K>, level: u8) -> *mut Node<K, V> {
        let mut slots: [Slot<K, V>; SLOTS_PER_NODE] = Default::default();
        for slot in slots.iter_mut() {
            slot.key = max_key.clone();
        }
        let inner = Inner {
            max_key,
            right: ptr::null_mut(),
            slots,
        };
        Box::into_raw(Box::new(Node {
            latch: Latch::new(),
            level,
            filled: AtomicUsize::new(0),
            inner: UnsafeCell::new(inner),
        }))
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.level == LEAF_LEVEL
    }

    #[inline]
    pub fn filled(&self) -> usize {
        self.filled.load(SeqCst)
    }

    #[inline]
    pub fn set_filled(&self, n: usize) {
        self.filled.store(n, SeqCst)
    }

    #[inline]
    pub fn incr_filled(&self) {
        self.filled.fetch_add(1, SeqCst);
    }

    #[inline]
    pub fn decr_filled(&self) {
        self.filled.fetch_sub(1, SeqCst);
    }

    /// Shared access to the node body. Caller must hold the node latch in
    /// read or write mode.
    #[allow(clippy::missing_safety_doc)]
    pub unsafe fn as_inner(&self) -> &Inner<K, V> {
        &*self.inner.get()
    }

    /// Exclusive access to the node body. Caller must hold the node latch
    /// in write mode.
    #[allow(clippy::mut_from_ref, clippy::missing_safety_doc)]
    pub unsafe fn as_inner_mut(&self) -> &mut Inner<K, V> {
        &mut *self.inner.get()
    }
}

/// `left < right` where `left` is a slot key and `None` is "+infinity".
#[inline]
pub(crate) fn key_ref_less<K: Ord>(left: Option<&Arc<K>>, right: &K) -> bool {
    match left {
        Some(left) => left.as_ref() < right,
        None => false,
    }
}

/// `left < right` where `right` is a slot key and `None` is "+infinity".
#[inline]
pub(crate) fn key_less_ref<K: Ord>(left: &K, right: Option<&Arc<K>>) -> bool {
    match right {
        Some(right) => left < right.as_ref(),
        None => true,
    }
}

/// Identity comparison of two key references. The split and unlink
/// protocols wait on a particular interned key, not on key equality.
#[inline]
pub(crate) fn key_ref_eq<K>(left: Option<&Arc<K>>, right: Option<&Arc<K>>) -> bool {
    match (left, right) {
        (Some(left), Some(right)) => Arc::ptr_eq(left, right),
        (None, None) => true,
        _ => false,
    }
}

impl<K, V> Inner<K, V>
where
    K: Ord,
{
    /// Binary search for the smallest slot whose key is >= `key`. Holes
    /// take part in the search with the key they last carried, which
    /// preserves ordering. Returns [SLOTS_PER_NODE] when every slot key
    /// is smaller than `key`.
    pub fn find_key_index(&self, key: &K) -> usize {
        let (mut low, mut high) = (0, SLOTS_PER_NODE);
        while low != high {
            let mid = (low + high) / 2;
            if key_ref_less(self.slots[mid].key.as_ref(), key) {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low
    }

    /// Variant of [Inner::find_key_index] searching by key reference,
    /// where `None` locates the first "+infinity" slot.
    pub fn find_key_index_ref(&self, key: Option<&Arc<K>>) -> usize {
        match key {
            Some(key) => self.find_key_index(key.as_ref()),
            None => {
                let mut index = SLOTS_PER_NODE - 1;
                while index > 0 && self.slots[index - 1].key.is_none() {
                    index -= 1;
                }
                index
            }
        }
    }

    /// Next non-hole slot at or after `index + 1`.
    pub fn next_live_index(&self, mut index: usize) -> usize {
        loop {
            index += 1;
            if index >= SLOTS_PER_NODE || self.slots[index].status != Status::Deleted {
                break index;
            }
        }
    }

    /// Smallest live slot whose key is >= `key`, skipping holes left by
    /// unlinked children.
    pub fn find_containing_index(&self, key: &K) -> usize {
        let index = self.find_key_index(key);
        if index != SLOTS_PER_NODE && self.slots[index].status == Status::Deleted {
            self.next_live_index(index)
        } else {
            index
        }
    }

    /// Whether the slot at `index` holds exactly `key` and is live.
    pub fn is_key_found(&self, key: &K, index: usize) -> bool {
        index != SLOTS_PER_NODE
            && !key_less_ref(key, self.slots[index].key.as_ref())
            && self.slots[index].status != Status::Deleted
    }

    /// Make room to insert before `index`, which is where binary search
    /// placed the new key. The node must have at least one hole. Either a
    /// nearby hole is used directly, or a run of slots is rotated toward
    /// the closest hole, salvaging the hole's slot for the insert. Returns
    /// the slot index to write into.
    pub fn find_insert_space(&mut self, index: usize) -> usize {
        if index != SLOTS_PER_NODE && self.slots[index].status == Status::Deleted {
            return index;
        }
        if index != 0 && self.slots[index - 1].status == Status::Deleted {
            return index - 1;
        }

        let mut right_index = index + 1;
        while right_index < SLOTS_PER_NODE
            && self.slots[right_index].status != Status::Deleted
        {
            right_index += 1;
        }
        if right_index < SLOTS_PER_NODE {
            // hole on the right; shift the run one step towards it.
            self.slots[index..=right_index].rotate_right(1);
            index
        } else {
            // hole on the left; binary search can also return one past
            // the last slot when every stored key is smaller than the
            // probe, this branch covers that case too.
            let ins_index = if index == SLOTS_PER_NODE {
                SLOTS_PER_NODE - 1
            } else {
                index - 1
            };
            let mut left_index = ins_index - 1;
            while self.slots[left_index].status != Status::Deleted {
                debug_assert!(left_index != 0);
                left_index -= 1;
            }
            self.slots[left_index..=ins_index].rotate_left(1);
            ins_index
        }
    }
}

#[cfg(test)]
#[path = "node_test.rs"]
mod node_test;
