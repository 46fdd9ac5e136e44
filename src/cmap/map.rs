//! The concurrent map proper: latched descents, inserts with split
//! propagation, erases with node unlink, root growth and shrink.
//!
//! Latching discipline
//! -------------------
//!
//! Every traversal step latches exactly one node at a time, read mode on
//! the way down and the caller-requested mode on the leaf. A writer that
//! splits or unlinks nodes keeps at most one latch while it walks up,
//! re-acquiring parents level by level. The `(root, height)` pair has its
//! own latch and changes atomically; a traversal pins the pair with a
//! root-reference count so the tree cannot shrink under it.
//!
//! A split first becomes visible in the sibling chain and only then in
//! the parent. The parent slot whose key equals the right half's max key
//! and whose child still points at the left half is the marker for "the
//! split this propagation belongs to"; both split propagation and node
//! unlink spin (yielding) on that marker until the racing writer has
//! published it.

use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::{cell::UnsafeCell, ptr, sync::Arc, thread};

use crate::cmap::node::{
    key_ref_eq, key_ref_less, KeyRef, Node, Payload, Slot,
};
use crate::cmap::reclaim::Reclaimer;
use crate::cmap::{GetKind, Status, LEAF_LEVEL, MAX_TREE_HEIGHT, SLOTS_PER_NODE};
use crate::util::{Latch, LockKind};

/// Concurrent, latched B+ tree mapping interned keys to values, with a
/// status lifecycle per slot.
///
/// All operations are thread safe except [CMap::clear], which the caller
/// must not run concurrently with any other call (same contract as
/// construction and drop).
pub struct CMap<K, V> {
    name: String,
    root: RootHead<K, V>,
    reclaim: Reclaimer<K, V>,
    n_root_refs: AtomicUsize,
    n_nodes: AtomicUsize,
    n_leaf_nodes: AtomicUsize,
    n_values: AtomicUsize,
}

unsafe impl<K: Send + Sync, V: Send + Sync> Send for CMap<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for CMap<K, V> {}

/// The `(root, height)` pair. Protected by its own latch; the two values
/// change together.
struct RootHead<K, V> {
    latch: Latch,
    inner: UnsafeCell<RootInner<K, V>>,
}

struct RootInner<K, V> {
    node: *mut Node<K, V>,
    height: u8,
}

/// Per-operation descent state, the moral equivalent of a call frame
/// threaded through the traversal helpers.
struct Ctx<'a, K, V> {
    lookup: &'a K,
    tree_height: u8,
    cur_level: u8,
    split_level: u8,
    path: [*mut Node<K, V>; MAX_TREE_HEIGHT + 1],
    locked: *mut Node<K, V>,
    locked_kind: LockKind,
    left_node: *mut Node<K, V>,
    right_node: *mut Node<K, V>,
    left_key: KeyRef<K>,
    right_key: KeyRef<K>,
}

impl<K, V> Drop for CMap<K, V> {
    fn drop(&mut self) {
        self.finalize();
        // parked nodes are freed by the reclaimer's own drop.
    }
}

impl<K, V> CMap<K, V> {
    pub fn new(name: &str) -> CMap<K, V> {
        let map = CMap {
            name: name.to_string(),
            root: RootHead {
                latch: Latch::new(),
                inner: UnsafeCell::new(RootInner {
                    node: ptr::null_mut(),
                    height: 1,
                }),
            },
            reclaim: Reclaimer::new(),
            n_root_refs: AtomicUsize::new(0),
            n_nodes: AtomicUsize::new(0),
            n_leaf_nodes: AtomicUsize::new(0),
            n_values: AtomicUsize::new(0),
        };
        let root = map.create_node(None, LEAF_LEVEL);
        unsafe { (*map.root.inner.get()).node = root };
        map
    }

    /// Identify this map instance.
    #[inline]
    pub fn to_name(&self) -> String {
        self.name.clone()
    }

    /// Number of live values in the map.
    #[inline]
    pub fn count_values(&self) -> usize {
        self.n_values.load(SeqCst)
    }

    /// Number of allocated nodes still linked into the tree.
    #[inline]
    pub fn count_nodes(&self) -> usize {
        self.n_nodes.load(SeqCst)
    }

    /// Number of leaf nodes still linked into the tree.
    #[inline]
    pub fn count_leaf_nodes(&self) -> usize {
        self.n_leaf_nodes.load(SeqCst)
    }

    /// Current height of the tree, 1 for a lone leaf root.
    pub fn tree_height(&self) -> u8 {
        self.root.latch.lock_read();
        let height = unsafe { &*self.root.inner.get() }.height;
        self.root.latch.unlock_read();
        height
    }

    /// Advance the deferred reclaimer by one generation. Expected to be
    /// called periodically by a single maintenance thread.
    pub fn heartbeat(&self) {
        self.reclaim.heartbeat();
    }

    /// Reset the map to empty. Caller is responsible to not make this
    /// call concurrent with any other method call.
    pub fn clear(&self) {
        self.finalize();
        self.reclaim.drain();
        self.n_values.store(0, SeqCst);
        let root = self.create_node(None, LEAF_LEVEL);
        let head = unsafe { &mut *self.root.inner.get() };
        head.node = root;
        head.height = 1;
    }

    fn create_node(&self, max_key: KeyRef<K>, level: u8) -> *mut Node<K, V> {
        let node = Node::alloc(max_key, level);
        self.n_nodes.fetch_add(1, SeqCst);
        if level == LEAF_LEVEL {
            self.n_leaf_nodes.fetch_add(1, SeqCst);
        }
        node
    }

    fn unlink_node(&self, node: *mut Node<K, V>) {
        self.n_nodes.fetch_sub(1, SeqCst);
        if unsafe { (*node).is_leaf() } {
            self.n_leaf_nodes.fetch_sub(1, SeqCst);
        }
        self.reclaim.add(node);
    }

    // Tear the whole tree down, freeing nodes immediately. Slots in
    // `Deleted` status are skipped: a deleted child slot points at a node
    // already handed to the reclaimer.
    fn finalize(&self) {
        let root = unsafe { &*self.root.inner.get() }.node;
        if root.is_null() {
            return;
        }
        let mut stack: Vec<(*mut Node<K, V>, usize)> = vec![(root, 0)];
        while let Some((node, mut child_ind)) = stack.pop() {
            if !unsafe { &*node }.is_leaf() {
                let inner = unsafe { (*node).as_inner() };
                while child_ind < SLOTS_PER_NODE
                    && inner.slots[child_ind].status == Status::Deleted
                {
                    child_ind += 1;
                }
                if child_ind < SLOTS_PER_NODE {
                    let child = inner.slots[child_ind].as_child();
                    stack.push((node, child_ind + 1));
                    stack.push((child, 0));
                    continue;
                }
            }
            self.n_nodes.fetch_sub(1, SeqCst);
            if unsafe { &*node }.is_leaf() {
                self.n_leaf_nodes.fetch_sub(1, SeqCst);
            }
            unsafe { drop(Box::from_raw(node)) };
        }
        unsafe { (*self.root.inner.get()).node = ptr::null_mut() };
        debug_assert_eq!(self.n_nodes.load(SeqCst), 0);
    }

    fn root_and_height(&self, add_ref: bool) -> (*mut Node<K, V>, u8) {
        self.root.latch.lock_read();
        let head = unsafe { &*self.root.inner.get() };
        let (node, height) = (head.node, head.height);
        if add_ref {
            self.n_root_refs.fetch_add(1, SeqCst);
        }
        self.root.latch.unlock_read();
        (node, height)
    }

    fn change_root(&self, node: *mut Node<K, V>, height: u8) {
        self.root.latch.lock_write();
        let head = unsafe { &mut *self.root.inner.get() };
        debug_assert_eq!(height, head.height + 1);
        head.node = node;
        head.height = height;
        self.root.latch.unlock_write();
    }

    fn can_shrink(&self) -> bool {
        let (root, height) = self.root_and_height(false);
        height != 1
            && unsafe { &*root }.filled() == 1
            && self.n_root_refs.load(SeqCst) == 1
    }

    fn shrink(&self) {
        self.root.latch.lock_write();
        let head = unsafe { &mut *self.root.inner.get() };
        let root = head.node;
        let can = head.height != 1
            && unsafe { &*root }.filled() == 1
            && self.n_root_refs.load(SeqCst) == 1;
        if !can {
            self.root.latch.unlock_write();
            return;
        }
        // no other traversal holds a root reference, so the old root's
        // latch is guaranteed free and its single live slot stable.
        {
            let inner = unsafe { (*root).as_inner() };
            let index = inner
                .slots
                .iter()
                .position(|slot| slot.status != Status::Deleted)
                .unwrap();
            head.node = inner.slots[index].as_child();
        }
        head.height -= 1;
        self.root.latch.unlock_write();
        self.unlink_node(root);
    }
}

impl<K, V> CMap<K, V>
where
    K: Ord + Clone,
{
    /// Return the value stored against `key`, if a live slot exists.
    /// Never blocks writers at other keys.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let mut ctx = self.init_ctx(key);
        let res = match self.dive_and_find(&mut ctx, LockKind::Read) {
            Some((node, index)) => {
                let inner = unsafe { (*node).as_inner() };
                Some(inner.slots[index].as_value().clone())
            }
            None => None,
        };
        self.fin_ctx(&mut ctx);
        res
    }

    /// Insert or overwrite. An existing slot has its value replaced in
    /// place and its status forced to `Active`.
    pub fn put(&self, key: &K, value: V)
    where
        V: Clone,
    {
        let mut ctx = self.init_ctx(key);
        if let Some((node, index)) = self.dive_and_create(&mut ctx, &value) {
            let inner = unsafe { (*node).as_inner_mut() };
            inner.slots[index].payload = Payload::Value(value);
            inner.slots[index].status = Status::Active;
        }
        self.fin_ctx(&mut ctx);
    }

    /// Remove the slot for `key` iff its status is `Active`. Return
    /// whether a removal happened.
    pub fn erase(&self, key: &K) -> bool {
        self.erase_if(key, Status::Active)
    }

    /// Remove the slot for `key` iff its status is `Passive`. Return
    /// whether a removal happened.
    pub fn erase_if_passive(&self, key: &K) -> bool {
        self.erase_if(key, Status::Passive)
    }

    /// Transition the slot for `key` to `Passive`. Return whether the
    /// slot existed.
    pub fn passivate(&self, key: &K) -> bool {
        self.set_status(key, Status::Passive)
    }

    /// Transition the slot for `key` to `Active`. Return whether the
    /// slot existed.
    pub fn activate(&self, key: &K) -> bool {
        self.set_status(key, Status::Active)
    }

    /// Atomic upsert-or-read. Returns `(put_happened, effective_value)`.
    ///
    /// The slot's status is observed before being forced to `Active`;
    /// "put happened" is true iff no live slot existed, or the observed
    /// status was non-`Active` while `kind` is [GetKind::OnlyActive] (in
    /// which case the slot's value is overwritten with `value`).
    pub fn put_or_get(&self, key: &K, value: &V, kind: GetKind) -> (bool, V)
    where
        V: Clone,
    {
        let mut ctx = self.init_ctx(key);
        let res = match self.dive_and_create(&mut ctx, value) {
            None => (true, value.clone()),
            Some((node, index)) => {
                let inner = unsafe { (*node).as_inner_mut() };
                let slot = &mut inner.slots[index];
                let put_happened =
                    slot.status != Status::Active && kind == GetKind::OnlyActive;
                let effective = if put_happened {
                    slot.payload = Payload::Value(value.clone());
                    value.clone()
                } else {
                    slot.as_value().clone()
                };
                slot.status = Status::Active;
                (put_happened, effective)
            }
        };
        self.fin_ctx(&mut ctx);
        res
    }

    /// Replace the value of an existing live slot in place. Return
    /// whether the slot existed.
    pub fn change(&self, key: &K, value: V) -> bool {
        let mut ctx = self.init_ctx(key);
        let res = match self.dive_and_find(&mut ctx, LockKind::Write) {
            Some((node, index)) => {
                let inner = unsafe { (*node).as_inner_mut() };
                inner.slots[index].payload = Payload::Value(value);
                true
            }
            None => false,
        };
        self.fin_ctx(&mut ctx);
        res
    }

    /// Smallest live entry whose key is >= `key`, walking right across
    /// leaves when the covering leaf holds nothing at or above the probe.
    pub fn get_lower_bound(&self, key: &K) -> Option<(K, V)>
    where
        V: Clone,
    {
        let mut ctx = self.init_ctx(key);
        let res = self.do_lower_bound(&mut ctx);
        self.fin_ctx(&mut ctx);
        res
    }

    fn do_lower_bound(&self, ctx: &mut Ctx<'_, K, V>) -> Option<(K, V)>
    where
        V: Clone,
    {
        loop {
            if ctx.cur_level != LEAF_LEVEL {
                let node = self.lock_cur(ctx, LockKind::Read);
                if self.is_node_deleted(node) {
                    self.move_one_level_up(ctx);
                    self.unlock_cur(ctx);
                    continue;
                }
                let inner = unsafe { (*node).as_inner() };
                let index = inner.find_containing_index(ctx.lookup);
                if index != SLOTS_PER_NODE {
                    self.move_one_level_down(ctx, index);
                    self.unlock_cur(ctx);
                } else if inner.right.is_null() {
                    self.unlock_cur(ctx);
                    break None;
                } else {
                    // nothing at or above the probe below this node.
                    ctx.path[ctx.cur_level as usize] = inner.right;
                    self.unlock_cur(ctx);
                }
                continue;
            }
            if !self.lock_leaf(ctx, LockKind::Read) {
                continue;
            }
            let node = ctx.path[LEAF_LEVEL as usize];
            let inner = unsafe { (*node).as_inner() };
            let mut index = inner.find_key_index(ctx.lookup);
            if index != SLOTS_PER_NODE && inner.slots[index].status == Status::Deleted {
                index = inner.next_live_index(index);
            }
            if index != SLOTS_PER_NODE {
                let slot = &inner.slots[index];
                let found_key = slot.key.as_ref().unwrap().as_ref().clone();
                let value = slot.as_value().clone();
                self.unlock_cur(ctx);
                break Some((found_key, value));
            } else if inner.right.is_null() {
                self.unlock_cur(ctx);
                break None;
            } else {
                ctx.path[LEAF_LEVEL as usize] = inner.right;
                self.unlock_cur(ctx);
            }
        }
    }

    fn erase_if(&self, key: &K, status: Status) -> bool {
        let mut ctx = self.init_ctx(key);
        let res = match self.dive_and_find(&mut ctx, LockKind::Write) {
            Some((node, index)) => {
                let matches = {
                    let inner = unsafe { (*node).as_inner() };
                    inner.slots[index].status == status
                };
                if matches {
                    self.delete_key(&mut ctx, index);
                }
                matches
            }
            None => false,
        };
        self.fin_ctx(&mut ctx);
        res
    }

    fn set_status(&self, key: &K, status: Status) -> bool {
        let mut ctx = self.init_ctx(key);
        let res = match self.dive_and_find(&mut ctx, LockKind::Write) {
            Some((node, index)) => {
                let inner = unsafe { (*node).as_inner_mut() };
                inner.slots[index].status = status;
                true
            }
            None => false,
        };
        self.fin_ctx(&mut ctx);
        res
    }

    fn init_ctx<'a>(&self, lookup: &'a K) -> Ctx<'a, K, V> {
        let (node, height) = self.root_and_height(true);
        let mut path = [ptr::null_mut(); MAX_TREE_HEIGHT + 1];
        path[height as usize] = node;
        Ctx {
            lookup,
            tree_height: height,
            cur_level: height,
            split_level: 0,
            path,
            locked: ptr::null_mut(),
            locked_kind: LockKind::Read,
            left_node: ptr::null_mut(),
            right_node: ptr::null_mut(),
            left_key: None,
            right_key: None,
        }
    }

    fn fin_ctx(&self, ctx: &mut Ctx<'_, K, V>) {
        if !ctx.locked.is_null() {
            self.unlock_cur(ctx);
        }
        self.n_root_refs.fetch_sub(1, SeqCst);
    }

    // Latch the node cached at the current level, following the sibling
    // chain while the node no longer covers the lookup key (a racing
    // split moved our key range to the right).
    fn lock_cur(&self, ctx: &mut Ctx<'_, K, V>, kind: LockKind) -> *mut Node<K, V> {
        let mut node = ctx.path[ctx.cur_level as usize];
        unsafe { &*node }.latch.lock(kind);
        loop {
            let inner = unsafe { (*node).as_inner() };
            if key_ref_less(inner.max_key.as_ref(), ctx.lookup) {
                let right = inner.right;
                unsafe { &*node }.latch.unlock(kind);
                node = right;
                unsafe { &*node }.latch.lock(kind);
            } else {
                break;
            }
        }
        ctx.path[ctx.cur_level as usize] = node;
        ctx.locked = node;
        ctx.locked_kind = kind;
        node
    }

    fn unlock_cur(&self, ctx: &mut Ctx<'_, K, V>) {
        unsafe { &*ctx.locked }.latch.unlock(ctx.locked_kind);
        ctx.locked = ptr::null_mut();
    }

    // Latch `to` and only then release the currently held write latch.
    // `to` is always a freshly created node, so the lock order cannot
    // deadlock against another thread.
    fn exchange_locks(&self, ctx: &mut Ctx<'_, K, V>, to: *mut Node<K, V>) {
        debug_assert!(ctx.locked_kind == LockKind::Write);
        unsafe { &*to }.latch.lock_write();
        unsafe { &*ctx.locked }.latch.unlock_write();
        ctx.locked = to;
    }

    // Locate the slot holding identically (`wait_key` -> `wait_child`)
    // in `inner`. Binary search gets to the first slot carrying the key
    // value; holes left by unlinked siblings can carry the same value,
    // so the probe steps past value-equal slots until identity matches.
    fn find_marker_index(
        &self,
        inner: &crate::cmap::node::Inner<K, V>,
        wait_key: Option<&Arc<K>>,
        wait_child: *mut Node<K, V>,
    ) -> Option<usize> {
        let mut index = inner.find_key_index_ref(wait_key);
        while index != SLOTS_PER_NODE {
            let slot = &inner.slots[index];
            if key_ref_eq(slot.key.as_ref(), wait_key) && slot.as_child() == wait_child {
                return Some(index);
            }
            let value_equal = match (slot.key.as_ref(), wait_key) {
                (Some(slot_key), Some(wait_key)) => slot_key.as_ref() == wait_key.as_ref(),
                (None, None) => true,
                _ => false,
            };
            if !value_equal {
                return None;
            }
            index += 1;
        }
        None
    }

    // Write-latch the current level and wait until it holds the slot
    // whose key is identically `wait_key` and whose child is identically
    // `wait_child`. A miss means the split (or unlink) this caller
    // belongs to is not yet published in the parent; yield and retry.
    fn lock_node_and_wait_key(
        &self,
        ctx: &mut Ctx<'_, K, V>,
        wait_key: Option<&Arc<K>>,
        wait_child: *mut Node<K, V>,
    ) -> usize {
        let mut node = self.lock_cur(ctx, LockKind::Write);
        let mut spins = 0_u32;
        loop {
            let inner = unsafe { (*node).as_inner() };
            if let Some(index) = self.find_marker_index(inner, wait_key, wait_child) {
                break index;
            }
            // a bounded wait: the publisher only needs this node's
            // latch, which every retry hands back. Spinning past the
            // bound means the marker cannot appear, a logic bug.
            spins += 1;
            debug_assert!(spins < 1000, "parent slot for split/unlink never appeared");
            self.unlock_cur(ctx);
            thread::yield_now();
            node = self.lock_cur(ctx, LockKind::Write);
        }
    }

    // true when the node is a tombstone: empty, but bounded (the
    // rightmost spine, whose max-key is "+infinity", is never unlinked).
    fn is_node_deleted(&self, node: *mut Node<K, V>) -> bool {
        unsafe { &*node }.filled() == 0
            && unsafe { (*node).as_inner() }.max_key.is_some()
    }

    // Descend to the leaf level. Returns false when some internal node
    // has no live slot covering the lookup key.
    fn dive_to_leaf(&self, ctx: &mut Ctx<'_, K, V>) -> bool {
        while ctx.cur_level != LEAF_LEVEL {
            if !self.dive_to_next_level(ctx) {
                return false;
            }
        }
        true
    }

    fn dive_to_next_level(&self, ctx: &mut Ctx<'_, K, V>) -> bool {
        let mut success = false;
        let node = self.lock_cur(ctx, LockKind::Read);
        if unsafe { &*node }.filled() != 0 {
            let index = {
                let inner = unsafe { (*node).as_inner() };
                inner.find_containing_index(ctx.lookup)
            };
            if index != SLOTS_PER_NODE {
                self.move_one_level_down(ctx, index);
                success = true;
            }
        } else if self.is_node_deleted(node) {
            // this node was just unlinked; try once more one level up.
            self.move_one_level_up(ctx);
            success = true;
        }
        self.unlock_cur(ctx);
        success
    }

    fn move_one_level_up(&self, ctx: &mut Ctx<'_, K, V>) {
        if ctx.cur_level == ctx.tree_height {
            // while we waited for the latch the root was split and then
            // emptied; the right sibling leads towards the new root.
            let node = ctx.path[ctx.cur_level as usize];
            let right = unsafe { (*node).as_inner() }.right;
            ctx.path[ctx.cur_level as usize] = right;
        } else {
            ctx.cur_level += 1;
        }
    }

    fn move_one_level_down(&self, ctx: &mut Ctx<'_, K, V>, index: usize) {
        let node = ctx.path[ctx.cur_level as usize];
        let child = unsafe { (*node).as_inner() }.slots[index].as_child();
        ctx.cur_level -= 1;
        ctx.path[ctx.cur_level as usize] = child;
    }

    fn lock_leaf(&self, ctx: &mut Ctx<'_, K, V>, kind: LockKind) -> bool {
        let node = self.lock_cur(ctx, kind);
        if self.is_node_deleted(node) {
            self.move_one_level_up(ctx);
            self.unlock_cur(ctx);
            false
        } else {
            true
        }
    }

    // Descend and locate the lookup key in its covering leaf, which is
    // left latched in `kind` mode (even on a miss). Returns the leaf and
    // slot index on a hit.
    fn dive_and_find(
        &self,
        ctx: &mut Ctx<'_, K, V>,
        kind: LockKind,
    ) -> Option<(*mut Node<K, V>, usize)> {
        loop {
            if !self.dive_to_leaf(ctx) {
                return None;
            }
            if !self.lock_leaf(ctx, kind) {
                continue;
            }
            let node = ctx.path[LEAF_LEVEL as usize];
            let inner = unsafe { (*node).as_inner() };
            let index = inner.find_key_index(ctx.lookup);
            return if inner.is_key_found(ctx.lookup, index) {
                Some((node, index))
            } else {
                None
            };
        }
    }

    // Descend and either find an existing live slot for the lookup key
    // (returned with the leaf write-latched) or insert a fresh `Active`
    // slot holding a clone of `value` and propagate any splits, in which
    // case every latch is already released.
    fn dive_and_create(
        &self,
        ctx: &mut Ctx<'_, K, V>,
        value: &V,
    ) -> Option<(*mut Node<K, V>, usize)>
    where
        V: Clone,
    {
        loop {
            if self.dive_to_leaf(ctx) {
                if !self.lock_leaf(ctx, LockKind::Write) {
                    continue;
                }
            } else if !self.create_path_to_leaf(ctx) {
                continue;
            }
            let node = ctx.path[LEAF_LEVEL as usize];
            let (found, index) = {
                let inner = unsafe { (*node).as_inner() };
                let index = inner.find_key_index(ctx.lookup);
                (inner.is_key_found(ctx.lookup, index), index)
            };
            if found {
                return Some((node, index));
            }
            self.insert_leaf_value(ctx, value.clone());
            self.propagate_split(ctx);
            return None;
        }
    }

    // The lookup key is beyond every live slot of the write-latched
    // internal node at the current level, yet still within its bound.
    // Build a fresh chain of nodes from below it down to a leaf, all
    // bounded by the node's max-key, and link the chain in.
    fn create_path_to_leaf(&self, ctx: &mut Ctx<'_, K, V>) -> bool {
        let node = self.lock_cur(ctx, LockKind::Write);
        if self.is_node_deleted(node) {
            self.move_one_level_up(ctx);
            self.unlock_cur(ctx);
            return false;
        }
        let (index, max_key) = {
            let inner = unsafe { (*node).as_inner() };
            (inner.find_containing_index(ctx.lookup), inner.max_key.clone())
        };
        if index != SLOTS_PER_NODE {
            self.move_one_level_down(ctx, index);
            self.unlock_cur(ctx);
            return false;
        }
        // a node whose max-key is "+infinity" always has a covering live
        // slot, so the chain is bounded by a real key.
        debug_assert!(max_key.is_some());
        let mut level = unsafe { &*node }.level - 1;
        let add_node = self.create_node(max_key.clone(), level);
        ctx.path[level as usize] = add_node;
        let mut last = add_node;
        while level > LEAF_LEVEL {
            level -= 1;
            let next = self.create_node(max_key.clone(), level);
            {
                // fresh nodes, invisible to other threads until linked.
                let inner = unsafe { (*last).as_inner_mut() };
                inner.slots[0].status = Status::Active;
                inner.slots[0].payload = Payload::Child(next);
            }
            unsafe { &*last }.set_filled(1);
            last = next;
            ctx.path[level as usize] = next;
        }
        self.add_node_key(ctx, max_key.as_ref().unwrap(), add_node);
        self.exchange_locks(ctx, last);
        ctx.cur_level = LEAF_LEVEL;
        true
    }

    // Insert a fresh Active slot into the write-latched leaf, splitting
    // it first when full.
    fn insert_leaf_value(&self, ctx: &mut Ctx<'_, K, V>, value: V) {
        let mut node = ctx.locked;
        if unsafe { &*node }.filled() == SLOTS_PER_NODE {
            self.split_node(ctx, node);
            node = ctx.locked;
        }
        let inner = unsafe { (*node).as_inner_mut() };
        let index = inner.find_key_index(ctx.lookup);
        let ins = if index != SLOTS_PER_NODE && inner.slots[index].status == Status::Deleted
        {
            index
        } else {
            inner.find_insert_space(index)
        };
        inner.slots[ins] = Slot {
            key: Some(Arc::new(ctx.lookup.clone())),
            status: Status::Active,
            payload: Payload::Value(value),
        };
        unsafe { &*node }.incr_filled();
        self.n_values.fetch_add(1, SeqCst);
    }

    // Insert `key -> child` into the write-latched internal node at the
    // current level, splitting it first when full. Returns the slot index
    // the entry landed in.
    fn add_node_key(
        &self,
        ctx: &mut Ctx<'_, K, V>,
        key: &Arc<K>,
        child: *mut Node<K, V>,
    ) -> usize {
        let mut node = ctx.locked;
        if unsafe { &*node }.filled() == SLOTS_PER_NODE {
            self.split_node(ctx, node);
            node = ctx.locked;
        }
        let inner = unsafe { (*node).as_inner_mut() };
        let index = inner.find_key_index(key.as_ref());
        let ins = inner.find_insert_space(index);
        inner.slots[ins] = Slot {
            key: Some(Arc::clone(key)),
            status: Status::Active,
            payload: Payload::Child(child),
        };
        unsafe { &*node }.incr_filled();
        ins
    }

    // Split the write-latched full node at its midpoint. The upper half
    // migrates to a fresh right sibling, the vacated slots become holes
    // carrying the new midpoint bound, and the sibling chain is
    // rethreaded so concurrent readers can still find every key. The
    // parent is fixed up later by the propagation loop.
    fn split_node(&self, ctx: &mut Ctx<'_, K, V>, node: *mut Node<K, V>) {
        let left_cnt = SLOTS_PER_NODE / 2;
        let level = unsafe { &*node }.level;
        let node_inner = unsafe { (*node).as_inner_mut() };
        let left_max = node_inner.slots[left_cnt - 1].key.clone();

        let right = self.create_node(left_max.clone(), level);
        let right_inner = unsafe { (*right).as_inner_mut() };
        for i in left_cnt..SLOTS_PER_NODE {
            // the fresh sibling's slots are holes carrying the midpoint
            // key, exactly what the vacated left slots must become.
            std::mem::swap(&mut node_inner.slots[i], &mut right_inner.slots[i]);
        }
        unsafe { &*node }.set_filled(left_cnt);
        unsafe { &*right }.set_filled(SLOTS_PER_NODE - left_cnt);
        right_inner.max_key = node_inner.max_key.clone();
        node_inner.max_key = left_max.clone();
        right_inner.right = node_inner.right;
        node_inner.right = right;

        ctx.split_level = level;
        ctx.left_node = node;
        ctx.right_node = right;
        ctx.left_key = left_max.clone();
        ctx.right_key = right_inner.max_key.clone();

        if key_ref_less(left_max.as_ref(), ctx.lookup) {
            ctx.path[level as usize] = right;
            self.exchange_locks(ctx, right);
        }
    }

    fn propagate_split(&self, ctx: &mut Ctx<'_, K, V>) {
        self.unlock_cur(ctx);
        while ctx.split_level != 0 {
            if ctx.split_level != ctx.tree_height {
                self.add_regular_split(ctx);
            } else {
                self.check_root_split(ctx);
            }
        }
    }

    // Publish a split in its parent: wait for the marker slot (right
    // half's max key, still pointing at the left half), insert the left
    // half's new bound before it, then repoint the marker at the right
    // half. The parent may itself split here, re-arming the loop.
    fn add_regular_split(&self, ctx: &mut Ctx<'_, K, V>) {
        let left_key = ctx.left_key.clone();
        let right_key = ctx.right_key.clone();
        let left_node = ctx.left_node;
        let right_node = ctx.right_node;

        ctx.cur_level = ctx.split_level + 1;
        self.lock_node_and_wait_key(ctx, right_key.as_ref(), left_node);
        ctx.split_level = 0;
        let key_index = self.add_node_key(ctx, left_key.as_ref().unwrap(), left_node);
        // the latched node can have been split inside add_node_key; the
        // marker follows the inserted bound into the same half.
        let node = ctx.locked;
        let inner = unsafe { (*node).as_inner_mut() };
        let marker = self
            .find_marker_index(inner, right_key.as_ref(), left_node)
            .expect("split marker vanished under the write latch");
        debug_assert!(marker > key_index);
        inner.slots[marker].payload = Payload::Child(right_node);
        self.unlock_cur(ctx);
    }

    fn check_root_split(&self, ctx: &mut Ctx<'_, K, V>) {
        // the root may have been split by someone else already.
        let (new_root, new_height) = self.root_and_height(false);
        if new_height == ctx.tree_height {
            debug_assert!(new_root == ctx.left_node);
            self.add_new_root(ctx);
        } else {
            debug_assert!(new_height > ctx.tree_height);
            let old_height = ctx.tree_height;
            ctx.tree_height = new_height;
            ctx.cur_level = new_height;
            ctx.path[new_height as usize] = new_root;
            while ctx.cur_level != old_height + 1 {
                let ok = self.dive_to_next_level(ctx);
                debug_assert!(ok);
            }
        }
    }

    fn add_new_root(&self, ctx: &mut Ctx<'_, K, V>) {
        if ctx.tree_height as usize == MAX_TREE_HEIGHT {
            panic!("concurrent map {} is too deep", self.name);
        }
        let new_height = ctx.tree_height + 1;
        let new_root = self.create_node(None, new_height);
        ctx.path[new_height as usize] = new_root;
        {
            let inner = unsafe { (*new_root).as_inner_mut() };
            inner.slots[0].key = ctx.left_key.clone();
            inner.slots[0].status = Status::Active;
            inner.slots[0].payload = Payload::Child(ctx.left_node);
            debug_assert!(key_ref_eq(
                inner.slots[1].key.as_ref(),
                ctx.right_key.as_ref()
            ));
            inner.slots[1].status = Status::Active;
            inner.slots[1].payload = Payload::Child(ctx.right_node);
        }
        unsafe { &*new_root }.set_filled(2);
        self.change_root(new_root, new_height);
        ctx.split_level = 0;
    }

    // Remove the slot at `index` of the write-latched leaf. The slot
    // only turns into a hole; real unlinking happens when the leaf (and
    // possibly its ancestors) run empty.
    fn delete_key(&self, ctx: &mut Ctx<'_, K, V>, index: usize) {
        let node = ctx.path[LEAF_LEVEL as usize];
        {
            let inner = unsafe { (*node).as_inner_mut() };
            inner.slots[index].status = Status::Deleted;
            inner.slots[index].payload = Payload::Vacant;
        }
        unsafe { &*node }.decr_filled();
        if self.is_node_deleted(node) {
            self.delete_empty_nodes(ctx);
        }
        self.n_values.fetch_sub(1, SeqCst);
    }

    // Unlink the tombstoned node from its parent, repeating upward while
    // parents in turn run empty, then consider shrinking the tree.
    fn delete_empty_nodes(&self, ctx: &mut Ctx<'_, K, V>) {
        let mut node = ctx.path[LEAF_LEVEL as usize];
        while self.is_node_deleted(node) {
            let del_key = unsafe { (*node).as_inner() }.max_key.clone();
            self.unlock_cur(ctx);
            ctx.cur_level = unsafe { &*node }.level + 1;
            // the unlinked node's pointer stays in use as the wait
            // marker below, but is never dereferenced by the parent.
            self.unlink_node(node);
            let index = self.lock_node_and_wait_key(ctx, del_key.as_ref(), node);
            node = ctx.locked;
            {
                let inner = unsafe { (*node).as_inner_mut() };
                inner.slots[index].status = Status::Deleted;
            }
            unsafe { &*node }.decr_filled();
        }
        if self.can_shrink() {
            // the latched node can be the root itself; release before
            // shrinking, the root may be unlinked on return.
            self.unlock_cur(ctx);
            self.shrink();
        }
    }
}

#[cfg(test)]
#[path = "map_test.rs"]
mod map_test;
