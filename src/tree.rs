//! The free-block index: a size-keyed red-black tree over a fixed-capacity
//! node pool
use core::{alloc::Layout, fmt, marker::PhantomData, ptr::NonNull};

use crate::{
    checks::{ensure, violation},
    Block, Checks, DefaultChecks, Error, RawSource, Violation,
};

/// Encodes "no node" in node links and list heads.
const NIL: u32 = u32::MAX;

/// A handle to a live node of a [`FreeTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    /// Get the node's slot index in the node pool.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy)]
struct Node {
    parent: u32,
    /// For a vacated slot, the next slot in the list of empties.
    left: u32,
    right: u32,
    /// `None` iff the slot is vacated.
    block: Option<Block>,
    /// The key. A copy of the block's size so that comparisons don't touch
    /// the arena.
    size: u32,
    red: bool,
}

#[cfg_attr(feature = "doc_cfg", svgbobdoc::transform)]
/// The free-block index: maps a requested size to a free block of at least
/// that size in logarithmic time.
///
/// # Data Structure Overview
///
/// <center>
/// ```svgbob
///                       len = 4, capacity = 8
///          ,-----+-----+-----+-----+-----+-----+-----+-----,
///   nodes  | 256 |  ×  |  64 | 512 | 128 |     |     |     |
///          '-----+--+--+-----+-----+-----+-----+-----+-----'
///                   |                       ^
///                   |                       |
///                empties                first_free
/// ```
/// </center>
///
/// Nodes live in a pool acquired once, when the tree is created. A vacated
/// slot goes to the list of empties, which is drained before the bump
/// cursor `first_free` advances. The pool never grows; inserting into a
/// full tree fails with [`Error::IndexFull`].
///
/// Blocks of equal size are ordered newest first, so [`Self::find_min_fit`]
/// returns the most recently inserted one among them.
///
/// The tree refers to blocks but doesn't own them. Nothing here reads or
/// writes a line's arena.
pub struct FreeTree<S: RawSource, C: Checks = DefaultChecks> {
    nodes: NonNull<Node>,
    /// `None` if `capacity` is zero and nothing was acquired.
    pool_layout: Option<Layout>,
    root: u32,
    empties: u32,
    first_free: u32,
    len: u32,
    capacity: u32,
    source: S,
    _checks: PhantomData<fn() -> C>,
}

// Safety: The node pool is exclusively owned by the tree
unsafe impl<S: RawSource + Send, C: Checks> Send for FreeTree<S, C> {}

impl<S: RawSource, C: Checks> fmt::Debug for FreeTree<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeTree")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("first_free", &self.first_free)
            .field("entries", &DebugEntries(self))
            .finish()
    }
}

struct DebugEntries<'a, S: RawSource, C: Checks>(&'a FreeTree<S, C>);

impl<S: RawSource, C: Checks> fmt::Debug for DebugEntries<'_, S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

impl<S: RawSource, C: Checks> FreeTree<S, C> {
    /// Acquire a node pool holding `capacity` nodes from `source`.
    ///
    /// Fails with [`Error::AllocationFailure`] if `source` fails.
    pub fn init(mut source: S, capacity: u32) -> Result<Self, Error> {
        if capacity == NIL {
            // `NIL` must never be a valid slot index
            return Err(Error::AllocationFailure);
        }

        let (nodes, pool_layout) = if capacity == 0 {
            (NonNull::dangling(), None)
        } else {
            let layout = Layout::array::<Node>(capacity as usize)
                .map_err(|_| Error::AllocationFailure)?;

            // Safety: `layout.size()` is not zero
            let nodes = unsafe { source.acquire(layout) }.ok_or_else(|| {
                log::debug!("tree init: acquiring {:?} failed", layout);
                Error::AllocationFailure
            })?;
            (nodes.cast(), Some(layout))
        };

        log::trace!("tree init: {} nodes at {:p}", capacity, nodes);

        Ok(Self {
            nodes,
            pool_layout,
            root: NIL,
            empties: NIL,
            first_free: 0,
            len: 0,
            capacity,
            source,
            _checks: PhantomData,
        })
    }

    /// Release the node pool. Equivalent to dropping `self`. The blocks
    /// referenced by the tree are not touched.
    #[inline]
    pub fn destroy(self) {}

    /// Get the number of entries.
    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Get the number of nodes the pool can hold.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    /// Get the number of pool slots that have ever been used.
    #[inline]
    pub fn pool_high_water(&self) -> u32 {
        self.first_free
    }

    #[inline]
    fn node(&self, i: u32) -> &Node {
        debug_assert!(i < self.first_free);
        // Safety: Slots below `first_free` are initialized
        unsafe { &*self.nodes.as_ptr().add(i as usize) }
    }

    #[inline]
    fn node_mut(&mut self, i: u32) -> &mut Node {
        debug_assert!(i < self.first_free);
        // Safety: Slots below `first_free` are initialized
        unsafe { &mut *self.nodes.as_ptr().add(i as usize) }
    }

    #[inline]
    fn parent(&self, i: u32) -> u32 {
        self.node(i).parent
    }

    #[inline]
    fn left(&self, i: u32) -> u32 {
        self.node(i).left
    }

    #[inline]
    fn right(&self, i: u32) -> u32 {
        self.node(i).right
    }

    /// `NIL` counts as black.
    #[inline]
    fn is_red(&self, i: u32) -> bool {
        i != NIL && self.node(i).red
    }

    #[inline]
    fn set_red(&mut self, i: u32, red: bool) {
        if i != NIL {
            self.node_mut(i).red = red;
        } else {
            debug_assert!(!red);
        }
    }

    #[inline]
    fn grandparent(&self, i: u32) -> u32 {
        match self.parent(i) {
            NIL => NIL,
            p => self.parent(p),
        }
    }

    #[inline]
    fn uncle(&self, i: u32) -> u32 {
        match self.grandparent(i) {
            NIL => NIL,
            g if self.parent(i) == self.left(g) => self.right(g),
            g => self.left(g),
        }
    }

    /// Find `i`'s in-order successor.
    fn successor(&self, mut i: u32) -> u32 {
        let right = self.right(i);
        if right != NIL {
            return self.minimum(right);
        }
        let mut p = self.parent(i);
        while p != NIL && i == self.right(p) {
            i = p;
            p = self.parent(p);
        }
        p
    }

    fn minimum(&self, mut i: u32) -> u32 {
        while self.left(i) != NIL {
            i = self.left(i);
        }
        i
    }

    /// Point `parent`'s link to `old` (or the root, if `parent` is `NIL`) at
    /// `new`.
    #[inline]
    fn replace_child(&mut self, parent: u32, old: u32, new: u32) {
        if parent == NIL {
            self.root = new;
        } else if self.left(parent) == old {
            self.node_mut(parent).left = new;
        } else {
            debug_assert_eq!(self.right(parent), old);
            self.node_mut(parent).right = new;
        }
    }

    fn rotate_left(&mut self, x: u32) {
        let y = self.right(x);
        let y_left = self.left(y);

        self.node_mut(x).right = y_left;
        if y_left != NIL {
            self.node_mut(y_left).parent = x;
        }

        let x_parent = self.parent(x);
        self.node_mut(y).parent = x_parent;
        self.replace_child(x_parent, x, y);

        self.node_mut(y).left = x;
        self.node_mut(x).parent = y;
    }

    fn rotate_right(&mut self, x: u32) {
        let y = self.left(x);
        let y_right = self.right(y);

        self.node_mut(x).left = y_right;
        if y_right != NIL {
            self.node_mut(y_right).parent = x;
        }

        let x_parent = self.parent(x);
        self.node_mut(y).parent = x_parent;
        self.replace_child(x_parent, x, y);

        self.node_mut(y).right = x;
        self.node_mut(x).parent = y;
    }

    /// Validate a node handle supplied by the caller.
    #[inline]
    fn live(&self, node: NodeId) -> Result<&Node, Error> {
        ensure::<C>(node.0 < self.first_free, Violation::StaleNode)?;
        let n = self.node(node.0);
        ensure::<C>(n.block.is_some(), Violation::StaleNode)?;
        Ok(n)
    }

    /// Get the block indexed by `node`.
    pub fn block(&self, node: NodeId) -> Result<Block, Error> {
        let n = self.live(node)?;
        n.block.ok_or(Error::PreconditionViolation(Violation::StaleNode))
    }

    /// Get the key (block size) of `node`.
    pub fn key(&self, node: NodeId) -> Result<u32, Error> {
        Ok(self.live(node)?.size)
    }

    /// Find the entry with the smallest key not less than `key`.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in logarithmic time.
    pub fn find_min_fit(&self, key: u32) -> Option<NodeId> {
        let mut best = NIL;
        let mut cur = self.root;
        while cur != NIL {
            let n = self.node(cur);
            if n.size >= key {
                // A candidate. Look for a tighter fit on the left.
                best = cur;
                cur = n.left;
            } else {
                cur = n.right;
            }
        }
        if best == NIL {
            None
        } else {
            Some(NodeId(best))
        }
    }

    /// Take a slot from the list of empties, or from `first_free` if there
    /// are none. The caller must ensure `len < capacity`.
    fn acquire_slot(&mut self, node: Node) -> u32 {
        if self.empties != NIL {
            let i = self.empties;
            self.empties = self.node(i).left;
            *self.node_mut(i) = node;
            i
        } else {
            debug_assert!(self.first_free < self.capacity);
            let i = self.first_free;
            // Safety: `i < capacity`, so the slot is within the pool
            unsafe { self.nodes.as_ptr().add(i as usize).write(node) };
            self.first_free += 1;
            i
        }
    }

    fn release_slot(&mut self, i: u32) {
        let empties = self.empties;
        *self.node_mut(i) = Node {
            parent: NIL,
            left: empties,
            right: NIL,
            block: None,
            size: 0,
            red: false,
        };
        self.empties = i;
    }

    /// Insert an entry for `block` with key `size`.
    ///
    /// Fails with [`Error::IndexFull`] if every pool slot is in use.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in logarithmic time.
    pub fn insert(&mut self, size: u32, block: Block) -> Result<NodeId, Error> {
        if self.is_full() {
            log::debug!("tree insert: index full ({} nodes)", self.capacity);
            return Err(Error::IndexFull);
        }

        let mut parent = NIL;
        let mut cur = self.root;
        while cur != NIL {
            parent = cur;
            // Equal keys go left, ahead of the existing ones
            cur = if size <= self.node(cur).size {
                self.left(cur)
            } else {
                self.right(cur)
            };
        }

        let z = self.acquire_slot(Node {
            parent,
            left: NIL,
            right: NIL,
            block: Some(block),
            size,
            red: true,
        });

        if parent == NIL {
            self.root = z;
        } else if size <= self.node(parent).size {
            self.node_mut(parent).left = z;
        } else {
            self.node_mut(parent).right = z;
        }

        self.insert_fixup(z);
        self.len += 1;

        Ok(NodeId(z))
    }

    fn insert_fixup(&mut self, mut z: u32) {
        while self.is_red(self.parent(z)) {
            // A red parent is never the root, so the grandparent exists
            let uncle = self.uncle(z);
            let g = self.grandparent(z);

            if self.is_red(uncle) {
                self.set_red(self.parent(z), false);
                self.set_red(uncle, false);
                self.set_red(g, true);
                z = g;
                continue;
            }

            if self.parent(z) == self.left(g) {
                if z == self.right(self.parent(z)) {
                    // Triangle; turn it into a line
                    z = self.parent(z);
                    self.rotate_left(z);
                }
                self.set_red(self.parent(z), false);
                self.set_red(g, true);
                self.rotate_right(g);
            } else {
                if z == self.left(self.parent(z)) {
                    z = self.parent(z);
                    self.rotate_right(z);
                }
                self.set_red(self.parent(z), false);
                self.set_red(g, true);
                self.rotate_left(g);
            }
        }

        self.set_red(self.root, false);
    }

    /// Replace the subtree rooted at `u` with the one rooted at `v`.
    fn transplant(&mut self, u: u32, v: u32) {
        let u_parent = self.parent(u);
        self.replace_child(u_parent, u, v);
        if v != NIL {
            self.node_mut(v).parent = u_parent;
        }
    }

    /// Remove the entry `node`, returning the block it referenced. The slot
    /// is recycled by a later insertion.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in logarithmic time.
    pub fn remove(&mut self, node: NodeId) -> Result<Block, Error> {
        let block = self.block(node)?;
        let z = node.0;

        // `x` moves into the position vacated by the physically removed
        // node. It may be `NIL`, hence `x_parent`.
        let x;
        let x_parent;
        let removed_red;

        if self.left(z) == NIL {
            x = self.right(z);
            x_parent = self.parent(z);
            removed_red = self.is_red(z);
            self.transplant(z, x);
        } else if self.right(z) == NIL {
            x = self.left(z);
            x_parent = self.parent(z);
            removed_red = self.is_red(z);
            self.transplant(z, x);
        } else {
            // Splice out the in-order successor instead
            let y = self.minimum(self.right(z));
            removed_red = self.is_red(y);
            x = self.right(y);

            if self.parent(y) == z {
                x_parent = y;
            } else {
                x_parent = self.parent(y);
                self.transplant(y, x);
                let z_right = self.right(z);
                self.node_mut(y).right = z_right;
                self.node_mut(z_right).parent = y;
            }

            self.transplant(z, y);
            let z_left = self.left(z);
            self.node_mut(y).left = z_left;
            self.node_mut(z_left).parent = y;
            let z_red = self.is_red(z);
            self.set_red(y, z_red);
        }

        if !removed_red {
            self.remove_fixup(x, x_parent);
        }

        self.release_slot(z);
        self.len -= 1;

        Ok(block)
    }

    fn remove_fixup(&mut self, mut x: u32, mut x_parent: u32) {
        // `x` carries an extra black. Its sibling is never `NIL` because
        // the sibling's subtree has a black height of at least one.
        while x != self.root && !self.is_red(x) {
            if x == self.left(x_parent) {
                let mut w = self.right(x_parent);
                if self.is_red(w) {
                    self.set_red(w, false);
                    self.set_red(x_parent, true);
                    self.rotate_left(x_parent);
                    w = self.right(x_parent);
                }

                if !self.is_red(self.left(w)) && !self.is_red(self.right(w)) {
                    self.set_red(w, true);
                    x = x_parent;
                    x_parent = self.parent(x);
                } else {
                    if !self.is_red(self.right(w)) {
                        self.set_red(self.left(w), false);
                        self.set_red(w, true);
                        self.rotate_right(w);
                        w = self.right(x_parent);
                    }
                    let parent_red = self.is_red(x_parent);
                    self.set_red(w, parent_red);
                    self.set_red(x_parent, false);
                    self.set_red(self.right(w), false);
                    self.rotate_left(x_parent);
                    x = self.root;
                }
            } else {
                let mut w = self.left(x_parent);
                if self.is_red(w) {
                    self.set_red(w, false);
                    self.set_red(x_parent, true);
                    self.rotate_right(x_parent);
                    w = self.left(x_parent);
                }

                if !self.is_red(self.right(w)) && !self.is_red(self.left(w)) {
                    self.set_red(w, true);
                    x = x_parent;
                    x_parent = self.parent(x);
                } else {
                    if !self.is_red(self.left(w)) {
                        self.set_red(self.right(w), false);
                        self.set_red(w, true);
                        self.rotate_left(w);
                        w = self.left(x_parent);
                    }
                    let parent_red = self.is_red(x_parent);
                    self.set_red(w, parent_red);
                    self.set_red(x_parent, false);
                    self.set_red(self.left(w), false);
                    self.rotate_right(x_parent);
                    x = self.root;
                }
            }
        }

        self.set_red(x, false);
    }

    /// Find the entry for `block`, whose key must be `size`.
    ///
    /// # Time Complexity
    ///
    /// Logarithmic in the number of entries plus linear in the number of
    /// entries with key `size`.
    pub fn find_block(&self, size: u32, block: Block) -> Option<NodeId> {
        let mut cur = self.find_min_fit(size)?.0;
        while cur != NIL {
            let n = self.node(cur);
            if n.size != size {
                break;
            }
            if n.block == Some(block) {
                return Some(NodeId(cur));
            }
            cur = self.successor(cur);
        }
        None
    }

    /// Remove the entry for `block`, whose key must be `size`.
    pub fn remove_block(&mut self, size: u32, block: Block) -> Result<(), Error> {
        match self.find_block(size, block) {
            Some(node) => self.remove(node).map(|_| ()),
            None => Err(violation::<C>(Violation::NotIndexed)),
        }
    }

    /// Iterate over the entries in key order, yielding `(size, block)`.
    #[inline]
    pub fn iter(&self) -> Iter<'_, S, C> {
        Iter {
            tree: self,
            next: if self.root == NIL {
                NIL
            } else {
                self.minimum(self.root)
            },
        }
    }

    /// Check the tree's structural invariants and return its black height.
    #[cfg(test)]
    pub(crate) fn validate(&self) -> u32 {
        use std::vec::Vec;

        assert!(!self.is_red(self.root), "root is red");
        if self.root != NIL {
            assert_eq!(self.parent(self.root), NIL);
        }

        let (black_height, count) = self.validate_subtree(self.root);
        assert_eq!(count, self.len);

        let keys: Vec<u32> = self.iter().map(|(size, _)| size).collect();
        assert!(keys.windows(2).all(|w| w[0] <= w[1]), "keys: {:?}", keys);

        let mut empties = 0;
        let mut i = self.empties;
        while i != NIL {
            assert!(self.node(i).block.is_none());
            empties += 1;
            i = self.left(i);
        }
        assert_eq!(empties + self.len, self.first_free);
        assert!(self.first_free <= self.capacity);

        black_height
    }

    #[cfg(test)]
    fn validate_subtree(&self, i: u32) -> (u32, u32) {
        if i == NIL {
            return (1, 0);
        }
        let n = *self.node(i);
        assert!(n.block.is_some(), "vacated slot {} is linked", i);

        for child in [n.left, n.right] {
            if child != NIL {
                assert_eq!(self.parent(child), i);
                assert!(!(n.red && self.is_red(child)), "red node {} has a red child", i);
            }
        }

        let (left_height, left_count) = self.validate_subtree(n.left);
        let (right_height, right_count) = self.validate_subtree(n.right);
        assert_eq!(left_height, right_height, "black height differs at {}", i);

        (left_height + !n.red as u32, left_count + right_count + 1)
    }
}

impl<S: RawSource, C: Checks> Drop for FreeTree<S, C> {
    fn drop(&mut self) {
        log::trace!("tree destroy: {} nodes at {:p}", self.capacity, self.nodes);
        if let Some(layout) = self.pool_layout {
            // Safety: The pool was acquired from `source` with `layout` and is
            //         released exactly once
            unsafe { self.source.release(self.nodes.cast(), layout) };
        }
    }
}

/// An iterator over the entries of a [`FreeTree`] in key order, created by
/// [`FreeTree::iter`].
pub struct Iter<'a, S: RawSource, C: Checks> {
    tree: &'a FreeTree<S, C>,
    next: u32,
}

impl<S: RawSource, C: Checks> Iterator for Iter<'_, S, C> {
    type Item = (u32, Block);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == NIL {
            return None;
        }
        let i = self.next;
        self.next = self.tree.successor(i);
        let n = self.tree.node(i);
        Some((n.size, n.block?))
    }
}

#[cfg(test)]
mod tests;
