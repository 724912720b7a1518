//! B+ Tree index over pluggable paged storage.
//!
//! A persistent, ordered key-value index with:
//! - point insertion, lookup and deletion over byte-string keys
//! - logarithmic height under a fixed per-tree branching factor
//! - all leaves on one level, chained left-to-right for ordered walks
//! - no disk I/O of its own: pages are allocated, resolved and freed
//!   through the [`PageStore`] seam, and persisted by whatever wraps it
//!   using the page codec in [`page`]
//!
//! The tree is single-threaded and holds no locks. Inserting a key that
//! is already present does not replace the existing value: both entries
//! coexist in adjacent leaf slots, newest first (append-on-duplicate).
//! Callers needing upsert must delete first.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{TreeError, TreeResult};

pub mod key;
pub mod node;
pub mod page;


pub use key::{compare, Key, Value};
pub use node::{InternalNode, LeafNode, Node};
pub use page::{
    decode_node, encode_node, MemoryPageStore, NodeHandle, PageId, PageStore, MAX_KEY_SIZE,
    MAX_VAL_SIZE, NO_PAGE, PAGE_SIZE,
};

/// Serializable snapshot of a tree handle. The tree keeps no on-disk
/// metadata of its own; the enclosing system persists this next to the
/// pages and reattaches with [`BTree::from_meta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeMeta {
    /// Root page id, [`NO_PAGE`] for an empty tree.
    pub root: PageId,
    /// Branching factor the tree was built with.
    pub order: u8,
}

/// A split result travelling up the insert recursion: the separator key
/// and the two child pages it divides.
#[derive(Debug)]
struct Promotion {
    key: Key,
    left: PageId,
    right: PageId,
}

impl Promotion {
    /// One-key internal node form, for installation as a page.
    fn into_node(self, order: u8) -> Node {
        let mut node = InternalNode::new(order);
        node.keys.push(self.key);
        node.children.push(self.left);
        node.children.push(self.right);
        Node::Internal(node)
    }
}

/// B+ tree index handle: the root page, the branching factor and the
/// page store the tree works against.
pub struct BTree<S: PageStore> {
    root: PageId,
    order: u8,
    min_keys: u8,
    store: S,
}

impl<S: PageStore> BTree<S> {
    /// Creates an empty tree of the given order over `store`.
    ///
    /// Fails when a full node of this order cannot encode into one page
    /// or the order is below 3.
    pub fn new(store: S, order: u8) -> TreeResult<Self> {
        Self::open(store, NO_PAGE, order)
    }

    /// Reattaches to an existing root, for callers that persisted one.
    pub fn open(store: S, root: PageId, order: u8) -> TreeResult<Self> {
        page::check_order(order)?;
        info!(root, order, "opening B+ tree index");
        Ok(Self {
            root,
            order,
            min_keys: (order + 1) / 2 - 1,
            store,
        })
    }

    /// Reattaches from a persisted metadata snapshot.
    pub fn from_meta(store: S, meta: TreeMeta) -> TreeResult<Self> {
        Self::open(store, meta.root, meta.order)
    }

    /// Snapshot of the handle for the enclosing system to persist.
    #[must_use]
    pub fn meta(&self) -> TreeMeta {
        TreeMeta {
            root: self.root,
            order: self.order,
        }
    }

    /// Current root page id, [`NO_PAGE`] for an empty tree.
    #[must_use]
    pub fn root(&self) -> PageId {
        self.root
    }

    /// Branching factor of this tree.
    #[must_use]
    pub fn order(&self) -> u8 {
        self.order
    }

    /// Minimum key count for any non-root node.
    #[must_use]
    pub fn min_keys(&self) -> u8 {
        self.min_keys
    }

    /// Whether the tree holds no entries at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root == NO_PAGE
    }

    /// The page store backing this tree.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Gives the page store back, e.g. to reattach later via
    /// [`BTree::from_meta`].
    pub fn into_store(self) -> S {
        self.store
    }

    fn max_keys(&self) -> usize {
        self.order as usize - 1
    }

    fn resolve(&self, id: PageId) -> TreeResult<NodeHandle> {
        self.store.resolve(id).ok_or(TreeError::UnresolvedPage(id))
    }

    fn key_count(&self, id: PageId) -> TreeResult<usize> {
        Ok(self.resolve(id)?.borrow().num_keys())
    }

    // === SEARCH ===

    /// Looks up the value paired with `key`, or `None` when absent.
    ///
    /// Under append-on-duplicate, which of several equal entries is
    /// returned follows descent order and is not otherwise specified.
    pub fn search(&self, key: &[u8]) -> TreeResult<Option<Value>> {
        if self.root == NO_PAGE {
            return Ok(None);
        }
        let mut current = self.root;
        loop {
            let handle = self.resolve(current)?;
            let node = handle.borrow();
            match &*node {
                Node::Internal(internal) => {
                    current = internal.children[internal.child_for_search(key)];
                }
                Node::Leaf(leaf) => return Ok(leaf.get(key).cloned()),
            }
        }
    }

    // === INSERT ===

    /// Inserts an entry. An existing equal key is kept; the new entry
    /// lands in the slot just before it.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> TreeResult<()> {
        debug!(key_len = key.len(), value_len = value.len(), "inserting entry");

        if self.root == NO_PAGE {
            let mut leaf = LeafNode::new(self.order);
            leaf.insert(key.to_vec(), value.to_vec());
            self.root = self.store.allocate(Node::Leaf(leaf));
            return Ok(());
        }

        if let Some(promotion) = self.insert_recursive(self.root, key, value)? {
            // the split escaped the root: install the promotion above it
            let old_root = promotion.left;
            self.root = self.store.allocate(promotion.into_node(self.order));
            debug!(root = self.root, below = old_root, "grew tree by one level");
        }
        Ok(())
    }

    /// Descends to the leaf for `key`, inserting there and splitting on
    /// the way back up as long as promotions keep overflowing.
    fn insert_recursive(
        &mut self,
        page_id: PageId,
        key: &[u8],
        value: &[u8],
    ) -> TreeResult<Option<Promotion>> {
        let handle = self.resolve(page_id)?;

        let descent = {
            let guard = handle.borrow();
            guard.try_as_internal().map(|internal| {
                let at = internal.child_for_insert(key);
                (at, internal.children[at])
            })
        };

        let Some((at, child)) = descent else {
            let mut guard = handle.borrow_mut();
            let Some(leaf) = guard.try_as_leaf_mut() else {
                return Err(TreeError::ExpectedLeaf(page_id));
            };
            if leaf.num_keys() < self.max_keys() {
                leaf.insert(key.to_vec(), value.to_vec());
                return Ok(None);
            }
            return self
                .split_leaf_and_insert(page_id, leaf, key, value)
                .map(Some);
        };

        let Some(promotion) = self.insert_recursive(child, key, value)? else {
            return Ok(None);
        };

        {
            let mut guard = handle.borrow_mut();
            let Some(internal) = guard.try_as_internal_mut() else {
                return Err(TreeError::ExpectedInternal(page_id));
            };
            if internal.num_keys() < self.max_keys() {
                internal.insert_separator(at, promotion.key, promotion.left, promotion.right);
                return Ok(None);
            }
        }

        // full on the way up as well: give the promotion a page of its
        // own and split this node around it
        let promotion_id = self.store.allocate(promotion.into_node(self.order));
        self.merge_full_internal_and_split(page_id, at, promotion_id)
            .map(Some)
    }

    /// Splits a full leaf around a new entry. The overflow buffer holds
    /// all `order` entries in sorted position; the lower half stays in
    /// place, the upper half moves to a fresh right sibling spliced into
    /// the leaf chain. The promoted separator is the right half's
    /// smallest key.
    fn split_leaf_and_insert(
        &mut self,
        page_id: PageId,
        leaf: &mut LeafNode,
        key: &[u8],
        value: &[u8],
    ) -> TreeResult<Promotion> {
        let at = leaf.insertion_point(key);
        let mut keys = std::mem::take(&mut leaf.keys);
        let mut values = std::mem::take(&mut leaf.values);
        keys.insert(at, key.to_vec());
        values.insert(at, value.to_vec());

        let split = (self.order as usize - 1).div_ceil(2);
        let right_keys = keys.split_off(split);
        let right_values = values.split_off(split);
        let separator = right_keys[0].clone();

        leaf.keys = keys;
        leaf.values = values;

        let right = LeafNode {
            keys: right_keys,
            values: right_values,
            next: leaf.next,
        };
        let right_id = self.store.allocate(Node::Leaf(right));
        leaf.next = right_id;

        debug!(left = page_id, right = right_id, "split leaf");
        Ok(Promotion {
            key: separator,
            left: page_id,
            right: right_id,
        })
    }

    /// Splits a full internal node absorbing a promotion. The overflow
    /// buffers hold `order` keys and `order + 1` children; the key at
    /// the split point becomes the new separator, and the promotion's
    /// page is rewritten into the right sibling so every allocation
    /// stays referenced.
    fn merge_full_internal_and_split(
        &mut self,
        page_id: PageId,
        at: usize,
        promotion_id: PageId,
    ) -> TreeResult<Promotion> {
        let promo_handle = self.resolve(promotion_id)?;
        let node_handle = self.resolve(page_id)?;

        let (promo_key, promo_left, promo_right) = {
            let guard = promo_handle.borrow();
            let Some(promo) = guard.try_as_internal() else {
                return Err(TreeError::ExpectedInternal(promotion_id));
            };
            (promo.keys[0].clone(), promo.children[0], promo.children[1])
        };

        let separator;
        let right;
        {
            let mut guard = node_handle.borrow_mut();
            let Some(internal) = guard.try_as_internal_mut() else {
                return Err(TreeError::ExpectedInternal(page_id));
            };

            let mut keys = std::mem::take(&mut internal.keys);
            keys.insert(at, promo_key);
            let mut children = std::mem::take(&mut internal.children);
            children[at] = promo_left;
            children.insert(at + 1, promo_right);

            let split = self.order as usize / 2;
            let right_keys = keys.split_off(split + 1);
            let right_children = children.split_off(split + 1);
            separator = keys.remove(split);

            internal.keys = keys;
            internal.children = children;
            right = InternalNode {
                keys: right_keys,
                children: right_children,
            };
        }

        *promo_handle.borrow_mut() = Node::Internal(right);

        debug!(left = page_id, right = promotion_id, "split internal node");
        Ok(Promotion {
            key: separator,
            left: page_id,
            right: promotion_id,
        })
    }

    // === DELETE ===

    /// Removes the first entry equal to `key`, reporting whether one
    /// existed. Ancestor separators naming the removed key are repaired
    /// and underfull nodes are rebalanced by borrow or merge.
    pub fn delete(&mut self, key: &[u8]) -> TreeResult<bool> {
        debug!(key_len = key.len(), "deleting entry");
        if self.root == NO_PAGE {
            return Ok(false);
        }

        // descend, recording (parent id, child index taken) per level
        let mut trail: Vec<(PageId, usize)> = Vec::new();
        let mut current = self.root;
        loop {
            let handle = self.resolve(current)?;
            let step = {
                let guard = handle.borrow();
                guard.try_as_internal().map(|internal| {
                    let at = internal.child_for_delete(key);
                    (at, internal.children[at])
                })
            };
            let Some((at, child)) = step else { break };
            trail.push((current, at));
            current = child;
        }

        let leaf_id = current;
        let removed_at = {
            let handle = self.resolve(leaf_id)?;
            let mut guard = handle.borrow_mut();
            let Some(leaf) = guard.try_as_leaf_mut() else {
                return Err(TreeError::ExpectedLeaf(leaf_id));
            };
            leaf.remove(key)
        };
        let Some(removed_at) = removed_at else {
            return Ok(false);
        };

        if removed_at == 0 {
            // the subtree's smallest key changed and may be quoted as a
            // separator anywhere up the spine
            self.repair_separators(leaf_id, &trail, key)?;
        }
        self.rebalance(leaf_id, trail)?;
        Ok(true)
    }

    /// Replaces every ancestor separator equal to the removed key with
    /// the subtree's next smallest key. The walk covers the whole trail:
    /// a leaf on the leftmost spine of several subtrees can surface the
    /// same separator again closer to the root, so no early stop on the
    /// first mismatch.
    fn repair_separators(
        &self,
        leaf_id: PageId,
        trail: &[(PageId, usize)],
        removed: &[u8],
    ) -> TreeResult<()> {
        let Some(replacement) = self.next_smallest(leaf_id, trail)? else {
            // the leaf emptied as a rightmost child; the stale separator
            // disappears with the upcoming merge
            return Ok(());
        };
        for &(ancestor_id, child_index) in trail.iter().rev() {
            if child_index == 0 {
                continue;
            }
            let handle = self.resolve(ancestor_id)?;
            let mut guard = handle.borrow_mut();
            let Some(internal) = guard.try_as_internal_mut() else {
                return Err(TreeError::ExpectedInternal(ancestor_id));
            };
            if compare(&internal.keys[child_index - 1], removed).is_eq() {
                internal.keys[child_index - 1].clone_from(&replacement);
            }
        }
        Ok(())
    }

    /// Smallest key now standing where the deletion hit: the leaf's new
    /// first key, else the right sibling's first key, or nothing when
    /// the leaf emptied as the rightmost child of its parent.
    fn next_smallest(&self, leaf_id: PageId, trail: &[(PageId, usize)]) -> TreeResult<Option<Key>> {
        {
            let handle = self.resolve(leaf_id)?;
            let guard = handle.borrow();
            if let Some(first) = guard.first_key() {
                return Ok(Some(first.clone()));
            }
        }
        let Some(&(parent_id, child_index)) = trail.last() else {
            return Ok(None);
        };
        let sibling_id = {
            let handle = self.resolve(parent_id)?;
            let guard = handle.borrow();
            let Some(parent) = guard.try_as_internal() else {
                return Err(TreeError::ExpectedInternal(parent_id));
            };
            if child_index == parent.num_keys() {
                return Ok(None);
            }
            parent.children[child_index + 1]
        };
        let handle = self.resolve(sibling_id)?;
        let first = handle.borrow().first_key().cloned();
        Ok(first)
    }

    /// Restores minimum occupancy from `node_id` upward: borrow from a
    /// sibling holding spare keys, else merge with one and continue on
    /// the parent. The root is exempt; an emptied root collapses.
    fn rebalance(&mut self, mut node_id: PageId, mut trail: Vec<(PageId, usize)>) -> TreeResult<()> {
        loop {
            let num_keys = self.key_count(node_id)?;
            if num_keys >= self.min_keys as usize {
                return Ok(());
            }

            let Some((parent_id, child_index)) = trail.pop() else {
                if num_keys == 0 {
                    self.collapse_root(node_id)?;
                }
                return Ok(());
            };

            let (left_id, right_id) = {
                let handle = self.resolve(parent_id)?;
                let guard = handle.borrow();
                let Some(parent) = guard.try_as_internal() else {
                    return Err(TreeError::ExpectedInternal(parent_id));
                };
                let left = (child_index > 0).then(|| parent.children[child_index - 1]);
                let right =
                    (child_index < parent.num_keys()).then(|| parent.children[child_index + 1]);
                (left, right)
            };

            // borrow only moves a key a sibling can spare
            if let Some(left_id) = left_id {
                if self.key_count(left_id)? > self.min_keys as usize {
                    return self.borrow_from_left(parent_id, child_index, left_id, node_id);
                }
            }
            if let Some(right_id) = right_id {
                if self.key_count(right_id)? > self.min_keys as usize {
                    return self.borrow_from_right(parent_id, child_index, node_id, right_id);
                }
            }

            match (left_id, right_id) {
                // the leftmost child merges rightward, everyone else
                // folds into their left sibling
                (None, Some(right_id)) => {
                    self.merge_right(node_id, right_id, parent_id, child_index)?;
                }
                (Some(left_id), _) => {
                    self.merge_right(left_id, node_id, parent_id, child_index - 1)?;
                }
                (None, None) => {
                    return Err(TreeError::Invariant {
                        page: node_id,
                        reason: "underfull node with no siblings under a non-root parent",
                    });
                }
            }
            node_id = parent_id;
        }
    }

    fn collapse_root(&mut self, root_id: PageId) -> TreeResult<()> {
        let new_root = {
            let handle = self.resolve(root_id)?;
            let guard = handle.borrow();
            match &*guard {
                Node::Internal(internal) => internal.children[0],
                Node::Leaf(_) => NO_PAGE,
            }
        };
        self.store.free(root_id);
        self.root = new_root;
        debug!(root = new_root, "collapsed root");
        Ok(())
    }

    /// Moves the left sibling's last key into this node. For leaves the
    /// parent separator follows the moved key; for internals the
    /// separator rotates down and the sibling's last key rotates up.
    fn borrow_from_left(
        &self,
        parent_id: PageId,
        child_index: usize,
        left_id: PageId,
        node_id: PageId,
    ) -> TreeResult<()> {
        let parent_handle = self.resolve(parent_id)?;
        let left_handle = self.resolve(left_id)?;
        let node_handle = self.resolve(node_id)?;

        let mut parent_guard = parent_handle.borrow_mut();
        let Some(parent) = parent_guard.try_as_internal_mut() else {
            return Err(TreeError::ExpectedInternal(parent_id));
        };
        let mut left_guard = left_handle.borrow_mut();
        let mut node_guard = node_handle.borrow_mut();

        match (&mut *left_guard, &mut *node_guard) {
            (Node::Leaf(left), Node::Leaf(node)) => {
                let last = left.num_keys() - 1;
                let key = left.keys.remove(last);
                let value = left.values.remove(last);
                parent.keys[child_index - 1].clone_from(&key);
                node.keys.insert(0, key);
                node.values.insert(0, value);
            }
            (Node::Internal(left), Node::Internal(node)) => {
                let last = left.num_keys() - 1;
                let separator =
                    std::mem::replace(&mut parent.keys[child_index - 1], left.keys.remove(last));
                node.keys.insert(0, separator);
                let child = left.children.remove(left.children.len() - 1);
                node.children.insert(0, child);
            }
            _ => {
                return Err(TreeError::Invariant {
                    page: node_id,
                    reason: "siblings of different kinds",
                });
            }
        }
        debug!(from = left_id, to = node_id, "borrowed key from left sibling");
        Ok(())
    }

    /// Moves the right sibling's first key into this node. For leaves
    /// the parent separator becomes the right sibling's first key after
    /// the move; for internals separator and key rotate through the
    /// parent as on the left side, mirrored.
    fn borrow_from_right(
        &self,
        parent_id: PageId,
        child_index: usize,
        node_id: PageId,
        right_id: PageId,
    ) -> TreeResult<()> {
        let parent_handle = self.resolve(parent_id)?;
        let node_handle = self.resolve(node_id)?;
        let right_handle = self.resolve(right_id)?;

        let mut parent_guard = parent_handle.borrow_mut();
        let Some(parent) = parent_guard.try_as_internal_mut() else {
            return Err(TreeError::ExpectedInternal(parent_id));
        };
        let mut node_guard = node_handle.borrow_mut();
        let mut right_guard = right_handle.borrow_mut();

        match (&mut *node_guard, &mut *right_guard) {
            (Node::Leaf(node), Node::Leaf(right)) => {
                node.keys.push(right.keys.remove(0));
                node.values.push(right.values.remove(0));
                parent.keys[child_index].clone_from(&right.keys[0]);
            }
            (Node::Internal(node), Node::Internal(right)) => {
                let separator =
                    std::mem::replace(&mut parent.keys[child_index], right.keys.remove(0));
                node.keys.push(separator);
                node.children.push(right.children.remove(0));
            }
            _ => {
                return Err(TreeError::Invariant {
                    page: node_id,
                    reason: "siblings of different kinds",
                });
            }
        }
        debug!(from = right_id, to = node_id, "borrowed key from right sibling");
        Ok(())
    }

    /// Folds `right_id` into `left_id` and drops the separator between
    /// them from the parent. For leaves the chain link skips the merged
    /// page; for internals the separator comes down between the two key
    /// runs. The right page is freed.
    fn merge_right(
        &mut self,
        left_id: PageId,
        right_id: PageId,
        parent_id: PageId,
        left_index: usize,
    ) -> TreeResult<()> {
        let parent_handle = self.resolve(parent_id)?;
        let left_handle = self.resolve(left_id)?;
        let right_handle = self.resolve(right_id)?;

        {
            let mut parent_guard = parent_handle.borrow_mut();
            let Some(parent) = parent_guard.try_as_internal_mut() else {
                return Err(TreeError::ExpectedInternal(parent_id));
            };
            let mut left_guard = left_handle.borrow_mut();
            let mut right_guard = right_handle.borrow_mut();

            let separator = parent.keys.remove(left_index);
            parent.children.remove(left_index + 1);

            match (&mut *left_guard, &mut *right_guard) {
                (Node::Leaf(left), Node::Leaf(right)) => {
                    left.keys.append(&mut right.keys);
                    left.values.append(&mut right.values);
                    left.next = right.next;
                }
                (Node::Internal(left), Node::Internal(right)) => {
                    left.keys.push(separator);
                    left.keys.append(&mut right.keys);
                    left.children.append(&mut right.children);
                }
                _ => {
                    return Err(TreeError::Invariant {
                        page: left_id,
                        reason: "siblings of different kinds",
                    });
                }
            }
        }

        self.store.free(right_id);
        debug!(left = left_id, right = right_id, "merged siblings");
        Ok(())
    }
}

impl<S: PageStore> fmt::Debug for BTree<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BTree")
            .field("root", &self.root)
            .field("order", &self.order)
            .field("min_keys", &self.min_keys)
            .finish_non_exhaustive()
    }
}
