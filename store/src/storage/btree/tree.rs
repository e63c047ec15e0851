//! B-tree operations over the buffer cache.
//!
//! Every operation descends from the root with lock coupling: the next
//! block is locked before the current one is released.
//!
//! # Design
//!
//! Writers restructure on the way down so they never need to walk back up:
//!
//! - Insert splits any full node before entering it. The parent was itself
//!   made non-full on the way down, so it always has room for the new
//!   separator.
//! - Remove rebalances any `underfull_or_min` node before entering it, by
//!   merging with an adjacent sibling if their union fits and leveling
//!   otherwise. Full internal nodes are split first, which leaves room for
//!   a longer separator after a level.
//!
//! The root keeps its block id for the life of the tree. It grows by
//! splitting in place and shrinks by absorbing its only child.

use tracing::{debug, info};

use crate::storage::btree::internal::{self, InternalNode, entry_footprint};
use crate::storage::btree::iter::Cursor;
use crate::storage::btree::key::{KeyRange, fits_inline, max_key_size, usable_space};
use crate::storage::btree::leaf::{self, LeafNode};
use crate::storage::btree::node::{Node, NodeError, Side};
use crate::storage::cache::{BlockLock, CacheError, LockMode};
use crate::storage::overflow::{
    OverflowError, OverflowHandle, StoredValue, free_overflow, read_overflow, write_overflow,
};
use crate::storage::page::{BlockHeader, BlockId, BlockType};
use crate::storage::transaction::Transactor;

/// A value removed from a leaf, and the chain it owned.
type Previous = (Vec<u8>, Option<OverflowHandle>);

/// A neighbour of the child being prepared, and the separator between them.
struct Sibling {
    block_id: BlockId,
    separator: Vec<u8>,
}

/// A B-tree rooted at a fixed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTree {
    root: BlockId,
}

/// Counts gathered by [`BTree::verify`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Levels from the root to the leaves; 1 for a lone leaf.
    pub depth: usize,
    /// All nodes.
    pub nodes: usize,
    /// Leaf nodes.
    pub leaves: usize,
    /// Internal nodes.
    pub internal: usize,
    /// Live pairs.
    pub pairs: usize,
    /// Values stored out of line.
    pub overflow_values: usize,
}

enum RootAction {
    Collapse(BlockId),
    Split,
    Compact,
    Done,
}

impl BTree {
    /// Create an empty tree in a newly allocated block.
    pub fn create(txn: &Transactor) -> Result<Self, BTreeError> {
        let mut lock = txn.allocate_block()?;
        leaf::init(lock.data_mut()?);
        let root = lock.block_id();
        info!(root, "created tree");
        Ok(Self { root })
    }

    /// Open the tree rooted at `root`.
    #[must_use]
    pub const fn open(root: BlockId) -> Self {
        Self { root }
    }

    /// The root block.
    #[must_use]
    pub const fn root(&self) -> BlockId {
        self.root
    }

    /// Look up the value stored under `key`.
    pub fn lookup(&self, txn: &Transactor, key: &[u8]) -> Result<Option<Vec<u8>>, BTreeError> {
        if key.len() > max_key_size(txn.block_size()) {
            return Ok(None);
        }

        let mut lock = txn.acquire(self.root, LockMode::Read)?;
        loop {
            let block_id = lock.block_id();
            let child = match Node::parse(lock.data()).map_err(at(block_id))? {
                Node::Internal(node) => node.child_id_for_key(key).map_err(at(block_id))?,
                Node::Leaf(leaf) => {
                    let Some(stored) = leaf.lookup(key).map_err(at(block_id))? else {
                        return Ok(None);
                    };
                    // Resolved while the leaf is still locked
                    return Ok(Some(StoredValue::decode(stored)?.resolve(txn)?));
                }
            };
            lock = txn.acquire(child, LockMode::Read)?;
        }
    }

    /// Insert or replace `key`. Returns the previous value.
    pub fn insert(
        &self,
        txn: &Transactor,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Vec<u8>>, BTreeError> {
        let block_size = txn.block_size();
        let max_key = max_key_size(block_size);
        if key.len() > max_key {
            return Err(BTreeError::KeyTooLarge {
                len: key.len(),
                max: max_key,
            });
        }

        let (stored, handle) = if fits_inline(block_size, key.len(), value.len()) {
            (StoredValue::encode_inline(value), None)
        } else {
            let handle = write_overflow(txn, value)?;
            (StoredValue::encode_overflow(handle), Some(handle))
        };

        let previous = match self.insert_stored(txn, key, &stored, max_key) {
            Ok(previous) => previous,
            Err(e) => {
                if let Some(handle) = handle {
                    // Best effort: the chain is unreachable either way
                    let _ = free_overflow(txn, handle.first_block);
                }
                return Err(e);
            }
        };

        let Some((old_value, old_handle)) = previous else {
            return Ok(None);
        };
        if let Some(old) = old_handle {
            free_overflow(txn, old.first_block)?;
        }
        Ok(Some(old_value))
    }

    /// Remove `key`. Returns the removed value.
    pub fn remove(&self, txn: &Transactor, key: &[u8]) -> Result<Option<Vec<u8>>, BTreeError> {
        let max_key = max_key_size(txn.block_size());
        if key.len() > max_key {
            return Ok(None);
        }

        let mut lock = txn.acquire(self.root, LockMode::Write)?;
        self.prepare_root_for_remove(txn, &mut lock, max_key)?;

        loop {
            let block_id = lock.block_id();
            let index = match Node::parse(lock.data()).map_err(at(block_id))? {
                Node::Leaf(_) => break,
                Node::Internal(node) => node.child_index_for_key(key).map_err(at(block_id))?,
            };

            let child = Self::prepare_child_for_remove(txn, &mut lock, index, key, max_key)?;
            let remaining = InternalNode::new(lock.data()).map_err(at(block_id))?.len();
            if block_id == self.root && remaining == 1 {
                Self::collapse_root(txn, &mut lock, child)?;
                continue;
            }
            lock = child;
        }

        let Some((value, handle)) = Self::remove_from_leaf(txn, &mut lock, key)? else {
            return Ok(None);
        };
        if let Some(handle) = handle {
            free_overflow(txn, handle.first_block)?;
        }
        Ok(Some(value))
    }

    /// Iterate over the pairs in `range`, in key order.
    pub fn iterate(&self, txn: &Transactor, range: KeyRange) -> Result<Cursor, BTreeError> {
        Cursor::new(txn.reader(), self.root, range)
    }

    /// Walk every node, checking node formats, separator bounds, uniform
    /// leaf depth and overflow chain lengths.
    pub fn verify(&self, txn: &Transactor) -> Result<TreeStats, BTreeError> {
        let mut verifier = Verifier {
            txn,
            stats: TreeStats::default(),
            leaf_depth: None,
        };
        verifier.visit(self.root, None, None, 1)?;
        Ok(TreeStats {
            depth: verifier.leaf_depth.unwrap_or(0),
            ..verifier.stats
        })
    }

    fn insert_stored(
        &self,
        txn: &Transactor,
        key: &[u8],
        stored: &[u8],
        max_key: usize,
    ) -> Result<Option<Previous>, BTreeError> {
        let mut lock = txn.acquire(self.root, LockMode::Write)?;
        self.prepare_root_for_insert(txn, &mut lock, key, stored, max_key)?;

        loop {
            let block_id = lock.block_id();
            let child_id = match Node::parse(lock.data()).map_err(at(block_id))? {
                Node::Leaf(_) => None,
                Node::Internal(node) => Some(node.child_id_for_key(key).map_err(at(block_id))?),
            };
            let Some(child_id) = child_id else {
                return Self::insert_into_leaf(txn, &mut lock, key, stored);
            };

            let mut child = txn.acquire(child_id, LockMode::Write)?;
            if Self::make_room(&mut child, key, stored, max_key)? {
                let (right, median) = Self::split_child(txn, &mut child)?;
                internal::insert(lock.data_mut()?, &median, right.block_id())
                    .map_err(at(block_id))?;
                if key >= median.as_slice() {
                    child = right;
                }
            }
            lock = child;
        }
    }

    fn prepare_root_for_insert(
        &self,
        txn: &Transactor,
        root: &mut BlockLock,
        key: &[u8],
        stored: &[u8],
        max_key: usize,
    ) -> Result<(), BTreeError> {
        let block_id = root.block_id();
        let action = match Node::parse(root.data()).map_err(at(block_id))? {
            Node::Internal(node) => {
                if node.is_full(max_key).map_err(at(block_id))? {
                    RootAction::Split
                } else {
                    RootAction::Done
                }
            }
            Node::Leaf(leaf) => {
                if !leaf.is_full(key, stored).map_err(at(block_id))? {
                    RootAction::Done
                } else if leaf.would_fit_compacted(key, stored).map_err(at(block_id))? {
                    RootAction::Compact
                } else {
                    RootAction::Split
                }
            }
        };

        match action {
            RootAction::Split => self.split_root(txn, root),
            RootAction::Compact => leaf::compact(root.data_mut()?).map_err(at(block_id)),
            RootAction::Done | RootAction::Collapse(_) => Ok(()),
        }
    }

    fn prepare_root_for_remove(
        &self,
        txn: &Transactor,
        root: &mut BlockLock,
        max_key: usize,
    ) -> Result<(), BTreeError> {
        loop {
            let block_id = root.block_id();
            let action = match Node::parse(root.data()).map_err(at(block_id))? {
                Node::Leaf(_) => RootAction::Done,
                Node::Internal(node) if node.len() == 1 => {
                    RootAction::Collapse(node.child_at(0).map_err(at(block_id))?)
                }
                Node::Internal(node) => {
                    if node.is_full(max_key).map_err(at(block_id))? {
                        RootAction::Split
                    } else {
                        RootAction::Done
                    }
                }
            };

            match action {
                RootAction::Collapse(child_id) => {
                    let child = txn.acquire(child_id, LockMode::Write)?;
                    Self::collapse_root(txn, root, child)?;
                }
                RootAction::Split => return self.split_root(txn, root),
                RootAction::Done | RootAction::Compact => return Ok(()),
            }
        }
    }

    /// Move the root's content into two new blocks and make the root an
    /// internal node over them.
    fn split_root(&self, txn: &Transactor, root: &mut BlockLock) -> Result<(), BTreeError> {
        let mut left = txn.allocate_block()?;
        left.data_mut()?.copy_from_slice(root.data());
        let (right, median) = match Self::split_child(txn, &mut left) {
            Ok(split) => split,
            Err(e) => {
                // Best effort: the copy is unreachable
                let _ = txn.free_block(left);
                return Err(e);
            }
        };

        internal::init_root(root.data_mut()?, left.block_id(), &median, right.block_id())
            .map_err(at(self.root))?;
        debug!(
            root = self.root,
            left = left.block_id(),
            right = right.block_id(),
            "split root"
        );
        Ok(())
    }

    /// Copy the root's only child into the root and free the child.
    fn collapse_root(
        txn: &Transactor,
        root: &mut BlockLock,
        child: BlockLock,
    ) -> Result<(), BTreeError> {
        root.data_mut()?.copy_from_slice(child.data());
        let child_id = child.block_id();
        txn.free_block(child)?;
        debug!(root = root.block_id(), child = child_id, "collapsed root");
        Ok(())
    }

    /// Split `node` into itself and a new right sibling. Returns the new
    /// sibling's lock and the median.
    fn split_child(
        txn: &Transactor,
        node: &mut BlockLock,
    ) -> Result<(BlockLock, Vec<u8>), BTreeError> {
        let block_id = node.block_id();
        let mut right = txn.allocate_block()?;
        let result = match BlockHeader::block_type_of(node.data()) {
            Ok(BlockType::BTreeLeaf) => leaf::split(node.data_mut()?, right.data_mut()?),
            Ok(BlockType::BTreeInternal) => internal::split(node.data_mut()?, right.data_mut()?),
            _ => Err(NodeError::WrongNodeType),
        };
        match result {
            Ok(median) => {
                debug!(block_id, new_block = right.block_id(), "split node");
                Ok((right, median))
            }
            Err(e) => {
                // Best effort: the new block was never linked
                let _ = txn.free_block(right);
                Err(at(block_id)(e))
            }
        }
    }

    /// Make room in `child` for an insert. Returns whether it must split.
    fn make_room(
        child: &mut BlockLock,
        key: &[u8],
        stored: &[u8],
        max_key: usize,
    ) -> Result<bool, BTreeError> {
        let block_id = child.block_id();
        match Node::parse(child.data()).map_err(at(block_id))? {
            Node::Internal(node) => node.is_full(max_key).map_err(at(block_id)),
            Node::Leaf(leaf) => {
                if !leaf.is_full(key, stored).map_err(at(block_id))? {
                    return Ok(false);
                }
                if !leaf.would_fit_compacted(key, stored).map_err(at(block_id))? {
                    return Ok(true);
                }
                leaf::compact(child.data_mut()?).map_err(at(block_id))?;
                Ok(false)
            }
        }
    }

    fn insert_into_leaf(
        txn: &Transactor,
        lock: &mut BlockLock,
        key: &[u8],
        stored: &[u8],
    ) -> Result<Option<Previous>, BTreeError> {
        let block_id = lock.block_id();
        let previous = {
            let leaf = LeafNode::new(lock.data()).map_err(at(block_id))?;
            match leaf.lookup(key).map_err(at(block_id))? {
                None => None,
                Some(old) => {
                    let old = StoredValue::decode(old)?;
                    Some((old.resolve(txn)?, old.overflow()))
                }
            }
        };
        leaf::insert(lock.data_mut()?, key, stored).map_err(at(block_id))?;
        Ok(previous)
    }

    fn remove_from_leaf(
        txn: &Transactor,
        lock: &mut BlockLock,
        key: &[u8],
    ) -> Result<Option<Previous>, BTreeError> {
        let block_id = lock.block_id();
        let previous = {
            let leaf = LeafNode::new(lock.data()).map_err(at(block_id))?;
            let Some(stored) = leaf.lookup(key).map_err(at(block_id))? else {
                return Ok(None);
            };
            let stored = StoredValue::decode(stored)?;
            (stored.resolve(txn)?, stored.overflow())
        };
        leaf::remove(lock.data_mut()?, key).map_err(at(block_id))?;
        Ok(Some(previous))
    }

    /// Lock child `index` of `parent`, restructuring it so a remove can
    /// descend into it. Returns the lock of the node that now covers `key`.
    fn prepare_child_for_remove(
        txn: &Transactor,
        parent: &mut BlockLock,
        index: usize,
        key: &[u8],
        max_key: usize,
    ) -> Result<BlockLock, BTreeError> {
        let parent_id = parent.block_id();
        let (child_id, left, right) = {
            let node = InternalNode::new(parent.data()).map_err(at(parent_id))?;
            // The separator between two siblings is stored with the right one
            let sibling = |i: usize| -> Result<Sibling, NodeError> {
                Ok(Sibling {
                    block_id: node.child_at(i)?,
                    separator: node.key_at(i.max(index))?.to_vec(),
                })
            };
            let left = (index > 0).then(|| sibling(index - 1));
            let right = (index + 1 < node.len()).then(|| sibling(index + 1));
            (
                node.child_at(index).map_err(at(parent_id))?,
                left.transpose().map_err(at(parent_id))?,
                right.transpose().map_err(at(parent_id))?,
            )
        };

        let mut child = txn.acquire(child_id, LockMode::Write)?;
        let (full, needs_rebalance) = {
            let node = Node::parse(child.data()).map_err(at(child_id))?;
            let full = match node {
                Node::Internal(internal) => internal.is_full(max_key).map_err(at(child_id))?,
                Node::Leaf(_) => false,
            };
            (full, node.is_underfull_or_min().map_err(at(child_id))?)
        };

        if full {
            let (new_right, median) = Self::split_child(txn, &mut child)?;
            internal::insert(parent.data_mut()?, &median, new_right.block_id())
                .map_err(at(parent_id))?;
            return Ok(if key >= median.as_slice() { new_right } else { child });
        }
        if !needs_rebalance {
            return Ok(child);
        }
        match (left, right) {
            (_, Some(right)) => {
                Self::rebalance_with_right(txn, parent, index, child, &right, max_key)
            }
            (Some(left), None) => {
                Self::rebalance_with_left(txn, parent, index, child, &left, max_key)
            }
            (None, None) => Ok(child),
        }
    }

    /// Merge the right sibling into `child`, or level the two.
    fn rebalance_with_right(
        txn: &Transactor,
        parent: &mut BlockLock,
        index: usize,
        mut child: BlockLock,
        right: &Sibling,
        max_key: usize,
    ) -> Result<BlockLock, BTreeError> {
        let parent_id = parent.block_id();
        let mut sibling = txn.acquire(right.block_id, LockMode::Write)?;
        if Self::try_merge(&mut child, &sibling, &right.separator, max_key)? {
            txn.free_block(sibling)?;
            internal::remove_at(parent.data_mut()?, index + 1).map_err(at(parent_id))?;
            debug!(left = child.block_id(), right = right.block_id, "merged nodes");
        } else if let Some(separator) =
            Self::level(&mut child, &mut sibling, Side::Right, &right.separator)?
        {
            internal::set_key_at(parent.data_mut()?, index + 1, &separator)
                .map_err(at(parent_id))?;
            debug!(node = child.block_id(), sibling = right.block_id, "leveled nodes");
        }
        Ok(child)
    }

    /// Merge `child` into the left sibling, or level the two.
    fn rebalance_with_left(
        txn: &Transactor,
        parent: &mut BlockLock,
        index: usize,
        mut child: BlockLock,
        left: &Sibling,
        max_key: usize,
    ) -> Result<BlockLock, BTreeError> {
        let parent_id = parent.block_id();
        let mut sibling = txn.acquire(left.block_id, LockMode::Write)?;
        if Self::try_merge(&mut sibling, &child, &left.separator, max_key)? {
            let child_id = child.block_id();
            txn.free_block(child)?;
            internal::remove_at(parent.data_mut()?, index).map_err(at(parent_id))?;
            debug!(left = left.block_id, right = child_id, "merged nodes");
            return Ok(sibling);
        }
        if let Some(separator) = Self::level(&mut child, &mut sibling, Side::Left, &left.separator)?
        {
            internal::set_key_at(parent.data_mut()?, index, &separator).map_err(at(parent_id))?;
            debug!(node = child.block_id(), sibling = left.block_id, "leveled nodes");
        }
        Ok(child)
    }

    /// Merge `right` into `left` if their union fits. Internal unions must
    /// also leave room for a maximum separator.
    fn try_merge(
        left: &mut BlockLock,
        right: &BlockLock,
        separator: &[u8],
        max_key: usize,
    ) -> Result<bool, BTreeError> {
        let left_id = left.block_id();
        let right_id = right.block_id();
        let usable = usable_space(left.data().len());

        let is_leaf = {
            let left_node = Node::parse(left.data()).map_err(at(left_id))?;
            let right_node = Node::parse(right.data()).map_err(at(right_id))?;
            match (left_node, right_node) {
                (Node::Leaf(l), Node::Leaf(r)) => {
                    let union = l.live_size().map_err(at(left_id))?
                        + r.live_size().map_err(at(right_id))?;
                    if union > usable {
                        return Ok(false);
                    }
                    true
                }
                (Node::Internal(l), Node::Internal(r)) => {
                    let union = l.live_size().map_err(at(left_id))?
                        + r.live_size().map_err(at(right_id))?
                        + separator.len();
                    if union + entry_footprint(max_key) > usable {
                        return Ok(false);
                    }
                    false
                }
                _ => {
                    return Err(BTreeError::Inconsistent {
                        block_id: right_id,
                        reason: format!("sibling of block {left_id} has a different node type"),
                    });
                }
            }
        };

        if is_leaf {
            leaf::merge(left.data_mut()?, right.data()).map_err(at(left_id))?;
        } else {
            internal::merge(left.data_mut()?, right.data(), separator).map_err(at(left_id))?;
        }
        Ok(true)
    }

    fn level(
        node: &mut BlockLock,
        sibling: &mut BlockLock,
        side: Side,
        separator: &[u8],
    ) -> Result<Option<Vec<u8>>, BTreeError> {
        let block_id = node.block_id();
        match BlockHeader::block_type_of(node.data()) {
            Ok(BlockType::BTreeLeaf) => leaf::level(node.data_mut()?, sibling.data_mut()?, side),
            Ok(BlockType::BTreeInternal) => {
                internal::level(node.data_mut()?, sibling.data_mut()?, side, separator)
            }
            _ => Err(NodeError::WrongNodeType),
        }
        .map_err(at(block_id))
    }
}

/// Recursive state for [`BTree::verify`].
struct Verifier<'t> {
    txn: &'t Transactor,
    stats: TreeStats,
    leaf_depth: Option<usize>,
}

impl Verifier<'_> {
    fn visit(
        &mut self,
        block_id: BlockId,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        depth: usize,
    ) -> Result<(), BTreeError> {
        let lock = self.txn.acquire(block_id, LockMode::Read)?;
        let node = Node::parse(lock.data()).map_err(at(block_id))?;
        node.validate().map_err(at(block_id))?;
        self.stats.nodes += 1;

        let in_bounds =
            |key: &[u8]| lower.is_none_or(|l| key >= l) && upper.is_none_or(|u| key < u);
        let inconsistent = |reason: String| BTreeError::Inconsistent { block_id, reason };

        match node {
            Node::Leaf(leaf) => {
                self.stats.leaves += 1;
                match self.leaf_depth {
                    None => self.leaf_depth = Some(depth),
                    Some(expected) if expected != depth => {
                        return Err(inconsistent(format!(
                            "leaf at depth {depth}, expected {expected}"
                        )));
                    }
                    Some(_) => {}
                }
                for pair in leaf.pairs() {
                    let pair = pair.map_err(at(block_id))?;
                    if !in_bounds(pair.key) {
                        return Err(inconsistent(format!(
                            "key {:?} outside the parent's bounds",
                            pair.key
                        )));
                    }
                    if let Some(handle) = StoredValue::decode(pair.value)?.overflow() {
                        read_overflow(self.txn, handle)?;
                        self.stats.overflow_values += 1;
                    }
                    self.stats.pairs += 1;
                }
            }
            Node::Internal(node) => {
                self.stats.internal += 1;
                let entries = node
                    .pairs()
                    .map(|pair| pair.map(|pair| (pair.key, pair.child)))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(at(block_id))?;
                for (i, &(key, child)) in entries.iter().enumerate() {
                    if i > 0 && !in_bounds(key) {
                        return Err(inconsistent(format!(
                            "separator {key:?} outside the parent's bounds"
                        )));
                    }
                    let child_lower = if i == 0 { lower } else { Some(key) };
                    let child_upper = entries.get(i + 1).map_or(upper, |&(next, _)| Some(next));
                    self.visit(child, child_lower, child_upper, depth + 1)?;
                }
            }
        }
        Ok(())
    }
}

/// Attach a block id to a node error.
pub(super) fn at(block_id: BlockId) -> impl Fn(NodeError) -> BTreeError {
    move |source| {
        if source.is_corruption() {
            BTreeError::Corruption { block_id, source }
        } else {
            BTreeError::Node { block_id, source }
        }
    }
}

/// Errors that can occur during B-tree operations.
#[derive(Debug, thiserror::Error)]
pub enum BTreeError {
    /// Buffer cache error.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    /// Overflow chain error.
    #[error("overflow error: {0}")]
    Overflow(#[from] OverflowError),
    /// A node failed to decode or validate.
    #[error("block {block_id} is corrupt: {source}")]
    Corruption { block_id: BlockId, source: NodeError },
    /// A node operation's precondition failed.
    #[error("node error in block {block_id}: {source}")]
    Node { block_id: BlockId, source: NodeError },
    /// The key exceeds the tree's key limit.
    #[error("key of {len} bytes exceeds the limit of {max}")]
    KeyTooLarge { len: usize, max: usize },
    /// Nodes are individually valid but do not form a tree.
    #[error("inconsistent tree at block {block_id}: {reason}")]
    Inconsistent { block_id: BlockId, reason: String },
}

impl BTreeError {
    /// Whether this error reports damaged data.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        match self {
            Self::Cache(e) => e.is_corruption(),
            Self::Overflow(e) => e.is_corruption(),
            Self::Corruption { .. } | Self::Inconsistent { .. } => true,
            Self::Node { .. } | Self::KeyTooLarge { .. } => false,
        }
    }
}
