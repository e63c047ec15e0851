//! Lock-coupled range iteration.
//!
//! Iteration is layered:
//!
//! - [`LeafIterator`] walks the pairs of one read-locked leaf.
//! - [`SliceLeavesIterator`] yields the leaves that may hold keys of a
//!   range, keeping a stack of read-locked internal frames from the root.
//! - [`SliceKeysIterator`] flattens those leaves into the pairs inside the
//!   range, applying the open or closed test at both ends.
//! - [`Cursor`] resolves stored values into full values.
//!
//! # Invariants
//!
//! - The next block is locked before the current one is released.
//! - Pairs come out strictly ascending.
//! - Dropping any iterator releases every lock it holds. After an error the
//!   iterator holds no locks and is exhausted.
//!
//! Because the frames stay read-locked, a writer on the same thread blocks
//! on any block an open iterator holds.

use crate::storage::btree::internal::InternalNode;
use crate::storage::btree::key::KeyRange;
use crate::storage::btree::leaf::LeafNode;
use crate::storage::btree::node::Node;
use crate::storage::btree::tree::{BTreeError, at};
use crate::storage::cache::{BlockLock, LockMode};
use crate::storage::overflow::StoredValue;
use crate::storage::page::BlockId;
use crate::storage::transaction::Transactor;

/// Upcoming pairs whose overflow chains [`LeafIterator::prefetch`] hints.
const PREFETCH_PAIRS: usize = 8;

/// The pairs of one read-locked leaf, from a cursor index onwards.
#[derive(Debug)]
pub struct LeafIterator {
    lock: BlockLock,
    index: usize,
}

impl LeafIterator {
    /// Iterate over the leaf held by `lock` from its first pair.
    pub fn new(lock: BlockLock) -> Result<Self, BTreeError> {
        LeafNode::new(lock.data()).map_err(at(lock.block_id()))?;
        Ok(Self { lock, index: 0 })
    }

    /// The leaf block.
    #[must_use]
    pub const fn block_id(&self) -> BlockId {
        self.lock.block_id()
    }

    fn leaf(&self) -> Result<LeafNode<'_>, BTreeError> {
        LeafNode::new(self.lock.data()).map_err(at(self.lock.block_id()))
    }

    /// Position at the first pair `>= key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<(), BTreeError> {
        let found = self.leaf()?.search(key).map_err(at(self.block_id()))?;
        self.index = match found {
            Ok(index) | Err(index) => index,
        };
        Ok(())
    }

    /// Hint the cache to load the overflow chains of the next few pairs.
    pub fn prefetch(&self, txn: &Transactor) {
        let Ok(leaf) = self.leaf() else {
            return;
        };
        for pair in leaf.pairs().skip(self.index).take(PREFETCH_PAIRS).flatten() {
            if let Ok(StoredValue::Overflow(handle)) = StoredValue::decode(pair.value) {
                txn.prefetch(handle.first_block);
            }
        }
    }
}

impl Iterator for LeafIterator {
    type Item = Result<(Vec<u8>, Vec<u8>), BTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let block_id = self.block_id();
        let item = match self.leaf() {
            Ok(leaf) if self.index >= leaf.len() => return None,
            Ok(leaf) => leaf
                .pair(self.index)
                .map(|pair| (pair.key.to_vec(), pair.value.to_vec()))
                .map_err(at(block_id)),
            Err(e) => Err(e),
        };
        self.index = if item.is_ok() { self.index + 1 } else { usize::MAX };
        Some(item)
    }
}

/// An internal node on the path to the current leaf.
#[derive(Debug)]
struct Frame {
    lock: BlockLock,
    /// Child currently being visited.
    index: usize,
}

/// The leaves that may hold keys of a range, in key order.
#[derive(Debug)]
pub struct SliceLeavesIterator {
    txn: Transactor,
    range: KeyRange,
    stack: Vec<Frame>,
    /// First leaf, found while positioning.
    pending: Option<LeafIterator>,
    done: bool,
}

impl SliceLeavesIterator {
    /// Descend from `root` toward the start of `range`.
    pub fn new(txn: Transactor, root: BlockId, range: KeyRange) -> Result<Self, BTreeError> {
        let mut iter = Self {
            txn,
            range,
            stack: Vec::new(),
            pending: None,
            done: false,
        };
        if iter.range.is_empty() {
            iter.done = true;
            return Ok(iter);
        }

        let root = iter.txn.acquire(root, LockMode::Read)?;
        let leaf = iter.descend(root, true)?;
        iter.pending = Some(leaf);
        Ok(iter)
    }

    /// The range being iterated.
    #[must_use]
    pub const fn range(&self) -> &KeyRange {
        &self.range
    }

    /// The transaction the iterator reads under.
    #[must_use]
    pub const fn txn(&self) -> &Transactor {
        &self.txn
    }

    /// Walk down from `lock` to a leaf, pushing a frame per internal node.
    ///
    /// With `toward_start`, each level follows the range's lower bound;
    /// otherwise the leftmost child.
    fn descend(&mut self, mut lock: BlockLock, toward_start: bool) -> Result<LeafIterator, BTreeError> {
        loop {
            let block_id = lock.block_id();
            let step = match Node::parse(lock.data()).map_err(at(block_id))? {
                Node::Leaf(_) => None,
                Node::Internal(node) => {
                    let index = match self.range.start_key() {
                        Some(start) if toward_start => {
                            node.child_index_for_key(start).map_err(at(block_id))?
                        }
                        _ => 0,
                    };
                    Some((index, node.child_at(index).map_err(at(block_id))?))
                }
            };
            let Some((index, child_id)) = step else {
                return LeafIterator::new(lock);
            };

            let child = self.txn.acquire(child_id, LockMode::Read)?;
            self.stack.push(Frame { lock, index });
            lock = child;
        }
    }

    /// The next leaf, or `None` once no later leaf can hold keys in range.
    pub fn next_leaf(&mut self) -> Result<Option<LeafIterator>, BTreeError> {
        match self.advance() {
            Ok(Some(leaf)) => Ok(Some(leaf)),
            Ok(None) => {
                self.finish();
                Ok(None)
            }
            Err(e) => {
                self.finish();
                Err(e)
            }
        }
    }

    fn advance(&mut self) -> Result<Option<LeafIterator>, BTreeError> {
        if self.done {
            return Ok(None);
        }
        if let Some(leaf) = self.pending.take() {
            return Ok(Some(leaf));
        }

        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            let block_id = frame.lock.block_id();
            let node = InternalNode::new(frame.lock.data()).map_err(at(block_id))?;
            let next = frame.index + 1;
            if next >= node.len() {
                self.stack.pop();
                continue;
            }

            // Every key under the next child is at least its separator
            if self
                .range
                .is_after_end(node.key_at(next).map_err(at(block_id))?)
            {
                return Ok(None);
            }
            let child_id = node.child_at(next).map_err(at(block_id))?;
            frame.index = next;

            let child = self.txn.acquire(child_id, LockMode::Read)?;
            return self.descend(child, false).map(Some);
        }
    }

    /// Hint the cache to load the next subtree.
    pub fn prefetch(&self) {
        let Some(frame) = self.stack.last() else {
            return;
        };
        if let Ok(child) =
            InternalNode::new(frame.lock.data()).and_then(|node| node.child_at(frame.index + 1))
        {
            self.txn.prefetch(child);
        }
    }

    fn finish(&mut self) {
        self.done = true;
        self.pending = None;
        // Deepest frames first
        while self.stack.pop().is_some() {}
    }
}

impl Iterator for SliceLeavesIterator {
    type Item = Result<LeafIterator, BTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_leaf().transpose()
    }
}

/// The pairs of a range, in key order, with stored values.
#[derive(Debug)]
pub struct SliceKeysIterator {
    leaves: SliceLeavesIterator,
    current: Option<LeafIterator>,
    done: bool,
}

impl SliceKeysIterator {
    /// Position at the first pair of `range`.
    pub fn new(txn: Transactor, root: BlockId, range: KeyRange) -> Result<Self, BTreeError> {
        let mut leaves = SliceLeavesIterator::new(txn, root, range)?;
        let mut current = leaves.next_leaf()?;
        if let (Some(leaf), Some(start)) = (current.as_mut(), leaves.range().start_key()) {
            leaf.seek(start)?;
        }
        let done = current.is_none();
        Ok(Self {
            leaves,
            current,
            done,
        })
    }

    /// The next pair in range: key and stored value.
    pub fn next_pair(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, BTreeError> {
        match self.advance() {
            Ok(Some(pair)) => Ok(Some(pair)),
            Ok(None) => {
                self.finish();
                Ok(None)
            }
            Err(e) => {
                self.finish();
                Err(e)
            }
        }
    }

    fn advance(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, BTreeError> {
        loop {
            if self.done {
                return Ok(None);
            }
            let Some(leaf) = self.current.as_mut() else {
                return Ok(None);
            };

            match leaf.next() {
                Some(Ok((key, value))) => {
                    let range = self.leaves.range();
                    if range.is_before_start(&key) {
                        continue;
                    }
                    if range.is_after_end(&key) {
                        return Ok(None);
                    }
                    return Ok(Some((key, value)));
                }
                Some(Err(e)) => return Err(e),
                None => {
                    // The next leaf is locked before the current one is dropped
                    let next = self.leaves.next_leaf()?;
                    self.current = next;
                    self.leaves.prefetch();
                }
            }
        }
    }

    /// Hint the cache about the current leaf's values and the next subtree.
    pub fn prefetch(&self) {
        if let Some(leaf) = &self.current {
            leaf.prefetch(self.leaves.txn());
        }
        self.leaves.prefetch();
    }

    fn finish(&mut self) {
        self.done = true;
        self.current = None;
        self.leaves.finish();
    }
}

impl Iterator for SliceKeysIterator {
    type Item = Result<(Vec<u8>, Vec<u8>), BTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_pair().transpose()
    }
}

/// Range scan over full values.
///
/// Holds read locks until dropped or exhausted. Do not write to the same
/// database on the thread that holds an open cursor.
#[derive(Debug)]
pub struct Cursor {
    keys: SliceKeysIterator,
}

impl Cursor {
    /// Position at the first pair of `range` in the tree rooted at `root`.
    pub fn new(txn: Transactor, root: BlockId, range: KeyRange) -> Result<Self, BTreeError> {
        Ok(Self {
            keys: SliceKeysIterator::new(txn, root, range)?,
        })
    }

    /// The next `(key, value)` in range.
    ///
    /// An out-of-line value is read while its leaf is still locked.
    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, BTreeError> {
        let Some((key, stored)) = self.keys.next_pair()? else {
            return Ok(None);
        };
        let resolved = StoredValue::decode(&stored)
            .and_then(|stored| stored.resolve(self.keys.leaves.txn()));
        match resolved {
            Ok(value) => Ok(Some((key, value))),
            Err(e) => {
                self.keys.finish();
                Err(e.into())
            }
        }
    }

    /// Hint the cache about upcoming blocks.
    pub fn prefetch(&self) {
        self.keys.prefetch();
    }
}

impl Iterator for Cursor {
    type Item = Result<(Vec<u8>, Vec<u8>), BTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
