//! Internal node engine.
//!
//! An internal node routes keys to children. Each pair is a separator key
//! and a child block id:
//!
//! ```text
//! [("", c0), (k1, c1), (k2, c2), ...]
//! ```
//!
//! # Invariants
//!
//! - At least one entry; entry 0 is the sentinel and has an empty key
//! - Separators after entry 0 strictly increase
//! - Keys under `c_i` are `>= k_i` (unless `i == 0`) and `< k_{i+1}`
//!
//! Unlike leaves, an insert that would fit once dead bytes are dropped
//! compacts the node first, so fullness is judged on live bytes.

use std::cmp::Ordering;

use crate::storage::btree::key::{AsKey, MAX_KEY_SIZE, compare, usable_space};
use crate::storage::btree::node::{
    HeapCoverage, NodeError, RawNode, SLOT_SIZE, Side, StagedPair, footprint, insert_slot,
    is_underfull_footprint, level_boundary, push_heap, split_point, write_node,
};
use crate::storage::page::{BlockId, BlockType, SUPERBLOCK_ID, read_u64};

/// Size of a child pointer.
const CHILD_SIZE: usize = 8;

/// A separator and child borrowed from an internal block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalPair<'a> {
    /// Separator key; empty for the sentinel entry.
    pub key: &'a [u8],
    /// Child block id.
    pub child: BlockId,
    /// Heap offset of the pair.
    pub offset: usize,
}

impl InternalPair<'_> {
    fn staged(&self) -> StagedPair {
        staged_pair(self.key, self.child)
    }
}

impl AsKey for InternalPair<'_> {
    fn key_bytes(&self) -> &[u8] {
        self.key
    }
}

fn staged_pair(key: &[u8], child: BlockId) -> StagedPair {
    StagedPair {
        key: key.to_vec(),
        payload: child.to_le_bytes().to_vec(),
    }
}

/// Footprint of one entry with a `key_len`-byte separator.
#[must_use]
pub const fn entry_footprint(key_len: usize) -> usize {
    SLOT_SIZE + 1 + key_len + CHILD_SIZE
}

/// Footprint of a run that will start a node: its first key becomes the sentinel.
fn leading_run_footprint(pairs: &[StagedPair]) -> usize {
    footprint(pairs) - pairs.first().map_or(0, |pair| pair.key.len())
}

/// A read-only view of an internal block.
#[derive(Debug, Clone, Copy)]
pub struct InternalNode<'a> {
    raw: RawNode<'a>,
}

impl<'a> InternalNode<'a> {
    /// View `data` as an internal node, checking the header.
    pub fn new(data: &'a [u8]) -> Result<Self, NodeError> {
        RawNode::new(data, BlockType::BTreeInternal).map(|raw| Self { raw })
    }

    /// Number of entries, which is the number of children.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.raw.len()
    }

    /// Whether the node has no entries. Only a damaged node is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the underlying block.
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.raw.data().len()
    }

    /// The entry at `index`.
    pub fn pair(&self, index: usize) -> Result<InternalPair<'a>, NodeError> {
        let offset = self.raw.offset(index)?;
        self.decode_pair(offset)
    }

    /// The entry stored at heap offset `offset`.
    pub fn pair_at_offset(&self, offset: usize) -> Result<InternalPair<'a>, NodeError> {
        if offset < self.raw.frontmost() || offset >= self.block_size() {
            return Err(NodeError::Corruption("pair offset outside heap"));
        }
        self.decode_pair(offset)
    }

    fn decode_pair(&self, offset: usize) -> Result<InternalPair<'a>, NodeError> {
        let (key, key_end) = self.raw.key_at_offset(offset)?;
        let data = self.raw.data();
        if key_end + CHILD_SIZE > data.len() {
            return Err(NodeError::Corruption("child pointer past end of block"));
        }
        Ok(InternalPair {
            key,
            child: read_u64(data, key_end),
            offset,
        })
    }

    /// Separator key at `index`.
    pub fn key_at(&self, index: usize) -> Result<&'a [u8], NodeError> {
        self.pair(index).map(|pair| pair.key)
    }

    /// Child block at `index`.
    pub fn child_at(&self, index: usize) -> Result<BlockId, NodeError> {
        self.pair(index).map(|pair| pair.child)
    }

    /// Entries in order.
    pub fn pairs(self) -> impl Iterator<Item = Result<InternalPair<'a>, NodeError>> {
        (0..self.len()).map(move |index| self.pair(index))
    }

    /// Binary search over the separators after the sentinel.
    fn search_separators(&self, key: &[u8]) -> Result<Result<usize, usize>, NodeError> {
        if self.is_empty() {
            return Err(NodeError::Corruption("internal node without children"));
        }
        let (mut lo, mut hi) = (1, self.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match compare(self.key_at(mid)?, key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    /// Index of the child whose range holds `key`: the greatest separator
    /// `<= key`, or the sentinel.
    pub fn child_index_for_key(&self, key: &[u8]) -> Result<usize, NodeError> {
        Ok(match self.search_separators(key)? {
            Ok(index) => index,
            Err(index) => index - 1,
        })
    }

    /// Child block whose range holds `key`.
    pub fn child_id_for_key(&self, key: &[u8]) -> Result<BlockId, NodeError> {
        self.child_at(self.child_index_for_key(key)?)
    }

    /// The first real separator, if any.
    pub fn first_key(&self) -> Result<Option<&'a [u8]>, NodeError> {
        if self.len() < 2 {
            return Ok(None);
        }
        self.key_at(1).map(Some)
    }

    /// Bytes used by live entries and their offset slots.
    pub fn live_size(&self) -> Result<usize, NodeError> {
        self.pairs()
            .map(|pair| pair.map(|pair| entry_footprint(pair.key.len())))
            .sum()
    }

    /// Whether a new separator of `key_len` bytes would not fit.
    ///
    /// The tree passes its maximum key size to split ahead of any insert.
    pub fn is_full(&self, key_len: usize) -> Result<bool, NodeError> {
        Ok(self.live_size()? + entry_footprint(key_len) > usable_space(self.block_size()))
    }

    /// Whether live occupancy is below 40% of the usable space.
    pub fn is_underfull(&self) -> Result<bool, NodeError> {
        Ok(is_underfull_footprint(self.live_size()?, self.block_size()))
    }

    /// Whether the node is underfull or has at most one child.
    pub fn is_underfull_or_min(&self) -> Result<bool, NodeError> {
        Ok(self.len() <= 1 || self.is_underfull()?)
    }

    /// Check the sentinel, separator order, child pointers and that entries
    /// do not overlap in the heap.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.is_empty() {
            return Err(NodeError::Corruption("internal node without children"));
        }
        let mut coverage = HeapCoverage::new(self.block_size());
        let mut prev: Option<&[u8]> = None;
        for (index, pair) in self.pairs().enumerate() {
            let pair = pair?;
            if pair.child == SUPERBLOCK_ID {
                return Err(NodeError::Corruption("child pointer to the superblock"));
            }
            if pair.key.len() > MAX_KEY_SIZE {
                return Err(NodeError::Corruption("key longer than maximum"));
            }
            coverage.claim(pair.offset, 1 + pair.key.len() + CHILD_SIZE)?;
            if index == 0 {
                if !pair.key.is_empty() {
                    return Err(NodeError::Corruption("sentinel entry has a key"));
                }
                continue;
            }
            if let Some(prev) = prev
                && compare(prev, pair.key) != Ordering::Less
            {
                return Err(NodeError::Corruption("separators out of order"));
            }
            prev = Some(pair.key);
        }
        Ok(())
    }

    /// Copy every live entry out of the block.
    pub(crate) fn staged(&self) -> Result<Vec<StagedPair>, NodeError> {
        self.pairs().map(|pair| pair.map(|pair| pair.staged())).collect()
    }
}

/// Format `node` as a root over two children.
pub fn init_root(
    node: &mut [u8],
    left: BlockId,
    separator: &[u8],
    right: BlockId,
) -> Result<(), NodeError> {
    if separator.len() > MAX_KEY_SIZE {
        return Err(NodeError::KeyTooLarge(separator.len()));
    }
    let pairs = [staged_pair(&[], left), staged_pair(separator, right)];
    write_node(node, BlockType::BTreeInternal, &pairs)
}

/// Build a compact internal node in `node` from the entries of `other` at `offsets`.
///
/// The first offset must name an entry with an empty key.
pub fn init_from(node: &mut [u8], other: &[u8], offsets: &[usize]) -> Result<(), NodeError> {
    let source = InternalNode::new(other)?;
    let pairs = offsets
        .iter()
        .map(|&offset| source.pair_at_offset(offset).map(|pair| pair.staged()))
        .collect::<Result<Vec<_>, _>>()?;
    if pairs.first().is_none_or(|pair| !pair.key.is_empty()) {
        return Err(NodeError::InvalidOperation("first entry must be the sentinel"));
    }
    if pairs.windows(2).skip(1).any(|w| w[0].key >= w[1].key) {
        return Err(NodeError::InvalidOperation("entries not in ascending key order"));
    }
    write_node(node, BlockType::BTreeInternal, &pairs)
}

/// Insert separator `key` routing to `child`.
///
/// Compacts first if that makes room. Fails with `NodeFull`, leaving the
/// node untouched, if the entry does not fit.
pub fn insert(node: &mut [u8], key: &[u8], child: BlockId) -> Result<(), NodeError> {
    if key.len() > MAX_KEY_SIZE {
        return Err(NodeError::KeyTooLarge(key.len()));
    }
    if key.is_empty() {
        return Err(NodeError::InvalidOperation("separator must not be empty"));
    }
    let internal = InternalNode::new(node)?;
    let index = match internal.search_separators(key)? {
        Ok(_) => return Err(NodeError::InvalidOperation("duplicate separator")),
        Err(index) => index,
    };

    if entry_footprint(key.len()) > internal.raw.free_space() {
        let mut pairs = internal.staged()?;
        pairs.insert(index, staged_pair(key, child));
        return write_node(node, BlockType::BTreeInternal, &pairs);
    }

    let (npairs, frontmost) = (internal.len(), internal.raw.frontmost());
    let offset = push_heap(node, frontmost, key, &child.to_le_bytes());
    insert_slot(node, npairs, index, offset);
    Ok(())
}

/// Remove the entry at `index`.
///
/// Removing the sentinel makes the next entry the sentinel.
pub fn remove_at(node: &mut [u8], index: usize) -> Result<(), NodeError> {
    let mut pairs = InternalNode::new(node)?.staged()?;
    if index >= pairs.len() {
        return Err(NodeError::InvalidOperation("entry index out of range"));
    }
    pairs.remove(index);
    if let Some(first) = pairs.first_mut() {
        first.key.clear();
    }
    write_node(node, BlockType::BTreeInternal, &pairs)
}

/// Replace the separator at `index`, keeping separator order.
pub fn set_key_at(node: &mut [u8], index: usize, key: &[u8]) -> Result<(), NodeError> {
    if index == 0 {
        return Err(NodeError::InvalidOperation("the sentinel has no key"));
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(NodeError::KeyTooLarge(key.len()));
    }
    let mut pairs = InternalNode::new(node)?.staged()?;
    if index >= pairs.len() {
        return Err(NodeError::InvalidOperation("entry index out of range"));
    }
    let below = index > 1 && pairs[index - 1].key.as_slice() >= key;
    let above = pairs.get(index + 1).is_some_and(|next| next.key.as_slice() <= key);
    if key.is_empty() || below || above {
        return Err(NodeError::InvalidOperation("separator out of order"));
    }
    pairs[index].key = key.to_vec();
    write_node(node, BlockType::BTreeInternal, &pairs)
}

/// Move the upper entries of `node` into `new_node`, splitting by byte size.
///
/// Returns the median: the key of the first moved entry, which becomes the
/// sentinel of `new_node`.
pub fn split(node: &mut [u8], new_node: &mut [u8]) -> Result<Vec<u8>, NodeError> {
    let mut pairs = InternalNode::new(node)?.staged()?;
    if pairs.len() < 2 {
        return Err(NodeError::InvalidOperation("split needs at least two entries"));
    }
    let at = split_point(&pairs);
    let median = std::mem::take(&mut pairs[at].key);
    write_node(new_node, BlockType::BTreeInternal, &pairs[at..])?;
    write_node(node, BlockType::BTreeInternal, &pairs[..at])?;
    Ok(median)
}

/// Append every entry of `right` to `left`; `right`'s sentinel takes `separator`.
///
/// Returns `separator`, which the parent drops. Fails with `NodeFull`,
/// leaving `left` untouched, if the union does not fit.
pub fn merge(left: &mut [u8], right: &[u8], separator: &[u8]) -> Result<Vec<u8>, NodeError> {
    let mut right_pairs = InternalNode::new(right)?.staged()?;
    let Some(first) = right_pairs.first_mut() else {
        return Err(NodeError::Corruption("internal node without children"));
    };
    first.key = separator.to_vec();

    let mut pairs = InternalNode::new(left)?.staged()?;
    pairs.extend(right_pairs);
    write_node(left, BlockType::BTreeInternal, &pairs)?;
    Ok(separator.to_vec())
}

/// Rotate entries from `sibling` through the parent `separator` into `node`.
///
/// `side` says where `sibling` sits and `separator` is the parent key
/// between the two. Returns the separator the parent must now store, or
/// `None` if nothing moved.
pub fn level(
    node: &mut [u8],
    sibling: &mut [u8],
    side: Side,
    separator: &[u8],
) -> Result<Option<Vec<u8>>, NodeError> {
    let block_size = node.len();
    let mine = InternalNode::new(node)?.staged()?;
    let theirs = InternalNode::new(sibling)?.staged()?;

    let (mut pairs, mut rest) = match side {
        Side::Right => (mine, theirs),
        Side::Left => (theirs, mine),
    };
    let Some(first) = rest.first_mut() else {
        return Err(NodeError::Corruption("internal node without children"));
    };
    first.key = separator.to_vec();
    let boundary = pairs.len();
    pairs.extend(rest);

    let moved_to = level_boundary(&pairs, boundary, side, block_size, leading_run_footprint);
    if moved_to == boundary {
        return Ok(None);
    }

    let new_separator = std::mem::take(&mut pairs[moved_to].key);
    let (left, right) = pairs.split_at(moved_to);
    let (left_node, right_node) = match side {
        Side::Right => (node, sibling),
        Side::Left => (sibling, node),
    };
    write_node(left_node, BlockType::BTreeInternal, left)?;
    write_node(right_node, BlockType::BTreeInternal, right)?;
    Ok(Some(new_separator))
}
