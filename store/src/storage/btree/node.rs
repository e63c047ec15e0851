//! Shared node layout, decoding, and the pair builder.
//!
//! Leaf and internal nodes share one layout:
//!
//! ```text
//! +--------------+--------+-----------+----------------------+------+-----------+
//! | Block Header | npairs | frontmost | pair offsets (u16 × n) | free | pair heap |
//! | (8 bytes)    | (u16)  | (u16)     |                      |      |           |
//! +--------------+--------+-----------+----------------------+------+-----------+
//! ```
//!
//! Every pair is `key_len: u8, key, payload`. For a leaf the payload is
//! `value_len: u16, value`; for an internal node it is `child: u64`. The
//! heap grows backwards from the end of the block and `frontmost` is the
//! lowest heap byte in use.
//!
//! # Invariants
//!
//! - `NODE_HEADER_SIZE + 2 * npairs <= frontmost <= block_size`
//! - Offsets are sorted by key and every pair lies inside the heap
//! - Keys are unique within a node

// Offsets and lengths are bounded by MAX_BLOCK_SIZE and always fit in u16.
#![allow(clippy::cast_possible_truncation)]

use std::cmp::Ordering;

use crate::storage::btree::internal::InternalNode;
use crate::storage::btree::key::usable_space;
use crate::storage::btree::leaf::LeafNode;
use crate::storage::page::{BlockHeader, BlockType, read_u16, write_u16};

/// Offset of the pair count.
pub const NPAIRS_OFFSET: usize = BlockHeader::SIZE;

/// Offset of the lowest used heap byte.
pub const FRONTMOST_OFFSET: usize = NPAIRS_OFFSET + 2;

/// Offset of the first pair offset slot.
pub const NODE_HEADER_SIZE: usize = FRONTMOST_OFFSET + 2;

/// Size of one pair offset slot.
pub const SLOT_SIZE: usize = 2;

/// Which side of a node its sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The sibling holds smaller keys.
    Left,
    /// The sibling holds larger keys.
    Right,
}

/// Errors that can occur when working with B-tree nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    /// The pair does not fit the free space; the node is unchanged.
    #[error("node is full")]
    NodeFull,
    /// The block content violates the node format.
    #[error("corrupt node: {0}")]
    Corruption(&'static str),
    /// The block is not the kind of node the operation expects.
    #[error("wrong node type for operation")]
    WrongNodeType,
    /// The key exceeds the one-byte length field or the tree limit.
    #[error("key of {0} bytes is too large")]
    KeyTooLarge(usize),
    /// The operation's precondition does not hold (e.g. split of a single pair).
    #[error("invalid node operation: {0}")]
    InvalidOperation(&'static str),
}

impl NodeError {
    /// Whether this error reports damaged data.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption(_) | Self::WrongNodeType)
    }
}

/// A node decoded once from its block.
#[derive(Debug, Clone, Copy)]
pub enum Node<'a> {
    /// A leaf node.
    Leaf(LeafNode<'a>),
    /// An internal node.
    Internal(InternalNode<'a>),
}

impl<'a> Node<'a> {
    /// Decode the node tag and check the header.
    pub fn parse(data: &'a [u8]) -> Result<Self, NodeError> {
        match BlockHeader::block_type_of(data) {
            Ok(BlockType::BTreeLeaf) => LeafNode::new(data).map(Self::Leaf),
            Ok(BlockType::BTreeInternal) => InternalNode::new(data).map(Self::Internal),
            _ => Err(NodeError::WrongNodeType),
        }
    }

    /// Number of pairs.
    #[must_use]
    pub const fn len(&self) -> usize {
        match self {
            Self::Leaf(node) => node.len(),
            Self::Internal(node) => node.len(),
        }
    }

    /// Whether the node holds no pairs.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether live occupancy is below 40% of the usable space.
    pub fn is_underfull(&self) -> Result<bool, NodeError> {
        match self {
            Self::Leaf(node) => node.is_underfull(),
            Self::Internal(node) => node.is_underfull(),
        }
    }

    /// Whether the node is underfull or holds at most one pair.
    pub fn is_underfull_or_min(&self) -> Result<bool, NodeError> {
        Ok(self.len() <= 1 || self.is_underfull()?)
    }

    /// Check the node format.
    pub fn validate(&self) -> Result<(), NodeError> {
        match self {
            Self::Leaf(node) => node.validate(),
            Self::Internal(node) => node.validate(),
        }
    }
}

/// Order two sibling nodes by their first key. An empty node sorts first.
pub fn nodecmp(a: &Node<'_>, b: &Node<'_>) -> Result<Ordering, NodeError> {
    let first_key = |node: &Node<'_>| -> Result<Option<Vec<u8>>, NodeError> {
        match node {
            Node::Leaf(leaf) => leaf.first_key().map(|key| key.map(<[u8]>::to_vec)),
            Node::Internal(internal) => internal.first_key().map(|key| key.map(<[u8]>::to_vec)),
        }
    };
    Ok(first_key(a)?.cmp(&first_key(b)?))
}

/// Raw access to the shared node header and offset array.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawNode<'a> {
    data: &'a [u8],
    npairs: usize,
    frontmost: usize,
}

impl<'a> RawNode<'a> {
    /// Check the header bounds of a node of `block_type`.
    pub(crate) fn new(data: &'a [u8], block_type: BlockType) -> Result<Self, NodeError> {
        if data.len() < NODE_HEADER_SIZE {
            return Err(NodeError::Corruption("block shorter than node header"));
        }
        if BlockHeader::block_type_of(data) != Ok(block_type) {
            return Err(NodeError::WrongNodeType);
        }
        let npairs = usize::from(read_u16(data, NPAIRS_OFFSET));
        let frontmost = usize::from(read_u16(data, FRONTMOST_OFFSET));
        if NODE_HEADER_SIZE + SLOT_SIZE * npairs > frontmost {
            return Err(NodeError::Corruption("offset array overlaps pair heap"));
        }
        if frontmost > data.len() {
            return Err(NodeError::Corruption("frontmost offset past end of block"));
        }
        Ok(Self {
            data,
            npairs,
            frontmost,
        })
    }

    pub(crate) const fn data(&self) -> &'a [u8] {
        self.data
    }

    pub(crate) const fn len(&self) -> usize {
        self.npairs
    }

    pub(crate) const fn frontmost(&self) -> usize {
        self.frontmost
    }

    /// Bytes between the end of the offset array and the heap.
    pub(crate) const fn free_space(&self) -> usize {
        self.frontmost - NODE_HEADER_SIZE - SLOT_SIZE * self.npairs
    }

    /// Heap offset of pair `index`, bounds-checked.
    pub(crate) fn offset(&self, index: usize) -> Result<usize, NodeError> {
        if index >= self.npairs {
            return Err(NodeError::Corruption("pair index out of range"));
        }
        let offset = usize::from(read_u16(self.data, NODE_HEADER_SIZE + SLOT_SIZE * index));
        if offset < self.frontmost || offset >= self.data.len() {
            return Err(NodeError::Corruption("pair offset outside heap"));
        }
        Ok(offset)
    }

    /// Key bytes and the offset just past the key of the pair at `offset`.
    pub(crate) fn key_at_offset(&self, offset: usize) -> Result<(&'a [u8], usize), NodeError> {
        let key_len = usize::from(
            *self
                .data
                .get(offset)
                .ok_or(NodeError::Corruption("pair offset past end of block"))?,
        );
        let key_start = offset + 1;
        let key_end = key_start + key_len;
        let key = self
            .data
            .get(key_start..key_end)
            .ok_or(NodeError::Corruption("key extends past end of block"))?;
        Ok((key, key_end))
    }
}

/// Heap bytes claimed by the pairs seen so far, for overlap checks.
pub(crate) struct HeapCoverage {
    claimed: Vec<bool>,
}

impl HeapCoverage {
    #[must_use]
    pub(crate) fn new(block_size: usize) -> Self {
        Self {
            claimed: vec![false; block_size],
        }
    }

    /// Mark `offset..offset + len` as used. Fails if any byte is already taken.
    pub(crate) fn claim(&mut self, offset: usize, len: usize) -> Result<(), NodeError> {
        let bytes = self
            .claimed
            .get_mut(offset..offset + len)
            .ok_or(NodeError::Corruption("pair extends past end of block"))?;
        if bytes.iter().any(|&taken| taken) {
            return Err(NodeError::Corruption("pairs overlap in the heap"));
        }
        bytes.fill(true);
        Ok(())
    }
}

/// `frontmost` of an empty node: the end of the block.
pub(crate) const fn empty_frontmost(block_size: usize) -> u16 {
    block_size as u16
}

/// A pair staged outside any block, ready to be written by [`write_node`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StagedPair {
    pub key: Vec<u8>,
    /// Encoded payload: `value_len, value` for leaves, `child` for internal nodes.
    pub payload: Vec<u8>,
}

impl StagedPair {
    /// Bytes the pair occupies in the heap.
    pub(crate) const fn encoded_len(&self) -> usize {
        1 + self.key.len() + self.payload.len()
    }

    /// Heap bytes plus the offset slot.
    pub(crate) const fn footprint(&self) -> usize {
        SLOT_SIZE + self.encoded_len()
    }
}

/// Total footprint of a run of pairs.
pub(crate) fn footprint(pairs: &[StagedPair]) -> usize {
    pairs.iter().map(StagedPair::footprint).sum()
}

/// Whether a footprint is below 40% of the usable space.
pub(crate) const fn is_underfull_footprint(footprint: usize, block_size: usize) -> bool {
    footprint * 5 < usable_space(block_size) * 2
}

/// Whether a run of pairs fits one node.
pub(crate) fn fits(pairs: &[StagedPair], block_size: usize) -> bool {
    footprint(pairs) <= usable_space(block_size)
}

/// Split point by byte size: the smallest `i` in `[1, n-1]` such that the
/// pairs `[0, i)` hold at least half of the total footprint.
pub(crate) fn split_point(pairs: &[StagedPair]) -> usize {
    let total = footprint(pairs);
    let mut prefix = 0;
    for (i, pair) in pairs.iter().enumerate().take(pairs.len().saturating_sub(1)) {
        prefix += pair.footprint();
        if prefix * 2 >= total {
            return i + 1;
        }
    }
    pairs.len().saturating_sub(1)
}

/// Write `pairs` into `node` as a compact node of `block_type`.
///
/// Fails with `NodeFull`, leaving `node` untouched, if the pairs do not fit.
pub(crate) fn write_node(
    node: &mut [u8],
    block_type: BlockType,
    pairs: &[StagedPair],
) -> Result<(), NodeError> {
    let block_size = node.len();
    if !fits(pairs, block_size) {
        return Err(NodeError::NodeFull);
    }

    node.fill(0);
    BlockHeader::stamp(node, block_type);

    let mut frontmost = block_size;
    for (i, pair) in pairs.iter().enumerate() {
        frontmost -= pair.encoded_len();
        node[frontmost] = pair.key.len() as u8;
        let key_end = frontmost + 1 + pair.key.len();
        node[frontmost + 1..key_end].copy_from_slice(&pair.key);
        node[key_end..key_end + pair.payload.len()].copy_from_slice(&pair.payload);
        write_u16(node, NODE_HEADER_SIZE + SLOT_SIZE * i, frontmost as u16);
    }

    write_u16(node, NPAIRS_OFFSET, pairs.len() as u16);
    let frontmost = if pairs.is_empty() {
        empty_frontmost(block_size)
    } else {
        frontmost as u16
    };
    write_u16(node, FRONTMOST_OFFSET, frontmost);
    Ok(())
}

/// Place one encoded pair at the front of the heap and record its offset.
///
/// The caller has checked that the pair fits the free space. Returns the new
/// heap offset.
pub(crate) fn push_heap(node: &mut [u8], frontmost: usize, key: &[u8], payload: &[u8]) -> usize {
    let offset = frontmost - (1 + key.len() + payload.len());
    node[offset] = key.len() as u8;
    node[offset + 1..offset + 1 + key.len()].copy_from_slice(key);
    node[offset + 1 + key.len()..frontmost].copy_from_slice(payload);
    write_u16(node, FRONTMOST_OFFSET, offset as u16);
    offset
}

/// Insert an offset slot at `index`, shifting later slots right.
pub(crate) fn insert_slot(node: &mut [u8], npairs: usize, index: usize, offset: usize) {
    let start = NODE_HEADER_SIZE + SLOT_SIZE * index;
    let end = NODE_HEADER_SIZE + SLOT_SIZE * npairs;
    node.copy_within(start..end, start + SLOT_SIZE);
    write_u16(node, start, offset as u16);
    write_u16(node, NPAIRS_OFFSET, (npairs + 1) as u16);
}

/// Remove the offset slot at `index`, shifting later slots left.
///
/// Heap bytes are not reclaimed, except that an emptied node resets its heap.
pub(crate) fn remove_slot(node: &mut [u8], npairs: usize, index: usize) {
    let start = NODE_HEADER_SIZE + SLOT_SIZE * index;
    let end = NODE_HEADER_SIZE + SLOT_SIZE * npairs;
    node.copy_within(start + SLOT_SIZE..end, start);
    write_u16(node, end - SLOT_SIZE, 0);
    write_u16(node, NPAIRS_OFFSET, (npairs - 1) as u16);
    if npairs == 1 {
        let block_size = node.len();
        write_u16(node, FRONTMOST_OFFSET, empty_frontmost(block_size));
    }
}

/// Repoint the offset slot at `index`.
pub(crate) fn set_slot(node: &mut [u8], index: usize, offset: usize) {
    write_u16(node, NODE_HEADER_SIZE + SLOT_SIZE * index, offset as u16);
}

/// Choose a new boundary between two adjacent runs of pairs.
///
/// `pairs` is the concatenation of the left and right nodes and `boundary`
/// the current length of the left one. The boundary moves one pair at a time
/// toward `sibling` while the node being filled is `underfull_or_min`, the
/// sibling keeps at least two pairs, and the filled node still fits.
/// `right_footprint` computes the footprint of a right-hand run (internal
/// nodes drop their first key). Returns the new boundary.
pub(crate) fn level_boundary(
    pairs: &[StagedPair],
    boundary: usize,
    sibling: Side,
    block_size: usize,
    right_footprint: impl Fn(&[StagedPair]) -> usize,
) -> usize {
    let needs_pairs = |count: usize, size: usize| {
        count <= 1 || is_underfull_footprint(size, block_size)
    };
    let usable = usable_space(block_size);

    let mut b = boundary;
    match sibling {
        // Node is on the left; take the sibling's first pairs
        Side::Right => {
            while pairs.len() - b > 2 && needs_pairs(b, footprint(&pairs[..b])) {
                if footprint(&pairs[..=b]) > usable {
                    break;
                }
                b += 1;
            }
        }
        // Node is on the right; take the sibling's last pairs
        Side::Left => {
            while b > 2 && needs_pairs(pairs.len() - b, right_footprint(&pairs[b..])) {
                if right_footprint(&pairs[b - 1..]) > usable {
                    break;
                }
                b -= 1;
            }
        }
    }
    b
}
