//! Leaf node engine.
//!
//! A leaf holds `(key, value)` pairs sorted by key. Values are opaque bytes;
//! the tree layer stores tagged stored values in them.
//!
//! Reads go through [`LeafNode`], a bounds-checked view over the block.
//! Mutations are free functions over `&mut [u8]`, so a caller holding a
//! write lock can apply them to the locked bytes directly.
//!
//! # Design
//!
//! Insert and remove work in place: a new pair is pushed onto the front of
//! the heap and removal only drops the offset slot. Dead heap bytes are
//! reclaimed by [`compact`] and by every operation that restages the node
//! (split, merge, level), all of which write compact nodes.

// Lengths are bounded by the block size and always fit in u16.
#![allow(clippy::cast_possible_truncation)]

use std::cmp::Ordering;

use crate::storage::btree::key::{AsKey, MAX_KEY_SIZE, compare, usable_space};
use crate::storage::btree::node::{
    FRONTMOST_OFFSET, HeapCoverage, NPAIRS_OFFSET, NodeError, RawNode, SLOT_SIZE, Side, StagedPair,
    empty_frontmost, footprint, insert_slot, is_underfull_footprint, level_boundary, push_heap,
    remove_slot, set_slot, split_point, write_node,
};
use crate::storage::page::{BlockHeader, BlockType, read_u16, write_u16};

/// What an insert did with the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The key was new.
    Inserted,
    /// The key existed and its value was replaced.
    Replaced,
}

/// A pair borrowed from a leaf block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafPair<'a> {
    /// Key bytes.
    pub key: &'a [u8],
    /// Value bytes.
    pub value: &'a [u8],
    /// Heap offset of the pair.
    pub offset: usize,
}

impl LeafPair<'_> {
    /// Bytes the pair occupies in the heap.
    #[must_use]
    pub const fn encoded_len(&self) -> usize {
        encoded_len(self.key.len(), self.value.len())
    }

    fn staged(&self) -> StagedPair {
        StagedPair {
            key: self.key.to_vec(),
            payload: encode_payload(self.value),
        }
    }
}

impl AsKey for LeafPair<'_> {
    fn key_bytes(&self) -> &[u8] {
        self.key
    }
}

const fn encoded_len(key_len: usize, value_len: usize) -> usize {
    1 + key_len + 2 + value_len
}

fn encode_payload(value: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + value.len());
    payload.extend_from_slice(&(value.len() as u16).to_le_bytes());
    payload.extend_from_slice(value);
    payload
}

/// A read-only view of a leaf block.
#[derive(Debug, Clone, Copy)]
pub struct LeafNode<'a> {
    raw: RawNode<'a>,
}

impl<'a> LeafNode<'a> {
    /// View `data` as a leaf, checking the header.
    pub fn new(data: &'a [u8]) -> Result<Self, NodeError> {
        RawNode::new(data, BlockType::BTreeLeaf).map(|raw| Self { raw })
    }

    /// Number of pairs.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.raw.len()
    }

    /// Whether the leaf holds no pairs.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the underlying block.
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.raw.data().len()
    }

    /// Bytes between the offset array and the heap.
    #[must_use]
    pub const fn free_space(&self) -> usize {
        self.raw.free_space()
    }

    /// The pair at `index` in key order.
    pub fn pair(&self, index: usize) -> Result<LeafPair<'a>, NodeError> {
        let offset = self.raw.offset(index)?;
        self.decode_pair(offset)
    }

    /// The pair stored at heap offset `offset`.
    pub fn pair_at_offset(&self, offset: usize) -> Result<LeafPair<'a>, NodeError> {
        if offset < self.raw.frontmost() || offset >= self.block_size() {
            return Err(NodeError::Corruption("pair offset outside heap"));
        }
        self.decode_pair(offset)
    }

    fn decode_pair(&self, offset: usize) -> Result<LeafPair<'a>, NodeError> {
        let (key, key_end) = self.raw.key_at_offset(offset)?;
        let data = self.raw.data();
        if key_end + 2 > data.len() {
            return Err(NodeError::Corruption("value length past end of block"));
        }
        let value_start = key_end + 2;
        let value_len = usize::from(read_u16(data, key_end));
        let value = data
            .get(value_start..value_start + value_len)
            .ok_or(NodeError::Corruption("value extends past end of block"))?;
        Ok(LeafPair { key, value, offset })
    }

    /// Binary search for `key`: `Ok(index)` if present, else `Err(insertion index)`.
    pub fn search(&self, key: &[u8]) -> Result<Result<usize, usize>, NodeError> {
        let (mut lo, mut hi) = (0, self.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match compare(self.pair(mid)?.key, key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    /// The value stored under `key`.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<&'a [u8]>, NodeError> {
        match self.search(key)? {
            Ok(index) => self.pair(index).map(|pair| Some(pair.value)),
            Err(_) => Ok(None),
        }
    }

    /// Pairs in key order.
    pub fn pairs(self) -> impl Iterator<Item = Result<LeafPair<'a>, NodeError>> {
        (0..self.len()).map(move |index| self.pair(index))
    }

    /// The smallest key, if any.
    pub fn first_key(&self) -> Result<Option<&'a [u8]>, NodeError> {
        if self.is_empty() {
            return Ok(None);
        }
        self.pair(0).map(|pair| Some(pair.key))
    }

    /// The largest key, if any.
    pub fn last_key(&self) -> Result<Option<&'a [u8]>, NodeError> {
        match self.len() {
            0 => Ok(None),
            n => self.pair(n - 1).map(|pair| Some(pair.key)),
        }
    }

    /// Bytes used by live pairs and their offset slots.
    pub fn live_size(&self) -> Result<usize, NodeError> {
        self.pairs()
            .map(|pair| pair.map(|pair| SLOT_SIZE + pair.encoded_len()))
            .sum()
    }

    /// Whether inserting `(key, value)` would fail with `NodeFull`.
    ///
    /// An existing key reuses its offset slot, and its old bytes count as
    /// free once the heap is rewritten.
    pub fn is_full(&self, key: &[u8], value: &[u8]) -> Result<bool, NodeError> {
        let need = encoded_len(key.len(), value.len());
        Ok(match self.search(key)? {
            Ok(index) => need > self.free_space() && !self.fits_replacing(index, need)?,
            Err(_) => need + SLOT_SIZE > self.free_space(),
        })
    }

    /// Whether inserting `(key, value)` would fit after [`compact`].
    pub fn would_fit_compacted(&self, key: &[u8], value: &[u8]) -> Result<bool, NodeError> {
        let need = encoded_len(key.len(), value.len());
        match self.search(key)? {
            Ok(index) => self.fits_replacing(index, need),
            Err(_) => Ok(self.live_size()? + SLOT_SIZE + need <= usable_space(self.block_size())),
        }
    }

    /// Whether pair `index` can be swapped for one of `need` bytes once dead
    /// bytes and the old copy are reclaimed.
    fn fits_replacing(&self, index: usize, need: usize) -> Result<bool, NodeError> {
        let rest = self.live_size()? - self.pair(index)?.encoded_len();
        Ok(rest + need <= usable_space(self.block_size()))
    }

    /// Whether live occupancy is below 40% of the usable space.
    pub fn is_underfull(&self) -> Result<bool, NodeError> {
        Ok(is_underfull_footprint(self.live_size()?, self.block_size()))
    }

    /// Whether the leaf is underfull or holds at most one pair.
    pub fn is_underfull_or_min(&self) -> Result<bool, NodeError> {
        Ok(self.len() <= 1 || self.is_underfull()?)
    }

    /// Check that pairs lie inside the heap without overlapping and keys
    /// strictly increase.
    pub fn validate(&self) -> Result<(), NodeError> {
        let mut coverage = HeapCoverage::new(self.block_size());
        let mut prev: Option<&[u8]> = None;
        for pair in self.pairs() {
            let pair = pair?;
            if pair.key.len() > MAX_KEY_SIZE {
                return Err(NodeError::Corruption("key longer than maximum"));
            }
            coverage.claim(pair.offset, pair.encoded_len())?;
            if let Some(prev) = prev
                && compare(prev, pair.key) != Ordering::Less
            {
                return Err(NodeError::Corruption("leaf keys out of order"));
            }
            prev = Some(pair.key);
        }
        Ok(())
    }

    /// Copy every live pair out of the block.
    pub(crate) fn staged(&self) -> Result<Vec<StagedPair>, NodeError> {
        self.pairs().map(|pair| pair.map(|pair| pair.staged())).collect()
    }
}

/// Format `node` as an empty leaf.
pub fn init(node: &mut [u8]) {
    let block_size = node.len();
    node.fill(0);
    BlockHeader::stamp(node, BlockType::BTreeLeaf);
    write_u16(node, NPAIRS_OFFSET, 0);
    write_u16(node, FRONTMOST_OFFSET, empty_frontmost(block_size));
}

/// Build a compact leaf in `node` from the pairs of `other` at `offsets`.
///
/// The offsets must name pairs in ascending key order.
pub fn init_from(node: &mut [u8], other: &[u8], offsets: &[usize]) -> Result<(), NodeError> {
    let source = LeafNode::new(other)?;
    let pairs = offsets
        .iter()
        .map(|&offset| source.pair_at_offset(offset).map(|pair| pair.staged()))
        .collect::<Result<Vec<_>, _>>()?;
    if pairs.windows(2).any(|w| w[0].key >= w[1].key) {
        return Err(NodeError::InvalidOperation("pairs not in ascending key order"));
    }
    write_node(node, BlockType::BTreeLeaf, &pairs)
}

/// Insert or replace `key`.
///
/// A replacement that does not fit the free space rewrites the heap without
/// the old copy. Fails with `NodeFull`, leaving the node untouched, if the
/// pair still does not fit.
pub fn insert(node: &mut [u8], key: &[u8], value: &[u8]) -> Result<InsertOutcome, NodeError> {
    if key.len() > MAX_KEY_SIZE {
        return Err(NodeError::KeyTooLarge(key.len()));
    }
    let leaf = LeafNode::new(node)?;
    let need = encoded_len(key.len(), value.len());
    let found = leaf.search(key)?;
    let (npairs, frontmost, free) = (leaf.len(), leaf.raw.frontmost(), leaf.free_space());

    match found {
        Ok(index) => {
            if need <= free {
                let offset = push_heap(node, frontmost, key, &encode_payload(value));
                set_slot(node, index, offset);
            } else {
                // The old copy's bytes are reclaimed by rewriting the heap
                let mut pairs = leaf.staged()?;
                pairs[index].payload = encode_payload(value);
                write_node(node, BlockType::BTreeLeaf, &pairs)?;
            }
            Ok(InsertOutcome::Replaced)
        }
        Err(index) => {
            if need + SLOT_SIZE > free {
                return Err(NodeError::NodeFull);
            }
            let offset = push_heap(node, frontmost, key, &encode_payload(value));
            insert_slot(node, npairs, index, offset);
            Ok(InsertOutcome::Inserted)
        }
    }
}

/// Remove `key`. Returns whether it was present.
pub fn remove(node: &mut [u8], key: &[u8]) -> Result<bool, NodeError> {
    let leaf = LeafNode::new(node)?;
    match leaf.search(key)? {
        Ok(index) => {
            let npairs = leaf.len();
            remove_slot(node, npairs, index);
            Ok(true)
        }
        Err(_) => Ok(false),
    }
}

/// Rewrite the heap without dead bytes.
pub fn compact(node: &mut [u8]) -> Result<(), NodeError> {
    let pairs = LeafNode::new(node)?.staged()?;
    write_node(node, BlockType::BTreeLeaf, &pairs)
}

/// Move the upper part of `node` into `new_node`, splitting by byte size.
///
/// Returns the median, the first key of `new_node`.
pub fn split(node: &mut [u8], new_node: &mut [u8]) -> Result<Vec<u8>, NodeError> {
    let pairs = LeafNode::new(node)?.staged()?;
    if pairs.len() < 2 {
        return Err(NodeError::InvalidOperation("split needs at least two pairs"));
    }
    let at = split_point(&pairs);
    write_node(new_node, BlockType::BTreeLeaf, &pairs[at..])?;
    write_node(node, BlockType::BTreeLeaf, &pairs[..at])?;
    Ok(pairs[at].key.clone())
}

/// Append every pair of `right` to `left`.
///
/// Returns the first key of `right`, the separator the parent drops. Fails
/// with `NodeFull`, leaving `left` untouched, if the union does not fit.
pub fn merge(left: &mut [u8], right: &[u8]) -> Result<Vec<u8>, NodeError> {
    let right_pairs = LeafNode::new(right)?.staged()?;
    let Some(first) = right_pairs.first() else {
        return Err(NodeError::InvalidOperation("merge of an empty right node"));
    };
    let removed = first.key.clone();

    let mut pairs = LeafNode::new(left)?.staged()?;
    if pairs.last().is_some_and(|last| last.key >= removed) {
        return Err(NodeError::InvalidOperation("merge of unordered siblings"));
    }
    pairs.extend(right_pairs);
    write_node(left, BlockType::BTreeLeaf, &pairs)?;
    Ok(removed)
}

/// Move boundary pairs from `sibling` into `node` until `node` is no longer
/// underfull or has at least two pairs.
///
/// `side` says where `sibling` sits. `sibling` keeps at least two pairs.
/// Returns the first key of the right-hand node, which the parent must now
/// store as its separator, or `None` if nothing moved.
pub fn level(node: &mut [u8], sibling: &mut [u8], side: Side) -> Result<Option<Vec<u8>>, NodeError> {
    let block_size = node.len();
    let mine = LeafNode::new(node)?.staged()?;
    let theirs = LeafNode::new(sibling)?.staged()?;

    let (mut pairs, rest) = match side {
        Side::Right => (mine, theirs),
        Side::Left => (theirs, mine),
    };
    let boundary = pairs.len();
    pairs.extend(rest);

    let moved_to = level_boundary(&pairs, boundary, side, block_size, footprint);
    if moved_to == boundary {
        return Ok(None);
    }

    let (left, right) = pairs.split_at(moved_to);
    let (left_node, right_node) = match side {
        Side::Right => (node, sibling),
        Side::Left => (sibling, node),
    };
    write_node(left_node, BlockType::BTreeLeaf, left)?;
    write_node(right_node, BlockType::BTreeLeaf, right)?;
    Ok(right.first().map(|pair| pair.key.clone()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::*;
    use crate::storage::btree::node::{Node, nodecmp};

    const BLOCK: usize = 128;

    fn empty_leaf() -> Vec<u8> {
        let mut node = vec![0u8; BLOCK];
        init(&mut node);
        node
    }

    fn leaf_with(pairs: &[(&[u8], &[u8])]) -> Vec<u8> {
        let mut node = empty_leaf();
        for (key, value) in pairs {
            insert(&mut node, key, value).expect("insert");
        }
        node
    }

    fn keys(node: &[u8]) -> Vec<Vec<u8>> {
        LeafNode::new(node)
            .expect("leaf")
            .pairs()
            .map(|pair| pair.expect("pair").key.to_vec())
            .collect()
    }

    #[test]
    fn test_three_pair_leaf_split() {
        let value = [7u8; 30];
        let mut node = leaf_with(&[(b"a", &value), (b"c", &value), (b"e", &value)]);

        let leaf = LeafNode::new(&node).expect("leaf");
        assert!(leaf.is_full(b"g", &value).expect("is_full"));
        assert_eq!(insert(&mut node, b"g", &value), Err(NodeError::NodeFull));

        let mut right = empty_leaf();
        let median = split(&mut node, &mut right).expect("split");
        assert_eq!(median, b"e");
        assert_eq!(keys(&node), vec![b"a".to_vec(), b"c".to_vec()]);
        assert_eq!(keys(&right), vec![b"e".to_vec()]);

        insert(&mut right, b"g", &value).expect("insert");
        assert_eq!(keys(&right), vec![b"e".to_vec(), b"g".to_vec()]);
        LeafNode::new(&node).expect("leaf").validate().expect("valid");
        LeafNode::new(&right).expect("leaf").validate().expect("valid");
    }

    #[test]
    fn test_insert_replace_and_lookup() {
        let mut node = leaf_with(&[(b"b", b"one"), (b"a", b"two")]);
        assert_eq!(
            insert(&mut node, b"b", b"three").expect("insert"),
            InsertOutcome::Replaced
        );

        let leaf = LeafNode::new(&node).expect("leaf");
        assert_eq!(leaf.len(), 2);
        assert_eq!(leaf.lookup(b"a").expect("lookup"), Some(b"two".as_slice()));
        assert_eq!(leaf.lookup(b"b").expect("lookup"), Some(b"three".as_slice()));
        assert_eq!(leaf.lookup(b"c").expect("lookup"), None);
        assert_eq!(leaf.first_key().expect("first"), Some(b"a".as_slice()));
        assert_eq!(leaf.last_key().expect("last"), Some(b"b".as_slice()));
    }

    #[test]
    fn test_empty_key_sorts_first() {
        let node = leaf_with(&[(b"a", b"x"), (b"", b"empty")]);
        assert_eq!(keys(&node), vec![b"".to_vec(), b"a".to_vec()]);
        let leaf = LeafNode::new(&node).expect("leaf");
        assert_eq!(leaf.lookup(b"").expect("lookup"), Some(b"empty".as_slice()));
    }

    #[test]
    fn test_replacements_leave_dead_bytes_until_compacted() {
        let mut node = leaf_with(&[(b"k", &[1u8; 20])]);
        let mut replaced = 0;
        while LeafNode::new(&node).expect("leaf").free_space() >= 24 {
            insert(&mut node, b"k", &[2u8; 20]).expect("insert");
            replaced += 1;
        }
        assert!(replaced > 0);

        let leaf = LeafNode::new(&node).expect("leaf");
        assert!(leaf.free_space() < BLOCK - 12 - leaf.live_size().expect("size"));
        assert!(!leaf.is_full(b"k", &[3u8; 20]).expect("is_full"));
        assert!(leaf.would_fit_compacted(b"k", &[3u8; 20]).expect("fit"));

        compact(&mut node).expect("compact");
        let leaf = LeafNode::new(&node).expect("leaf");
        assert_eq!(leaf.live_size().expect("size"), 2 + 1 + 1 + 2 + 20);
        assert_eq!(leaf.free_space(), BLOCK - 12 - leaf.live_size().expect("size"));
        assert_eq!(leaf.lookup(b"k").expect("lookup"), Some([2u8; 20].as_slice()));
    }

    #[test]
    fn test_replace_larger_value_in_nearly_full_leaf() {
        let value = [1u8; 20];
        let mut node = leaf_with(&[(b"a", &value), (b"b", &value), (b"c", &value), (b"d", &value)]);
        // Four pairs of 26 bytes leave 12 free
        let leaf = LeafNode::new(&node).expect("leaf");
        assert_eq!(leaf.free_space(), 12);
        assert!(!leaf.is_full(b"a", &[2u8; 22]).expect("is_full"));

        assert_eq!(
            insert(&mut node, b"a", &[2u8; 22]).expect("insert"),
            InsertOutcome::Replaced
        );
        let leaf = LeafNode::new(&node).expect("leaf");
        leaf.validate().expect("valid");
        assert_eq!(leaf.len(), 4);
        assert_eq!(leaf.lookup(b"a").expect("lookup"), Some([2u8; 22].as_slice()));
        assert_eq!(leaf.lookup(b"d").expect("lookup"), Some(value.as_slice()));
        assert_eq!(leaf.free_space(), BLOCK - 12 - leaf.live_size().expect("size"));

        // Growing past the usable space still fails and leaves the node as it was
        let before = node.clone();
        let leaf = LeafNode::new(&node).expect("leaf");
        assert!(leaf.is_full(b"a", &[3u8; 40]).expect("is_full"));
        assert!(!leaf.would_fit_compacted(b"a", &[3u8; 40]).expect("fit"));
        assert_eq!(insert(&mut node, b"a", &[3u8; 40]), Err(NodeError::NodeFull));
        assert_eq!(node, before);
    }

    #[test]
    fn test_remove_keeps_heap_bytes() {
        let mut node = leaf_with(&[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")]);
        let free_before = LeafNode::new(&node).expect("leaf").free_space();

        assert!(remove(&mut node, b"b").expect("remove"));
        assert!(!remove(&mut node, b"b").expect("remove"));
        let leaf = LeafNode::new(&node).expect("leaf");
        assert_eq!(leaf.free_space(), free_before + SLOT_SIZE);
        assert_eq!(keys(&node), vec![b"a".to_vec(), b"c".to_vec()]);

        // Emptying the node resets its heap
        remove(&mut node, b"a").expect("remove");
        remove(&mut node, b"c").expect("remove");
        assert_eq!(LeafNode::new(&node).expect("leaf").free_space(), BLOCK - 12);
    }

    #[test]
    fn test_key_too_large() {
        let mut node = vec![0u8; 4096];
        init(&mut node);
        let key = vec![b'k'; MAX_KEY_SIZE + 1];
        assert_eq!(
            insert(&mut node, &key, b"v"),
            Err(NodeError::KeyTooLarge(MAX_KEY_SIZE + 1))
        );
    }

    #[test]
    fn test_merge_preserves_content() {
        let mut left = leaf_with(&[(b"a", b"1"), (b"b", b"2")]);
        let right = leaf_with(&[(b"c", b"3"), (b"d", b"4")]);
        let removed = merge(&mut left, &right).expect("merge");
        assert_eq!(removed, b"c");
        assert_eq!(
            keys(&left),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );
        let leaf = LeafNode::new(&left).expect("leaf");
        assert_eq!(leaf.lookup(b"d").expect("lookup"), Some(b"4".as_slice()));
    }

    #[test]
    fn test_merge_too_large_leaves_left_untouched() {
        let value = [0u8; 30];
        let mut left = leaf_with(&[(b"a", &value), (b"b", &value)]);
        let right = leaf_with(&[(b"c", &value), (b"d", &value)]);
        let before = left.clone();
        assert_eq!(merge(&mut left, &right), Err(NodeError::NodeFull));
        assert_eq!(left, before);
    }

    #[test]
    fn test_level_from_right_sibling() {
        let mut node = leaf_with(&[(b"a", b"x")]);
        let mut sibling = leaf_with(&[
            (b"m", &[0u8; 20]),
            (b"n", &[0u8; 20]),
            (b"o", &[0u8; 20]),
            (b"p", &[0u8; 20]),
        ]);
        let separator = level(&mut node, &mut sibling, Side::Right)
            .expect("level")
            .expect("moved");

        let leaf = LeafNode::new(&node).expect("leaf");
        let sib = LeafNode::new(&sibling).expect("leaf");
        assert!(!leaf.is_underfull_or_min().expect("underfull"));
        assert!(sib.len() >= 2);
        assert_eq!(Some(separator.as_slice()), sib.first_key().expect("first"));
        assert_eq!(leaf.len() + sib.len(), 5);
    }

    #[test]
    fn test_level_from_left_sibling() {
        let mut node = leaf_with(&[(b"z", b"x")]);
        let mut sibling = leaf_with(&[
            (b"a", &[0u8; 20]),
            (b"b", &[0u8; 20]),
            (b"c", &[0u8; 20]),
            (b"d", &[0u8; 20]),
        ]);
        let separator = level(&mut node, &mut sibling, Side::Left)
            .expect("level")
            .expect("moved");

        // The node is now on the right and its first key is the new separator
        let leaf = LeafNode::new(&node).expect("leaf");
        assert_eq!(Some(separator.as_slice()), leaf.first_key().expect("first"));
        assert_eq!(leaf.last_key().expect("last"), Some(b"z".as_slice()));
        assert!(LeafNode::new(&sibling).expect("leaf").len() >= 2);
    }

    #[test]
    fn test_level_keeps_sibling_floor() {
        let mut node = leaf_with(&[(b"a", b"x")]);
        let mut sibling = leaf_with(&[(b"m", b"y"), (b"n", b"z")]);
        assert_eq!(level(&mut node, &mut sibling, Side::Right).expect("level"), None);
        assert_eq!(keys(&sibling).len(), 2);
    }

    #[test]
    fn test_underfull_threshold() {
        // usable 116: footprint below 46.4 bytes is underfull
        let node = leaf_with(&[(b"a", &[0u8; 40])]);
        let leaf = LeafNode::new(&node).expect("leaf");
        assert_eq!(leaf.live_size().expect("size"), 46);
        assert!(leaf.is_underfull().expect("underfull"));

        let node = leaf_with(&[(b"a", &[0u8; 41])]);
        let leaf = LeafNode::new(&node).expect("leaf");
        assert!(!leaf.is_underfull().expect("underfull"));
        assert!(leaf.is_underfull_or_min().expect("underfull"));
    }

    #[test]
    fn test_validate_detects_unordered_keys() {
        let mut node = vec![0u8; BLOCK];
        let pairs = vec![
            StagedPair {
                key: b"b".to_vec(),
                payload: encode_payload(b"1"),
            },
            StagedPair {
                key: b"a".to_vec(),
                payload: encode_payload(b"2"),
            },
        ];
        write_node(&mut node, BlockType::BTreeLeaf, &pairs).expect("write");
        assert!(matches!(
            LeafNode::new(&node).expect("leaf").validate(),
            Err(NodeError::Corruption(_))
        ));
    }

    #[test]
    fn test_validate_detects_overlapping_pairs() {
        // The value of "a" spells out a complete pair for key "b"
        let mut node = leaf_with(&[(b"a", &[1, b'b', 1, 0, b'x']), (b"c", b"1")]);
        let offset = LeafNode::new(&node).expect("leaf").pair(0).expect("pair").offset;
        set_slot(&mut node, 1, offset + 4);

        let leaf = LeafNode::new(&node).expect("leaf");
        assert_eq!(leaf.pair(1).expect("pair").key, b"b");
        assert_eq!(
            leaf.validate(),
            Err(NodeError::Corruption("pairs overlap in the heap"))
        );
    }

    #[test]
    fn test_corrupt_offset_reported() {
        let mut node = leaf_with(&[(b"a", b"1")]);
        // Point the only slot into the offset array
        write_u16(&mut node, 12, 4);
        let leaf = LeafNode::new(&node).expect("leaf");
        assert!(matches!(leaf.pair(0), Err(NodeError::Corruption(_))));
        assert!(leaf.validate().is_err());

        // A value length running past the block
        let mut node = leaf_with(&[(b"a", b"1")]);
        let offset = LeafNode::new(&node).expect("leaf").pair(0).expect("pair").offset;
        write_u16(&mut node, offset + 2, 500);
        let leaf = LeafNode::new(&node).expect("leaf");
        assert!(matches!(leaf.lookup(b"a"), Err(NodeError::Corruption(_))));
    }

    #[test]
    fn test_init_from_offsets() {
        let source = leaf_with(&[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")]);
        let view = LeafNode::new(&source).expect("leaf");
        let offsets = [
            view.pair(0).expect("pair").offset,
            view.pair(2).expect("pair").offset,
        ];

        let mut node = vec![0u8; BLOCK];
        init_from(&mut node, &source, &offsets).expect("init_from");
        assert_eq!(keys(&node), vec![b"a".to_vec(), b"c".to_vec()]);

        let reversed = [offsets[1], offsets[0]];
        assert!(init_from(&mut node, &source, &reversed).is_err());
        assert!(init_from(&mut node, &source, &[3]).is_err());
    }

    #[test]
    fn test_nodecmp_orders_siblings() {
        fn parse(data: &[u8]) -> Node<'_> {
            Node::parse(data).expect("parse")
        }
        let low = leaf_with(&[(b"a", b"1")]);
        let high = leaf_with(&[(b"m", b"1")]);
        let empty = empty_leaf();
        assert_eq!(
            nodecmp(&parse(&low), &parse(&high)).expect("cmp"),
            Ordering::Less
        );
        assert_eq!(
            nodecmp(&parse(&empty), &parse(&low)).expect("cmp"),
            Ordering::Less
        );
    }

    #[derive(Debug, Clone)]
    enum LeafOp {
        Insert(u8, usize),
        Remove(u8),
    }

    fn leaf_op() -> impl Strategy<Value = LeafOp> {
        prop_oneof![
            (0u8..24, 0usize..24).prop_map(|(k, len)| LeafOp::Insert(k, len)),
            (0u8..24).prop_map(LeafOp::Remove),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]
        #[test]
        fn leaf_matches_btreemap(ops in prop::collection::vec(leaf_op(), 1..60)) {
            let mut node = vec![0u8; 256];
            init(&mut node);
            let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

            for op in ops {
                match op {
                    LeafOp::Insert(k, len) => {
                        let key = vec![k];
                        let value = vec![k; len];
                        let full = LeafNode::new(&node).expect("leaf").is_full(&key, &value).expect("is_full");
                        let result = insert(&mut node, &key, &value);
                        prop_assert_eq!(full, result == Err(NodeError::NodeFull));
                        if full
                            && LeafNode::new(&node).expect("leaf").would_fit_compacted(&key, &value).expect("fit")
                        {
                            compact(&mut node).expect("compact");
                            insert(&mut node, &key, &value).expect("insert after compact");
                            model.insert(key, value);
                        } else if !full {
                            model.insert(key, value);
                        }
                    }
                    LeafOp::Remove(k) => {
                        let removed = remove(&mut node, &[k]).expect("remove");
                        prop_assert_eq!(removed, model.remove([k].as_slice()).is_some());
                    }
                }
                let leaf = LeafNode::new(&node).expect("leaf");
                leaf.validate().expect("valid");
                prop_assert_eq!(leaf.len(), model.len());
            }

            let leaf = LeafNode::new(&node).expect("leaf");
            for (key, value) in &model {
                prop_assert_eq!(leaf.lookup(key).expect("lookup"), Some(value.as_slice()));
            }
        }
    }
}
