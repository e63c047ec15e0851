//! Key comparison, size limits, and key ranges.

use std::cmp::Ordering;
use std::ops::Bound;

use crate::storage::btree::node::{NODE_HEADER_SIZE, SLOT_SIZE};
use crate::storage::overflow::STORED_HANDLE_SIZE;

/// Absolute maximum key length. The on-disk key length is one byte.
pub const MAX_KEY_SIZE: usize = 250;

/// Anything that carries key bytes: a bare search key or a stored pair.
pub trait AsKey {
    /// The key bytes.
    fn key_bytes(&self) -> &[u8];
}

impl AsKey for [u8] {
    fn key_bytes(&self) -> &[u8] {
        self
    }
}

impl AsKey for Vec<u8> {
    fn key_bytes(&self) -> &[u8] {
        self
    }
}

impl<T: AsKey + ?Sized> AsKey for &T {
    fn key_bytes(&self) -> &[u8] {
        (**self).key_bytes()
    }
}

/// Compare two keys lexicographically; a proper prefix sorts first.
#[must_use]
pub fn compare<A: AsKey + ?Sized, B: AsKey + ?Sized>(a: &A, b: &B) -> Ordering {
    a.key_bytes().cmp(b.key_bytes())
}

/// Bytes available to pairs and offsets in a node.
#[must_use]
pub const fn usable_space(block_size: usize) -> usize {
    block_size - NODE_HEADER_SIZE
}

/// Largest footprint (pair plus offset slot) a single pair may have.
#[must_use]
pub const fn max_pair_footprint(block_size: usize) -> usize {
    usable_space(block_size) / 4
}

/// Longest key a tree with this block size accepts.
///
/// Leaves room for the key next to an overflow handle in a leaf.
#[must_use]
pub const fn max_key_size(block_size: usize) -> usize {
    // slot + key length byte + value length + stored handle
    let overhead = SLOT_SIZE + 1 + 2 + STORED_HANDLE_SIZE;
    let limit = max_pair_footprint(block_size) - overhead;
    if limit < MAX_KEY_SIZE {
        limit
    } else {
        MAX_KEY_SIZE
    }
}

/// Footprint of a leaf pair holding `stored_len` bytes of stored value.
#[must_use]
pub const fn leaf_pair_footprint(key_len: usize, stored_len: usize) -> usize {
    SLOT_SIZE + 1 + key_len + 2 + stored_len
}

/// Whether a value can be stored inline (tag plus bytes) next to `key_len`.
#[must_use]
pub const fn fits_inline(block_size: usize, key_len: usize, value_len: usize) -> bool {
    leaf_pair_footprint(key_len, 1 + value_len) <= max_pair_footprint(block_size)
}

/// A range of keys with independent bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    /// Lower bound.
    pub start: Bound<Vec<u8>>,
    /// Upper bound.
    pub end: Bound<Vec<u8>>,
}

impl KeyRange {
    /// Every key.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    /// A range from `start` to `end`. An open bound excludes its key.
    #[must_use]
    pub fn new(start: &[u8], end: &[u8], left_open: bool, right_open: bool) -> Self {
        let bound = |key: &[u8], open: bool| {
            if open {
                Bound::Excluded(key.to_vec())
            } else {
                Bound::Included(key.to_vec())
            }
        };
        Self {
            start: bound(start, left_open),
            end: bound(end, right_open),
        }
    }

    /// Whether `key` lies before the lower bound.
    #[must_use]
    pub fn is_before_start(&self, key: &[u8]) -> bool {
        match &self.start {
            Bound::Unbounded => false,
            Bound::Included(start) => key < start.as_slice(),
            Bound::Excluded(start) => key <= start.as_slice(),
        }
    }

    /// Whether `key` lies after the upper bound.
    #[must_use]
    pub fn is_after_end(&self, key: &[u8]) -> bool {
        match &self.end {
            Bound::Unbounded => false,
            Bound::Included(end) => key > end.as_slice(),
            Bound::Excluded(end) => key >= end.as_slice(),
        }
    }

    /// Whether `key` is inside the range.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        !self.is_before_start(key) && !self.is_after_end(key)
    }

    /// Whether no key can be in the range.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (Bound::Included(start), Bound::Included(end)) => start > end,
            (Bound::Included(start) | Bound::Excluded(start), Bound::Excluded(end))
            | (Bound::Excluded(start), Bound::Included(end)) => start >= end,
            _ => false,
        }
    }

    /// The lower bound key, if any.
    #[must_use]
    pub fn start_key(&self) -> Option<&[u8]> {
        match &self.start {
            Bound::Included(key) | Bound::Excluded(key) => Some(key),
            Bound::Unbounded => None,
        }
    }
}

impl Default for KeyRange {
    fn default() -> Self {
        Self::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_prefix_first() {
        assert_eq!(compare(b"ab".as_slice(), b"abc".as_slice()), Ordering::Less);
        assert_eq!(compare(b"b".as_slice(), b"abc".as_slice()), Ordering::Greater);
        assert_eq!(compare(b"".as_slice(), b"a".as_slice()), Ordering::Less);
        assert_eq!(compare(&b"x".to_vec(), b"x".as_slice()), Ordering::Equal);
    }

    #[test]
    fn test_size_limits() {
        assert_eq!(usable_space(128), 116);
        assert_eq!(max_pair_footprint(128), 29);
        assert_eq!(max_key_size(128), 11);
        assert_eq!(max_key_size(4096), MAX_KEY_SIZE);

        // 2 + 1 + 4 + 2 + 1 + 19 = 29
        assert!(fits_inline(128, 4, 19));
        assert!(!fits_inline(128, 4, 20));
        // The longest key always fits with an overflow handle
        let key = max_key_size(128);
        assert!(leaf_pair_footprint(key, STORED_HANDLE_SIZE) <= max_pair_footprint(128));
    }

    #[test]
    fn test_range_bounds() {
        let range = KeyRange::new(b"c", b"g", false, true);
        assert!(!range.contains(b"b"));
        assert!(range.contains(b"c"));
        assert!(range.contains(b"f"));
        assert!(!range.contains(b"g"));

        let range = KeyRange::new(b"c", b"g", true, false);
        assert!(!range.contains(b"c"));
        assert!(range.contains(b"g"));
        assert!(!range.contains(b"ga"));

        assert!(KeyRange::all().contains(b""));
    }

    #[test]
    fn test_range_is_empty() {
        assert!(!KeyRange::new(b"c", b"c", false, false).is_empty());
        assert!(KeyRange::new(b"c", b"c", true, false).is_empty());
        assert!(KeyRange::new(b"c", b"c", false, true).is_empty());
        assert!(KeyRange::new(b"d", b"c", false, false).is_empty());
        assert!(!KeyRange::new(b"a", b"c", true, true).is_empty());
        assert!(!KeyRange::all().is_empty());
    }
}
