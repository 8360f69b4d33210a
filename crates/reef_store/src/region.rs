//! Key ranges, hash intervals, and the region algebra used for sharding.
//!
//! A region is the cross product of a hash interval and a lexicographic key
//! range. Key-range shards split the key axis; CPU shards split the hash
//! axis. All algebra operations are total: an empty result is a value, not
//! an error.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Number of bits in the hash axis.
pub const HASH_SPACE_BITS: u32 = 63;
/// Exclusive upper bound of the hash axis.
pub const HASH_SPACE_SIZE: u64 = 1 << HASH_SPACE_BITS;
/// Maximum length of a store key in bytes.
pub const MAX_KEY_SIZE: usize = 250;

/// Hash a store key onto the hash axis.
pub fn hash_store_key(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish() % HASH_SPACE_SIZE
}

/// The largest representable store key.
pub fn max_store_key() -> Vec<u8> {
    vec![0xff; MAX_KEY_SIZE]
}

/// Immediate lexicographic successor of a key.
pub fn key_successor(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 1);
    out.extend_from_slice(key);
    out.push(0x00);
    out
}

/// Right bound of a key range.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyBound {
    Unbounded,
    Exclusive(Vec<u8>),
}

/// Lexicographic key interval with a closed left bound.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub left: Vec<u8>,
    pub right: KeyBound,
}

impl KeyRange {
    pub fn new(left: Vec<u8>, right: KeyBound) -> Self {
        Self { left, right }
    }

    /// Range covering every key.
    pub fn universe() -> Self {
        Self {
            left: Vec::new(),
            right: KeyBound::Unbounded,
        }
    }

    /// Range covering no keys.
    pub fn empty() -> Self {
        Self {
            left: Vec::new(),
            right: KeyBound::Exclusive(Vec::new()),
        }
    }

    /// `[left, right)`.
    pub fn half_open(left: Vec<u8>, right: Vec<u8>) -> Self {
        Self {
            left,
            right: KeyBound::Exclusive(right),
        }
    }

    /// `[left, right]`, normalized to a half-open range ending at the
    /// successor of `right`.
    pub fn closed(left: Vec<u8>, right: &[u8]) -> Self {
        Self {
            left,
            right: KeyBound::Exclusive(key_successor(right)),
        }
    }

    /// Range holding exactly one key.
    pub fn single_key(key: &[u8]) -> Self {
        Self::closed(key.to_vec(), key)
    }

    pub fn is_empty(&self) -> bool {
        match &self.right {
            KeyBound::Unbounded => false,
            KeyBound::Exclusive(right) => *right <= self.left,
        }
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        if key < self.left.as_slice() {
            return false;
        }
        match &self.right {
            KeyBound::Unbounded => true,
            KeyBound::Exclusive(right) => key < right.as_slice(),
        }
    }

    /// True when every key of `other` is inside `self`.
    pub fn is_superset(&self, other: &KeyRange) -> bool {
        if other.is_empty() {
            return true;
        }
        if other.left < self.left {
            return false;
        }
        match (&self.right, &other.right) {
            (KeyBound::Unbounded, _) => true,
            (KeyBound::Exclusive(_), KeyBound::Unbounded) => false,
            (KeyBound::Exclusive(sr), KeyBound::Exclusive(or)) => or <= sr,
        }
    }

    pub fn intersection(&self, other: &KeyRange) -> KeyRange {
        let left = self.left.clone().max(other.left.clone());
        let right = match (&self.right, &other.right) {
            (KeyBound::Unbounded, r) | (r, KeyBound::Unbounded) => r.clone(),
            (KeyBound::Exclusive(a), KeyBound::Exclusive(b)) => {
                KeyBound::Exclusive(a.clone().min(b.clone()))
            }
        };
        KeyRange { left, right }
    }

    /// Upper bound used as the "fully considered" watermark for scans that
    /// drained the whole range.
    pub fn last_key_in_range(&self) -> Vec<u8> {
        match &self.right {
            KeyBound::Unbounded => max_store_key(),
            KeyBound::Exclusive(right) => right.clone(),
        }
    }
}

/// A subspace of the store: hash interval `[hash_start, hash_end)` crossed
/// with a key range.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub hash_start: u64,
    pub hash_end: u64,
    pub keys: KeyRange,
}

impl Region {
    pub fn new(hash_start: u64, hash_end: u64, keys: KeyRange) -> Self {
        debug_assert!(hash_start <= hash_end);
        debug_assert!(hash_end <= HASH_SPACE_SIZE);
        Self {
            hash_start,
            hash_end,
            keys,
        }
    }

    /// Full hash axis over every key.
    pub fn universe() -> Self {
        Self::new(0, HASH_SPACE_SIZE, KeyRange::universe())
    }

    pub fn empty() -> Self {
        Self::new(0, 0, KeyRange::empty())
    }

    /// Full hash axis over `keys`.
    pub fn from_key_range(keys: KeyRange) -> Self {
        Self::new(0, HASH_SPACE_SIZE, keys)
    }

    pub fn is_empty(&self) -> bool {
        self.hash_start >= self.hash_end || self.keys.is_empty()
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        let h = hash_store_key(key);
        self.hash_start <= h && h < self.hash_end && self.keys.contains_key(key)
    }

    /// Componentwise superset test.
    pub fn is_superset(&self, other: &Region) -> bool {
        if other.is_empty() {
            return true;
        }
        self.hash_start <= other.hash_start
            && other.hash_end <= self.hash_end
            && self.keys.is_superset(&other.keys)
    }

    /// Componentwise intersection; empty when either axis is disjoint.
    pub fn intersection(&self, other: &Region) -> Region {
        let hash_start = self.hash_start.max(other.hash_start);
        // Clamp so a disjoint hash axis yields a zero-width interval.
        let hash_end = self.hash_end.min(other.hash_end).max(hash_start);
        Region {
            hash_start,
            hash_end,
            keys: self.keys.intersection(&other.keys),
        }
    }
}

/// Region containing exactly one key: hash width 1 over a single-key range.
pub fn monokey_region(key: &[u8]) -> Region {
    let h = hash_store_key(key);
    Region::new(h, h + 1, KeyRange::single_key(key))
}

/// Hash-axis partition assigned to worker `index` out of `count`. Subspaces
/// are equal width; the last one absorbs the remainder so the union covers
/// the hash axis exactly.
pub fn cpu_sharding_subspace(index: usize, count: usize) -> Region {
    assert!(count > 0);
    assert!(index < count);

    // Integer width first so intermediate products cannot overflow.
    let width = HASH_SPACE_SIZE / count as u64;
    let start = width * index as u64;
    let end = if index + 1 == count {
        HASH_SPACE_SIZE
    } else {
        start + width
    };
    Region::new(start, end, KeyRange::universe())
}
