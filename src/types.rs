//! Core data types: entries, file metadata and key ordering

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Write-order marker
pub type SequenceNumber = i64;

/// Sentinel for files whose format does not keep per-entry write order
/// (e.g. levels reconstructed from historical snapshots).
pub const UNKNOWN_SEQUENCE: SequenceNumber = -1;

/// Row kind of an entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowKind {
    Insert,
    Delete,
}

/// A single key-value record of a sorted run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: Vec<u8>,
    pub sequence: SequenceNumber,
    pub kind: RowKind,
    pub value: Vec<u8>,
}

impl Entry {
    pub fn insert(key: impl Into<Vec<u8>>, sequence: SequenceNumber, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            sequence,
            kind: RowKind::Insert,
            value: value.into(),
        }
    }

    /// Tombstone for `key`
    pub fn delete(key: impl Into<Vec<u8>>, sequence: SequenceNumber) -> Self {
        Self {
            key: key.into(),
            sequence,
            kind: RowKind::Delete,
            value: Vec::new(),
        }
    }

    pub fn is_delete(&self) -> bool {
        self.kind == RowKind::Delete
    }

    pub fn has_known_sequence(&self) -> bool {
        self.sequence != UNKNOWN_SEQUENCE
    }
}

/// Metadata of one immutable sorted run
///
/// `file_name` is the file identity: the cache keys its per-file indexes by it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// File name (relative to the data directory)
    pub file_name: String,

    /// Level this file belongs to
    pub level: usize,

    /// Smallest key (inclusive)
    pub min_key: Vec<u8>,

    /// Largest key (inclusive)
    pub max_key: Vec<u8>,

    /// File size in bytes
    pub file_size: u64,

    /// Number of entries
    pub row_count: u64,
}

impl FileMeta {
    /// Whether `[min_key, max_key]` contains `key` under `comparator`
    pub fn contains_key(&self, comparator: &dyn KeyComparator, key: &[u8]) -> bool {
        comparator.compare(&self.min_key, key) != Ordering::Greater
            && comparator.compare(&self.max_key, key) != Ordering::Less
    }
}

impl fmt::Display for FileMeta {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} (L{}, {} rows, {} bytes)",
            self.file_name, self.level, self.row_count, self.file_size
        )
    }
}

/// Total order over keys
pub trait KeyComparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Lexicographic byte order
#[derive(Clone, Copy, Debug, Default)]
pub struct BytewiseComparator;

impl KeyComparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}
