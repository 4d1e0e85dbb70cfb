//! Lookup Levels
//!
//! Point-lookup cache over a leveled set of immutable sorted runs.
//!
//! ## Features
//! - Level 0 runs probed newest first, deeper levels by binary search
//! - Per-run lookup index (bloom filter + on-disk hash index) built once, on demand
//! - Disk-budgeted LRU of built indexes with idle expiry
//! - Single-flight builds and leases that defer spill file deletion
//!
//! ## Architecture
//! - lookup: `LookupLevels` → `LevelSet` / `LookupFileCache` → `FileLookup`
//! - storage: sorted runs, hash index, bloom filter, spill files
//! - cache: page cache of decoded index buckets shared by every index

pub mod cache;
pub mod config;
pub mod lookup;
pub mod storage;
pub mod types;

mod error;

pub use cache::{PageCache, PageCacheStats};
pub use config::{IndexCompression, LookupConfig};
pub use error::{Result, StorageError};
pub use lookup::{
    BuildOptions, CacheOptions, CacheStats, EntryIter, FileLookup, LevelEntry, LevelSet,
    LookupFileCache, LookupLevels, LookupLevelsBuilder, SourceReader,
};
pub use storage::{SSTableBuilder, SSTableReader};
pub use types::{BytewiseComparator, Entry, FileMeta, KeyComparator, RowKind, SequenceNumber, UNKNOWN_SEQUENCE};
