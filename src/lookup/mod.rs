//! Point lookups over leveled sorted runs
//!
//! ## Flow
//! ```text
//! LookupLevels::lookup(key, level)
//!   → LevelSet::files_to_probe      (which files, in precedence order)
//!   → LookupFileCache::get(file)    (build once or reuse, disk-budgeted)
//!   → FileLookup::lookup(key)       (bloom filter, then on-disk hash index)
//!   → first hit wins
//! ```

mod file_cache;
mod file_lookup;
mod levels;
mod lookup_levels;

pub use file_cache::{CacheOptions, CacheStats, LookupFileCache};
pub use file_lookup::{BuildOptions, FileLookup};
pub use levels::LevelSet;
pub use lookup_levels::{LevelEntry, LookupLevels, LookupLevelsBuilder};

use crate::types::{Entry, FileMeta};
use crate::Result;

/// Once-iterable, key-ordered entries of one source file
pub type EntryIter<'a> = Box<dyn Iterator<Item = Result<Entry>> + Send + 'a>;

/// Reads the entries of a source file
///
/// Called exactly once per per-file index build.
pub trait SourceReader: Send + Sync {
    fn read(&self, meta: &FileMeta) -> Result<EntryIter<'_>>;
}
