//! Storage layer
//!
//! Sorted runs (the indexed source files), the on-disk hash index and bloom
//! filter collaborators, and spill file management.

pub mod lsm;
pub mod file_manager;

pub use lsm::{
    BloomFilter, BloomFilterFactory, FilterFactory, HashIndexFactory, HashIndexReader,
    IndexFactory, IndexReader, IndexWriter, KeyFilter, SSTable, SSTableBuilder, SSTableReader,
};
pub use file_manager::{SpillDirectory, SpillFile};
