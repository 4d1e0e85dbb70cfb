//! LSM file formats consumed by the lookup cache
//!
//! ## Components
//! - **SSTable**: immutable sorted run (source of every per-file index)
//! - **HashIndex**: on-disk key → value index built once per SSTable
//! - **BloomFilter**: in-memory negative lookup filter per SSTable

mod bloom;
mod hash_index;
mod sstable;

pub use bloom::{BloomFilter, BloomFilterFactory, FilterFactory, KeyFilter};
pub use hash_index::{
    HashIndexFactory, HashIndexReader, HashIndexWriter, IndexFactory, IndexReader, IndexWriter,
};
pub use sstable::{SSTable, SSTableBuilder, SSTableIterator, SSTableReader, DEFAULT_BLOCK_SIZE};
