//! On-disk hash index: key → value store built once per source file
//!
//! ## File Format
//! ```text
//! [Bucket 0] [Bucket 1] ... [Bucket N-1]
//! [Directory: N × (offset u64, len u32, crc32 u32)]
//! [Footer (32 bytes)]
//! ```
//!
//! A key lives in bucket `crc32(key) % N`. Each non-empty bucket is a flag
//! byte (0 = raw, 1 = Snappy) followed by the bincode-encoded
//! `(key, value)` list. Readers memory-map the file and decode buckets on
//! demand, through the shared page cache when one is configured.
//!
//! Buckets are assembled in memory during the build and written on
//! `finish()`; the file is complete only once `finish()` returns.

use crate::cache::{OwnerId, Page, PageCache, PageKey};
use crate::config::IndexCompression;
use crate::{Result, StorageError};
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Magic number for hash index files (ASCII "LKIX")
const HASH_INDEX_MAGIC: u32 = 0x4C4B4958;

const HASH_INDEX_VERSION: u32 = 1;

const FOOTER_SIZE: usize = 32;
const DIR_ENTRY_SIZE: usize = 16;

/// Buckets smaller than this are stored raw
const MIN_COMPRESS_SIZE: usize = 256;

/// Writer side of an index under construction
pub trait IndexWriter: Send {
    /// Insert or overwrite `key`
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Persist the index and reopen it for reads
    fn finish(self: Box<Self>) -> Result<Box<dyn IndexReader>>;
}

/// Read side of a finished index
pub trait IndexReader: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Size of the backing file in bytes
    fn disk_size(&self) -> u64;

    /// Number of entries written
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Creates and reopens on-disk indexes
pub trait IndexFactory: Send + Sync {
    fn create(
        &self,
        path: &Path,
        expected_rows: u64,
        load_factor: f64,
        compression: IndexCompression,
    ) -> Result<Box<dyn IndexWriter>>;

    fn open(&self, path: &Path) -> Result<Box<dyn IndexReader>>;
}

/// Factory for bucketed hash index files
#[derive(Clone, Debug)]
pub struct HashIndexFactory {
    /// Target entries per bucket at load factor 1.0
    bucket_capacity: usize,

    /// Shared cache for decoded buckets
    page_cache: Option<Arc<PageCache>>,
}

impl HashIndexFactory {
    pub fn new(bucket_capacity: usize) -> Self {
        Self {
            bucket_capacity: bucket_capacity.max(1),
            page_cache: None,
        }
    }

    pub fn with_page_cache(mut self, page_cache: Arc<PageCache>) -> Self {
        self.page_cache = Some(page_cache);
        self
    }

    fn num_buckets(&self, expected_rows: u64, load_factor: f64) -> u32 {
        let per_bucket = (self.bucket_capacity as f64 * load_factor).max(1.0);
        let buckets = (expected_rows as f64 / per_bucket).ceil();
        buckets.clamp(1.0, u32::MAX as f64) as u32
    }
}

impl Default for HashIndexFactory {
    fn default() -> Self {
        Self::new(16)
    }
}

impl IndexFactory for HashIndexFactory {
    fn create(
        &self,
        path: &Path,
        expected_rows: u64,
        load_factor: f64,
        compression: IndexCompression,
    ) -> Result<Box<dyn IndexWriter>> {
        if !(load_factor > 0.0 && load_factor <= 1.0) {
            return Err(StorageError::InvalidArgument(format!(
                "load factor must be in (0, 1], got {}",
                load_factor
            )));
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let num_buckets = self.num_buckets(expected_rows, load_factor);
        Ok(Box::new(HashIndexWriter {
            path: path.to_path_buf(),
            writer: BufWriter::with_capacity(64 * 1024, file),
            buckets: vec![Vec::new(); num_buckets as usize],
            compression,
            num_entries: 0,
            page_cache: self.page_cache.clone(),
        }))
    }

    fn open(&self, path: &Path) -> Result<Box<dyn IndexReader>> {
        Ok(Box::new(HashIndexReader::open(path, self.page_cache.clone())?))
    }
}

fn bucket_of(key: &[u8], num_buckets: u32) -> u32 {
    crc32fast::hash(key) % num_buckets
}

/// Hash index builder
pub struct HashIndexWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    buckets: Vec<Vec<(Vec<u8>, Vec<u8>)>>,
    compression: IndexCompression,
    num_entries: u64,
    page_cache: Option<Arc<PageCache>>,
}

impl HashIndexWriter {
    fn encode_bucket(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<Vec<u8>> {
        let raw = bincode::serialize(entries)?;

        if self.compression == IndexCompression::Snappy && raw.len() >= MIN_COMPRESS_SIZE {
            let compressed = snap::raw::Encoder::new()
                .compress_vec(&raw)
                .map_err(|e| StorageError::Serialization(format!("Compression failed: {}", e)))?;
            if compressed.len() < raw.len() {
                let mut out = Vec::with_capacity(compressed.len() + 1);
                out.push(1u8);
                out.extend_from_slice(&compressed);
                return Ok(out);
            }
        }

        let mut out = Vec::with_capacity(raw.len() + 1);
        out.push(0u8);
        out.extend_from_slice(&raw);
        Ok(out)
    }
}

impl IndexWriter for HashIndexWriter {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let bucket = bucket_of(key, self.buckets.len() as u32) as usize;
        let entries = &mut self.buckets[bucket];

        match entries.iter_mut().find(|(k, _)| k.as_slice() == key) {
            Some(existing) => existing.1 = value.to_vec(),
            None => {
                entries.push((key.to_vec(), value.to_vec()));
                self.num_entries += 1;
            }
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<Box<dyn IndexReader>> {
        let buckets = std::mem::take(&mut self.buckets);
        let num_buckets = buckets.len() as u32;
        let mut directory = Vec::with_capacity(buckets.len() * DIR_ENTRY_SIZE);
        let mut offset = 0u64;

        for entries in &buckets {
            if entries.is_empty() {
                directory.extend_from_slice(&offset.to_le_bytes());
                directory.extend_from_slice(&0u32.to_le_bytes());
                directory.extend_from_slice(&0u32.to_le_bytes());
                continue;
            }

            let data = self.encode_bucket(entries)?;
            self.writer.write_all(&data)?;

            directory.extend_from_slice(&offset.to_le_bytes());
            directory.extend_from_slice(&(data.len() as u32).to_le_bytes());
            directory.extend_from_slice(&crc32fast::hash(&data).to_le_bytes());
            offset += data.len() as u64;
        }
        drop(buckets);

        let directory_offset = offset;
        self.writer.write_all(&directory)?;

        let compression_flag: u32 = match self.compression {
            IndexCompression::None => 0,
            IndexCompression::Snappy => 1,
        };
        let mut footer = [0u8; FOOTER_SIZE];
        footer[0..4].copy_from_slice(&HASH_INDEX_MAGIC.to_le_bytes());
        footer[4..8].copy_from_slice(&HASH_INDEX_VERSION.to_le_bytes());
        footer[8..12].copy_from_slice(&num_buckets.to_le_bytes());
        footer[12..16].copy_from_slice(&compression_flag.to_le_bytes());
        footer[16..24].copy_from_slice(&self.num_entries.to_le_bytes());
        footer[24..32].copy_from_slice(&directory_offset.to_le_bytes());
        self.writer.write_all(&footer)?;

        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;

        Ok(Box::new(HashIndexReader::open(&self.path, self.page_cache.take())?))
    }
}

/// Memory-mapped hash index reader
pub struct HashIndexReader {
    path: PathBuf,
    mmap: Mmap,
    num_buckets: u32,
    num_entries: u64,
    directory_offset: usize,
    owner: OwnerId,
    page_cache: Option<Arc<PageCache>>,
}

impl HashIndexReader {
    pub fn open<P: AsRef<Path>>(path: P, page_cache: Option<Arc<PageCache>>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let file_len = file.metadata()?.len() as usize;
        if file_len < FOOTER_SIZE {
            return Err(StorageError::InvalidData(format!(
                "{} too small for a hash index",
                path.display()
            )));
        }

        // Safety: spill files are written once and never modified afterwards
        let mmap = unsafe { Mmap::map(&file)? };

        let footer = &mmap[file_len - FOOTER_SIZE..];
        let u32_at = |at: usize| {
            u32::from_le_bytes([footer[at], footer[at + 1], footer[at + 2], footer[at + 3]])
        };
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&footer[at..at + 8]);
            u64::from_le_bytes(b)
        };

        if u32_at(0) != HASH_INDEX_MAGIC {
            return Err(StorageError::InvalidData(format!(
                "Invalid hash index magic in {}",
                path.display()
            )));
        }
        if u32_at(4) != HASH_INDEX_VERSION {
            return Err(StorageError::InvalidData(format!(
                "Unsupported hash index version {}",
                u32_at(4)
            )));
        }

        let num_buckets = u32_at(8);
        let num_entries = u64_at(16);
        let directory_offset = u64_at(24) as usize;
        let directory_end = directory_offset + num_buckets as usize * DIR_ENTRY_SIZE;
        if num_buckets == 0 || directory_end != file_len - FOOTER_SIZE {
            return Err(StorageError::Corruption(format!(
                "hash index directory out of bounds in {}",
                path.display()
            )));
        }

        let owner = page_cache.as_ref().map(|pc| pc.register_owner()).unwrap_or(0);

        Ok(Self {
            path,
            mmap,
            num_buckets,
            num_entries,
            directory_offset,
            owner,
            page_cache,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_bucket(&self, bucket: u32) -> Result<Page> {
        let at = self.directory_offset + bucket as usize * DIR_ENTRY_SIZE;
        let dir = &self.mmap[at..at + DIR_ENTRY_SIZE];
        let mut b = [0u8; 8];
        b.copy_from_slice(&dir[0..8]);
        let offset = u64::from_le_bytes(b) as usize;
        let len = u32::from_le_bytes([dir[8], dir[9], dir[10], dir[11]]) as usize;
        let crc = u32::from_le_bytes([dir[12], dir[13], dir[14], dir[15]]);

        if len == 0 {
            return Ok(Page::default());
        }
        if offset + len > self.directory_offset {
            return Err(StorageError::Corruption(format!(
                "bucket {} out of bounds in {}",
                bucket,
                self.path.display()
            )));
        }

        let data = &self.mmap[offset..offset + len];
        if crc32fast::hash(data) != crc {
            return Err(StorageError::Corruption(format!(
                "bucket {} checksum mismatch in {}",
                bucket,
                self.path.display()
            )));
        }

        let entries: Vec<(Vec<u8>, Vec<u8>)> = match data[0] {
            0 => bincode::deserialize(&data[1..])?,
            1 => {
                let raw = snap::raw::Decoder::new()
                    .decompress_vec(&data[1..])
                    .map_err(|e| StorageError::Corruption(format!("Decompression failed: {}", e)))?;
                bincode::deserialize(&raw)?
            }
            flag => {
                return Err(StorageError::Corruption(format!(
                    "Unknown compression flag: {}",
                    flag
                )))
            }
        };

        Ok(Page::new(entries))
    }
}

impl IndexReader for HashIndexReader {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let bucket = bucket_of(key, self.num_buckets);

        match &self.page_cache {
            Some(cache) => {
                let page = cache.get_or_load(
                    PageKey {
                        owner: self.owner,
                        page: bucket,
                    },
                    || self.load_bucket(bucket),
                )?;
                Ok(page.get(key).map(|v| v.to_vec()))
            }
            None => Ok(self.load_bucket(bucket)?.get(key).map(|v| v.to_vec())),
        }
    }

    fn disk_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn len(&self) -> u64 {
        self.num_entries
    }
}

impl Drop for HashIndexReader {
    fn drop(&mut self) {
        if let Some(cache) = &self.page_cache {
            cache.release_owner(self.owner);
        }
    }
}
