//! SSTable: immutable sorted run (the source files the lookup cache indexes)
//!
//! ## File Format
//! ```text
//! [Data Block 1] [Data Block 2] ... [Data Block N]
//! [Index Block]
//! [Footer (32 bytes)]
//! ```
//!
//! Each data block is a flag byte (0 = raw, 1 = Snappy) followed by the
//! bincode-encoded entries. The index block lists `(first_key, offset, size,
//! crc32)` per data block; the footer carries its position and checksum.

use crate::lookup::{EntryIter, SourceReader};
use crate::types::{BytewiseComparator, Entry, FileMeta, KeyComparator};
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Magic number for SSTable files (ASCII "LSMT")
const SSTABLE_MAGIC: u32 = 0x4C534D54;

/// SSTable version
const SSTABLE_VERSION: u32 = 2;

const FOOTER_SIZE: usize = 32;

/// Default data block size (64KB)
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Location of one data block
#[derive(Clone, Debug, Serialize, Deserialize)]
struct BlockHandle {
    first_key: Vec<u8>,
    offset: u64,
    size: u32,
    crc: u32,
}

/// SSTable footer (stored at end of file)
#[derive(Clone, Debug)]
struct Footer {
    index_offset: u64,
    index_size: u32,
    index_crc: u32,
    num_entries: u64,
}

impl Footer {
    fn serialize(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0..4].copy_from_slice(&SSTABLE_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&SSTABLE_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.index_offset.to_le_bytes());
        buf[16..20].copy_from_slice(&self.index_size.to_le_bytes());
        buf[20..24].copy_from_slice(&self.index_crc.to_le_bytes());
        buf[24..32].copy_from_slice(&self.num_entries.to_le_bytes());
        buf
    }

    fn deserialize(data: &[u8; FOOTER_SIZE]) -> Result<Self> {
        let u32_at = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[at..at + 8]);
            u64::from_le_bytes(b)
        };

        if u32_at(0) != SSTABLE_MAGIC {
            return Err(StorageError::InvalidData("Invalid SSTable magic".into()));
        }
        let version = u32_at(4);
        if version != SSTABLE_VERSION {
            return Err(StorageError::InvalidData(format!(
                "Unsupported SSTable version {}",
                version
            )));
        }

        Ok(Self {
            index_offset: u64_at(8),
            index_size: u32_at(16),
            index_crc: u32_at(20),
            num_entries: u64_at(24),
        })
    }
}

/// SSTable builder (write-only)
///
/// Entries must be added in strictly ascending key order.
pub struct SSTableBuilder {
    /// Output file
    writer: BufWriter<File>,

    /// File path (store separately)
    path: PathBuf,

    /// Key order the run is sorted by
    comparator: Arc<dyn KeyComparator>,

    /// Current block
    current_block: Vec<Entry>,
    current_block_size: usize,
    block_size: usize,

    /// Block index being built
    index: Vec<BlockHandle>,

    /// Statistics
    num_entries: u64,
    min_key: Option<Vec<u8>>,
    max_key: Option<Vec<u8>>,

    /// Current file offset
    offset: u64,
}

impl SSTableBuilder {
    /// Create a new SSTable builder with byte-wise key order
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_options(path, DEFAULT_BLOCK_SIZE, Arc::new(BytewiseComparator))
    }

    pub fn with_options<P: AsRef<Path>>(
        path: P,
        block_size: usize,
        comparator: Arc<dyn KeyComparator>,
    ) -> Result<Self> {
        let path_buf = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path_buf)?;

        Ok(Self {
            writer: BufWriter::with_capacity(64 * 1024, file),
            path: path_buf,
            comparator,
            current_block: Vec::new(),
            current_block_size: 0,
            block_size: block_size.max(1),
            index: Vec::new(),
            num_entries: 0,
            min_key: None,
            max_key: None,
            offset: 0,
        })
    }

    /// Add an entry (must be in sorted order)
    pub fn add(&mut self, entry: Entry) -> Result<()> {
        if let Some(last) = &self.max_key {
            if self.comparator.compare(last, &entry.key) != Ordering::Less {
                return Err(StorageError::InvalidArgument(format!(
                    "keys out of order in {}: {:?} after {:?}",
                    self.path.display(),
                    entry.key,
                    last
                )));
            }
        }

        if self.min_key.is_none() {
            self.min_key = Some(entry.key.clone());
        }
        self.max_key = Some(entry.key.clone());
        self.num_entries += 1;

        self.current_block_size += entry.key.len() + entry.value.len() + 24;
        self.current_block.push(entry);

        if self.current_block_size >= self.block_size {
            self.flush_block()?;
        }

        Ok(())
    }

    /// Finish building and write footer; returns the file's metadata for `level`
    pub fn finish(mut self, level: usize) -> Result<FileMeta> {
        self.flush_block()?;

        let (min_key, max_key) = match (self.min_key.take(), self.max_key.take()) {
            (Some(min), Some(max)) => (min, max),
            _ => {
                return Err(StorageError::InvalidArgument(format!(
                    "empty SSTable {}",
                    self.path.display()
                )))
            }
        };

        // Write index
        let index_offset = self.offset;
        let index_data = bincode::serialize(&self.index)?;
        self.writer.write_all(&index_data)?;
        self.offset += index_data.len() as u64;

        let footer = Footer {
            index_offset,
            index_size: index_data.len() as u32,
            index_crc: crc32fast::hash(&index_data),
            num_entries: self.num_entries,
        };
        self.writer.write_all(&footer.serialize())?;
        self.offset += FOOTER_SIZE as u64;

        self.writer.flush()?;
        self.writer.get_mut().sync_data()?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| StorageError::InvalidArgument(format!("bad path {}", self.path.display())))?;

        Ok(FileMeta {
            file_name,
            level,
            min_key,
            max_key,
            file_size: self.offset,
            row_count: self.num_entries,
        })
    }

    fn flush_block(&mut self) -> Result<()> {
        let first_key = match self.current_block.first() {
            Some(entry) => entry.key.clone(),
            None => return Ok(()),
        };

        let block_data = encode_block(&self.current_block)?;
        let size = block_data.len() as u32;

        self.index.push(BlockHandle {
            first_key,
            offset: self.offset,
            size,
            crc: crc32fast::hash(&block_data),
        });

        self.writer.write_all(&block_data)?;
        self.offset += size as u64;

        self.current_block.clear();
        self.current_block_size = 0;
        Ok(())
    }
}

fn encode_block(entries: &[Entry]) -> Result<Vec<u8>> {
    let raw = bincode::serialize(entries)?;

    // Very small blocks: compression overhead > benefit
    if raw.len() >= 1024 {
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

fn decode_block(data: &[u8]) -> Result<Vec<Entry>> {
    let (flag, body) = data
        .split_first()
        .ok_or_else(|| StorageError::InvalidData("Empty block data".into()))?;

    match flag {
        0 => Ok(bincode::deserialize(body)?),
        1 => {
            let raw = snap::raw::Decoder::new()
                .decompress_vec(body)
                .map_err(|e| StorageError::Corruption(format!("Decompression failed: {}", e)))?;
            Ok(bincode::deserialize(&raw)?)
        }
        other => Err(StorageError::InvalidData(format!(
            "Unknown compression flag: {}",
            other
        ))),
    }
}

/// SSTable (read-only)
pub struct SSTable {
    path: PathBuf,
    index: Vec<BlockHandle>,
    num_entries: u64,
}

impl SSTable {
    /// Open an existing SSTable (reads footer and index only)
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;

        let file_size = file.metadata()?.len();
        if file_size < FOOTER_SIZE as u64 {
            return Err(StorageError::InvalidData(format!(
                "{} too small for an SSTable",
                path.display()
            )));
        }

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer_buf = [0u8; FOOTER_SIZE];
        file.read_exact(&mut footer_buf)?;
        let footer = Footer::deserialize(&footer_buf)?;

        file.seek(SeekFrom::Start(footer.index_offset))?;
        let mut index_buf = vec![0u8; footer.index_size as usize];
        file.read_exact(&mut index_buf)?;
        if crc32fast::hash(&index_buf) != footer.index_crc {
            return Err(StorageError::Corruption(format!(
                "index checksum mismatch in {}",
                path.display()
            )));
        }
        let index: Vec<BlockHandle> = bincode::deserialize(&index_buf)?;

        Ok(Self {
            path,
            index,
            num_entries: footer.num_entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    pub fn num_blocks(&self) -> usize {
        self.index.len()
    }

    /// Stream all entries in key order, one block in memory at a time
    pub fn iter(&self) -> Result<SSTableIterator> {
        Ok(SSTableIterator {
            file: BufReader::new(File::open(&self.path)?),
            path: self.path.clone(),
            index: self.index.clone(),
            next_block: 0,
            current: Vec::new().into_iter(),
            failed: false,
        })
    }
}

/// Streaming iterator: reads blocks on demand
///
/// Yields an error once and then stops.
pub struct SSTableIterator {
    file: BufReader<File>,
    path: PathBuf,
    index: Vec<BlockHandle>,
    next_block: usize,
    current: std::vec::IntoIter<Entry>,
    failed: bool,
}

impl SSTableIterator {
    fn load_next_block(&mut self) -> Result<bool> {
        let Some(handle) = self.index.get(self.next_block) else {
            return Ok(false);
        };

        self.file.seek(SeekFrom::Start(handle.offset))?;
        let mut buf = vec![0u8; handle.size as usize];
        self.file.read_exact(&mut buf)?;

        if crc32fast::hash(&buf) != handle.crc {
            return Err(StorageError::Corruption(format!(
                "block {} checksum mismatch in {}",
                self.next_block,
                self.path.display()
            )));
        }

        self.current = decode_block(&buf)?.into_iter();
        self.next_block += 1;
        Ok(true)
    }
}

impl Iterator for SSTableIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(entry) = self.current.next() {
                return Some(Ok(entry));
            }
            match self.load_next_block() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Source reader over SSTables stored in one data directory
#[derive(Clone, Debug)]
pub struct SSTableReader {
    data_dir: PathBuf,
}

impl SSTableReader {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_of(&self, meta: &FileMeta) -> PathBuf {
        self.data_dir.join(&meta.file_name)
    }
}

impl SourceReader for SSTableReader {
    fn read(&self, meta: &FileMeta) -> Result<EntryIter<'_>> {
        let table = SSTable::open(self.path_of(meta))?;
        Ok(Box::new(table.iter()?))
    }
}
