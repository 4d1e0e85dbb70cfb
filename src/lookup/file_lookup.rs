//! Per-file lookup index: bloom filter + on-disk hash index
//!
//! Built from one linear scan of the source file. Afterwards a point lookup
//! costs one filter check and, on a positive, one bucket read.

use super::SourceReader;
use crate::config::{IndexCompression, LookupConfig};
use crate::storage::{FilterFactory, IndexFactory, IndexReader, KeyFilter, SpillFile};
use crate::types::{Entry, FileMeta, RowKind, SequenceNumber};
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Parameters of a per-file build
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOptions {
    pub bloom_filter_enabled: bool,
    pub false_positive_rate: f64,
    pub load_factor: f64,
    pub compression: IndexCompression,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self::from(&LookupConfig::default())
    }
}

impl From<&LookupConfig> for BuildOptions {
    fn from(config: &LookupConfig) -> Self {
        Self {
            bloom_filter_enabled: config.bloom_filter_enabled,
            false_positive_rate: config.bloom_false_positive_rate,
            load_factor: config.hash_load_factor,
            compression: config.index_compression,
        }
    }
}

/// What the index stores per key; the key itself is the index key
#[derive(Serialize, Deserialize)]
struct StoredValue {
    sequence: SequenceNumber,
    kind: RowKind,
    value: Vec<u8>,
}

pub(crate) fn encode_value(entry: &Entry) -> Result<Vec<u8>> {
    Ok(bincode::serialize(&StoredValue {
        sequence: entry.sequence,
        kind: entry.kind,
        value: entry.value.clone(),
    })?)
}

pub(crate) fn decode_entry(key: &[u8], bytes: &[u8]) -> Result<Entry> {
    let stored: StoredValue = bincode::deserialize(bytes)?;
    Ok(Entry {
        key: key.to_vec(),
        sequence: stored.sequence,
        kind: stored.kind,
        value: stored.value,
    })
}

/// Lookup index of one source file
///
/// Owns its spill file: dropping the `FileLookup` deletes it.
pub struct FileLookup {
    file_name: String,
    filter: Option<Box<dyn KeyFilter>>,
    // Declared before `spill`: the index is unmapped before its file is deleted
    index: Box<dyn IndexReader>,
    spill: SpillFile,
    disk_bytes: u64,
    row_count: u64,
    created_at: Instant,
    false_positives: AtomicU64,
}

impl FileLookup {
    /// Scan `meta` once through `reader` and build its index into `spill`
    ///
    /// On failure the partially written spill file is removed before the
    /// error (`StorageError::Build`) is returned.
    pub fn build(
        meta: &FileMeta,
        reader: &dyn SourceReader,
        index_factory: &dyn IndexFactory,
        filter_factory: &dyn FilterFactory,
        spill: SpillFile,
        options: &BuildOptions,
    ) -> Result<Self> {
        let started = Instant::now();

        let (filter, index, row_count) =
            Self::scan(meta, reader, index_factory, filter_factory, spill.path(), options)
                .map_err(|e| match e {
                    err @ StorageError::Build { .. } => err,
                    other => StorageError::Build {
                        file: meta.file_name.clone(),
                        reason: other.to_string(),
                    },
                })?;

        let disk_bytes = index.disk_size();
        tracing::debug!(
            file = %meta.file_name,
            rows = row_count,
            disk_bytes,
            filter_bytes = filter.as_ref().map(|f| f.byte_size()).unwrap_or(0),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "built file lookup"
        );

        Ok(Self {
            file_name: meta.file_name.clone(),
            filter,
            index,
            spill,
            disk_bytes,
            row_count,
            created_at: Instant::now(),
            false_positives: AtomicU64::new(0),
        })
    }

    fn scan(
        meta: &FileMeta,
        reader: &dyn SourceReader,
        index_factory: &dyn IndexFactory,
        filter_factory: &dyn FilterFactory,
        spill_path: &Path,
        options: &BuildOptions,
    ) -> Result<(Option<Box<dyn KeyFilter>>, Box<dyn IndexReader>, u64)> {
        let mut filter = options
            .bloom_filter_enabled
            .then(|| filter_factory.create(meta.row_count, options.false_positive_rate));
        let mut writer = index_factory.create(
            spill_path,
            meta.row_count,
            options.load_factor,
            options.compression,
        )?;

        let mut rows = 0u64;
        for entry in reader.read(meta)? {
            let entry = entry?;
            if let Some(filter) = filter.as_mut() {
                filter.insert(&entry.key);
            }
            writer.put(&entry.key, &encode_value(&entry)?)?;
            rows += 1;
        }

        let index = writer.finish()?;
        Ok((filter, index, rows))
    }

    /// Encoded value stored for `key`, if the file contains it
    ///
    /// A negative filter answer is authoritative and costs no I/O. A positive
    /// one is confirmed against the index; a miss there is a false positive.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(filter) = &self.filter {
            if !filter.may_contain(key) {
                return Ok(None);
            }
        }

        let found = self.index.get(key).map_err(|e| StorageError::Lookup {
            file: self.file_name.clone(),
            reason: e.to_string(),
        })?;

        if found.is_none() && self.filter.is_some() {
            self.false_positives.fetch_add(1, Ordering::Relaxed);
        }
        Ok(found)
    }

    /// Decoded entry for `key`
    pub fn lookup_entry(&self, key: &[u8]) -> Result<Option<Entry>> {
        match self.lookup(key)? {
            Some(bytes) => decode_entry(key, &bytes)
                .map(Some)
                .map_err(|e| StorageError::Lookup {
                    file: self.file_name.clone(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Size of the spill file, used for the cache's disk budget
    pub fn disk_bytes(&self) -> u64 {
        self.disk_bytes
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn spill_path(&self) -> &Path {
        self.spill.path()
    }

    pub fn filter_bytes(&self) -> usize {
        self.filter.as_ref().map(|f| f.byte_size()).unwrap_or(0)
    }

    /// Filter positives the index did not confirm
    pub fn false_positives(&self) -> u64 {
        self.false_positives.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for FileLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("FileLookup")
            .field("file_name", &self.file_name)
            .field("spill", &self.spill.path())
            .field("disk_bytes", &self.disk_bytes)
            .field("row_count", &self.row_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::testing::*;
    use crate::storage::{BloomFilterFactory, HashIndexFactory, SSTableReader, SpillDirectory};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Index wrapper that counts probes
    struct CountingIndex {
        inner: Box<dyn IndexReader>,
        probes: Arc<AtomicU64>,
    }

    impl IndexReader for CountingIndex {
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key)
        }
        fn disk_size(&self) -> u64 {
            self.inner.disk_size()
        }
        fn len(&self) -> u64 {
            self.inner.len()
        }
    }

    struct CountingWriter {
        inner: Box<dyn crate::storage::IndexWriter>,
        probes: Arc<AtomicU64>,
    }

    impl crate::storage::IndexWriter for CountingWriter {
        fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
            self.inner.put(key, value)
        }
        fn finish(self: Box<Self>) -> Result<Box<dyn IndexReader>> {
            Ok(Box::new(CountingIndex {
                inner: self.inner.finish()?,
                probes: self.probes,
            }))
        }
    }

    struct CountingFactory {
        probes: Arc<AtomicU64>,
    }

    impl IndexFactory for CountingFactory {
        fn create(
            &self,
            path: &Path,
            expected_rows: u64,
            load_factor: f64,
            compression: IndexCompression,
        ) -> Result<Box<dyn crate::storage::IndexWriter>> {
            Ok(Box::new(CountingWriter {
                inner: HashIndexFactory::default().create(path, expected_rows, load_factor, compression)?,
                probes: Arc::clone(&self.probes),
            }))
        }
        fn open(&self, path: &Path) -> Result<Box<dyn IndexReader>> {
            HashIndexFactory::default().open(path)
        }
    }

    /// Filter that never rules anything out
    struct AcceptAll;

    impl KeyFilter for AcceptAll {
        fn insert(&mut self, _key: &[u8]) {}
        fn may_contain(&self, _key: &[u8]) -> bool {
            true
        }
        fn byte_size(&self) -> usize {
            0
        }
    }

    struct AcceptAllFactory;

    impl FilterFactory for AcceptAllFactory {
        fn create(&self, _expected_keys: u64, _fpp: f64) -> Box<dyn KeyFilter> {
            Box::new(AcceptAll)
        }
    }

    fn setup() -> (TempDir, FileMeta, SpillDirectory) {
        let temp_dir = TempDir::new().unwrap();
        let rows: Vec<(u32, i32)> = (0..200).map(|k| (k * 2, k as i32 * 10)).collect();
        let meta = write_run(temp_dir.path(), "run-1.sst", 1, &rows);
        let spill = SpillDirectory::new(temp_dir.path().join("spill"), "lookup-").unwrap();
        (temp_dir, meta, spill)
    }

    #[test]
    fn test_lookup_present_and_absent() {
        let (temp_dir, meta, spill) = setup();
        let lookup = FileLookup::build(
            &meta,
            &SSTableReader::new(temp_dir.path()),
            &HashIndexFactory::default(),
            &BloomFilterFactory,
            spill.allocate(),
            &BuildOptions::default(),
        )
        .unwrap();

        assert_eq!(lookup.file_name(), "run-1.sst");
        assert_eq!(lookup.row_count(), 200);
        assert!(lookup.disk_bytes() > 0);
        assert_eq!(lookup.disk_bytes(), std::fs::metadata(lookup.spill_path()).unwrap().len());

        let entry = lookup.lookup_entry(&int_key(84)).unwrap().unwrap();
        assert_eq!(entry.key, int_key(84));
        assert_eq!(value_as_int(&entry), 420);
        assert_eq!(entry.sequence, 42);
        assert_eq!(entry.kind, RowKind::Insert);

        for odd in (1..400).step_by(2) {
            assert!(lookup.lookup(&int_key(odd)).unwrap().is_none());
        }
    }

    #[test]
    fn test_filter_negative_skips_index() {
        let (temp_dir, meta, spill) = setup();
        let probes = Arc::new(AtomicU64::new(0));
        let lookup = FileLookup::build(
            &meta,
            &SSTableReader::new(temp_dir.path()),
            &CountingFactory { probes: Arc::clone(&probes) },
            &BloomFilterFactory,
            spill.allocate(),
            &BuildOptions::default(),
        )
        .unwrap();

        let mut filtered = 0;
        for odd in (1..4000).step_by(2) {
            let before = probes.load(Ordering::SeqCst);
            assert!(lookup.lookup(&int_key(odd)).unwrap().is_none());
            if probes.load(Ordering::SeqCst) == before {
                filtered += 1;
            }
        }
        // At 5% fpp the vast majority of absent keys never reach the index
        assert!(filtered > 1500, "only {} of 2000 absent keys filtered", filtered);
        assert_eq!(
            probes.load(Ordering::SeqCst),
            lookup.false_positives(),
            "every index probe for an absent key is a false positive"
        );
    }

    #[test]
    fn test_false_positive_falls_through_to_none() {
        let (temp_dir, meta, spill) = setup();
        let lookup = FileLookup::build(
            &meta,
            &SSTableReader::new(temp_dir.path()),
            &HashIndexFactory::default(),
            &AcceptAllFactory,
            spill.allocate(),
            &BuildOptions::default(),
        )
        .unwrap();

        assert!(lookup.lookup(&int_key(3)).unwrap().is_none());
        assert_eq!(lookup.false_positives(), 1);
        assert!(lookup.lookup(&int_key(4)).unwrap().is_some());
    }

    #[test]
    fn test_filter_disabled() {
        let (temp_dir, meta, spill) = setup();
        let options = BuildOptions {
            bloom_filter_enabled: false,
            ..BuildOptions::default()
        };
        let lookup = FileLookup::build(
            &meta,
            &SSTableReader::new(temp_dir.path()),
            &HashIndexFactory::default(),
            &BloomFilterFactory,
            spill.allocate(),
            &options,
        )
        .unwrap();

        assert_eq!(lookup.filter_bytes(), 0);
        assert!(lookup.lookup(&int_key(10)).unwrap().is_some());
        assert!(lookup.lookup(&int_key(11)).unwrap().is_none());
        assert_eq!(lookup.false_positives(), 0);
    }

    #[test]
    fn test_drop_deletes_spill_file() {
        let (temp_dir, meta, spill) = setup();
        let lookup = FileLookup::build(
            &meta,
            &SSTableReader::new(temp_dir.path()),
            &HashIndexFactory::default(),
            &BloomFilterFactory,
            spill.allocate(),
            &BuildOptions::default(),
        )
        .unwrap();

        let path = lookup.spill_path().to_path_buf();
        assert!(path.exists());
        assert_eq!(spill.count_on_disk().unwrap(), 1);

        drop(lookup);
        assert!(!path.exists());
        assert_eq!(spill.count_on_disk().unwrap(), 0);
    }

    #[test]
    fn test_failed_build_removes_partial_file() {
        let (_temp_dir, meta, spill) = setup();
        let err = FileLookup::build(
            &meta,
            &FailingReader { good_rows: 50 },
            &HashIndexFactory::default(),
            &BloomFilterFactory,
            spill.allocate(),
            &BuildOptions::default(),
        )
        .unwrap_err();

        match err {
            StorageError::Build { file, reason } => {
                assert_eq!(file, "run-1.sst");
                assert!(reason.contains("source truncated"), "{}", reason);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(spill.count_on_disk().unwrap(), 0);
    }

    #[test]
    fn test_missing_source_is_build_failure() {
        let (temp_dir, mut meta, spill) = setup();
        meta.file_name = "does-not-exist.sst".into();
        let err = FileLookup::build(
            &meta,
            &SSTableReader::new(temp_dir.path()),
            &HashIndexFactory::default(),
            &BloomFilterFactory,
            spill.allocate(),
            &BuildOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, StorageError::Build { .. }));
        assert_eq!(spill.count_on_disk().unwrap(), 0);
    }

    #[test]
    fn test_stored_value_keeps_kind_and_sequence() {
        let entry = Entry::delete(int_key(9), crate::types::UNKNOWN_SEQUENCE);
        let decoded = decode_entry(&entry.key, &encode_value(&entry).unwrap()).unwrap();
        assert_eq!(decoded, entry);
    }
}
