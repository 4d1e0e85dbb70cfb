//! Point lookups across all levels through the per-file index cache

use super::{CacheOptions, CacheStats, LevelSet, LookupFileCache, SourceReader};
use crate::cache::PageCache;
use crate::config::LookupConfig;
use crate::storage::{BloomFilterFactory, FilterFactory, HashIndexFactory, IndexFactory, SpillDirectory};
use crate::types::Entry;
use crate::{Result, StorageError};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A lookup hit and the level of the run that answered it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelEntry {
    pub level: usize,
    pub entry: Entry,
}

/// Point lookup over a leveled set of sorted runs
///
/// Each run gets a lookup index (bloom filter + on-disk hash index) built on
/// first use and cached under a disk budget. The first run containing the
/// key answers, level 0 newest first, then deeper levels in order. A delete
/// entry is a hit like any other.
///
/// # Example
/// ```ignore
/// let levels = LevelSet::from_files(Arc::new(BytewiseComparator), files, 4)?;
/// let lookup = LookupLevels::open(levels, "/tmp/lookup", Arc::new(SSTableReader::new(data_dir)), LookupConfig::default())?;
/// if let Some(hit) = lookup.lookup(b"key", 0)? {
///     println!("level {}: {:?}", hit.level, hit.entry.kind);
/// }
/// lookup.close();
/// ```
pub struct LookupLevels {
    levels: RwLock<Arc<LevelSet>>,
    cache: LookupFileCache,
    page_cache: Arc<PageCache>,
    closed: AtomicBool,
}

impl LookupLevels {
    /// Open with the default hash index and bloom filter
    pub fn open<P: AsRef<Path>>(
        levels: LevelSet,
        work_dir: P,
        reader: Arc<dyn SourceReader>,
        config: LookupConfig,
    ) -> Result<Self> {
        Self::builder(levels, work_dir, reader).config(config).build()
    }

    pub fn builder<P: AsRef<Path>>(
        levels: LevelSet,
        work_dir: P,
        reader: Arc<dyn SourceReader>,
    ) -> LookupLevelsBuilder {
        LookupLevelsBuilder {
            levels,
            work_dir: work_dir.as_ref().to_path_buf(),
            reader,
            config: LookupConfig::default(),
            index_factory: None,
            filter_factory: None,
            page_cache: None,
        }
    }

    /// Entry for `key` from the first run that holds it, probing levels >= `start_level`
    pub fn lookup(&self, key: &[u8], start_level: usize) -> Result<Option<LevelEntry>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }

        let levels = self.levels();
        for (level, meta) in levels.files_to_probe(key, start_level) {
            let file = self.cache.get(meta)?;
            if let Some(entry) = file.lookup_entry(key)? {
                tracing::trace!(file = %meta.file_name, level, "lookup hit");
                return Ok(Some(LevelEntry { level, entry }));
            }
        }
        Ok(None)
    }

    /// Current level view
    pub fn levels(&self) -> Arc<LevelSet> {
        self.levels.read().clone()
    }

    /// Swap in a new level view
    ///
    /// Lookups already running finish against the old view. Cached indexes
    /// of runs missing from `new_levels` are dropped.
    pub fn update_levels(&self, new_levels: LevelSet) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }

        let new_levels = Arc::new(new_levels);
        let old = std::mem::replace(&mut *self.levels.write(), Arc::clone(&new_levels));

        let kept: HashSet<&str> = new_levels.files().map(|f| f.file_name.as_str()).collect();
        let mut dropped = 0;
        for file in old.files().filter(|f| !kept.contains(f.file_name.as_str())) {
            if self.cache.invalidate(&file.file_name) {
                dropped += 1;
            }
        }

        tracing::debug!(
            files = new_levels.num_files(),
            dropped_indexes = dropped,
            "updated level set"
        );
        Ok(())
    }

    /// Number of resident per-file indexes
    pub fn cached_file_count(&self) -> usize {
        self.cache.estimated_size()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn file_cache(&self) -> &LookupFileCache {
        &self.cache
    }

    pub fn page_cache(&self) -> &Arc<PageCache> {
        &self.page_cache
    }

    /// Release every cached index; later lookups fail with `Closed`
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cache.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for LookupLevels {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("LookupLevels")
            .field("levels", &*self.levels.read())
            .field("cache", &self.cache)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Builder for `LookupLevels` with injectable collaborators
pub struct LookupLevelsBuilder {
    levels: LevelSet,
    work_dir: PathBuf,
    reader: Arc<dyn SourceReader>,
    config: LookupConfig,
    index_factory: Option<Arc<dyn IndexFactory>>,
    filter_factory: Option<Arc<dyn FilterFactory>>,
    page_cache: Option<Arc<PageCache>>,
}

impl LookupLevelsBuilder {
    pub fn config(mut self, config: LookupConfig) -> Self {
        self.config = config;
        self
    }

    pub fn index_factory(mut self, factory: Arc<dyn IndexFactory>) -> Self {
        self.index_factory = Some(factory);
        self
    }

    pub fn filter_factory(mut self, factory: Arc<dyn FilterFactory>) -> Self {
        self.filter_factory = Some(factory);
        self
    }

    /// Share a page cache with other `LookupLevels` instances
    pub fn page_cache(mut self, page_cache: Arc<PageCache>) -> Self {
        self.page_cache = Some(page_cache);
        self
    }

    pub fn build(self) -> Result<LookupLevels> {
        self.config.validate()?;

        let config = self.config;
        let page_cache = self
            .page_cache
            .unwrap_or_else(|| Arc::new(PageCache::new(config.page_cache_bytes)));
        let index_factory: Arc<dyn IndexFactory> = match self.index_factory {
            Some(factory) => factory,
            None => Arc::new(
                HashIndexFactory::new(config.bucket_capacity).with_page_cache(Arc::clone(&page_cache)),
            ),
        };
        let filter_factory: Arc<dyn FilterFactory> = match self.filter_factory {
            Some(factory) => factory,
            None => Arc::new(BloomFilterFactory),
        };
        let spill_dir = SpillDirectory::new(&self.work_dir, &config.spill_file_prefix)?;

        tracing::debug!(
            work_dir = %self.work_dir.display(),
            files = self.levels.num_files(),
            levels = self.levels.num_levels(),
            max_disk_bytes = config.max_disk_size_bytes,
            "opened lookup levels"
        );

        let cache = LookupFileCache::new(
            CacheOptions::from(&config),
            spill_dir,
            self.reader,
            index_factory,
            filter_factory,
        );

        Ok(LookupLevels {
            levels: RwLock::new(Arc::new(self.levels)),
            cache,
            page_cache,
            closed: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::testing::*;
    use crate::config::IndexCompression;
    use crate::storage::{IndexReader, IndexWriter, SSTableReader};
    use crate::types::{BytewiseComparator, FileMeta, RowKind};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Index whose reads fail once built
    struct BrokenIndex {
        inner: Box<dyn IndexReader>,
    }

    impl IndexReader for BrokenIndex {
        fn get(&self, _key: &[u8]) -> Result<Option<Vec<u8>>> {
            Err(StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk gone")))
        }
        fn disk_size(&self) -> u64 {
            self.inner.disk_size()
        }
        fn len(&self) -> u64 {
            self.inner.len()
        }
    }

    struct BrokenWriter {
        inner: Box<dyn IndexWriter>,
    }

    impl IndexWriter for BrokenWriter {
        fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
            self.inner.put(key, value)
        }
        fn finish(self: Box<Self>) -> Result<Box<dyn IndexReader>> {
            Ok(Box::new(BrokenIndex {
                inner: self.inner.finish()?,
            }))
        }
    }

    struct BrokenIndexFactory;

    impl IndexFactory for BrokenIndexFactory {
        fn create(
            &self,
            path: &Path,
            expected_rows: u64,
            load_factor: f64,
            compression: IndexCompression,
        ) -> Result<Box<dyn IndexWriter>> {
            Ok(Box::new(BrokenWriter {
                inner: HashIndexFactory::default().create(path, expected_rows, load_factor, compression)?,
            }))
        }
        fn open(&self, path: &Path) -> Result<Box<dyn IndexReader>> {
            HashIndexFactory::default().open(path)
        }
    }

    fn comparator() -> Arc<dyn crate::types::KeyComparator> {
        Arc::new(BytewiseComparator)
    }

    fn open(data_dir: &Path, levels: LevelSet, config: LookupConfig) -> LookupLevels {
        LookupLevels::open(
            levels,
            data_dir.join("work"),
            Arc::new(SSTableReader::new(data_dir)),
            config,
        )
        .unwrap()
    }

    fn value_at(lookup: &LookupLevels, key: u32, start_level: usize) -> Option<i32> {
        lookup
            .lookup(&int_key(key), start_level)
            .unwrap()
            .map(|hit| value_as_int(&hit.entry))
    }

    /// Answering level and value
    fn hit_at(lookup: &LookupLevels, key: u32, start_level: usize) -> Option<(usize, i32)> {
        lookup
            .lookup(&int_key(key), start_level)
            .unwrap()
            .map(|hit| (hit.level, value_as_int(&hit.entry)))
    }

    #[test]
    fn test_lower_level_wins() {
        let temp_dir = TempDir::new().unwrap();
        let l1 = write_run(temp_dir.path(), "l1.sst", 1, &[(1, 11), (3, 33), (5, 5)]);
        let l2 = write_run(temp_dir.path(), "l2.sst", 2, &[(2, 22), (5, 55)]);
        let levels = LevelSet::from_files(comparator(), vec![l1, l2], 3).unwrap();
        let lookup = open(temp_dir.path(), levels, LookupConfig::default());

        assert_eq!(hit_at(&lookup, 1, 1), Some((1, 11)));
        assert_eq!(hit_at(&lookup, 2, 1), Some((2, 22)));
        assert_eq!(hit_at(&lookup, 5, 1), Some((1, 5)));
        assert_eq!(value_at(&lookup, 4, 1), None);

        // Starting below level 1 skips it
        assert_eq!(hit_at(&lookup, 5, 2), Some((2, 55)));
        assert_eq!(value_at(&lookup, 1, 2), None);
    }

    #[test]
    fn test_level0_shadows_and_falls_through_after_removal() {
        let temp_dir = TempDir::new().unwrap();
        let l0 = write_run(temp_dir.path(), "l0.sst", 0, &[(1, 0)]);
        let l1 = write_run(temp_dir.path(), "l1.sst", 1, &[(1, 11)]);
        let levels = LevelSet::from_files(comparator(), vec![l0, l1], 2).unwrap();
        let lookup = open(temp_dir.path(), levels, LookupConfig::default());

        assert_eq!(hit_at(&lookup, 1, 0), Some((0, 0)));
        assert_eq!(lookup.cached_file_count(), 1);

        let without_l0 = lookup.levels().without_file("l0.sst");
        lookup.update_levels(without_l0).unwrap();
        assert!(!lookup.file_cache().contains("l0.sst"));

        assert_eq!(hit_at(&lookup, 1, 0), Some((1, 11)));
        assert_eq!(lookup.cached_file_count(), 1);
        assert_eq!(lookup.file_cache().spill_files_on_disk().unwrap(), 1);
    }

    #[test]
    fn test_disk_budget_bounds_cached_files() {
        let temp_dir = TempDir::new().unwrap();
        let files: Vec<FileMeta> = (0..10u32)
            .map(|i| {
                let rows: Vec<(u32, i32)> = (i * 100..i * 100 + 100).map(|k| (k, k as i32)).collect();
                write_run(temp_dir.path(), &format!("run-{}.sst", i), 1, &rows)
            })
            .collect();

        // Measure one index, then budget for roughly three and a half
        let one = {
            let levels = LevelSet::from_files(comparator(), vec![files[0].clone()], 2).unwrap();
            let sizing = LookupLevels::open(
                levels,
                temp_dir.path().join("sizing"),
                Arc::new(SSTableReader::new(temp_dir.path())),
                LookupConfig::default(),
            )
            .unwrap();
            sizing.lookup(&int_key(0), 0).unwrap();
            let size = sizing.file_cache().total_disk_bytes();
            sizing.close();
            size
        };
        assert!(one > 0);

        let config = LookupConfig::default().with_max_disk_size(one * 7 / 2);
        let levels = LevelSet::from_files(comparator(), files, 2).unwrap();
        let lookup = open(temp_dir.path(), levels, config);

        for key in 0..1000u32 {
            assert_eq!(value_at(&lookup, key, 0), Some(key as i32));
        }

        let count = lookup.cached_file_count();
        assert!(count < 10, "{} indexes resident", count);
        assert!(count > 0);
        assert_eq!(count, lookup.file_cache().spill_files_on_disk().unwrap());
        assert!(lookup.file_cache().total_disk_bytes() <= lookup.file_cache().max_disk_bytes());
        assert!(lookup.stats().evictions > 0);
    }

    #[test]
    fn test_absent_keys() {
        let temp_dir = TempDir::new().unwrap();
        let l0 = write_run(temp_dir.path(), "l0.sst", 0, &[(10, 1), (20, 2)]);
        let l1 = write_run(temp_dir.path(), "l1.sst", 1, &[(30, 3), (40, 4)]);
        let levels = LevelSet::from_files(comparator(), vec![l0, l1], 2).unwrap();
        let lookup = open(temp_dir.path(), levels, LookupConfig::default());

        // Outside every range: no index is even built
        assert_eq!(value_at(&lookup, 5, 0), None);
        assert_eq!(value_at(&lookup, 99, 0), None);
        assert_eq!(lookup.cached_file_count(), 0);

        // Inside ranges but absent
        assert_eq!(value_at(&lookup, 15, 0), None);
        assert_eq!(value_at(&lookup, 35, 0), None);
    }

    #[test]
    fn test_newest_level0_file_wins() {
        let temp_dir = TempDir::new().unwrap();
        let older = write_run(temp_dir.path(), "older.sst", 0, &[(7, 1), (8, 1)]);
        let newer = write_run(temp_dir.path(), "newer.sst", 0, &[(7, 2)]);
        let levels = LevelSet::new(comparator(), vec![older], vec![]).unwrap();
        let lookup = open(temp_dir.path(), levels, LookupConfig::default());
        assert_eq!(value_at(&lookup, 7, 0), Some(1));

        let levels = lookup.levels().with_level0_file(newer).unwrap();
        lookup.update_levels(levels).unwrap();
        assert_eq!(value_at(&lookup, 7, 0), Some(2));
        assert_eq!(value_at(&lookup, 8, 0), Some(1));
    }

    #[test]
    fn test_delete_entry_is_a_hit() {
        let temp_dir = TempDir::new().unwrap();
        let l0_path = temp_dir.path().join("l0.sst");
        let mut builder = crate::storage::SSTableBuilder::new(&l0_path).unwrap();
        builder.add(Entry::delete(int_key(3), 9)).unwrap();
        let l0 = builder.finish(0).unwrap();
        let l1 = write_run(temp_dir.path(), "l1.sst", 1, &[(3, 33)]);

        let levels = LevelSet::from_files(comparator(), vec![l0, l1], 2).unwrap();
        let lookup = open(temp_dir.path(), levels, LookupConfig::default());

        let hit = lookup.lookup(&int_key(3), 0).unwrap().unwrap();
        assert_eq!(hit.level, 0);
        assert_eq!(hit.entry.kind, RowKind::Delete);
        assert_eq!(hit.entry.sequence, 9);
        assert_eq!(value_at(&lookup, 3, 1), Some(33));
    }

    #[test]
    fn test_index_read_failure_surfaces_as_lookup_error() {
        let temp_dir = TempDir::new().unwrap();
        let l1 = write_run(temp_dir.path(), "l1.sst", 1, &[(1, 11), (2, 22)]);
        let lookup = LookupLevels::builder(
            LevelSet::from_files(comparator(), vec![l1], 2).unwrap(),
            temp_dir.path().join("work"),
            Arc::new(SSTableReader::new(temp_dir.path())),
        )
        .index_factory(Arc::new(BrokenIndexFactory))
        .build()
        .unwrap();

        for _ in 0..2 {
            match lookup.lookup(&int_key(1), 0) {
                Err(StorageError::Lookup { file, reason }) => {
                    assert_eq!(file, "l1.sst");
                    assert!(reason.contains("disk gone"), "{}", reason);
                }
                other => panic!("expected lookup error, got {:?}", other),
            }
            // The built index stays cached; a read error is not a build error
            assert_eq!(lookup.cached_file_count(), 1);
            assert!(lookup.file_cache().contains("l1.sst"));
        }

        let stats = lookup.stats();
        assert_eq!(stats.builds, 1);
        assert_eq!(stats.build_failures, 0);
        assert_eq!(stats.evictions, 0);
    }

    #[test]
    fn test_file_dropped_while_its_index_builds() {
        let temp_dir = TempDir::new().unwrap();
        let l0 = write_run(temp_dir.path(), "l0.sst", 0, &[(1, 0)]);
        let l1 = write_run(temp_dir.path(), "l1.sst", 1, &[(1, 11)]);
        let reader = Arc::new(CountingReader::with_delay(temp_dir.path(), Duration::from_millis(300)));
        let lookup = LookupLevels::open(
            LevelSet::from_files(comparator(), vec![l0, l1], 2).unwrap(),
            temp_dir.path().join("work"),
            reader,
            LookupConfig::default(),
        )
        .unwrap();

        let hit = std::thread::scope(|s| {
            let running = s.spawn(|| hit_at(&lookup, 1, 0));
            std::thread::sleep(Duration::from_millis(100));
            lookup.update_levels(lookup.levels().without_file("l0.sst")).unwrap();
            running.join().unwrap()
        });

        // The lookup in flight answers from the view it started with
        assert_eq!(hit, Some((0, 0)));
        assert!(!lookup.file_cache().contains("l0.sst"));
        assert_eq!(lookup.cached_file_count(), 0);
        assert_eq!(lookup.file_cache().spill_files_on_disk().unwrap(), 0);

        assert_eq!(hit_at(&lookup, 1, 0), Some((1, 11)));
        assert_eq!(lookup.cached_file_count(), 1);
    }

    #[test]
    fn test_repeated_lookups_are_stable() {
        let temp_dir = TempDir::new().unwrap();
        let l1 = write_run(temp_dir.path(), "l1.sst", 1, &[(1, 11), (2, 22)]);
        let levels = LevelSet::from_files(comparator(), vec![l1], 2).unwrap();
        let lookup = open(temp_dir.path(), levels, LookupConfig::default());

        let first = lookup.lookup(&int_key(2), 0).unwrap();
        for _ in 0..10 {
            assert_eq!(lookup.lookup(&int_key(2), 0).unwrap(), first);
        }
        assert_eq!(lookup.stats().builds, 1);
        assert_eq!(lookup.cached_file_count(), 1);
    }

    #[test]
    fn test_close_removes_spill_files() {
        let temp_dir = TempDir::new().unwrap();
        let l0 = write_run(temp_dir.path(), "l0.sst", 0, &[(1, 1)]);
        let l1 = write_run(temp_dir.path(), "l1.sst", 1, &[(1, 11), (2, 22)]);
        let levels = LevelSet::from_files(comparator(), vec![l0, l1], 2).unwrap();
        let lookup = open(temp_dir.path(), levels, LookupConfig::default());

        assert_eq!(value_at(&lookup, 2, 0), Some(22));
        assert_eq!(value_at(&lookup, 1, 0), Some(1));
        assert_eq!(lookup.file_cache().spill_files_on_disk().unwrap(), 2);

        lookup.close();
        lookup.close();
        assert_eq!(lookup.cached_file_count(), 0);
        assert_eq!(lookup.file_cache().spill_files_on_disk().unwrap(), 0);
        assert!(matches!(lookup.lookup(&int_key(1), 0), Err(StorageError::Closed)));
        assert!(lookup.update_levels(LevelSet::empty(comparator(), 2)).is_err());
    }

    #[test]
    fn test_shared_page_cache() {
        let temp_dir = TempDir::new().unwrap();
        let l1 = write_run(temp_dir.path(), "l1.sst", 1, &[(1, 11), (2, 22)]);
        let page_cache = Arc::new(PageCache::new(1024 * 1024));

        let lookup = LookupLevels::builder(
            LevelSet::from_files(comparator(), vec![l1], 2).unwrap(),
            temp_dir.path().join("work"),
            Arc::new(SSTableReader::new(temp_dir.path())),
        )
        .page_cache(Arc::clone(&page_cache))
        .build()
        .unwrap();

        assert_eq!(value_at(&lookup, 1, 0), Some(11));
        assert_eq!(value_at(&lookup, 1, 0), Some(11));
        let stats = page_cache.stats();
        assert!(stats.pages > 0);
        assert!(stats.hits > 0);

        // Dropping the index releases its pages
        lookup.close();
        assert_eq!(page_cache.stats().pages, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config = LookupConfig {
            bloom_false_positive_rate: 2.0,
            ..LookupConfig::default()
        };
        let result = LookupLevels::open(
            LevelSet::empty(comparator(), 2),
            temp_dir.path().join("work"),
            Arc::new(SSTableReader::new(temp_dir.path())),
            config,
        );
        assert!(matches!(result, Err(StorageError::Config(_))));
    }

    #[test]
    fn test_concurrent_lookups() {
        let temp_dir = TempDir::new().unwrap();
        let files: Vec<FileMeta> = (0..4u32)
            .map(|i| {
                let rows: Vec<(u32, i32)> = (i * 50..i * 50 + 50).map(|k| (k, k as i32 * 2)).collect();
                write_run(temp_dir.path(), &format!("run-{}.sst", i), 1, &rows)
            })
            .collect();
        let reader = Arc::new(CountingReader::new(temp_dir.path()));
        let lookup = LookupLevels::open(
            LevelSet::from_files(comparator(), files, 2).unwrap(),
            temp_dir.path().join("work"),
            reader.clone(),
            LookupConfig::default(),
        )
        .unwrap();

        std::thread::scope(|s| {
            for t in 0..8u32 {
                let lookup = &lookup;
                s.spawn(move || {
                    for i in 0..200u32 {
                        let key = (i * 7 + t) % 200;
                        assert_eq!(value_at(lookup, key, 0), Some(key as i32 * 2));
                    }
                });
            }
        });

        // One build per file no matter how many threads raced for it
        assert_eq!(reader.total_reads(), 4);
        assert_eq!(lookup.cached_file_count(), 4);
    }
}
