//! Disk-budgeted cache of per-file lookup indexes
//!
//! Byte-weighted LRU over `FileLookup`s keyed by file name:
//! - builds are single-flight per file and run outside the cache lock
//! - entries idle longer than the TTL are dropped on the next access
//! - callers hold `Arc<FileLookup>` leases; an evicted index keeps its spill
//!   file until the last lease is released

use super::{BuildOptions, FileLookup, SourceReader};
use crate::config::LookupConfig;
use crate::storage::{FilterFactory, IndexFactory, SpillDirectory};
use crate::types::FileMeta;
use crate::{Result, StorageError};
use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cache limits and per-file build parameters
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Upper bound on the summed spill file sizes of resident entries
    pub max_disk_bytes: u64,
    /// Idle time after which an entry is dropped
    pub ttl: Duration,
    pub build: BuildOptions,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self::from(&LookupConfig::default())
    }
}

impl From<&LookupConfig> for CacheOptions {
    fn from(config: &LookupConfig) -> Self {
        Self {
            max_disk_bytes: config.max_disk_size_bytes,
            ttl: config.cache_ttl(),
            build: BuildOptions::from(config),
        }
    }
}

/// Cache statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub resident_files: usize,
    pub resident_bytes: u64,
    pub max_disk_bytes: u64,
    /// Requests served by a resident entry or an in-flight build
    pub hits: u64,
    /// Requests that started a build
    pub misses: u64,
    pub builds: u64,
    pub build_failures: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "files={} bytes={}/{} hits={} misses={} builds={} failures={} evictions={} expirations={}",
            self.resident_files,
            self.resident_bytes,
            self.max_disk_bytes,
            self.hits,
            self.misses,
            self.builds,
            self.build_failures,
            self.evictions,
            self.expirations
        )
    }
}

struct Resident {
    lookup: Arc<FileLookup>,
    last_accessed: Instant,
}

struct CacheState {
    /// Least recently used first
    resident: LruCache<String, Resident>,
    total_bytes: u64,
    /// In-flight builds by file name
    building: HashMap<String, Arc<BuildSlot>>,
    closed: bool,
}

#[derive(Clone)]
enum BuildOutcome {
    Ready(Arc<FileLookup>),
    Failed(String),
    Closed,
}

/// Rendezvous between the builder of a file and its waiters
struct BuildSlot {
    outcome: Mutex<Option<BuildOutcome>>,
    ready: Condvar,
    /// Set under the cache lock when the file is invalidated mid-build;
    /// the result is then handed out but never made resident
    invalidated: AtomicBool,
}

impl BuildSlot {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            ready: Condvar::new(),
            invalidated: AtomicBool::new(false),
        }
    }

    fn wait(&self) -> BuildOutcome {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(done) = outcome.as_ref() {
                return done.clone();
            }
            self.ready.wait(&mut outcome);
        }
    }

    fn publish(&self, outcome: BuildOutcome) {
        *self.outcome.lock() = Some(outcome);
        self.ready.notify_all();
    }
}

/// Held by the builder; wakes waiters with a failure if dropped unpublished
/// (e.g. the build panicked)
struct BuildGuard<'a> {
    cache: &'a LookupFileCache,
    file_name: String,
    slot: Arc<BuildSlot>,
    published: bool,
}

impl BuildGuard<'_> {
    fn publish(mut self, outcome: BuildOutcome) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: BuildOutcome) {
        self.published = true;
        {
            let mut state = self.cache.state.lock();
            let ours = state
                .building
                .get(&self.file_name)
                .map(|slot| Arc::ptr_eq(slot, &self.slot))
                .unwrap_or(false);
            if ours {
                state.building.remove(&self.file_name);
            }
        }
        self.slot.publish(outcome);
    }
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        if !self.published {
            self.cache.build_failures.fetch_add(1, Ordering::Relaxed);
            self.finish(BuildOutcome::Failed("builder panicked".to_string()));
        }
    }
}

enum Role {
    Hit(Arc<FileLookup>),
    Wait(Arc<BuildSlot>),
    Build(Arc<BuildSlot>),
}

/// Cache of `FileLookup`s bounded by total spill file size
pub struct LookupFileCache {
    options: CacheOptions,
    state: Mutex<CacheState>,
    spill_dir: SpillDirectory,
    reader: Arc<dyn SourceReader>,
    index_factory: Arc<dyn IndexFactory>,
    filter_factory: Arc<dyn FilterFactory>,

    hits: AtomicU64,
    misses: AtomicU64,
    builds: AtomicU64,
    build_failures: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl LookupFileCache {
    pub fn new(
        options: CacheOptions,
        spill_dir: SpillDirectory,
        reader: Arc<dyn SourceReader>,
        index_factory: Arc<dyn IndexFactory>,
        filter_factory: Arc<dyn FilterFactory>,
    ) -> Self {
        Self {
            options,
            state: Mutex::new(CacheState {
                resident: LruCache::unbounded(),
                total_bytes: 0,
                building: HashMap::new(),
                closed: false,
            }),
            spill_dir,
            reader,
            index_factory,
            filter_factory,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            builds: AtomicU64::new(0),
            build_failures: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Lookup index of `meta`, building it on first use
    ///
    /// Concurrent requests for the same uncached file share one build and
    /// receive the same index. A failed build is reported to every waiter
    /// and nothing is cached.
    pub fn get(&self, meta: &FileMeta) -> Result<Arc<FileLookup>> {
        let now = Instant::now();
        let mut expired = Vec::new();

        let role = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(StorageError::Closed);
            }
            self.expire_idle(&mut state, now, &mut expired);

            if let Some(resident) = state.resident.get_mut(&meta.file_name) {
                resident.last_accessed = now;
                Role::Hit(Arc::clone(&resident.lookup))
            } else if let Some(slot) = state.building.get(&meta.file_name) {
                Role::Wait(Arc::clone(slot))
            } else {
                let slot = Arc::new(BuildSlot::new());
                state
                    .building
                    .insert(meta.file_name.clone(), Arc::clone(&slot));
                Role::Build(slot)
            }
        };
        // Spill files of expired entries are deleted here, outside the lock
        drop(expired);

        match role {
            Role::Hit(lookup) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(lookup)
            }
            Role::Wait(slot) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                match slot.wait() {
                    BuildOutcome::Ready(lookup) => Ok(lookup),
                    BuildOutcome::Failed(reason) => Err(StorageError::Build {
                        file: meta.file_name.clone(),
                        reason,
                    }),
                    BuildOutcome::Closed => Err(StorageError::Closed),
                }
            }
            Role::Build(slot) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let guard = BuildGuard {
                    cache: self,
                    file_name: meta.file_name.clone(),
                    slot,
                    published: false,
                };
                self.build_and_register(meta, guard)
            }
        }
    }

    fn build_and_register(&self, meta: &FileMeta, guard: BuildGuard<'_>) -> Result<Arc<FileLookup>> {
        let built = FileLookup::build(
            meta,
            self.reader.as_ref(),
            self.index_factory.as_ref(),
            self.filter_factory.as_ref(),
            self.spill_dir.allocate(),
            &self.options.build,
        );

        let lookup = match built {
            Ok(lookup) => Arc::new(lookup),
            Err(e) => {
                self.build_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(file = %meta.file_name, error = %e, "lookup build failed");
                let reason = match &e {
                    StorageError::Build { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                guard.publish(BuildOutcome::Failed(reason));
                return Err(e);
            }
        };
        self.builds.fetch_add(1, Ordering::Relaxed);

        let mut evicted = Vec::new();
        let registered = {
            let mut state = self.state.lock();
            // Resident and no longer building in one step: no window for a rebuild
            state.building.remove(&meta.file_name);
            if state.closed {
                false
            } else if guard.slot.invalidated.load(Ordering::Relaxed) {
                tracing::debug!(file = %meta.file_name, "not caching lookup invalidated during build");
                true
            } else {
                let now = Instant::now();
                state.total_bytes += lookup.disk_bytes();
                let previous = state.resident.put(
                    meta.file_name.clone(),
                    Resident {
                        lookup: Arc::clone(&lookup),
                        last_accessed: now,
                    },
                );
                if let Some(previous) = previous {
                    state.total_bytes -= previous.lookup.disk_bytes();
                    evicted.push(previous.lookup);
                }
                self.expire_idle(&mut state, now, &mut evicted);
                self.evict_over_budget(&mut state, &mut evicted);
                true
            }
        };

        if !registered {
            tracing::warn!(file = %meta.file_name, "discarding lookup built after close");
            guard.publish(BuildOutcome::Closed);
            return Err(StorageError::Closed);
        }

        guard.publish(BuildOutcome::Ready(Arc::clone(&lookup)));
        drop(evicted);
        Ok(lookup)
    }

    fn expire_idle(&self, state: &mut CacheState, now: Instant, out: &mut Vec<Arc<FileLookup>>) {
        // LRU order is last-access order, so idle entries sit at the front
        loop {
            let idle = match state.resident.peek_lru() {
                Some((_, resident)) => now.saturating_duration_since(resident.last_accessed),
                None => break,
            };
            if idle <= self.options.ttl {
                break;
            }
            if let Some((file_name, resident)) = state.resident.pop_lru() {
                state.total_bytes -= resident.lookup.disk_bytes();
                self.expirations.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(file = %file_name, idle_ms = idle.as_millis() as u64, "expired lookup");
                out.push(resident.lookup);
            }
        }
    }

    fn evict_over_budget(&self, state: &mut CacheState, out: &mut Vec<Arc<FileLookup>>) {
        while state.total_bytes > self.options.max_disk_bytes {
            match state.resident.pop_lru() {
                Some((file_name, resident)) => {
                    state.total_bytes -= resident.lookup.disk_bytes();
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        file = %file_name,
                        disk_bytes = resident.lookup.disk_bytes(),
                        total_bytes = state.total_bytes,
                        "evicted lookup"
                    );
                    out.push(resident.lookup);
                }
                None => break,
            }
        }
    }

    /// Drop the entry of `file_name`; true if one was resident or building
    ///
    /// A build already in flight still serves its requesters, but its
    /// index is released with their leases instead of being cached.
    pub fn invalidate(&self, file_name: &str) -> bool {
        let (removed, cancelled) = {
            let mut state = self.state.lock();
            let removed = state.resident.pop(file_name);
            if let Some(resident) = &removed {
                state.total_bytes -= resident.lookup.disk_bytes();
            }
            let cancelled = match state.building.get(file_name) {
                Some(slot) => {
                    slot.invalidated.store(true, Ordering::Relaxed);
                    true
                }
                None => false,
            };
            (removed, cancelled)
        };
        removed.is_some() || cancelled
    }

    /// Drop every entry and refuse further requests
    pub fn close(&self) {
        let drained: Vec<Resident> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.total_bytes = 0;
            let mut drained = Vec::with_capacity(state.resident.len());
            while let Some((_, resident)) = state.resident.pop_lru() {
                drained.push(resident);
            }
            drained
        };

        tracing::info!(
            files = drained.len(),
            dir = %self.spill_dir.path().display(),
            "closed lookup file cache"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of resident entries
    pub fn estimated_size(&self) -> usize {
        self.state.lock().resident.len()
    }

    /// Summed spill file size of resident entries
    pub fn total_disk_bytes(&self) -> u64 {
        self.state.lock().total_bytes
    }

    pub fn max_disk_bytes(&self) -> u64 {
        self.options.max_disk_bytes
    }

    /// Whether `file_name` is resident (does not refresh recency)
    pub fn contains(&self, file_name: &str) -> bool {
        self.state.lock().resident.contains(file_name)
    }

    /// Spill files currently on disk, leased ones included
    pub fn spill_files_on_disk(&self) -> Result<usize> {
        self.spill_dir.count_on_disk()
    }

    pub fn stats(&self) -> CacheStats {
        let (resident_files, resident_bytes) = {
            let state = self.state.lock();
            (state.resident.len(), state.total_bytes)
        };
        CacheStats {
            resident_files,
            resident_bytes,
            max_disk_bytes: self.options.max_disk_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            builds: self.builds.load(Ordering::Relaxed),
            build_failures: self.build_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for LookupFileCache {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LookupFileCache")
            .field("spill_dir", &self.spill_dir.path())
            .field("options", &self.options)
            .field("stats", &self.stats())
            .finish()
    }
}
