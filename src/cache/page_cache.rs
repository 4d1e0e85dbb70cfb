//! Page Cache - shared LRU cache of decoded index buckets
//!
//! **Purpose**: Hot hash buckets are decoded (decompressed + deserialized)
//! once and shared by every lookup that hits them, across all per-file
//! indexes.
//!
//! **Memory**: bounded by a byte budget; least recently used pages go first.
//!
//! Holding the returned `Arc<Page>` is the acquire, dropping it the release:
//! eviction never invalidates a page that is still being read.

use crate::Result;
use lru::LruCache;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identifies the index a page belongs to
pub type OwnerId = u64;

/// Page cache key: (owning index, bucket number)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub owner: OwnerId,
    pub page: u32,
}

/// Fixed per-entry overhead used for weighing pages
const ENTRY_OVERHEAD: usize = 48;

/// One decoded hash bucket
#[derive(Debug, Default)]
pub struct Page {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    weight: usize,
}

impl Page {
    pub fn new(entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        let weight = entries
            .iter()
            .map(|(k, v)| k.len() + v.len() + ENTRY_OVERHEAD)
            .sum::<usize>()
            + ENTRY_OVERHEAD;
        Self { entries, weight }
    }

    /// Value of `key`; later entries win over earlier ones
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k.as_slice() == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Approximate memory footprint in bytes
    pub fn weight(&self) -> usize {
        self.weight
    }
}

struct PageCacheState {
    pages: LruCache<PageKey, Arc<Page>>,
    used_bytes: usize,
}

/// Shared, byte-budgeted page cache
pub struct PageCache {
    state: Mutex<PageCacheState>,
    capacity_bytes: usize,
    next_owner: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Page cache statistics
#[derive(Debug, Clone, Default)]
pub struct PageCacheStats {
    pub pages: usize,
    pub used_bytes: usize,
    pub capacity_bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

impl PageCacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl PageCache {
    /// Create a page cache holding at most `capacity_bytes` of decoded pages
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            state: Mutex::new(PageCacheState {
                pages: LruCache::unbounded(),
                used_bytes: 0,
            }),
            capacity_bytes,
            next_owner: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Allocate an id for a new index using this cache
    pub fn register_owner(&self) -> OwnerId {
        self.next_owner.fetch_add(1, Ordering::Relaxed)
    }

    /// Return the cached page or decode it with `load`
    ///
    /// `load` runs without the cache lock held. Two threads missing the same
    /// page may both decode it; the second insert just refreshes the entry.
    /// Pages heavier than the whole budget are returned but not cached.
    pub fn get_or_load<F>(&self, key: PageKey, load: F) -> Result<Arc<Page>>
    where
        F: FnOnce() -> Result<Page>,
    {
        if let Some(page) = self.state.lock().pages.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(page));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let page = Arc::new(load()?);
        if page.weight() > self.capacity_bytes {
            return Ok(page);
        }

        let mut state = self.state.lock();
        if let Some(old) = state.pages.put(key, Arc::clone(&page)) {
            state.used_bytes -= old.weight();
        }
        state.used_bytes += page.weight();

        while state.used_bytes > self.capacity_bytes {
            match state.pages.pop_lru() {
                Some((_, evicted)) => state.used_bytes -= evicted.weight(),
                None => break,
            }
        }

        Ok(page)
    }

    /// Drop every page of `owner` (its index is going away)
    pub fn release_owner(&self, owner: OwnerId) {
        let mut state = self.state.lock();
        let keys: Vec<PageKey> = state
            .pages
            .iter()
            .filter(|(key, _)| key.owner == owner)
            .map(|(key, _)| *key)
            .collect();

        for key in keys {
            if let Some(page) = state.pages.pop(&key) {
                state.used_bytes -= page.weight();
            }
        }
    }

    pub fn stats(&self) -> PageCacheStats {
        let state = self.state.lock();
        PageCacheStats {
            pages: state.pages.len(),
            used_bytes: state.used_bytes,
            capacity_bytes: self.capacity_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("PageCache")
            .field("pages", &stats.pages)
            .field("used_bytes", &stats.used_bytes)
            .field("capacity_bytes", &stats.capacity_bytes)
            .finish()
    }
}
