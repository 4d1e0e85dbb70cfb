//! Cache module - shared page cache for decoded index buckets

pub mod page_cache;

pub use page_cache::{OwnerId, Page, PageCache, PageCacheStats, PageKey};
