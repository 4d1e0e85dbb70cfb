//! Lookup cache configuration
//!
//! Balances disk usage of the spill files against the cost of rebuilding
//! per-file indexes.

use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Compression applied to hash index buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexCompression {
    None,
    /// Snappy (fast, ~2x on typical values). Small buckets are stored raw.
    Snappy,
}

impl Default for IndexCompression {
    fn default() -> Self {
        IndexCompression::Snappy
    }
}

/// Lookup cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    /// Disk budget for all resident spill files (default 256MB)
    ///
    /// When the sum of spill file sizes exceeds this limit, the least
    /// recently used per-file indexes are evicted and their files deleted.
    pub max_disk_size_bytes: u64,

    /// Idle time after which a per-file index is dropped (default 1 hour)
    pub cache_ttl_ms: u64,

    /// Build a bloom filter per file to skip index probes (default true)
    pub bloom_filter_enabled: bool,

    /// Target false positive rate of the per-file bloom filter (default 5%)
    pub bloom_false_positive_rate: f64,

    /// Hash index load factor in (0, 1] (default 0.75)
    pub hash_load_factor: f64,

    /// Target entries per hash bucket at load factor 1.0 (default 16)
    pub bucket_capacity: usize,

    /// Bucket compression (default Snappy)
    pub index_compression: IndexCompression,

    /// Memory budget of the shared page cache for decoded buckets (default 32MB)
    pub page_cache_bytes: usize,

    /// File name prefix of spill files inside the work directory
    pub spill_file_prefix: String,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            max_disk_size_bytes: 256 * 1024 * 1024,
            cache_ttl_ms: 60 * 60 * 1000,
            bloom_filter_enabled: true,
            bloom_false_positive_rate: 0.05,
            hash_load_factor: 0.75,
            bucket_capacity: 16,
            index_compression: IndexCompression::Snappy,
            page_cache_bytes: 32 * 1024 * 1024,
            spill_file_prefix: "lookup-".to_string(),
        }
    }
}

impl LookupConfig {
    /// Read-heavy workloads: bigger budgets, tighter filters
    pub fn read_optimized() -> Self {
        Self {
            max_disk_size_bytes: 1024 * 1024 * 1024,
            bloom_false_positive_rate: 0.01,
            bucket_capacity: 8,                 // shorter bucket scans
            page_cache_bytes: 128 * 1024 * 1024,
            ..Self::default()
        }
    }

    /// Embedded devices: small disk and memory footprint
    pub fn embedded() -> Self {
        Self {
            max_disk_size_bytes: 64 * 1024 * 1024,
            cache_ttl_ms: 10 * 60 * 1000,
            bucket_capacity: 32,
            page_cache_bytes: 8 * 1024 * 1024,
            ..Self::default()
        }
    }

    /// IoT / mobile: keep only a handful of indexes around
    pub fn tiny() -> Self {
        Self {
            max_disk_size_bytes: 16 * 1024 * 1024,
            cache_ttl_ms: 5 * 60 * 1000,
            bloom_false_positive_rate: 0.1,
            bucket_capacity: 64,
            page_cache_bytes: 2 * 1024 * 1024,
            ..Self::default()
        }
    }

    pub fn with_max_disk_size(mut self, bytes: u64) -> Self {
        self.max_disk_size_bytes = bytes;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_ms = ttl.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        let fpp = self.bloom_false_positive_rate;
        if !(fpp > 0.0 && fpp < 1.0) {
            return Err(StorageError::Config(format!(
                "bloom_false_positive_rate must be in (0, 1), got {}",
                fpp
            )));
        }
        let lf = self.hash_load_factor;
        if !(lf > 0.0 && lf <= 1.0) {
            return Err(StorageError::Config(format!(
                "hash_load_factor must be in (0, 1], got {}",
                lf
            )));
        }
        if self.cache_ttl_ms == 0 {
            return Err(StorageError::Config("cache_ttl_ms must be positive".into()));
        }
        if self.bucket_capacity == 0 {
            return Err(StorageError::Config("bucket_capacity must be positive".into()));
        }
        if self.spill_file_prefix.is_empty() || self.spill_file_prefix.contains(|c: char| c == '/' || c == '\\') {
            return Err(StorageError::Config(format!(
                "invalid spill_file_prefix: {:?}",
                self.spill_file_prefix
            )));
        }
        Ok(())
    }

    /// Parse from JSON; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }
}
