//! Spill File Manager
//!
//! Hands out uniquely named spill files inside the lookup work directory.
//!
//! ## Features
//! - Unique names: `<prefix><random-hex>-<counter>.idx`
//! - RAII deletion: a `SpillFile` removes its file when dropped
//! - Best-effort cleanup: deletion failures are logged, never raised
//!
//! ## Safety
//! A `SpillFile` is owned by exactly one per-file index. Readers share that
//! index through an `Arc`, so the file outlives every in-flight probe and is
//! deleted only after the last reference is released.

use crate::Result;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const SPILL_EXTENSION: &str = "idx";

/// Work directory for spill files (cheap to clone)
#[derive(Clone, Debug)]
pub struct SpillDirectory {
    inner: Arc<SpillDirInner>,
}

#[derive(Debug)]
struct SpillDirInner {
    dir: PathBuf,
    prefix: String,
    /// Random per-instance tag; two caches sharing a directory never collide
    nonce: u64,
    next_id: AtomicU64,
}

impl SpillDirectory {
    /// Use `dir` (created if missing) for spill files named `<prefix>...`
    pub fn new<P: AsRef<Path>>(dir: P, prefix: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        Ok(Self {
            inner: Arc::new(SpillDirInner {
                dir,
                prefix: prefix.to_string(),
                nonce: rand::random::<u64>(),
                next_id: AtomicU64::new(0),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.dir
    }

    /// Reserve a new unique spill file path
    ///
    /// Nothing is created on disk; whoever writes the path owns the file
    /// through the returned guard.
    pub fn allocate(&self) -> SpillFile {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "{}{:016x}-{}.{}",
            self.inner.prefix, self.inner.nonce, id, SPILL_EXTENSION
        );
        SpillFile {
            path: self.inner.dir.join(name),
        }
    }

    /// Number of spill files with this directory's prefix currently on disk
    pub fn count_on_disk(&self) -> Result<usize> {
        let mut count = 0;
        for entry in std::fs::read_dir(&self.inner.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&self.inner.prefix) && name.ends_with(SPILL_EXTENSION) {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Owned spill file path (RAII-managed)
#[derive(Debug)]
pub struct SpillFile {
    path: PathBuf,
}

impl SpillFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size on disk (0 if not written yet)
    pub fn size_on_disk(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::trace!(path = %self.path.display(), "removed spill file");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                // May leak the file; external cleanup of the work dir reclaims it
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to delete spill file"
                );
            }
        }
    }
}
