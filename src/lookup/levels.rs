//! Immutable view of the sorted runs per level
//!
//! ## Layout
//! - **Level 0**: overlapping runs kept in insertion order (oldest first),
//!   probed newest first
//! - **Level 1+**: runs sorted by `min_key` with disjoint key ranges, at most
//!   one candidate per level (binary search)

use crate::types::{FileMeta, KeyComparator};
use crate::{Result, StorageError};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Leveled set of sorted runs
///
/// Never mutated after construction; `with_level0_file` and `without_file`
/// return a new set.
#[derive(Clone)]
pub struct LevelSet {
    comparator: Arc<dyn KeyComparator>,
    /// Insertion order, oldest first
    level0: Vec<FileMeta>,
    /// `levels[i]` holds level `i + 1`, sorted by `min_key`
    levels: Vec<Vec<FileMeta>>,
}

impl LevelSet {
    /// Build a set from the level-0 runs (oldest first) and one list per level >= 1
    ///
    /// Level >= 1 lists may be in any order; they are sorted here and must
    /// not overlap.
    pub fn new(
        comparator: Arc<dyn KeyComparator>,
        level0: Vec<FileMeta>,
        upper: Vec<Vec<FileMeta>>,
    ) -> Result<Self> {
        let cmp = comparator.as_ref();
        let mut names = HashSet::new();

        for file in &level0 {
            Self::check_file(cmp, file, 0, &mut names)?;
        }

        let mut levels = Vec::with_capacity(upper.len());
        for (i, mut files) in upper.into_iter().enumerate() {
            let level = i + 1;
            for file in &files {
                Self::check_file(cmp, file, level, &mut names)?;
            }

            files.sort_by(|a, b| cmp.compare(&a.min_key, &b.min_key));
            for pair in files.windows(2) {
                if cmp.compare(&pair[0].max_key, &pair[1].min_key) != Ordering::Less {
                    return Err(StorageError::InvalidArgument(format!(
                        "level {} files {} and {} overlap",
                        level, pair[0].file_name, pair[1].file_name
                    )));
                }
            }
            levels.push(files);
        }

        Ok(Self {
            comparator,
            level0,
            levels,
        })
    }

    /// Group `files` by their `level`; level-0 order is the input order
    pub fn from_files(
        comparator: Arc<dyn KeyComparator>,
        files: Vec<FileMeta>,
        num_levels: usize,
    ) -> Result<Self> {
        if num_levels == 0 {
            return Err(StorageError::InvalidArgument(
                "a level set has at least level 0".into(),
            ));
        }

        let mut level0 = Vec::new();
        let mut upper = vec![Vec::new(); num_levels - 1];
        for file in files {
            match file.level {
                0 => level0.push(file),
                level if level < num_levels => upper[level - 1].push(file),
                level => {
                    return Err(StorageError::InvalidArgument(format!(
                        "{} is at level {} but the set has {} levels",
                        file.file_name, level, num_levels
                    )))
                }
            }
        }

        Self::new(comparator, level0, upper)
    }

    /// Set with `num_levels` empty levels (at least one)
    pub fn empty(comparator: Arc<dyn KeyComparator>, num_levels: usize) -> Self {
        Self {
            comparator,
            level0: Vec::new(),
            levels: vec![Vec::new(); num_levels.saturating_sub(1)],
        }
    }

    fn check_file(
        cmp: &dyn KeyComparator,
        file: &FileMeta,
        level: usize,
        names: &mut HashSet<String>,
    ) -> Result<()> {
        if file.level != level {
            return Err(StorageError::InvalidArgument(format!(
                "{} claims level {} but is placed in level {}",
                file.file_name, file.level, level
            )));
        }
        if cmp.compare(&file.min_key, &file.max_key) == Ordering::Greater {
            return Err(StorageError::InvalidArgument(format!(
                "{} has min_key > max_key",
                file.file_name
            )));
        }
        if !names.insert(file.file_name.clone()) {
            return Err(StorageError::InvalidArgument(format!(
                "duplicate file {}",
                file.file_name
            )));
        }
        Ok(())
    }

    /// Candidate files for `key` in precedence order, skipping levels below `start_level`
    ///
    /// Level 0 contributes every run whose range contains the key, newest
    /// first. Each deeper level contributes at most one run.
    pub fn files_to_probe(&self, key: &[u8], start_level: usize) -> Vec<(usize, &FileMeta)> {
        let cmp = self.comparator.as_ref();
        let mut candidates = Vec::new();

        if start_level == 0 {
            candidates.extend(
                self.level0
                    .iter()
                    .rev()
                    .filter(|file| file.contains_key(cmp, key))
                    .map(|file| (0, file)),
            );
        }

        for level in start_level.max(1)..self.num_levels() {
            let files = &self.levels[level - 1];
            // First run whose max_key >= key; ranges are disjoint and sorted
            let idx = files.partition_point(|file| cmp.compare(&file.max_key, key) == Ordering::Less);
            if let Some(file) = files.get(idx) {
                if cmp.compare(&file.min_key, key) != Ordering::Greater {
                    candidates.push((level, file));
                }
            }
        }

        candidates
    }

    /// New set with `meta` added as the newest level-0 run
    pub fn with_level0_file(&self, meta: FileMeta) -> Result<Self> {
        let mut level0 = self.level0.clone();
        level0.push(meta);
        Self::new(Arc::clone(&self.comparator), level0, self.levels.clone())
    }

    /// New set without the run named `file_name` (unchanged if absent)
    pub fn without_file(&self, file_name: &str) -> Self {
        let keep = |files: &Vec<FileMeta>| -> Vec<FileMeta> {
            files
                .iter()
                .filter(|file| file.file_name != file_name)
                .cloned()
                .collect()
        };
        Self {
            comparator: Arc::clone(&self.comparator),
            level0: keep(&self.level0),
            levels: self.levels.iter().map(keep).collect(),
        }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len() + 1
    }

    pub fn max_level(&self) -> usize {
        self.levels.len()
    }

    /// Runs of `level` (level 0 in insertion order); empty past `max_level`
    pub fn level_files(&self, level: usize) -> &[FileMeta] {
        match level {
            0 => &self.level0,
            n => self.levels.get(n - 1).map(Vec::as_slice).unwrap_or(&[]),
        }
    }

    pub fn files(&self) -> impl Iterator<Item = &FileMeta> + '_ {
        self.level0.iter().chain(self.levels.iter().flatten())
    }

    pub fn num_files(&self) -> usize {
        self.level0.len() + self.levels.iter().map(Vec::len).sum::<usize>()
    }

    pub fn contains_file(&self, file_name: &str) -> bool {
        self.files().any(|file| file.file_name == file_name)
    }

    pub fn comparator(&self) -> &Arc<dyn KeyComparator> {
        &self.comparator
    }
}

impl fmt::Debug for LevelSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut list = f.debug_list();
        for level in 0..self.num_levels() {
            let names: Vec<&str> = self
                .level_files(level)
                .iter()
                .map(|file| file.file_name.as_str())
                .collect();
            list.entry(&(level, names));
        }
        list.finish()
    }
}
