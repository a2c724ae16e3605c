//! Live tree scanning
//!
//! [`TreeScanner`] walks a directory tree with `walkdir` and yields one
//! [`Entry`] per node in ascending index order. Siblings are sorted by their
//! unmapped names so that quoted mirrors scan in the same order as the
//! sources they were made from.
//!
//! A scan can start part-way through the tree: with a resume index set, every
//! subtree lying wholly before that index is pruned without being read, and
//! entries at or before it are skipped. This is what lets an interrupted
//! backup reopen its source and mirror streams where it stopped.
//!
//! Per-file errors (a file vanishing between `readdir` and `lstat`, an
//! unreadable subdirectory) are logged, counted and skipped.

use crate::entry::Entry;
use crate::error::{Result, RewindError};
use crate::index::{Index, PathMapping};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// Prefix of temporary files written next to mirror entries
pub const TEMP_PREFIX: &str = ".rewind-tmp";

/// Compiled exclusion globs
///
/// Patterns follow gitignore conventions: a pattern without `/` matches at
/// any depth, a leading `/` anchors it at the root, a trailing `/` is
/// ignored. `*` does not cross directory boundaries; `**` does.
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    set: Option<GlobSet>,
    patterns: Vec<String>,
}

impl ExcludeSet {
    /// Compile a list of patterns
    pub fn new(patterns: &[String]) -> Result<Self> {
        if patterns.is_empty() {
            return Ok(Self::default());
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let trimmed = pattern.trim_end_matches('/');
            let normalized = if let Some(anchored) = trimmed.strip_prefix('/') {
                anchored.to_string()
            } else if trimmed.contains('/') {
                trimmed.to_string()
            } else {
                format!("**/{}", trimmed)
            };
            builder.add(GlobBuilder::new(&normalized).literal_separator(true).build()?);
        }
        Ok(ExcludeSet {
            set: Some(builder.build()?),
            patterns: patterns.to_vec(),
        })
    }

    /// True if `index` is excluded
    pub fn is_excluded(&self, index: &Index) -> bool {
        match &self.set {
            Some(set) => !index.is_root() && set.is_match(index.to_path()),
            None => false,
        }
    }

    /// Source patterns
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

/// Configures and opens a [`TreeScanner`]
#[derive(Debug, Clone)]
pub struct ScanOptions {
    mapping: PathMapping,
    excludes: ExcludeSet,
    resume_after: Option<Index>,
    skip_root_names: Vec<String>,
    skip_temp_files: bool,
    errors: Arc<AtomicU64>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        ScanOptions {
            mapping: PathMapping::Local,
            excludes: ExcludeSet::default(),
            resume_after: None,
            skip_root_names: Vec::new(),
            skip_temp_files: false,
            errors: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl ScanOptions {
    /// Start a configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Unquote on-disk names with this mapping
    pub fn mapping(mut self, mapping: PathMapping) -> Self {
        self.mapping = mapping;
        self
    }

    /// Prune entries matching these globs
    pub fn excludes(mut self, excludes: ExcludeSet) -> Self {
        self.excludes = excludes;
        self
    }

    /// Skip everything at or before `index`
    pub fn resume_after(mut self, index: Option<Index>) -> Self {
        self.resume_after = index;
        self
    }

    /// Skip a top-level name (such as the data directory)
    pub fn skip_root_name(mut self, name: impl Into<String>) -> Self {
        self.skip_root_names.push(name.into());
        self
    }

    /// Skip leftover temp files from interrupted writes
    pub fn skip_temp_files(mut self, skip: bool) -> Self {
        self.skip_temp_files = skip;
        self
    }

    /// Count per-file errors into a shared counter
    pub fn error_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.errors = counter;
        self
    }

    /// Open a scanner on `root`
    pub fn scan(self, root: &Path) -> Result<TreeScanner> {
        TreeScanner::new(root, self)
    }
}

type EntryFilter = Box<dyn FnMut(&DirEntry) -> bool + Send>;

/// Lazy, index-ordered, resumable scan of a live tree
pub struct TreeScanner {
    root: PathBuf,
    walker: walkdir::FilterEntry<walkdir::IntoIter, EntryFilter>,
    mapping: PathMapping,
    resume_after: Option<Index>,
    errors: Arc<AtomicU64>,
}

impl TreeScanner {
    /// Scan `root` with default options
    pub fn open(root: &Path) -> Result<Self> {
        ScanOptions::default().scan(root)
    }

    fn new(root: &Path, options: ScanOptions) -> Result<Self> {
        // The root itself must be readable; anything below is per-file
        std::fs::symlink_metadata(root)?;

        let sort_mapping = options.mapping.clone();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by(move |a, b| {
                let left = sort_mapping.unquote(a.file_name());
                let right = sort_mapping.unquote(b.file_name());
                match (left, right) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => a.file_name().cmp(b.file_name()),
                }
            });

        let filter_root = root.to_path_buf();
        let filter_mapping = options.mapping.clone();
        let excludes = options.excludes.clone();
        let resume = options.resume_after.clone();
        let skip_root_names = options.skip_root_names.clone();
        let skip_temp = options.skip_temp_files;

        let filter: EntryFilter = Box::new(move |entry: &DirEntry| {
            if entry.depth() == 0 {
                return true;
            }
            let name = entry.file_name();
            if entry.depth() == 1 && skip_root_names.iter().any(|n| OsStr::new(n) == name) {
                return false;
            }
            if skip_temp && name.to_string_lossy().starts_with(TEMP_PREFIX) {
                return false;
            }
            let index = match index_for(&filter_root, entry.path(), &filter_mapping) {
                Ok(index) => index,
                Err(_) => return true,
            };
            if let Some(resume) = &resume {
                // Subtrees wholly before the resume point need not be read
                if index < *resume && !resume.starts_with(&index) {
                    return false;
                }
            }
            if excludes.is_excluded(&index) {
                debug!("Excluding {}", index);
                return false;
            }
            true
        });

        Ok(TreeScanner {
            root: root.to_path_buf(),
            walker: walker.into_iter().filter_entry(filter),
            mapping: options.mapping,
            resume_after: options.resume_after,
            errors: options.errors,
        })
    }

    /// Root being scanned
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Per-file errors skipped so far
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    fn note_skipped(&self, err: &RewindError) {
        warn!("Skipping unreadable entry below {:?}: {}", self.root, err);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

impl Iterator for TreeScanner {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let dir_entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    let err = RewindError::from(e);
                    if err.is_per_file() {
                        self.note_skipped(&err);
                        continue;
                    }
                    return Some(Err(err));
                }
            };

            let index = match index_for(&self.root, dir_entry.path(), &self.mapping) {
                Ok(index) => index,
                Err(e) => return Some(Err(e)),
            };
            if let Some(resume) = &self.resume_after {
                if index <= *resume {
                    continue;
                }
            }

            let built = dir_entry
                .metadata()
                .map_err(RewindError::from)
                .and_then(|meta| Entry::from_metadata(index, dir_entry.path(), &meta));
            match built {
                Ok(entry) => return Some(Ok(entry)),
                Err(e) if e.is_per_file() => self.note_skipped(&e),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Index of `path` below `root`, unmapping each component
fn index_for(root: &Path, path: &Path, mapping: &PathMapping) -> Result<Index> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| RewindError::internal(format!("{:?} is not below {:?}", path, root)))?;
    let mut parts = Vec::new();
    for component in relative.components() {
        parts.push(mapping.unquote(component.as_os_str())?);
    }
    Ok(Index::from_components(parts))
}
