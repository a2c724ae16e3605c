//! Compare engine
//!
//! Reports how a live source tree differs from a committed session without
//! touching either. The source scan and the session's metadata snapshot are
//! collated by index; each aligned pair is classified lazily as the caller
//! pulls from the returned iterator.
//!
//! | Level | Regular files are equal when |
//! |---|---|
//! | [`CompareLevel::Meta`] | metadata loosely matches |
//! | [`CompareLevel::Hash`] | ...and the SHA-256 digests match |
//! | [`CompareLevel::Full`] | ...and the bytes match |
//!
//! At [`CompareLevel::Hash`] the stored digest is used when the snapshot
//! has one; otherwise the stored content is reconstructed and hashed.

use crate::collate::{collate2, Pair};
use crate::diff::DeltaCodec;
use crate::entry::Entry;
use crate::error::Result;
use crate::increment::IncrementGroup;
use crate::index::{Index, PathMapping};
use crate::restore::{metadata_subtree, reconstruct_file};
use crate::scan::{ExcludeSet, ScanOptions};
use crate::storage::{Repository, DATA_DIR};
use crate::types::{CompareLevel, CompareOptions, Timestamp};
use crate::utils::{hash_data, hash_file_content};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, instrument, trace};

/// Classification of one path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompareStatus {
    /// Only in the source
    New,
    /// Only in the stored session
    Deleted,
    /// In both, different
    Changed,
    /// In both, equal at the requested level
    Unchanged,
}

impl fmt::Display for CompareStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareStatus::New => "new",
            CompareStatus::Deleted => "deleted",
            CompareStatus::Changed => "changed",
            CompareStatus::Unchanged => "unchanged",
        };
        f.write_str(s)
    }
}

/// Outcome for one path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompareReport {
    /// Path compared
    pub index: Index,
    /// Classification
    pub status: CompareStatus,
    /// What differed, for changed paths
    pub reason: Option<String>,
}

impl CompareReport {
    fn new(index: Index, status: CompareStatus) -> Self {
        CompareReport {
            index,
            status,
            reason: None,
        }
    }

    fn changed(index: Index, reason: &str) -> Self {
        CompareReport {
            index,
            status: CompareStatus::Changed,
            reason: Some(reason.to_string()),
        }
    }

    /// True for anything but [`CompareStatus::Unchanged`]
    pub fn is_difference(&self) -> bool {
        self.status != CompareStatus::Unchanged
    }
}

type CompareItem = Pair<Pair<Entry, Entry>, IncrementGroup>;

/// Lazy stream of [`CompareReport`]s in index order
pub struct Comparison {
    items: Box<dyn Iterator<Item = Result<CompareItem>>>,
    source_root: PathBuf,
    mirror: PathBuf,
    mapping: PathMapping,
    codec: Arc<dyn DeltaCodec>,
    time: Timestamp,
    use_increments: bool,
    level: CompareLevel,
}

impl Comparison {
    /// Stored content of `record`
    fn stored_content(&self, record: &Entry, group: Option<&IncrementGroup>) -> Result<Vec<u8>> {
        let mirror_path = self.mapping.to_path(&self.mirror, &record.index);
        match group {
            Some(group) if self.use_increments => reconstruct_file(
                &mirror_path,
                &group.increments,
                self.time,
                self.codec.as_ref(),
                &record.index,
            ),
            _ => Ok(fs::read(&mirror_path)?),
        }
    }

    fn classify(&self, item: CompareItem) -> Result<CompareReport> {
        let index = item.index;
        let (source, record) = match item.left {
            Some(pair) => (pair.left, pair.right),
            None => (None, None),
        };
        let group = item.right;

        let (source, record) = match (source, record) {
            (Some(s), Some(r)) => (s, r),
            (Some(_), None) => return Ok(CompareReport::new(index, CompareStatus::New)),
            (None, Some(_)) => return Ok(CompareReport::new(index, CompareStatus::Deleted)),
            (None, None) => return Ok(CompareReport::new(index, CompareStatus::Unchanged)),
        };

        if !source.loose_eq(&record) {
            return Ok(CompareReport::changed(index, "metadata"));
        }
        if !source.is_reg() {
            return Ok(CompareReport::new(index, CompareStatus::Unchanged));
        }

        let source_path = self.source_root.join(index.to_path());
        let equal = match self.level {
            CompareLevel::Meta => true,
            CompareLevel::Hash => {
                let stored = match &record.content_hash {
                    Some(digest) => digest.clone(),
                    None => hash_data(&self.stored_content(&record, group.as_ref())?),
                };
                hash_file_content(&source_path)? == stored
            }
            CompareLevel::Full => {
                fs::read(&source_path)? == self.stored_content(&record, group.as_ref())?
            }
        };
        trace!("Compared {} at {:?}: equal={}", index, self.level, equal);
        Ok(if equal {
            CompareReport::new(index, CompareStatus::Unchanged)
        } else {
            CompareReport::changed(index, "content")
        })
    }
}

impl Iterator for Comparison {
    type Item = Result<CompareReport>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.items.next()?;
        Some(item.and_then(|item| self.classify(item)))
    }
}

/// Compare `source` with committed session `time`
#[instrument(skip(repo, codec, options), fields(mirror = ?repo.mirror()))]
pub fn compare(
    repo: &Repository,
    codec: Arc<dyn DeltaCodec>,
    source: &std::path::Path,
    time: Timestamp,
    options: &CompareOptions,
) -> Result<Comparison> {
    let mut patterns = repo.config().exclude_patterns.clone();
    patterns.extend(options.exclude.iter().cloned());
    let excludes = ExcludeSet::new(&patterns)?;

    let scan = ScanOptions::new()
        .excludes(excludes.clone())
        .skip_root_name(DATA_DIR)
        .scan(source)?;
    let records = metadata_subtree(repo, time, &Index::root())?.filter(move |r| match r {
        Ok(entry) => !excludes.is_excluded(&entry.index),
        Err(_) => true,
    });

    let current = repo.current_time()?;
    let use_increments = current != Some(time) && options.level != CompareLevel::Meta;
    let groups: Box<dyn Iterator<Item = Result<IncrementGroup>>> = if use_increments {
        Box::new(repo.increment_store().stream(None)?)
    } else {
        Box::new(std::iter::empty())
    };
    debug!("Comparing {:?} with session {} at {:?}", source, time, options.level);

    Ok(Comparison {
        items: Box::new(collate2(collate2(scan, records), groups)),
        source_root: source.to_path_buf(),
        mirror: repo.mirror().to_path_buf(),
        mapping: repo.mapping().clone(),
        codec,
        time,
        use_increments,
        level: options.level,
    })
}
