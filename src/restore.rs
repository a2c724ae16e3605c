//! Restore engine
//!
//! Rebuilds the tree (or a subtree) as it was at a committed session into a
//! separate target directory. The repository is only read.
//!
//! The metadata snapshot of the session is authoritative for what existed;
//! it is collated with the increment groups of the same subtree and driven
//! through a [`TreeReducer`] so that directories are created on the way down
//! and get their final metadata on the way back up (after their children no
//! longer need write access).
//!
//! ## Reconstruction
//!
//! [`reconstruct_file`] produces the content of one regular file at a time
//! `T` from the mirror and the file's increments:
//!
//! 1. keep increments stamped `T` or later, oldest first;
//! 2. cut the list after the first one that is not a diff (the anchor);
//! 3. start from the anchor snapshot, or from the mirror file when every
//!    kept increment is a diff;
//! 4. apply the diffs newest first.

use crate::collate::{collate2, Pair};
use crate::diff::DeltaCodec;
use crate::entry::{make_dir_writable, remove_node, Entry, HardlinkKey};
use crate::error::{Result, RewindError};
use crate::increment::{Increment, IncrementGroup, IncrementKind};
use crate::index::{Index, PathMapping};
use crate::metadata::MetadataReader;
use crate::reducer::{Branch, OrderPolicy, TreeReducer};
use crate::storage::Repository;
use crate::types::{RestoreOptions, RestoreResult, Timestamp, VerifyReport};
use crate::utils::{self, hash_data};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

/// Content of the regular file `index` at `at`
///
/// `mirror_path` is the file's location in the mirror and `increments` every
/// increment known for it.
pub fn reconstruct_file(
    mirror_path: &Path,
    increments: &[Increment],
    at: Timestamp,
    codec: &dyn DeltaCodec,
    index: &Index,
) -> Result<Vec<u8>> {
    let mut relevant: Vec<&Increment> = increments.iter().filter(|inc| inc.time >= at).collect();
    relevant.sort_by_key(|inc| inc.time);
    if let Some(anchor) = relevant.iter().position(|inc| !inc.is_diff()) {
        relevant.truncate(anchor + 1);
    }

    let (mut content, diffs) = match relevant.last() {
        Some(anchor) if !anchor.is_diff() => {
            match anchor.kind {
                IncrementKind::Snapshot => {}
                other => {
                    return Err(RewindError::broken_chain(
                        index,
                        format!("state at {} is a {} marker, not a file", anchor.time, other),
                    ))
                }
            }
            let content = anchor.read_content()?;
            (content, &relevant[..relevant.len() - 1])
        }
        _ => {
            let meta = match fs::symlink_metadata(mirror_path) {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(RewindError::broken_chain(index, "no mirror file to patch from"))
                }
                Err(e) => return Err(e.into()),
            };
            if !meta.is_file() {
                return Err(RewindError::broken_chain(index, "mirror entry is not a regular file"));
            }
            (fs::read(mirror_path)?, &relevant[..])
        }
    };

    for inc in diffs.iter().rev() {
        let delta = inc.read_content()?;
        content = codec.patch(&content, &delta).map_err(|e| {
            RewindError::broken_chain(index, format!("diff at {} does not apply: {}", inc.time, e))
        })?;
        trace!("Applied diff {} to {}", inc.time, index);
    }
    Ok(content)
}

/// Shared state of a restore pass
pub struct RestoreContext {
    mirror: PathBuf,
    mapping: PathMapping,
    codec: Arc<dyn DeltaCodec>,
    time: Timestamp,
    use_increments: bool,
    subtree: Index,
    target: PathBuf,
    hardlinks: HashMap<HardlinkKey, PathBuf>,
    result: RestoreResult,
}

impl RestoreContext {
    fn target_path(&self, index: &Index) -> PathBuf {
        match index.strip_prefix(&self.subtree) {
            Some(rel) if !rel.is_root() => self.target.join(rel.to_path()),
            _ => self.target.clone(),
        }
    }

    fn content_of(&self, entry: &Entry, group: Option<&IncrementGroup>) -> Result<Vec<u8>> {
        let mirror_path = self.mapping.to_path(&self.mirror, &entry.index);
        match group {
            Some(group) if self.use_increments => reconstruct_file(
                &mirror_path,
                &group.increments,
                self.time,
                self.codec.as_ref(),
                &entry.index,
            ),
            _ => Ok(fs::read(&mirror_path)?),
        }
    }

    /// Materialize one non-directory entry at its target path
    fn restore_leaf(&mut self, entry: &Entry, group: Option<&IncrementGroup>) -> Result<()> {
        let path = self.target_path(&entry.index);
        remove_node(&path)?;

        if entry.is_reg() {
            if let Some(key) = entry.hardlink.filter(|_| entry.nlink > 1) {
                if let Some(first) = self.hardlinks.get(&key) {
                    fs::hard_link(first, &path)?;
                    self.result.hardlinks_restored += 1;
                    trace!("Linked {} to {:?}", entry.index, first);
                    return Ok(());
                }
            }
            let content = self.content_of(entry, group)?;
            fs::write(&path, &content)?;
            entry.apply_to(&path)?;
            self.result.files_restored += 1;
            self.result.bytes_written += content.len() as u64;
            if let Some(key) = entry.hardlink.filter(|_| entry.nlink > 1) {
                self.hardlinks.insert(key, path);
            }
        } else {
            entry.create_node(&path)?;
            entry.apply_to(&path)?;
            self.result.other_restored += 1;
        }
        trace!("Restored {}", entry.index);
        Ok(())
    }

    fn record_error(&mut self, index: &Index, err: RewindError) -> Result<()> {
        if err.is_per_file() {
            warn!("Could not restore {}: {}", index, err);
            self.result.errors += 1;
            Ok(())
        } else {
            Err(err)
        }
    }
}

type RestoreItem = Pair<Entry, IncrementGroup>;

/// One open directory of a restore pass
pub struct RestoreBranch {
    dir: Option<(Entry, PathBuf)>,
}

impl Branch for RestoreBranch {
    type Item = RestoreItem;
    type Context = RestoreContext;

    fn new(_ctx: &mut RestoreContext) -> Self {
        RestoreBranch { dir: None }
    }

    fn start(&mut self, ctx: &mut RestoreContext, item: RestoreItem) -> Result<()> {
        let entry = match item.left {
            Some(entry) => entry,
            None => return Ok(()),
        };
        if !entry.is_dir() {
            let index = entry.index.clone();
            return match ctx.restore_leaf(&entry, item.right.as_ref()) {
                Ok(()) => Ok(()),
                Err(e) => ctx.record_error(&index, e),
            };
        }

        let path = ctx.target_path(&entry.index);
        let outcome = (|| -> Result<()> {
            match fs::symlink_metadata(&path) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => {
                    remove_node(&path)?;
                    fs::create_dir(&path)?;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir(&path)?,
                Err(e) => return Err(e.into()),
            }
            make_dir_writable(&path)
        })();
        match outcome {
            Ok(()) => {
                ctx.result.directories_restored += 1;
                self.dir = Some((entry, path));
                Ok(())
            }
            Err(e) => ctx.record_error(&entry.index, e),
        }
    }

    fn end(&mut self, ctx: &mut RestoreContext) -> Result<()> {
        if let Some((entry, path)) = self.dir.take() {
            if let Err(e) = entry.apply_to(&path) {
                ctx.record_error(&entry.index, e)?;
            }
        }
        Ok(())
    }

    fn branch_complete(&mut self, _ctx: &mut RestoreContext, _child: Self) -> Result<()> {
        Ok(())
    }

    fn can_fast_process(&self, item: &RestoreItem) -> bool {
        // Children of a directory that failed to open are skipped in place
        self.dir.is_none() || !item.left.as_ref().map(Entry::is_dir).unwrap_or(false)
    }

    fn fast_process(&mut self, ctx: &mut RestoreContext, item: RestoreItem) -> Result<()> {
        if self.dir.is_none() {
            trace!("Skipping {} below an unrestorable directory", item.index);
            return Ok(());
        }
        match item.left {
            Some(entry) => {
                let index = entry.index.clone();
                match ctx.restore_leaf(&entry, item.right.as_ref()) {
                    Ok(()) => Ok(()),
                    Err(e) => ctx.record_error(&index, e),
                }
            }
            None => Ok(()),
        }
    }
}

/// Metadata records at `time` inside `subtree`, in index order
pub(crate) fn metadata_subtree(
    repo: &Repository,
    time: Timestamp,
    subtree: &Index,
) -> Result<impl Iterator<Item = Result<Entry>>> {
    let mut reader = MetadataReader::open(&repo.require_metadata(time)?)?;
    let start = subtree.clone();
    reader.advance_while(|i| *i < start)?;
    let within = subtree.clone();
    Ok(reader.take_while(move |r| match r {
        Ok(entry) => entry.index.starts_with(&within),
        Err(_) => true,
    }))
}

/// Restore the state at committed session `time` into `target`
#[instrument(skip(repo, codec, options), fields(mirror = ?repo.mirror()))]
pub fn restore(
    repo: &Repository,
    codec: Arc<dyn DeltaCodec>,
    time: Timestamp,
    target: &Path,
    options: &RestoreOptions,
) -> Result<RestoreResult> {
    let started = Instant::now();
    let subtree = options.subtree.clone().unwrap_or_else(Index::root);

    if !options.force && !utils::is_absent_or_empty_dir(target)? {
        return Err(RewindError::TargetNotEmpty(target.to_path_buf()));
    }
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let current = repo.current_time()?.ok_or(RewindError::EmptyRepository)?;
    let mut records = metadata_subtree(repo, time, &subtree)?.peekable();
    match records.peek() {
        Some(Ok(first)) if first.index == subtree => {}
        Some(Err(_)) => {}
        _ => {
            return Err(RewindError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} did not exist at {}", subtree, time),
            )))
        }
    }

    let use_increments = time != current;
    let groups = repo
        .increment_store()
        .stream(Some(&subtree))?
        .filter(move |g| use_increments || g.is_err());

    let mut ctx = RestoreContext {
        mirror: repo.mirror().to_path_buf(),
        mapping: repo.mapping().clone(),
        codec,
        time,
        use_increments,
        subtree: subtree.clone(),
        target: target.to_path_buf(),
        hardlinks: HashMap::new(),
        result: RestoreResult {
            restored_time: Some(time),
            ..Default::default()
        },
    };

    info!("Restoring {} at {} into {:?}", subtree, time, target);
    let mut reducer: TreeReducer<RestoreBranch> = TreeReducer::new(OrderPolicy::Strict);
    for item in collate2(records, groups) {
        let item = item?;
        if item.left.is_none() {
            // Not present at `time`
            continue;
        }
        reducer.process(&mut ctx, item)?;
    }
    reducer.finish(&mut ctx)?;

    let mut result = ctx.result;
    result.duration_ms = started.elapsed().as_millis() as u64;
    info!(
        "Restored {} files, {} directories, {} other ({} errors)",
        result.files_restored, result.directories_restored, result.other_restored, result.errors
    );
    Ok(result)
}

/// Check every stored file digest at `time` against reconstructed content
#[instrument(skip(repo, codec), fields(mirror = ?repo.mirror()))]
pub fn verify(repo: &Repository, codec: Arc<dyn DeltaCodec>, time: Timestamp) -> Result<VerifyReport> {
    let current = repo.current_time()?.ok_or(RewindError::EmptyRepository)?;
    let use_increments = time != current;
    let records = metadata_subtree(repo, time, &Index::root())?;
    let groups = repo.increment_store().stream(None)?;
    let mut report = VerifyReport {
        time: Some(time),
        ..Default::default()
    };

    for item in collate2(records, groups) {
        let item = item?;
        let entry = match item.left {
            Some(entry) if entry.is_reg() => entry,
            _ => continue,
        };
        let expected = match &entry.content_hash {
            Some(hash) => hash.clone(),
            None => {
                report.files_without_digest += 1;
                continue;
            }
        };
        let mirror_path = repo.mapping().to_path(repo.mirror(), &entry.index);
        let content = match item.right.as_ref().filter(|_| use_increments) {
            Some(group) => reconstruct_file(&mirror_path, &group.increments, time, codec.as_ref(), &entry.index),
            None => fs::read(&mirror_path).map_err(RewindError::from),
        };
        report.files_checked += 1;
        match content {
            Ok(bytes) if hash_data(&bytes) == expected => {}
            Ok(_) => {
                warn!("Digest mismatch for {}", entry.index);
                report.mismatches.push(entry.index.to_string());
            }
            Err(e) => {
                warn!("Could not reconstruct {}: {}", entry.index, e);
                report.mismatches.push(entry.index.to_string());
            }
        }
    }
    debug!(
        "Verified {} files at {}, {} mismatches",
        report.files_checked,
        time,
        report.mismatches.len()
    );
    Ok(report)
}
