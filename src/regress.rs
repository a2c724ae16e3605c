//! Regression engine
//!
//! Rolls the mirror back to the last committed session after a backup was
//! interrupted. Two current-mirror markers are the trigger: the older one
//! (`regress_time`) names the state to return to, the newer one
//! (`unsuccessful_time`) the session to erase.
//!
//! The metadata snapshot at `regress_time` is the target. It is collated
//! with the live mirror and with every increment stamped at or after
//! `regress_time` (only the interrupted session writes those), and each path
//! is put back the way the snapshot describes it, using the increments to
//! rebuild content. Once a path is back, its increments are deleted.
//!
//! ## Crash safety
//!
//! A regular file is always rebuilt in this order:
//!
//! ```text
//! write temp sibling + fsync -> apply metadata -> rename over mirror
//!   -> fsync directory -> delete increments
//! ```
//!
//! Until the increments are gone a rerun can rebuild the same content, and
//! the rename guarantees the mirror path holds either the old or the new
//! file, never a partial one. The interrupted session's marker is deleted
//! last, after a full `sync()`, so a crash anywhere in here only causes
//! another (idempotent) regression.

use crate::collate::{collate2, Indexed, Pair};
use crate::diff::DeltaCodec;
use crate::entry::{make_dir_writable, remove_node, Entry};
use crate::error::{Result, RewindError};
use crate::increment::{Increment, IncrementGroup, IncrementStore};
use crate::index::{Index, PathMapping};
use crate::metadata::MetadataReader;
use crate::reducer::{Branch, OrderPolicy, TreeReducer};
use crate::restore::reconstruct_file;
use crate::scan::ScanOptions;
use crate::storage::{RepoState, Repository, DATA_DIR};
use crate::types::{Hooks, RegressResult, SessionStep, Timestamp};
use crate::utils::{self, hash_file_content};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, trace};

/// One aligned step of a regression pass
#[derive(Debug, Clone)]
pub struct RegressItem {
    /// Shared index
    pub index: Index,
    /// What the mirror holds now
    pub mirror: Option<Entry>,
    /// What it held at the regress time
    pub target: Option<Entry>,
    /// Increments written by the interrupted session
    pub increments: Vec<Increment>,
}

impl Indexed for RegressItem {
    fn index(&self) -> &Index {
        &self.index
    }
}

impl From<Pair<Pair<Entry, Entry>, IncrementGroup>> for RegressItem {
    fn from(pair: Pair<Pair<Entry, Entry>, IncrementGroup>) -> Self {
        let (mirror, target) = match pair.left {
            Some(inner) => (inner.left, inner.right),
            None => (None, None),
        };
        RegressItem {
            index: pair.index,
            mirror,
            target,
            increments: pair.right.map(|g| g.increments).unwrap_or_default(),
        }
    }
}

impl RegressItem {
    fn target_entry(&self) -> Entry {
        self.target
            .clone()
            .unwrap_or_else(|| Entry::absent(self.index.clone()))
    }

    fn is_dir_path(&self) -> bool {
        let dir = |e: &Option<Entry>| e.as_ref().map(Entry::is_dir).unwrap_or(false);
        dir(&self.mirror) || dir(&self.target)
    }
}

/// Everything a regression pass needs, passed explicitly
pub struct RegressContext {
    /// State being returned to
    pub regress_time: Timestamp,
    /// Session being erased
    pub unsuccessful_time: Timestamp,
    mirror_root: PathBuf,
    mapping: PathMapping,
    store: IncrementStore,
    codec: Arc<dyn DeltaCodec>,
    hooks: Hooks,
    fsync: bool,
    result: RegressResult,
}

impl RegressContext {
    fn mirror_path(&self, index: &Index) -> PathBuf {
        self.mapping.to_path(&self.mirror_root, index)
    }

    /// True if the mirror already holds the target state
    fn already_matches(&self, item: &RegressItem, target: &Entry) -> Result<bool> {
        let mirror = item
            .mirror
            .clone()
            .unwrap_or_else(|| Entry::absent(item.index.clone()));
        if !mirror.loose_eq(target) {
            return Ok(false);
        }
        if target.is_reg() && !item.increments.is_empty() {
            if let Some(expected) = &target.content_hash {
                return Ok(hash_file_content(&self.mirror_path(&item.index))? == *expected);
            }
        }
        Ok(true)
    }

    /// Put one non-directory path back, then drop its increments
    fn revert_leaf(&mut self, item: &RegressItem) -> Result<()> {
        let target = item.target_entry();
        let path = self.mirror_path(&item.index);

        if self.already_matches(item, &target)? {
            trace!("{} already at {}", item.index, self.regress_time);
        } else if target.is_reg() {
            let content = reconstruct_file(
                &path,
                &item.increments,
                self.regress_time,
                self.codec.as_ref(),
                &item.index,
            )?;
            let temp =
                utils::write_temp_sibling_with(&path, &content, self.fsync, |p| target.apply_to(p))?;
            if let Err(e) = self.hooks.fire(SessionStep::TempWritten, &item.index) {
                // Leave the temp file behind exactly as a kill would
                let _ = temp.keep();
                return Err(e);
            }
            if fs::symlink_metadata(&path).map(|m| m.is_dir()).unwrap_or(false) {
                remove_node(&path)?;
            }
            temp.persist(&path).map_err(|e| RewindError::Io(e.error))?;
            self.hooks.fire(SessionStep::Renamed, &item.index)?;
            if self.fsync {
                utils::fsync_parent(&path)?;
            }
            self.hooks.fire(SessionStep::DirSynced, &item.index)?;
            self.result.paths_reverted += 1;
            debug!("Rebuilt {} ({} bytes)", item.index, content.len());
        } else {
            remove_node(&path)?;
            if target.exists() {
                target.create_node(&path)?;
                target.apply_to(&path)?;
            }
            if self.fsync {
                utils::fsync_parent(&path)?;
            }
            self.result.paths_reverted += 1;
            debug!("Reset {} to {}", item.index, target.kind.as_str());
        }

        self.delete_increments(&item.index, &item.increments)
    }

    fn delete_increments(&mut self, index: &Index, increments: &[Increment]) -> Result<()> {
        for increment in increments {
            increment.remove()?;
            self.result.increments_deleted += 1;
            self.hooks.fire(SessionStep::IncrementDeleted, index)?;
        }
        Ok(())
    }
}

/// One open directory of a regression pass
pub struct RegressBranch {
    item: Option<RegressItem>,
    target_dir: bool,
}

impl Branch for RegressBranch {
    type Item = RegressItem;
    type Context = RegressContext;

    fn new(_ctx: &mut RegressContext) -> Self {
        RegressBranch {
            item: None,
            target_dir: false,
        }
    }

    fn start(&mut self, ctx: &mut RegressContext, item: RegressItem) -> Result<()> {
        if !item.is_dir_path() {
            ctx.revert_leaf(&item)?;
            return Ok(());
        }

        let path = ctx.mirror_path(&item.index);
        let mirror_dir = item.mirror.as_ref().map(Entry::is_dir).unwrap_or(false);
        self.target_dir = item.target.as_ref().map(Entry::is_dir).unwrap_or(false);
        if self.target_dir && !mirror_dir {
            remove_node(&path)?;
            fs::create_dir(&path)?;
            ctx.result.paths_reverted += 1;
            debug!("Recreated directory {}", item.index);
        }
        // Children need write access on the way down
        make_dir_writable(&path)?;
        self.item = Some(item);
        Ok(())
    }

    fn end(&mut self, ctx: &mut RegressContext) -> Result<()> {
        let item = match self.item.take() {
            Some(item) => item,
            None => return Ok(()),
        };
        let index = item.index.clone();
        let path = ctx.mirror_path(&index);

        if self.target_dir {
            let target = item.target_entry();
            let matched = item
                .mirror
                .as_ref()
                .map(|m| m.loose_eq(&target))
                .unwrap_or(false);
            target.apply_to(&path)?;
            if !matched {
                ctx.result.paths_reverted += 1;
            }
            ctx.delete_increments(&item.index, &item.increments)?;
        } else {
            // The directory did not exist at the regress time
            remove_node(&path)?;
            let leaf = RegressItem { mirror: None, ..item };
            ctx.revert_leaf(&leaf)?;
        }
        if !index.is_root() {
            utils::remove_dir_if_empty(&ctx.store.dir_for(&index))?;
        }
        Ok(())
    }

    fn branch_complete(&mut self, _ctx: &mut RegressContext, _child: Self) -> Result<()> {
        Ok(())
    }

    fn can_fast_process(&self, item: &RegressItem) -> bool {
        !item.is_dir_path()
    }

    fn fast_process(&mut self, ctx: &mut RegressContext, item: RegressItem) -> Result<()> {
        ctx.revert_leaf(&item)
    }
}

/// Roll an interrupted session back
///
/// Returns `None` when the repository is empty or already clean. Unless
/// `force` is set, refuses while the process that ran the interrupted
/// session is still alive.
#[instrument(skip(repo, codec, hooks), fields(mirror = ?repo.mirror()))]
pub fn regress(
    repo: &Repository,
    codec: Arc<dyn DeltaCodec>,
    hooks: &Hooks,
    force: bool,
) -> Result<Option<RegressResult>> {
    let (regress_time, unsuccessful_time) = match repo.state()? {
        RepoState::NeedsRegress {
            regress_time,
            unsuccessful_time,
        } => (regress_time, unsuccessful_time),
        state => {
            debug!("Nothing to regress: {:?}", state);
            return Ok(None);
        }
    };
    let started = Instant::now();
    repo.check_lock(unsuccessful_time, force)?;
    repo.write_lock(unsuccessful_time)?;
    info!(
        "Regressing mirror from interrupted session {} back to {}",
        unsuccessful_time, regress_time
    );

    let target = MetadataReader::open(&repo.require_metadata(regress_time)?)?;
    let mirror = ScanOptions::new()
        .mapping(repo.mapping().clone())
        .skip_root_name(DATA_DIR)
        .scan(repo.mirror())?;
    let store = repo.increment_store();
    let groups = store.stream(None)?.filter_map(move |group| match group {
        Ok(mut group) => {
            group.increments.retain(|inc| inc.time >= regress_time);
            if group.increments.is_empty() {
                None
            } else {
                Some(Ok(group))
            }
        }
        Err(e) => Some(Err(e)),
    });

    let mut ctx = RegressContext {
        regress_time,
        unsuccessful_time,
        mirror_root: repo.mirror().to_path_buf(),
        mapping: repo.mapping().clone(),
        store,
        codec,
        hooks: hooks.clone(),
        fsync: repo.config().fsync,
        result: RegressResult {
            regress_time,
            unsuccessful_time,
            paths_reverted: 0,
            increments_deleted: 0,
            session_files_removed: 0,
            duration_ms: 0,
        },
    };

    let policy = if repo.config().strict_ordering {
        OrderPolicy::Strict
    } else {
        OrderPolicy::Lenient
    };
    let mut reducer: TreeReducer<RegressBranch> = TreeReducer::new(policy);
    for item in collate2(collate2(mirror, target), groups) {
        reducer.process(&mut ctx, RegressItem::from(item?))?;
    }
    reducer.finish(&mut ctx)?;

    // Whatever else the interrupted session left in the data directory
    let marker = repo.marker_path(unsuccessful_time);
    let lock = repo.lock_path(unsuccessful_time);
    for file in repo.session_files(unsuccessful_time)? {
        if file == marker || file == lock {
            continue;
        }
        crate::storage::remove_if_exists(&file)?;
        ctx.result.session_files_removed += 1;
        trace!("Swept {:?}", file);
    }

    nix::unistd::sync();
    repo.remove_lock(unsuccessful_time)?;
    repo.sync_data_dir()?;
    // The marker goes last: until it is gone the repository still reads as
    // needing regress
    repo.remove_marker(unsuccessful_time)?;
    repo.sync_data_dir()?;

    let mut result = ctx.result;
    result.duration_ms = started.elapsed().as_millis() as u64;
    info!(
        "Regressed to {}: {} paths reverted, {} increments and {} session files removed",
        regress_time, result.paths_reverted, result.increments_deleted, result.session_files_removed
    );
    Ok(Some(result))
}
