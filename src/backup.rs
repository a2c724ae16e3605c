//! Backup orchestrator
//!
//! One backup session brings the mirror in line with the source tree and
//! records, for every path that changes, an increment describing the state
//! being replaced. Three streams are collated by index and fed through a
//! [`TreeReducer`]:
//!
//! ```text
//! source scan ─┐
//!              ├─ collate2 ─┐
//! mirror scan ─┘            ├─ collate2 ─> BackupItem ─> TreeReducer<BackupBranch>
//! previous metadata ────────┘
//! ```
//!
//! Change detection compares the source entry with the previous session's
//! metadata record, not with the mirror. The previous record is what the
//! mirror was known to hold when that session committed.
//!
//! ## Commit protocol
//!
//! 1. write the session lock, then the new current-mirror marker (fsynced;
//!    a first session has no previous state and writes it at step 5 instead)
//! 2. per path: write the increment, then replace the mirror entry through a
//!    temp file, then append the metadata record
//! 3. every `checkpoint_interval` items: sync the metadata snapshot and
//!    persist a [`SessionCheckpoint`]
//! 4. compress the metadata snapshot, write statistics
//! 5. remove the previous marker (the commit point), then the checkpoint and
//!    the lock
//!
//! A crash anywhere before step 5 leaves two markers behind, which the next
//! run either regresses or resumes from the checkpoint.

use crate::checkpoint::SessionCheckpoint;
use crate::collate::{collate2, Indexed, Pair};
use crate::compression::CompressionEngine;
use crate::diff::DeltaCodec;
use crate::entry::{make_dir_writable, remove_node, Entry};
use crate::error::{Result, RewindError};
use crate::increment::{Increment, IncrementWriter};
use crate::index::{Index, PathMapping};
use crate::metadata::{MetadataReader, MetadataWriter};
use crate::reducer::{Branch, OrderPolicy, TreeReducer};
use crate::regress;
use crate::scan::{ExcludeSet, ScanOptions, TEMP_PREFIX};
use crate::storage::{RepoState, Repository, DATA_DIR};
use crate::types::{BackupOptions, Hooks, SessionStats, SessionStep, Timestamp};
use crate::utils::{self, hash_data, hash_file_content};
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

/// One aligned step of a backup pass
#[derive(Debug, Clone)]
pub struct BackupItem {
    /// Shared index
    pub index: Index,
    /// Live source entry
    pub source: Option<Entry>,
    /// Current mirror entry
    pub mirror: Option<Entry>,
    /// Record from the previous session's metadata
    pub previous: Option<Entry>,
}

impl Indexed for BackupItem {
    fn index(&self) -> &Index {
        &self.index
    }
}

impl From<Pair<Pair<Entry, Entry>, Entry>> for BackupItem {
    fn from(pair: Pair<Pair<Entry, Entry>, Entry>) -> Self {
        let (source, mirror) = match pair.left {
            Some(inner) => (inner.left, inner.right),
            None => (None, None),
        };
        BackupItem {
            index: pair.index,
            source,
            mirror,
            previous: pair.right,
        }
    }
}

impl BackupItem {
    fn any_dir(&self) -> bool {
        [&self.source, &self.mirror, &self.previous]
            .iter()
            .any(|e| e.as_ref().map(Entry::is_dir).unwrap_or(false))
    }

    /// State the mirror held before this session touched it
    fn prior(&self) -> Entry {
        match (&self.mirror, &self.previous) {
            (None, _) => Entry::absent(self.index.clone()),
            (Some(m), Some(p)) if m.kind == p.kind => p.clone(),
            (Some(m), _) => m.clone(),
        }
    }

    /// True if the mirror still holds what the previous session recorded
    fn mirror_untouched(&self) -> bool {
        match (&self.mirror, &self.previous) {
            (Some(m), Some(p)) => m.loose_eq(p),
            (None, None) => true,
            _ => false,
        }
    }
}

/// Shared state of a backup session
pub struct BackupContext {
    source_root: PathBuf,
    mirror_root: PathBuf,
    mapping: PathMapping,
    previous_time: Option<Timestamp>,
    writer: IncrementWriter,
    codec: Arc<dyn DeltaCodec>,
    metadata: MetadataWriter,
    stats: SessionStats,
    hooks: Hooks,
    fsync: bool,
    resuming: bool,
}

impl BackupContext {
    fn source_path(&self, index: &Index) -> PathBuf {
        self.source_root.join(index.to_path())
    }

    fn mirror_path(&self, index: &Index) -> PathBuf {
        self.mapping.to_path(&self.mirror_root, index)
    }

    fn count_source(&mut self, item: &BackupItem) {
        if item.index.is_root() {
            return;
        }
        if let Some(source) = &item.source {
            self.stats.source_entries += 1;
            if source.is_reg() {
                self.stats.source_bytes += source.size;
            }
        }
    }

    fn count_change(&mut self, current: &Entry, prior: &Entry) {
        if !current.exists() {
            self.stats.deleted_entries += 1;
        } else if !prior.exists() {
            self.stats.new_entries += 1;
        } else {
            self.stats.changed_entries += 1;
        }
    }

    fn per_file_error(&mut self, index: &Index, err: RewindError) -> Result<()> {
        if err.is_per_file() {
            warn!("Skipping {}: {}", index, err);
            self.stats.errors += 1;
            Ok(())
        } else {
            Err(err)
        }
    }

    /// Write the increment recording `prior`, reconciling leftovers of an
    /// interrupted run first
    fn write_increment(
        &mut self,
        item: &BackupItem,
        current: &Entry,
        prior: &Entry,
        current_content: Option<&[u8]>,
        prior_content: Option<&[u8]>,
    ) -> Result<Option<Increment>> {
        let time = match self.previous_time {
            Some(time) if !item.index.is_root() => time,
            _ => return Ok(None),
        };

        if self.resuming {
            if let Some(stale) = self.writer.store().find_at(&item.index, time)? {
                if item.mirror_untouched() {
                    debug!("Replacing increment left by the interrupted run for {}", item.index);
                    stale.remove()?;
                } else {
                    // The mirror already moved on; the leftover is the only record of `prior`
                    if stale.is_diff() {
                        let basis = prior_content.ok_or_else(|| {
                            RewindError::broken_chain(&item.index, "diff left without a mirror file")
                        })?;
                        let delta = stale.read_content()?;
                        let old = self.codec.patch(basis, &delta)?;
                        self.writer.diff_to_snapshot(&stale, prior, &old)?;
                    }
                    debug!("Keeping increment left by the interrupted run for {}", item.index);
                    return Ok(None);
                }
            }
        }

        let written = self
            .writer
            .decide_and_write(current, prior, current_content, prior_content, time)?;
        if written.is_some() {
            self.hooks.fire(SessionStep::IncrementWritten, &item.index)?;
        }
        Ok(written)
    }

    /// Make the mirror entry at `entry.index` match `entry`
    fn install(&mut self, entry: &Entry, content: Option<&[u8]>) -> Result<()> {
        let path = self.mirror_path(&entry.index);
        if entry.is_reg() {
            let bytes = content.ok_or_else(|| {
                RewindError::internal(format!("no content supplied for {}", entry.index))
            })?;
            if fs::symlink_metadata(&path).map(|m| m.is_dir()).unwrap_or(false) {
                remove_node(&path)?;
            }
            let temp = utils::write_temp_sibling_with(&path, bytes, self.fsync, |p| entry.apply_to(p))?;
            temp.persist(&path).map_err(|e| RewindError::Io(e.error))?;
        } else if entry.is_dir() {
            match fs::symlink_metadata(&path) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => {
                    remove_node(&path)?;
                    fs::create_dir(&path)?;
                }
                Err(_) => fs::create_dir(&path)?,
            }
            make_dir_writable(&path)?;
        } else {
            remove_node(&path)?;
            if entry.exists() {
                entry.create_node(&path)?;
                entry.apply_to(&path)?;
            }
        }
        if self.fsync && !entry.index.is_root() {
            utils::fsync_parent(&path)?;
        }
        trace!("Installed {} at {:?}", entry.index, path);
        Ok(())
    }

    fn record(&mut self, entry: &Entry) -> Result<()> {
        self.metadata.write(entry)
    }

    /// Digest for an unchanged regular file
    fn carried_hash(&self, item: &BackupItem, source: &Entry) -> Result<Option<String>> {
        if !source.is_reg() {
            return Ok(None);
        }
        if let Some(previous) = &item.previous {
            if previous.loose_eq(source) && previous.content_hash.is_some() {
                return Ok(previous.content_hash.clone());
            }
        }
        Ok(Some(hash_file_content(&self.mirror_path(&source.index))?))
    }

    /// Handle an item that needs no branch of its own
    ///
    /// With `fallback` set, a per-file failure keeps the previous record so
    /// the metadata still describes what the mirror holds.
    fn process_leaf(&mut self, item: BackupItem, fallback: bool) -> Result<()> {
        self.count_source(&item);

        if item.source.is_none() && item.previous.is_none() && is_temp_name(&item.index) {
            debug!("Removing leftover temp file {}", item.index);
            return remove_node(&self.mirror_path(&item.index));
        }
        if item.source.is_none() && item.mirror.is_none() {
            return Ok(());
        }

        let current = item
            .source
            .clone()
            .unwrap_or_else(|| Entry::absent(item.index.clone()));
        let prior = item.prior();

        if current.loose_eq(&prior) {
            let outcome = self.carried_hash(&item, &current);
            return match outcome {
                Ok(hash) => {
                    self.stats.unchanged_entries += 1;
                    self.record(&current.with_hash(hash))
                }
                Err(e) => {
                    self.per_file_error(&item.index, e)?;
                    self.record_fallback(&item, fallback)
                }
            };
        }

        match self.update_leaf(&item, &current, &prior) {
            Ok(()) => {
                self.count_change(&current, &prior);
                Ok(())
            }
            Err(e) => {
                self.per_file_error(&item.index, e)?;
                self.record_fallback(&item, fallback)
            }
        }
    }

    fn update_leaf(&mut self, item: &BackupItem, current: &Entry, prior: &Entry) -> Result<()> {
        let current_content = if current.is_reg() {
            Some(fs::read(self.source_path(&item.index))?)
        } else {
            None
        };
        let prior_content = if prior.is_reg() {
            Some(fs::read(self.mirror_path(&item.index))?)
        } else {
            None
        };

        let increment = self.write_increment(
            item,
            current,
            prior,
            current_content.as_deref(),
            prior_content.as_deref(),
        )?;
        if let Err(e) = self.install(current, current_content.as_deref()) {
            if let Some(increment) = &increment {
                increment.remove()?;
            }
            return Err(e);
        }
        self.hooks.fire(SessionStep::MirrorUpdated, &item.index)?;

        if current.exists() {
            let hash = current_content.as_deref().map(hash_data);
            self.record(&current.clone().with_hash(hash))?;
        }
        trace!("Updated {}", item.index);
        Ok(())
    }

    fn record_fallback(&mut self, item: &BackupItem, fallback: bool) -> Result<()> {
        if !fallback {
            return Ok(());
        }
        match (&item.mirror, &item.previous) {
            (Some(_), Some(previous)) => {
                let previous = previous.clone();
                self.record(&previous)
            }
            _ => Ok(()),
        }
    }

    /// Enter a path that is a directory in the source or the mirror
    fn open_dir(&mut self, item: &BackupItem, branch: &mut BackupBranch) -> Result<()> {
        let current = item
            .source
            .clone()
            .unwrap_or_else(|| Entry::absent(item.index.clone()));
        let prior = item.prior();

        if current.is_dir() {
            let unchanged = current.loose_eq(&prior);
            if !unchanged {
                let prior_content = if prior.is_reg() {
                    Some(fs::read(self.mirror_path(&item.index))?)
                } else {
                    None
                };
                self.write_increment(item, &current, &prior, None, prior_content.as_deref())?;
            }
            let existed = item.mirror.as_ref().map(Entry::is_dir).unwrap_or(false);
            self.install(&current, None)?;
            if !existed {
                self.hooks.fire(SessionStep::MirrorUpdated, &item.index)?;
            }
            self.record(&current)?;
            if item.index.is_root() {
                // never counted
            } else if unchanged {
                self.stats.unchanged_entries += 1;
            } else {
                self.count_change(&current, &prior);
            }
            branch.dir = Some(current);
        } else {
            // A mirror directory is going away; its children are deleted first
            let content = if current.is_reg() {
                Some(fs::read(self.source_path(&item.index))?)
            } else {
                None
            };
            self.write_increment(item, &current, &prior, None, None)?;
            make_dir_writable(&self.mirror_path(&item.index))?;
            if current.exists() {
                let hash = content.as_deref().map(hash_data);
                self.record(&current.clone().with_hash(hash))?;
            }
            self.count_change(&current, &prior);
            branch.replace = Some(Replacement { entry: current, content });
        }
        Ok(())
    }
}

fn is_temp_name(index: &Index) -> bool {
    index
        .file_name()
        .map(|n| n.as_bytes().starts_with(TEMP_PREFIX.as_bytes()))
        .unwrap_or(false)
}

/// Non-directory state replacing a mirror directory
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Replacement {
    entry: Entry,
    content: Option<Vec<u8>>,
}

/// One open directory of a backup session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupBranch {
    dir: Option<Entry>,
    replace: Option<Replacement>,
    failed: bool,
}

impl Branch for BackupBranch {
    type Item = BackupItem;
    type Context = BackupContext;

    fn new(_ctx: &mut BackupContext) -> Self {
        BackupBranch::default()
    }

    fn start(&mut self, ctx: &mut BackupContext, item: BackupItem) -> Result<()> {
        let source_dir = item.source.as_ref().map(Entry::is_dir).unwrap_or(false);
        let mirror_dir = item.mirror.as_ref().map(Entry::is_dir).unwrap_or(false);
        if !source_dir && !mirror_dir {
            return ctx.process_leaf(item, true);
        }

        ctx.count_source(&item);
        match ctx.open_dir(&item, self) {
            Ok(()) => Ok(()),
            Err(e) => {
                ctx.per_file_error(&item.index, e)?;
                self.failed = true;
                self.dir = None;
                self.replace = None;
                ctx.record_fallback(&item, true)
            }
        }
    }

    fn end(&mut self, ctx: &mut BackupContext) -> Result<()> {
        if self.failed {
            return Ok(());
        }
        if let Some(dir) = self.dir.take() {
            let path = ctx.mirror_path(&dir.index);
            if let Err(e) = dir.apply_to(&path) {
                ctx.per_file_error(&dir.index, e)?;
            }
        }
        if let Some(replacement) = self.replace.take() {
            let index = replacement.entry.index.clone();
            let outcome = remove_node(&ctx.mirror_path(&index))
                .and_then(|_| ctx.install(&replacement.entry, replacement.content.as_deref()));
            match outcome {
                Ok(()) => ctx.hooks.fire(SessionStep::MirrorUpdated, &index)?,
                Err(e) => ctx.per_file_error(&index, e)?,
            }
        }
        Ok(())
    }

    fn branch_complete(&mut self, _ctx: &mut BackupContext, _child: Self) -> Result<()> {
        Ok(())
    }

    fn can_fast_process(&self, item: &BackupItem) -> bool {
        self.failed || !item.any_dir()
    }

    fn fast_process(&mut self, ctx: &mut BackupContext, item: BackupItem) -> Result<()> {
        if self.failed {
            // Below a directory that could not be opened the mirror is left alone
            ctx.count_source(&item);
            return ctx.record_fallback(&item, true);
        }
        let fallback = self.replace.is_none();
        ctx.process_leaf(item, fallback)
    }
}

/// Everything a checkpoint needs beyond the shared fields
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupState {
    reducer: TreeReducer<BackupBranch>,
    metadata_last: Option<Index>,
}

/// Run one backup session of `source` into `repo`
#[instrument(skip(repo, codec, hooks, options), fields(mirror = ?repo.mirror()))]
pub fn backup(
    repo: &Repository,
    codec: Arc<dyn DeltaCodec>,
    hooks: &Hooks,
    source: &Path,
    options: &BackupOptions,
) -> Result<SessionStats> {
    let meta = fs::metadata(source)?;
    if !meta.is_dir() {
        return Err(RewindError::InvalidConfiguration(format!(
            "source {:?} is not a directory",
            source
        )));
    }

    let previous_time = match repo.state()? {
        RepoState::Empty => {
            for leftover in repo.recorded_times()? {
                repo.check_lock(leftover, options.force)?;
                repo.discard_session(leftover)?;
            }
            None
        }
        RepoState::Clean { current } => Some(current),
        RepoState::NeedsRegress {
            regress_time,
            unsuccessful_time,
        } => {
            let checkpoint = repo.checkpoint_path(unsuccessful_time);
            if options.resume && checkpoint.exists() {
                repo.check_lock(unsuccessful_time, options.force)?;
                return resume(repo, codec, hooks, source, options, unsuccessful_time);
            }
            if !options.force {
                return Err(RewindError::NeedsRegress {
                    regress_time,
                    unsuccessful_time,
                });
            }
            info!("Regressing interrupted session {} before backing up", unsuccessful_time);
            regress::regress(repo, codec.clone(), hooks, true)?;
            Some(regress_time)
        }
    };
    if options.resume {
        info!("No interrupted session to resume; starting a new one");
    }

    let session_time = options.time.unwrap_or_else(Timestamp::now);
    if let Some(current) = previous_time {
        if session_time <= current {
            return Err(RewindError::InvalidSessionTime {
                requested: session_time,
                current,
            });
        }
    }

    repo.write_lock(session_time)?;
    if previous_time.is_some() {
        repo.write_marker(session_time)?;
    }
    info!(
        "Starting session {} (previous {:?}) from {:?}",
        session_time, previous_time, source
    );

    let metadata = MetadataWriter::create(&repo.metadata_path(session_time))?;
    let stats = SessionStats {
        session_time: Some(session_time),
        previous_time,
        ..Default::default()
    };
    let session = Session {
        repo,
        codec,
        hooks,
        source,
        options,
        session_time,
        previous_time,
    };
    let state = BackupState {
        reducer: TreeReducer::new(session.order_policy()),
        metadata_last: None,
    };
    session.run(state, metadata, stats, false)
}

/// Continue the interrupted session `session_time` from its checkpoint
fn resume(
    repo: &Repository,
    codec: Arc<dyn DeltaCodec>,
    hooks: &Hooks,
    source: &Path,
    options: &BackupOptions,
    session_time: Timestamp,
) -> Result<SessionStats> {
    let checkpoint: SessionCheckpoint<BackupState> =
        SessionCheckpoint::load(&repo.checkpoint_path(session_time))?;
    if checkpoint.session_time != session_time {
        return Err(RewindError::InvalidCheckpoint(format!(
            "checkpoint belongs to session {}, not {}",
            checkpoint.session_time, session_time
        )));
    }
    if let Some(requested) = options.time {
        if requested != session_time {
            warn!("Ignoring requested time {}; resuming session {}", requested, session_time);
        }
    }
    repo.write_lock(session_time)?;
    info!(
        "Resuming session {} after {:?}",
        session_time,
        checkpoint.last_index.as_ref().map(|i| i.to_string())
    );

    let session = Session {
        repo,
        codec,
        hooks,
        source,
        options,
        session_time,
        previous_time: checkpoint.previous_time,
    };

    let plain = repo.metadata_path(session_time);
    if !plain.exists() && repo.find_metadata(session_time).is_some() {
        // The snapshot was already finalized; only the commit tail is missing
        let mut stats = checkpoint.stats;
        stats.resumed = true;
        return session.commit(stats, None);
    }

    let metadata = MetadataWriter::resume(
        &plain,
        checkpoint.metadata_len,
        checkpoint.metadata_records,
        checkpoint.state.metadata_last.clone(),
    )?;
    let mut stats = checkpoint.stats;
    stats.resumed = true;
    session.run(checkpoint.state, metadata, stats, true)
}

struct Session<'a> {
    repo: &'a Repository,
    codec: Arc<dyn DeltaCodec>,
    hooks: &'a Hooks,
    source: &'a Path,
    options: &'a BackupOptions,
    session_time: Timestamp,
    previous_time: Option<Timestamp>,
}

impl<'a> Session<'a> {
    fn order_policy(&self) -> OrderPolicy {
        if self.repo.config().strict_ordering {
            OrderPolicy::Strict
        } else {
            OrderPolicy::Lenient
        }
    }

    fn previous_metadata(&self, after: Option<&Index>) -> Result<Box<dyn Iterator<Item = Result<Entry>>>> {
        let time = match self.previous_time {
            Some(time) => time,
            None => return Ok(Box::new(std::iter::empty())),
        };
        let mut reader = MetadataReader::open(&self.repo.require_metadata(time)?)?;
        if let Some(after) = after {
            reader.skip_through(after)?;
        }
        Ok(Box::new(reader))
    }

    fn run(
        &self,
        state: BackupState,
        metadata: MetadataWriter,
        stats: SessionStats,
        resuming: bool,
    ) -> Result<SessionStats> {
        let started = Instant::now();
        let config = self.repo.config();
        let mut patterns = config.exclude_patterns.clone();
        patterns.extend(self.options.exclude.iter().cloned());
        let excludes = ExcludeSet::new(&patterns)?;
        let scan_errors = Arc::new(AtomicU64::new(0));
        let resume_after = state.reducer.last_index().cloned();

        let source_scan = ScanOptions::new()
            .excludes(excludes)
            .skip_root_name(DATA_DIR)
            .resume_after(resume_after.clone())
            .error_counter(scan_errors.clone())
            .scan(self.source)?;
        let mirror_scan = ScanOptions::new()
            .mapping(self.repo.mapping().clone())
            .skip_root_name(DATA_DIR)
            .resume_after(resume_after.clone())
            .error_counter(scan_errors.clone())
            .scan(self.repo.mirror())?;
        let previous = self.previous_metadata(resume_after.as_ref())?;

        let writer = IncrementWriter::new(
            self.repo.increment_store(),
            self.codec.clone(),
            CompressionEngine::new(config.compression.clone()),
        );
        let mut ctx = BackupContext {
            source_root: self.source.to_path_buf(),
            mirror_root: self.repo.mirror().to_path_buf(),
            mapping: self.repo.mapping().clone(),
            previous_time: self.previous_time,
            writer,
            codec: self.codec.clone(),
            metadata,
            stats,
            hooks: self.hooks.clone(),
            fsync: config.fsync,
            resuming,
        };

        let mut reducer = state.reducer;
        let interval = config.checkpoint_interval.max(1);
        let items = collate2(collate2(source_scan, mirror_scan), previous).map(|r| r.map(BackupItem::from));

        for item in items {
            let outcome = item.and_then(|item| reducer.process(&mut ctx, item));
            match outcome {
                Ok(true) => {
                    if reducer.processed() % interval == 0 {
                        self.checkpoint(&mut ctx, &reducer)?;
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    if !matches!(e, RewindError::Interrupted(_)) {
                        if let Err(cp) = self.checkpoint(&mut ctx, &reducer) {
                            warn!("Could not write final checkpoint: {}", cp);
                        }
                    }
                    return Err(e);
                }
            }
        }
        reducer.finish(&mut ctx)?;

        let mut stats = ctx.stats;
        stats.errors += scan_errors.load(Ordering::Relaxed);
        stats.increment_files += ctx.writer.files_written();
        stats.increment_bytes += ctx.writer.bytes_written();
        stats.elapsed_ms += started.elapsed().as_millis() as u64;
        self.commit(stats, Some(ctx.metadata))
    }

    fn checkpoint(&self, ctx: &mut BackupContext, reducer: &TreeReducer<BackupBranch>) -> Result<()> {
        let metadata_len = ctx.metadata.sync()?;
        let mut stats = ctx.stats.clone();
        stats.increment_files += ctx.writer.files_written();
        stats.increment_bytes += ctx.writer.bytes_written();
        let checkpoint = SessionCheckpoint {
            session_time: self.session_time,
            previous_time: self.previous_time,
            metadata_len,
            metadata_records: ctx.metadata.records(),
            last_index: reducer.last_index().cloned(),
            stats,
            state: BackupState {
                reducer: reducer.clone(),
                metadata_last: ctx.metadata.last_index().cloned(),
            },
        };
        checkpoint.save(&self.repo.checkpoint_path(self.session_time), ctx.fsync)?;
        let at = reducer.last_index().cloned().unwrap_or_else(Index::root);
        ctx.hooks.fire(SessionStep::CheckpointWritten, &at)?;
        Ok(())
    }

    /// Finalize the snapshot and make the session current
    fn commit(&self, stats: SessionStats, metadata: Option<MetadataWriter>) -> Result<SessionStats> {
        if let Some(metadata) = metadata {
            if self.repo.config().compression.is_enabled() {
                metadata.finish_compressed()?;
            } else {
                metadata.finish()?;
            }
        }
        match self.previous_time {
            Some(previous) => {
                self.repo.write_stats(&stats)?;
                self.repo.remove_marker(previous)?;
            }
            None => {
                self.repo.write_marker(self.session_time)?;
                self.repo.write_stats(&stats)?;
            }
        }
        crate::storage::remove_if_exists(&self.repo.checkpoint_path(self.session_time))?;
        self.repo.remove_lock(self.session_time)?;
        self.repo.sync_data_dir()?;
        info!(
            "Session {} committed: {} new, {} changed, {} deleted, {} unchanged, {} errors",
            self.session_time,
            stats.new_entries,
            stats.changed_entries,
            stats.deleted_entries,
            stats.unchanged_entries,
            stats.errors
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::RsyncCodec;
    use crate::types::RepoConfig;
    use filetime::FileTime;
    use tempfile::TempDir;

    fn codec() -> Arc<dyn DeltaCodec> {
        Arc::new(RsyncCodec::default())
    }

    fn touch(path: &Path, content: &[u8], mtime: i64) {
        fs::write(path, content).unwrap();
        filetime::set_file_mtime(path, FileTime::from_unix_time(mtime, 0)).unwrap();
    }

    fn run(repo: &Repository, source: &Path, secs: i64) -> SessionStats {
        let options = BackupOptions {
            time: Some(Timestamp::from_secs(secs)),
            ..Default::default()
        };
        backup(repo, codec(), &Hooks::default(), source, &options).unwrap()
    }

    #[test]
    fn test_first_session_mirrors_without_increments() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        fs::create_dir_all(source.join("sub")).unwrap();
        touch(&source.join("a.txt"), b"alpha", 100);
        touch(&source.join("sub/b.txt"), b"beta", 100);
        std::os::unix::fs::symlink("a.txt", source.join("link")).unwrap();

        let repo = Repository::init(&dir.path().join("mirror"), RepoConfig::default()).unwrap();
        let stats = run(&repo, &source, 10_000);

        assert_eq!(stats.new_entries, 4);
        assert_eq!(stats.increment_files, 0);
        assert_eq!(fs::read(repo.mirror().join("sub/b.txt")).unwrap(), b"beta");
        assert_eq!(fs::read_link(repo.mirror().join("link")).unwrap(), Path::new("a.txt"));
        assert_eq!(repo.state().unwrap(), RepoState::Clean { current: Timestamp::from_secs(10_000) });
        assert!(!repo.checkpoint_path(Timestamp::from_secs(10_000)).exists());
        assert!(repo.read_stats(Timestamp::from_secs(10_000)).unwrap().is_some());
    }

    #[test]
    fn test_second_session_writes_reverse_increments() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        fs::create_dir_all(&source).unwrap();
        touch(&source.join("keep.txt"), b"same", 100);
        touch(&source.join("edit.txt"), b"before edit", 100);
        touch(&source.join("gone.txt"), b"deleted later", 100);

        let repo = Repository::init(&dir.path().join("mirror"), RepoConfig::default()).unwrap();
        run(&repo, &source, 10_000);

        touch(&source.join("edit.txt"), b"after the edit", 200);
        fs::remove_file(source.join("gone.txt")).unwrap();
        touch(&source.join("new.txt"), b"brand new", 200);
        let stats = run(&repo, &source, 20_000);

        assert_eq!(stats.changed_entries, 1);
        assert_eq!(stats.deleted_entries, 1);
        assert_eq!(stats.new_entries, 1);
        assert_eq!(stats.unchanged_entries, 1);
        assert_eq!(stats.increment_files, 3);

        let store = repo.increment_store();
        let t1 = Timestamp::from_secs(10_000);
        let kind = |name: &str| store.find_at(&Index::from_components([name]), t1).unwrap().map(|i| i.kind);
        use crate::increment::IncrementKind;
        assert_eq!(kind("edit.txt"), Some(IncrementKind::Diff));
        assert_eq!(kind("gone.txt"), Some(IncrementKind::Snapshot));
        assert_eq!(kind("new.txt"), Some(IncrementKind::Missing));
        assert_eq!(kind("keep.txt"), None);

        assert!(!repo.mirror().join("gone.txt").exists());
        assert_eq!(fs::read(repo.mirror().join("edit.txt")).unwrap(), b"after the edit");
        assert_eq!(repo.markers().unwrap(), vec![Timestamp::from_secs(20_000)]);
    }

    #[test]
    fn test_directory_replaced_by_file() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        fs::create_dir_all(source.join("thing")).unwrap();
        touch(&source.join("thing/inner.txt"), b"inner", 100);

        let repo = Repository::init(&dir.path().join("mirror"), RepoConfig::default()).unwrap();
        run(&repo, &source, 10_000);

        fs::remove_dir_all(source.join("thing")).unwrap();
        touch(&source.join("thing"), b"now a file", 200);
        run(&repo, &source, 20_000);

        let mirror_thing = repo.mirror().join("thing");
        assert!(mirror_thing.is_file());
        assert_eq!(fs::read(&mirror_thing).unwrap(), b"now a file");
        let store = repo.increment_store();
        let t1 = Timestamp::from_secs(10_000);
        assert!(store.find_at(&Index::from_components(["thing"]), t1).unwrap().is_some());
        assert!(store
            .find_at(&Index::from_components(["thing", "inner.txt"]), t1)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_session_time_must_increase() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        fs::create_dir_all(&source).unwrap();
        let repo = Repository::init(&dir.path().join("mirror"), RepoConfig::default()).unwrap();
        run(&repo, &source, 10_000);

        let options = BackupOptions {
            time: Some(Timestamp::from_secs(10_000)),
            ..Default::default()
        };
        let err = backup(&repo, codec(), &Hooks::default(), &source, &options).unwrap_err();
        assert!(matches!(err, RewindError::InvalidSessionTime { .. }));
    }

    #[test]
    fn test_excluded_paths_are_not_mirrored() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        fs::create_dir_all(source.join("target")).unwrap();
        touch(&source.join("target/out.o"), b"obj", 100);
        touch(&source.join("main.rs"), b"fn main() {}", 100);
        let repo = Repository::init(&dir.path().join("mirror"), RepoConfig::default()).unwrap();
        let options = BackupOptions {
            time: Some(Timestamp::from_secs(10_000)),
            exclude: vec!["target/".to_string()],
            ..Default::default()
        };
        backup(&repo, codec(), &Hooks::default(), &source, &options).unwrap();
        assert!(repo.mirror().join("main.rs").exists());
        assert!(!repo.mirror().join("target").exists());
    }
}
