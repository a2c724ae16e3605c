//! Core data types used throughout the Rewind library
//!
//! This module contains the small shared vocabulary that the engines pass
//! between each other.
//!
//! ## Overview
//!
//! - **Time**: [`Timestamp`] - session times and their on-disk spelling
//! - **Operations**: [`BackupOptions`], [`RestoreOptions`], [`CompareLevel`] - operation parameters
//! - **Results**: [`SessionStats`], [`RestoreResult`], [`RegressResult`], [`VerifyReport`]
//! - **Configuration**: [`RepoConfig`] - persisted repository settings
//! - **Hooks**: [`SessionHook`], [`Hooks`] - observation points inside crash-sensitive sequences
//!
//! ## Examples
//!
//! ```rust
//! use rewind::types::{BackupOptions, Timestamp};
//!
//! let options = BackupOptions {
//!     time: Some(Timestamp::from_secs(10_000)),
//!     exclude: vec!["**/*.tmp".to_string()],
//!     ..Default::default()
//! };
//! assert_eq!(options.time.unwrap().to_string(), "1970-01-01T02-46-40Z");
//! ```

use crate::compression::CompressionStrategy;
use crate::error::{Result, RewindError};
use crate::index::Index;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Format used for timestamps embedded in file names
const FILE_TIME_FORMAT: &str = "%Y-%m-%dT%H-%M-%SZ";

/// A session time, in whole seconds since the Unix epoch
///
/// Timestamps name every artifact of a session: the current-mirror marker,
/// the metadata snapshot and all increments. Their file-name spelling never
/// contains `.`, so it can sit between `.` separators without ambiguity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create a timestamp from seconds since the epoch
    pub fn from_secs(secs: i64) -> Self {
        Timestamp(secs)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        Timestamp(Utc::now().timestamp())
    }

    /// Seconds since the epoch
    pub fn as_secs(&self) -> i64 {
        self.0
    }

    /// The next representable timestamp
    pub fn next(&self) -> Self {
        Timestamp(self.0 + 1)
    }

    /// Convert to a chrono UTC datetime
    pub fn to_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.0, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Parse the file-name spelling produced by `Display`
    pub fn parse_file_form(s: &str) -> Option<Self> {
        NaiveDateTime::parse_from_str(s, FILE_TIME_FORMAT)
            .ok()
            .map(|naive| Timestamp(naive.and_utc().timestamp()))
    }

    /// Human readable RFC 3339 form
    pub fn to_rfc3339(&self) -> String {
        self.to_datetime().to_rfc3339()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format(FILE_TIME_FORMAT))
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Timestamp(dt.timestamp())
    }
}

/// Options for a backup session
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Session time; defaults to now
    pub time: Option<Timestamp>,
    /// Regress an interrupted previous session first instead of refusing
    pub force: bool,
    /// Continue an interrupted session from its checkpoint
    pub resume: bool,
    /// Extra exclusion globs for this session
    pub exclude: Vec<String>,
}

/// Options for a restore
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Restore only this subtree of the backed-up tree
    pub subtree: Option<Index>,
    /// Allow restoring into a non-empty target, replacing what is there
    pub force: bool,
}

/// Strictness of a comparison between a live tree and a stored state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareLevel {
    /// Loose metadata equality only
    #[default]
    Meta,
    /// Metadata plus SHA-256 of content when sizes match
    Hash,
    /// Metadata plus byte-for-byte content comparison
    Full,
}

/// Options for a comparison
#[derive(Debug, Clone, Default)]
pub struct CompareOptions {
    /// How closely to compare
    pub level: CompareLevel,
    /// Exclusion globs applied to both sides
    pub exclude: Vec<String>,
}

/// Statistics recorded for one backup session
///
/// Persisted as `session_statistics.<time>.json` when the session commits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Session time
    pub session_time: Option<Timestamp>,
    /// Time of the mirror this session replaced
    pub previous_time: Option<Timestamp>,
    /// Entries seen in the source tree
    pub source_entries: u64,
    /// Bytes in regular source files
    pub source_bytes: u64,
    /// Entries new in this session
    pub new_entries: u64,
    /// Entries whose metadata or type changed
    pub changed_entries: u64,
    /// Entries deleted since the previous session
    pub deleted_entries: u64,
    /// Entries found unchanged
    pub unchanged_entries: u64,
    /// Increment artifacts written
    pub increment_files: u64,
    /// Bytes of increment artifacts written
    pub increment_bytes: u64,
    /// Per-file errors skipped
    pub errors: u64,
    /// Whether the session was resumed from a checkpoint
    pub resumed: bool,
    /// Wall-clock duration in milliseconds
    pub elapsed_ms: u64,
}

/// Result of a restore operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreResult {
    /// Session time the restore resolved to
    pub restored_time: Option<Timestamp>,
    /// Regular files written
    pub files_restored: u64,
    /// Directories created
    pub directories_restored: u64,
    /// Symlinks and special files created
    pub other_restored: u64,
    /// Paths materialized as hard links to earlier paths
    pub hardlinks_restored: u64,
    /// Bytes of file content written
    pub bytes_written: u64,
    /// Per-file errors skipped
    pub errors: u64,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

/// Result of a regress operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegressResult {
    /// State the mirror was rolled back to
    pub regress_time: Timestamp,
    /// Interrupted session that was erased
    pub unsuccessful_time: Timestamp,
    /// Paths whose mirror state had to be rewritten
    pub paths_reverted: u64,
    /// Increment artifacts deleted
    pub increments_deleted: u64,
    /// Session files removed from the data directory
    pub session_files_removed: u64,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

/// Outcome of verifying stored content against metadata digests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Session verified
    pub time: Option<Timestamp>,
    /// Regular files checked
    pub files_checked: u64,
    /// Files without a recorded digest
    pub files_without_digest: u64,
    /// Paths whose reconstructed content did not match
    pub mismatches: Vec<String>,
}

impl VerifyReport {
    /// True when every checked file matched its digest
    pub fn is_valid(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Repository configuration, persisted as `repository.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    /// On-disk format version
    pub format_version: u32,
    /// Version of the crate that created the repository
    pub created_by: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Compression of increments and metadata snapshots
    pub compression: CompressionStrategy,
    /// Bytes quoted in mirror and increment file names, if any
    pub quote_chars: Option<String>,
    /// Exclusion globs applied to every backup
    pub exclude_patterns: Vec<String>,
    /// fsync files and directories at every durability point
    pub fsync: bool,
    /// Processed entries between session checkpoints
    pub checkpoint_interval: u64,
    /// Refuse out-of-order indices instead of skipping them
    pub strict_ordering: bool,
}

/// Current on-disk format version
pub const FORMAT_VERSION: u32 = 1;

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            created_by: env!("CARGO_PKG_VERSION").to_string(),
            created_at: Utc::now(),
            compression: CompressionStrategy::default(),
            quote_chars: None,
            exclude_patterns: Vec::new(),
            fsync: true,
            checkpoint_interval: 1000,
            strict_ordering: false,
        }
    }
}

/// Named points inside crash-sensitive sequences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStep {
    /// An increment artifact was written (backup)
    IncrementWritten,
    /// A mirror entry was replaced (backup)
    MirrorUpdated,
    /// A session checkpoint was persisted (backup)
    CheckpointWritten,
    /// Reconstructed content reached a temp file (regress)
    TempWritten,
    /// The temp file was renamed over the mirror entry (regress)
    Renamed,
    /// The containing directory was synced (regress)
    DirSynced,
    /// An obsolete increment was deleted (regress)
    IncrementDeleted,
}

impl fmt::Display for SessionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStep::IncrementWritten => "increment-written",
            SessionStep::MirrorUpdated => "mirror-updated",
            SessionStep::CheckpointWritten => "checkpoint-written",
            SessionStep::TempWritten => "temp-written",
            SessionStep::Renamed => "renamed",
            SessionStep::DirSynced => "dir-synced",
            SessionStep::IncrementDeleted => "increment-deleted",
        };
        f.write_str(name)
    }
}

/// Observer of session steps
///
/// Returning an error from [`SessionHook::on_step`] stops the running
/// operation right there, leaving the repository exactly as an abrupt kill
/// at that point would.
///
/// # Examples
///
/// ```rust
/// use rewind::types::{SessionHook, SessionStep};
/// use rewind::{Index, Result, RewindError};
///
/// struct StopAfterRename;
///
/// impl SessionHook for StopAfterRename {
///     fn on_step(&self, step: SessionStep, index: &Index) -> Result<()> {
///         if step == SessionStep::Renamed {
///             return Err(RewindError::Interrupted(format!("{} {}", step, index)));
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait SessionHook: Send + Sync {
    /// Called after `step` completed for `index`
    fn on_step(&self, step: SessionStep, index: &Index) -> Result<()> {
        let _ = (step, index);
        Ok(())
    }
}

/// Shared list of registered hooks
#[derive(Clone, Default)]
pub struct Hooks {
    inner: Arc<Mutex<Vec<Box<dyn SessionHook>>>>,
}

impl Hooks {
    /// Register a hook
    pub fn add(&self, hook: Box<dyn SessionHook>) {
        self.inner.lock().push(hook);
    }

    /// Remove every hook
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Number of registered hooks
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when no hook is registered
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Notify every hook; the first error wins
    pub fn fire(&self, step: SessionStep, index: &Index) -> Result<()> {
        for hook in self.inner.lock().iter() {
            hook.on_step(step, index)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks").field("count", &self.len()).finish()
    }
}

/// Parse a hook-style interruption back into its step name, if it is one
pub fn interrupted_step(err: &RewindError) -> Option<&str> {
    match err {
        RewindError::Interrupted(what) => what.split_whitespace().next(),
        _ => None,
    }
}
