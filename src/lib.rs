//! # Rewind - Incremental reverse-delta backups
//!
//! Rewind keeps a plain mirror of a source directory tree and stores the
//! history behind it as reverse increments, so the newest state is always a
//! directly usable copy and older states are rebuilt on demand.
//!
//! ## Overview
//!
//! - **Backup** brings the mirror in line with the source and records, for
//!   every changed path, what it looked like before (a reverse diff, a full
//!   snapshot, or a marker)
//! - **Restore** rebuilds any committed session into a separate directory
//! - **Regress** rolls the mirror back after an interrupted backup, and is
//!   safe to interrupt and rerun itself
//! - **Compare** reports how a live tree differs from a committed session
//!
//! ## Architecture
//!
//! Every operation is a single ordered pass over the tree. Lazily produced,
//! index-ordered streams (a live scan, a metadata snapshot, the increments
//! tree) are aligned by the [`collate`] module and fed to a
//! [`reducer::TreeReducer`], which opens and closes one
//! [`reducer::Branch`] per directory so that directory metadata is fixed up
//! after the directory's children are done. The reducer's state is
//! serializable, which is what makes backup sessions resumable.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rewind::{BackupOptions, RestoreOptions, RewindBuilder};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let rewind = RewindBuilder::new()
//!     .exclude_patterns(vec!["target/".to_string()])
//!     .build(Path::new("/backups/project"))?;
//!
//! let stats = rewind.backup(Path::new("/home/user/project"), &BackupOptions::default())?;
//! println!("{} changed, {} new", stats.changed_entries, stats.new_entries);
//!
//! // Everything as it was two sessions ago
//! let then = rewind.resolve_time("2B")?;
//! rewind.restore(then, Path::new("/tmp/project-then"), &RestoreOptions::default())?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Recovering from an interrupted backup
//!
//! ```rust,no_run
//! # use rewind::Rewind;
//! # use rewind::storage::RepoState;
//! # use std::path::Path;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let rewind = Rewind::open(Path::new("/backups/project"))?;
//! if let RepoState::NeedsRegress { regress_time, .. } = rewind.state()? {
//!     rewind.regress(false)?;
//!     println!("Mirror is back at {}", regress_time);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Comparing a live tree
//!
//! ```rust,no_run
//! # use rewind::{CompareLevel, CompareOptions, Rewind};
//! # use std::path::Path;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let rewind = Rewind::open(Path::new("/backups/project"))?;
//! let options = CompareOptions { level: CompareLevel::Hash, ..Default::default() };
//! let now = rewind.resolve_time("now")?;
//! for report in rewind.compare(Path::new("/home/user/project"), now, &options)? {
//!     let report = report?;
//!     if report.is_difference() {
//!         println!("{} {}", report.status, report.index);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! ### Indices
//!
//! A path relative to the backup root is an [`Index`], a sequence of raw
//! name components. All streams are ordered by index, component-wise, so a
//! directory always comes right before its descendants.
//!
//! ### Increments
//!
//! An increment stamped `T` holds the state of one path that was current at
//! session `T` and was replaced by the following session. Reverse diffs are
//! applied newest first onto the mirror; a snapshot (or a directory or
//! missing marker) ends the chain.
//!
//! ### Commit protocol
//!
//! The `current_mirror.<T>.data` markers are the source of truth for which
//! session is current. Two markers mean a backup was interrupted; see
//! [`regress`].
//!
//! ## Error Handling
//!
//! All operations return `Result<T, RewindError>`. Per-file problems (a file
//! vanishing mid-scan, a permission error) are counted and skipped during
//! backup and restore; structural problems (corrupt metadata, broken
//! increment chains, impossible marker counts) abort the operation.
//!
//! ## Module Organization
//!
//! - [`rewind`]: the [`Rewind`] handle and [`RewindBuilder`]
//! - [`backup`], [`regress`], [`restore`], [`compare`]: the four engines
//! - [`collate`], [`reducer`]: stream alignment and tree reduction
//! - [`scan`], [`metadata`], [`increment`]: the three kinds of streams
//! - [`storage`], [`checkpoint`], [`timeline`]: repository bookkeeping
//! - [`entry`], [`index`], [`diff`], [`compression`]: building blocks
//! - [`types`], [`error`]: shared types

// Public API modules
pub mod backup;
pub mod checkpoint;
pub mod collate;
pub mod compare;
pub mod compression;
pub mod diff;
pub mod entry;
pub mod error;
pub mod increment;
pub mod index;
pub mod metadata;
pub mod reducer;
pub mod regress;
pub mod restore;
pub mod rewind;
pub mod scan;
pub mod storage;
pub mod timeline;
pub mod types;

// Internal modules (not part of public API)
mod utils;

// Re-export main types for convenience
pub use compare::{CompareReport, CompareStatus, Comparison};
pub use compression::{CompressionEngine, CompressionStrategy};
pub use diff::{DeltaCodec, RsyncCodec};
pub use entry::{Entry, EntryKind};
pub use error::{Result, RewindError};
pub use index::{Index, PathMapping};
pub use rewind::{Rewind, RewindBuilder};
pub use storage::{RepoState, Repository};
pub use timeline::{TimeSpec, Timeline};
pub use types::*;
