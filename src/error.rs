//! Error types for the Rewind library
//!
//! Errors fall into three families that callers treat differently:
//!
//! - **Per-file** errors ([`RewindError::is_per_file`]) concern a single path
//!   (a file vanished mid-scan, permission denied on one source file). Backup,
//!   restore and compare log them, count them and keep going.
//! - **Structural** errors ([`RewindError::is_structural`]) mean the repository
//!   cannot be trusted as-is: corrupt metadata, a broken increment chain, a
//!   marker count that makes no sense. They abort the whole operation.
//! - **Concurrency** errors ([`RewindError::is_concurrency`]) mean another
//!   process still owns the session being touched. They abort unless forced.

use crate::types::Timestamp;
use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the Rewind library
pub type Result<T> = std::result::Result<T, RewindError>;

/// Main error type for all Rewind operations
#[derive(Debug, Error)]
pub enum RewindError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Exclusion pattern could not be compiled
    #[error("Invalid exclude pattern: {0}")]
    InvalidPattern(String),

    /// No repository at the given mirror path
    #[error("Repository not initialized at path: {0:?}")]
    RepositoryNotInitialized(PathBuf),

    /// A repository already exists at the given mirror path
    #[error("Repository already exists at path: {0:?}")]
    RepositoryAlreadyExists(PathBuf),

    /// A metadata snapshot could not be parsed
    #[error("Corrupt metadata in {path:?} at line {line}: {reason}")]
    CorruptMetadata {
        /// Metadata file being read
        path: PathBuf,
        /// 1-based line number of the offending line
        line: usize,
        /// What was wrong with it
        reason: String,
    },

    /// The metadata snapshot for a session is missing
    #[error("No metadata snapshot for session {0}")]
    MissingMetadata(Timestamp),

    /// The data directory holds an impossible number of current-mirror markers
    #[error("Found {count} current-mirror markers; expected one (or two after an interrupted session)")]
    MarkerCount {
        /// Number of markers found
        count: usize,
    },

    /// Increment chain cannot produce the requested state
    #[error("Broken increment chain for {index}: {reason}")]
    BrokenChain {
        /// Path whose chain is broken
        index: String,
        /// What is missing
        reason: String,
    },

    /// Index arrived out of order under the strict ordering policy
    #[error("Out-of-order index {current} after {previous}")]
    OutOfOrder {
        /// Last index successfully processed
        previous: String,
        /// Offending index
        current: String,
    },

    /// Index is not inside the subtree the reducer was opened on
    #[error("Index {index} lies outside reduction root {root}")]
    IndexOutsideRoot {
        /// Root of the reduction
        root: String,
        /// Offending index
        index: String,
    },

    /// A previous session was interrupted and must be regressed first
    #[error("Previous session {unsuccessful_time} did not complete; repository must be regressed to {regress_time}")]
    NeedsRegress {
        /// Last fully committed session
        regress_time: Timestamp,
        /// Session that was interrupted
        unsuccessful_time: Timestamp,
    },

    /// Another process still owns the session
    #[error("Session {session_time} is still owned by process {pid} on host {hostname}")]
    SessionActive {
        /// Owning process id
        pid: u32,
        /// Host the owning process runs on
        hostname: String,
        /// Session being touched
        session_time: Timestamp,
    },

    /// Session time is not later than the current mirror time
    #[error("Session time {requested} is not later than current mirror time {current}")]
    InvalidSessionTime {
        /// Requested session time
        requested: Timestamp,
        /// Time of the current mirror
        current: Timestamp,
    },

    /// A time specification could not be parsed
    #[error("Invalid time specification: {0}")]
    InvalidTime(String),

    /// No session exists at or before the requested time
    #[error("No backup session at or before {0}")]
    NoSessionAt(String),

    /// Restore target exists and is not empty
    #[error("Restore target {0:?} exists and is not empty")]
    TargetNotEmpty(PathBuf),

    /// The repository has no sessions yet
    #[error("Repository has no backup sessions")]
    EmptyRepository,

    /// Session checkpoint unusable
    #[error("Invalid checkpoint: {0}")]
    InvalidCheckpoint(String),

    /// Compression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Delta codec errors
    #[error("Delta error: {0}")]
    Delta(String),

    /// A hook stopped the operation at a named step
    #[error("Interrupted at {0}")]
    Interrupted(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

// Implement conversions for bincode 2.0 error types
impl From<bincode::error::DecodeError> for RewindError {
    fn from(err: bincode::error::DecodeError) -> Self {
        RewindError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for RewindError {
    fn from(err: bincode::error::EncodeError) -> Self {
        RewindError::Bincode(err.to_string())
    }
}

impl From<nix::errno::Errno> for RewindError {
    fn from(err: nix::errno::Errno) -> Self {
        RewindError::Io(std::io::Error::from(err))
    }
}

impl From<globset::Error> for RewindError {
    fn from(err: globset::Error) -> Self {
        RewindError::InvalidPattern(err.to_string())
    }
}

impl RewindError {
    /// Create a broken-chain error for an index
    pub fn broken_chain(index: impl ToString, reason: impl Into<String>) -> Self {
        RewindError::BrokenChain {
            index: index.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a delta codec error with a custom message
    pub fn delta(msg: impl Into<String>) -> Self {
        RewindError::Delta(msg.into())
    }

    /// Create a compression error with a custom message
    pub fn compression(msg: impl Into<String>) -> Self {
        RewindError::Compression(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        RewindError::Internal(msg.into())
    }

    /// Check if this error concerns a single path and can be skipped
    pub fn is_per_file(&self) -> bool {
        match self {
            RewindError::Io(e) => is_per_file_io(e),
            RewindError::WalkDir(e) => e.io_error().map(is_per_file_io).unwrap_or(false),
            _ => false,
        }
    }

    /// Check if this error means the repository cannot be trusted as-is
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            RewindError::CorruptMetadata { .. }
                | RewindError::MissingMetadata(_)
                | RewindError::MarkerCount { .. }
                | RewindError::BrokenChain { .. }
                | RewindError::OutOfOrder { .. }
                | RewindError::IndexOutsideRoot { .. }
                | RewindError::InvalidCheckpoint(_)
        )
    }

    /// Check if this error was raised because another process owns the session
    pub fn is_concurrency(&self) -> bool {
        matches!(self, RewindError::SessionActive { .. })
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            RewindError::NeedsRegress { unsuccessful_time, .. } => format!(
                "{}. Run 'rewind regress' to roll back session {}, or back up with --resume to continue it.",
                self, unsuccessful_time
            ),
            RewindError::SessionActive { pid, .. } => format!(
                "{}. Wait for process {} to finish, or pass --force if it is gone.",
                self, pid
            ),
            RewindError::RepositoryNotInitialized(path) => {
                format!("No repository at {:?}. Run 'rewind backup <source> {}' first.", path, path.display())
            }
            RewindError::TargetNotEmpty(path) => {
                format!("Restore target {:?} is not empty. Pick an empty directory or pass --force.", path)
            }
            RewindError::MarkerCount { .. } | RewindError::MissingMetadata(_) => format!(
                "{}. The data directory has been modified outside rewind and needs manual repair.",
                self
            ),
            _ => self.to_string(),
        }
    }
}

fn is_per_file_io(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::NotFound | ErrorKind::PermissionDenied
    ) || err.raw_os_error() == Some(nix::libc::ELOOP)
}
