//! Backup history
//!
//! The timeline is the ordered list of committed session times of a
//! repository. It resolves user time specifications to the session that was
//! current at that time, and produces the listings behind
//! `list-sessions` and `list-increments`.
//!
//! ## Time specifications
//!
//! | Spelling | Meaning |
//! |---|---|
//! | `now` | the current mirror |
//! | `10000` | seconds since the epoch |
//! | `2024-03-01T12:00:00Z` | RFC 3339 |
//! | `3days`, `2h 30m` | that long ago |
//! | `2B` | two sessions before the current one |
//!
//! A time resolves to the latest session at or before it.
//!
//! ## Examples
//!
//! ```rust
//! use rewind::timeline::{TimeSpec, Timeline};
//! use rewind::types::Timestamp;
//!
//! let timeline = Timeline::from_sessions(vec![
//!     Timestamp::from_secs(10_000),
//!     Timestamp::from_secs(20_000),
//! ]);
//! let spec: TimeSpec = "15000".parse().unwrap();
//! assert_eq!(timeline.resolve(&spec).unwrap(), Timestamp::from_secs(10_000));
//! assert_eq!(timeline.resolve(&"1B".parse().unwrap()).unwrap(), Timestamp::from_secs(10_000));
//! ```

use crate::entry::Entry;
use crate::error::{Result, RewindError};
use crate::increment::IncrementKind;
use crate::index::Index;
use crate::storage::Repository;
use crate::types::{SessionStats, Timestamp};
use chrono::DateTime;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::trace;

/// A point in time as a user spells it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeSpec {
    /// The current mirror
    Now,
    /// An absolute time
    At(Timestamp),
    /// This long before now
    Ago(Duration),
    /// This many sessions before the current one
    SessionsBack(usize),
}

impl FromStr for TimeSpec {
    type Err = RewindError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(RewindError::InvalidTime(s.to_string()));
        }
        if s.eq_ignore_ascii_case("now") {
            return Ok(TimeSpec::Now);
        }
        if s.bytes().all(|b| b.is_ascii_digit()) {
            return s
                .parse::<i64>()
                .map(|secs| TimeSpec::At(Timestamp::from_secs(secs)))
                .map_err(|_| RewindError::InvalidTime(s.to_string()));
        }
        if let Some(count) = s.strip_suffix('B') {
            if let Ok(n) = count.parse::<usize>() {
                return Ok(TimeSpec::SessionsBack(n));
            }
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(TimeSpec::At(Timestamp::from_secs(dt.timestamp())));
        }
        if let Some(t) = Timestamp::parse_file_form(s) {
            return Ok(TimeSpec::At(t));
        }
        humantime::parse_duration(s)
            .map(TimeSpec::Ago)
            .map_err(|_| RewindError::InvalidTime(s.to_string()))
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeSpec::Now => f.write_str("now"),
            TimeSpec::At(t) => write!(f, "{}", t),
            TimeSpec::Ago(d) => write!(f, "{} ago", humantime::format_duration(*d)),
            TimeSpec::SessionsBack(n) => write!(f, "{}B", n),
        }
    }
}

/// Committed sessions of a repository, ascending
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timeline {
    sessions: Vec<Timestamp>,
}

impl Timeline {
    /// Load the committed sessions of `repo`
    pub fn load(repo: &Repository) -> Result<Self> {
        Ok(Self::from_sessions(repo.session_times()?))
    }

    /// Timeline over explicit session times
    pub fn from_sessions(mut sessions: Vec<Timestamp>) -> Self {
        sessions.sort();
        sessions.dedup();
        Timeline { sessions }
    }

    /// Session times, ascending
    pub fn sessions(&self) -> &[Timestamp] {
        &self.sessions
    }

    /// The current mirror time
    pub fn current(&self) -> Option<Timestamp> {
        self.sessions.last().copied()
    }

    /// True when nothing has been committed
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Session committed immediately before `time`
    pub fn previous(&self, time: Timestamp) -> Option<Timestamp> {
        self.sessions.iter().rev().find(|t| **t < time).copied()
    }

    /// Latest session at or before `time`
    pub fn at_or_before(&self, time: Timestamp) -> Option<Timestamp> {
        self.sessions.iter().rev().find(|t| **t <= time).copied()
    }

    /// Resolve a time specification to a session time
    pub fn resolve(&self, spec: &TimeSpec) -> Result<Timestamp> {
        let current = self.current().ok_or(RewindError::EmptyRepository)?;
        let resolved = match spec {
            TimeSpec::Now => Some(current),
            TimeSpec::At(t) => self.at_or_before(*t),
            TimeSpec::Ago(d) => {
                let t = Timestamp::from_secs(Timestamp::now().as_secs() - d.as_secs() as i64);
                self.at_or_before(t)
            }
            TimeSpec::SessionsBack(n) => self
                .sessions
                .len()
                .checked_sub(n + 1)
                .map(|i| self.sessions[i]),
        };
        trace!("Resolved {} to {:?}", spec, resolved);
        resolved.ok_or_else(|| RewindError::NoSessionAt(spec.to_string()))
    }

    /// Parse and resolve a time specification
    pub fn resolve_str(&self, spec: &str) -> Result<Timestamp> {
        self.resolve(&spec.parse()?)
    }
}

/// One committed session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Session time
    pub time: Timestamp,
    /// Whether the session's metadata snapshot is compressed
    pub compressed_metadata: bool,
    /// Recorded statistics, if the file survived
    pub stats: Option<SessionStats>,
    /// Whether this is the current mirror
    pub is_current: bool,
}

/// Describe every committed session
pub fn list_sessions(repo: &Repository) -> Result<Vec<SessionInfo>> {
    let timeline = Timeline::load(repo)?;
    let current = timeline.current();
    timeline
        .sessions()
        .iter()
        .map(|&time| {
            let compressed_metadata = repo
                .find_metadata(time)
                .map(|p| p.extension().map(|e| e == "gz").unwrap_or(false))
                .unwrap_or(false);
            Ok(SessionInfo {
                time,
                compressed_metadata,
                stats: repo.read_stats(time)?,
                is_current: Some(time) == current,
            })
        })
        .collect()
}

/// One increment as listed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncrementInfo {
    /// Time of the recorded state
    pub time: Timestamp,
    /// Artifact kind
    pub kind: String,
    /// Whether the artifact is compressed
    pub compressed: bool,
    /// Size on disk
    pub size: u64,
}

/// History of one path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncrementListing {
    /// Path listed
    pub index: Index,
    /// Current mirror entry
    pub mirror: Entry,
    /// Increments, oldest first
    pub increments: Vec<IncrementInfo>,
}

impl IncrementListing {
    /// Number of diff increments
    pub fn diff_count(&self) -> usize {
        let diff = IncrementKind::Diff.as_str();
        self.increments.iter().filter(|i| i.kind == diff).count()
    }
}

/// List the mirror entry and increments of `index`
pub fn list_increments(repo: &Repository, index: &Index) -> Result<IncrementListing> {
    let mirror = Entry::read(index.clone(), &repo.mapping().to_path(repo.mirror(), index))?;
    let increments = repo
        .increment_store()
        .list(index)?
        .into_iter()
        .map(|inc| {
            Ok(IncrementInfo {
                time: inc.time,
                kind: inc.kind.to_string(),
                compressed: inc.compressed,
                size: inc.size()?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(IncrementListing {
        index: index.clone(),
        mirror,
        increments,
    })
}
