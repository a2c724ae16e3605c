//! Repository layout and session bookkeeping
//!
//! A repository is a mirror directory with a `rewind-data` directory inside
//! it. Everything other than the mirror tree itself lives in the data
//! directory:
//!
//! ```text
//! <mirror>/rewind-data/
//! ├── repository.json                         # RepoConfig
//! ├── current_mirror.<T>.data                 # zero-length marker
//! ├── mirror_metadata.<T>.snapshot[.gz]       # metadata snapshot per session
//! ├── session_statistics.<T>.json             # SessionStats per session
//! ├── session_lock.<T>.json                   # owner of a running session
//! ├── checkpoint.<T>.bin                      # resumable session state
//! └── increments/                             # see the increment module
//! ```
//!
//! ## Session state
//!
//! The current-mirror markers are the commit protocol. A session writes its
//! own marker when it starts and removes the previous one when it commits.
//! The very first session has no previous marker and writes its own only when
//! it commits.
//!
//! - one marker: [`RepoState::Clean`]
//! - two markers: [`RepoState::NeedsRegress`]; the older names the last good
//!   state, the newer the interrupted session
//! - no markers and no session statistics: [`RepoState::Empty`] (possibly
//!   with leftovers of a first session that never committed)
//!
//! Anything else means the data directory was tampered with and is refused.

use crate::error::{Result, RewindError};
use crate::increment::IncrementStore;
use crate::index::PathMapping;
use crate::types::{RepoConfig, SessionStats, Timestamp, FORMAT_VERSION};
use crate::utils;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Name of the data directory inside the mirror
pub const DATA_DIR: &str = "rewind-data";
/// Name of the increments directory inside the data directory
pub const INCREMENTS_DIR: &str = "increments";
/// Repository configuration file name
pub const CONFIG_FILE: &str = "repository.json";

const MARKER_PREFIX: &str = "current_mirror";
const METADATA_PREFIX: &str = "mirror_metadata";
const STATS_PREFIX: &str = "session_statistics";
const LOCK_PREFIX: &str = "session_lock";
const CHECKPOINT_PREFIX: &str = "checkpoint";

/// Commit state of a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoState {
    /// No session has ever committed
    Empty,
    /// Exactly one committed session is current
    Clean {
        /// Time of the current mirror
        current: Timestamp,
    },
    /// A session was interrupted and its changes must be undone
    NeedsRegress {
        /// Last fully committed session
        regress_time: Timestamp,
        /// Interrupted session
        unsuccessful_time: Timestamp,
    },
}

/// Identity of the process running a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLock {
    /// Process id
    pub pid: u32,
    /// Host the process runs on
    pub hostname: String,
    /// Session the lock belongs to
    pub session_time: Timestamp,
    /// When the session started
    pub started_at: DateTime<Utc>,
}

impl SessionLock {
    /// Lock for the calling process
    pub fn for_current_process(session_time: Timestamp) -> Self {
        SessionLock {
            pid: std::process::id(),
            hostname: local_hostname(),
            session_time,
            started_at: Utc::now(),
        }
    }

    /// Whether the owning process may still be running
    ///
    /// Processes on other hosts cannot be probed and count as alive. The
    /// calling process never counts: a lock it holds is one it abandoned.
    pub fn is_alive(&self) -> bool {
        if self.hostname != local_hostname() {
            return true;
        }
        if self.pid == std::process::id() {
            return false;
        }
        let pid = nix::unistd::Pid::from_raw(self.pid as i32);
        match nix::sys::signal::kill(pid, None) {
            Ok(()) => true,
            Err(nix::errno::Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Split a data-directory file name into its prefix and session time
fn parse_data_name(name: &str) -> Option<(&str, Timestamp)> {
    let mut parts = name.splitn(3, '.');
    let prefix = parts.next()?;
    let time = Timestamp::parse_file_form(parts.next()?)?;
    parts.next()?;
    Some((prefix, time))
}

/// An opened repository
#[derive(Debug, Clone)]
pub struct Repository {
    mirror: PathBuf,
    data_dir: PathBuf,
    config: RepoConfig,
    mapping: PathMapping,
}

impl Repository {
    /// Create a repository in `mirror`, creating the directory if needed
    pub fn init(mirror: &Path, config: RepoConfig) -> Result<Self> {
        let data_dir = mirror.join(DATA_DIR);
        let config_path = data_dir.join(CONFIG_FILE);
        if config_path.exists() {
            return Err(RewindError::RepositoryAlreadyExists(mirror.to_path_buf()));
        }
        if let Some(chars) = &config.quote_chars {
            if chars.contains('/') {
                return Err(RewindError::InvalidConfiguration(
                    "'/' cannot be quoted".to_string(),
                ));
            }
        }
        fs::create_dir_all(data_dir.join(INCREMENTS_DIR))?;
        utils::atomic_write(&config_path, &serde_json::to_vec_pretty(&config)?, config.fsync)?;
        info!("Initialized repository at {:?}", mirror);
        Ok(Self::from_parts(mirror, config))
    }

    /// Open an existing repository
    pub fn open(mirror: &Path) -> Result<Self> {
        let config_path = mirror.join(DATA_DIR).join(CONFIG_FILE);
        let raw = match fs::read(&config_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RewindError::RepositoryNotInitialized(mirror.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        let config: RepoConfig = serde_json::from_slice(&raw)?;
        if config.format_version > FORMAT_VERSION {
            return Err(RewindError::InvalidConfiguration(format!(
                "repository format {} is newer than supported format {}",
                config.format_version, FORMAT_VERSION
            )));
        }
        debug!("Opened repository at {:?}", mirror);
        Ok(Self::from_parts(mirror, config))
    }

    /// Open the repository in `mirror`, creating it with `config` if absent
    pub fn init_or_open(mirror: &Path, config: RepoConfig) -> Result<Self> {
        if mirror.join(DATA_DIR).join(CONFIG_FILE).exists() {
            Self::open(mirror)
        } else {
            Self::init(mirror, config)
        }
    }

    fn from_parts(mirror: &Path, config: RepoConfig) -> Self {
        Repository {
            mirror: mirror.to_path_buf(),
            data_dir: mirror.join(DATA_DIR),
            mapping: PathMapping::from_quote_chars(config.quote_chars.as_deref()),
            config,
        }
    }

    /// Mirror directory
    pub fn mirror(&self) -> &Path {
        &self.mirror
    }

    /// Data directory
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Persisted configuration
    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    /// Mapping between indices and on-disk names
    pub fn mapping(&self) -> &PathMapping {
        &self.mapping
    }

    /// The increments tree
    pub fn increment_store(&self) -> IncrementStore {
        IncrementStore::new(
            self.data_dir.join(INCREMENTS_DIR),
            self.mapping.clone(),
            self.config.fsync,
        )
    }

    fn data_path(&self, prefix: &str, time: Timestamp, ext: &str) -> PathBuf {
        self.data_dir.join(format!("{}.{}.{}", prefix, time, ext))
    }

    /// Current-mirror marker for `time`
    pub fn marker_path(&self, time: Timestamp) -> PathBuf {
        self.data_path(MARKER_PREFIX, time, "data")
    }

    /// Uncompressed metadata snapshot path for `time`
    pub fn metadata_path(&self, time: Timestamp) -> PathBuf {
        self.data_path(METADATA_PREFIX, time, "snapshot")
    }

    /// Existing metadata snapshot for `time`, compressed or not
    pub fn find_metadata(&self, time: Timestamp) -> Option<PathBuf> {
        let plain = self.metadata_path(time);
        let gz = self.data_path(METADATA_PREFIX, time, "snapshot.gz");
        [gz, plain].into_iter().find(|p| p.exists())
    }

    /// Metadata snapshot for `time`, which must exist
    pub fn require_metadata(&self, time: Timestamp) -> Result<PathBuf> {
        self.find_metadata(time)
            .ok_or(RewindError::MissingMetadata(time))
    }

    /// Session statistics path for `time`
    pub fn stats_path(&self, time: Timestamp) -> PathBuf {
        self.data_path(STATS_PREFIX, time, "json")
    }

    /// Session lock path for `time`
    pub fn lock_path(&self, time: Timestamp) -> PathBuf {
        self.data_path(LOCK_PREFIX, time, "json")
    }

    /// Session checkpoint path for `time`
    pub fn checkpoint_path(&self, time: Timestamp) -> PathBuf {
        self.data_path(CHECKPOINT_PREFIX, time, "bin")
    }

    /// Times of every data-directory file with `prefix`, ascending
    fn times_with_prefix(&self, wanted: &str) -> Result<Vec<Timestamp>> {
        let mut times = Vec::new();
        let entries = match fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(times),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if let Some((prefix, time)) = name.to_str().and_then(parse_data_name) {
                if prefix == wanted {
                    times.push(time);
                }
            }
        }
        times.sort();
        times.dedup();
        Ok(times)
    }

    /// Times of every current-mirror marker, ascending
    pub fn markers(&self) -> Result<Vec<Timestamp>> {
        self.times_with_prefix(MARKER_PREFIX)
    }

    /// Times of every metadata snapshot, ascending
    pub fn metadata_times(&self) -> Result<Vec<Timestamp>> {
        self.times_with_prefix(METADATA_PREFIX)
    }

    /// Commit state derived from the markers
    pub fn state(&self) -> Result<RepoState> {
        let markers = self.markers()?;
        match markers.as_slice() {
            [] => {
                if self.times_with_prefix(STATS_PREFIX)?.is_empty() {
                    Ok(RepoState::Empty)
                } else {
                    Err(RewindError::MarkerCount { count: 0 })
                }
            }
            [current] => Ok(RepoState::Clean { current: *current }),
            [regress_time, unsuccessful_time] => Ok(RepoState::NeedsRegress {
                regress_time: *regress_time,
                unsuccessful_time: *unsuccessful_time,
            }),
            more => Err(RewindError::MarkerCount { count: more.len() }),
        }
    }

    /// Time of the last committed session
    pub fn current_time(&self) -> Result<Option<Timestamp>> {
        Ok(match self.state()? {
            RepoState::Empty => None,
            RepoState::Clean { current } => Some(current),
            RepoState::NeedsRegress { regress_time, .. } => Some(regress_time),
        })
    }

    /// Committed session times, ascending
    ///
    /// A session counts once its metadata snapshot exists and it is not
    /// later than the current mirror.
    pub fn session_times(&self) -> Result<Vec<Timestamp>> {
        let current = match self.current_time()? {
            Some(current) => current,
            None => return Ok(Vec::new()),
        };
        Ok(self
            .metadata_times()?
            .into_iter()
            .filter(|t| *t <= current)
            .collect())
    }

    /// Create the marker for `time` durably
    pub fn write_marker(&self, time: Timestamp) -> Result<()> {
        let path = self.marker_path(time);
        let file = File::create(&path)?;
        if self.config.fsync {
            file.sync_all()?;
            utils::fsync_dir(&self.data_dir)?;
        }
        debug!("Wrote marker {:?}", path);
        Ok(())
    }

    /// Remove the marker for `time` durably
    pub fn remove_marker(&self, time: Timestamp) -> Result<()> {
        remove_if_exists(&self.marker_path(time))?;
        if self.config.fsync {
            utils::fsync_dir(&self.data_dir)?;
        }
        debug!("Removed marker for {}", time);
        Ok(())
    }

    /// Record the calling process as owner of session `time`
    pub fn write_lock(&self, time: Timestamp) -> Result<SessionLock> {
        let lock = SessionLock::for_current_process(time);
        utils::atomic_write(
            &self.lock_path(time),
            &serde_json::to_vec_pretty(&lock)?,
            self.config.fsync,
        )?;
        Ok(lock)
    }

    /// Owner of session `time`, if a lock was left
    pub fn read_lock(&self, time: Timestamp) -> Result<Option<SessionLock>> {
        match fs::read(self.lock_path(time)) {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(lock) => Ok(Some(lock)),
                Err(e) => {
                    warn!("Ignoring unreadable session lock for {}: {}", time, e);
                    Ok(None)
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Refuse to touch session `time` while its owner is alive
    pub fn check_lock(&self, time: Timestamp, force: bool) -> Result<()> {
        if let Some(lock) = self.read_lock(time)? {
            if lock.is_alive() {
                if force {
                    warn!(
                        "Overriding lock of process {} on {} for session {}",
                        lock.pid, lock.hostname, time
                    );
                } else {
                    return Err(RewindError::SessionActive {
                        pid: lock.pid,
                        hostname: lock.hostname,
                        session_time: time,
                    });
                }
            }
        }
        Ok(())
    }

    /// Remove the lock for session `time`
    pub fn remove_lock(&self, time: Timestamp) -> Result<()> {
        remove_if_exists(&self.lock_path(time))
    }

    /// Persist session statistics
    pub fn write_stats(&self, stats: &SessionStats) -> Result<()> {
        let time = stats
            .session_time
            .ok_or_else(|| RewindError::internal("statistics without a session time"))?;
        utils::atomic_write(
            &self.stats_path(time),
            &serde_json::to_vec_pretty(stats)?,
            self.config.fsync,
        )
    }

    /// Statistics of session `time`, if recorded
    pub fn read_stats(&self, time: Timestamp) -> Result<Option<SessionStats>> {
        match fs::read(self.stats_path(time)) {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every data-directory file belonging to session `time`
    pub fn session_files(&self, time: Timestamp) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if let Some((_, t)) = name.to_str().and_then(parse_data_name) {
                if t == time {
                    files.push(entry.path());
                }
            }
        }
        files.sort();
        Ok(files)
    }

    /// Times of every session with files in the data directory
    pub fn recorded_times(&self) -> Result<Vec<Timestamp>> {
        let mut times = Vec::new();
        for prefix in [METADATA_PREFIX, LOCK_PREFIX, CHECKPOINT_PREFIX, STATS_PREFIX] {
            times.extend(self.times_with_prefix(prefix)?);
        }
        times.sort();
        times.dedup();
        Ok(times)
    }

    /// Remove every data-directory file of session `time`
    pub fn discard_session(&self, time: Timestamp) -> Result<usize> {
        let files = self.session_files(time)?;
        for file in &files {
            remove_if_exists(file)?;
        }
        if !files.is_empty() {
            info!("Discarded {} files of uncommitted session {}", files.len(), time);
        }
        Ok(files.len())
    }

    /// fsync the data directory
    pub fn sync_data_dir(&self) -> Result<()> {
        if self.config.fsync {
            utils::fsync_dir(&self.data_dir)?;
        }
        Ok(())
    }
}

/// Remove a file; a missing file is not an error
pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
