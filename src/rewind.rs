//! Main Rewind implementation
//!
//! [`Rewind`] ties a [`Repository`] to the delta codec and the registered
//! session hooks, and exposes every repository operation in one place.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use rewind::{BackupOptions, RestoreOptions, Rewind};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let rewind = Rewind::init(Path::new("/backups/project"))?;
//! rewind.backup(Path::new("/home/user/project"), &BackupOptions::default())?;
//!
//! let time = rewind.resolve_time("1B")?;
//! rewind.restore(time, Path::new("/tmp/project-then"), &RestoreOptions::default())?;
//! # Ok(())
//! # }
//! ```

use crate::backup;
use crate::compare::{self, Comparison};
use crate::compression::CompressionStrategy;
use crate::diff::{DeltaCodec, RsyncCodec};
use crate::error::{Result, RewindError};
use crate::index::Index;
use crate::regress;
use crate::restore;
use crate::storage::{RepoState, Repository};
use crate::timeline::{self, IncrementListing, SessionInfo, Timeline};
use crate::types::*;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Handle on one backup repository
///
/// # Examples
///
/// ```rust,no_run
/// use rewind::{CompressionStrategy, RewindBuilder};
/// use std::path::Path;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let rewind = RewindBuilder::new()
///     .compression_strategy(CompressionStrategy::Gzip)
///     .exclude_patterns(vec!["target/".to_string(), "*.tmp".to_string()])
///     .build(Path::new("/backups/project"))?;
/// println!("{:?}", rewind.state()?);
/// # Ok(())
/// # }
/// ```
pub struct Rewind {
    repo: Repository,
    codec: Arc<dyn DeltaCodec>,
    hooks: Hooks,
}

impl std::fmt::Debug for Rewind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rewind")
            .field("repo", &self.repo)
            .field("hooks", &self.hooks)
            .finish()
    }
}

impl Rewind {
    /// Create a repository with default configuration
    ///
    /// # Errors
    ///
    /// Fails with [`RewindError::RepositoryAlreadyExists`] if `mirror`
    /// already holds one.
    #[instrument]
    pub fn init(mirror: &Path) -> Result<Self> {
        Ok(Self::from_repository(Repository::init(mirror, RepoConfig::default())?))
    }

    /// Open an existing repository
    #[instrument]
    pub fn open(mirror: &Path) -> Result<Self> {
        Ok(Self::from_repository(Repository::open(mirror)?))
    }

    fn from_repository(repo: Repository) -> Self {
        Rewind {
            repo,
            codec: Arc::new(RsyncCodec::default()),
            hooks: Hooks::default(),
        }
    }

    /// The underlying repository
    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    /// Commit state of the repository
    pub fn state(&self) -> Result<RepoState> {
        self.repo.state()
    }

    /// Refuse read operations while an interrupted session is pending
    fn require_clean(&self) -> Result<Timestamp> {
        match self.repo.state()? {
            RepoState::Empty => Err(RewindError::EmptyRepository),
            RepoState::Clean { current } => Ok(current),
            RepoState::NeedsRegress {
                regress_time,
                unsuccessful_time,
            } => Err(RewindError::NeedsRegress {
                regress_time,
                unsuccessful_time,
            }),
        }
    }

    /// Back up `source` as a new session
    ///
    /// See [`BackupOptions`] for forcing a regression first or resuming an
    /// interrupted session.
    #[instrument(skip(self, options))]
    pub fn backup(&self, source: &Path, options: &BackupOptions) -> Result<SessionStats> {
        backup::backup(&self.repo, self.codec.clone(), &self.hooks, source, options)
    }

    /// Restore committed session `time` into `target`
    #[instrument(skip(self, options))]
    pub fn restore(&self, time: Timestamp, target: &Path, options: &RestoreOptions) -> Result<RestoreResult> {
        self.require_clean()?;
        restore::restore(&self.repo, self.codec.clone(), time, target, options)
    }

    /// Roll back an interrupted session; `None` if there was none
    #[instrument(skip(self))]
    pub fn regress(&self, force: bool) -> Result<Option<RegressResult>> {
        regress::regress(&self.repo, self.codec.clone(), &self.hooks, force)
    }

    /// Compare `source` with committed session `time`
    #[instrument(skip(self, options))]
    pub fn compare(&self, source: &Path, time: Timestamp, options: &CompareOptions) -> Result<Comparison> {
        self.require_clean()?;
        compare::compare(&self.repo, self.codec.clone(), source, time, options)
    }

    /// Check stored digests at `time` against reconstructed content
    #[instrument(skip(self))]
    pub fn verify(&self, time: Timestamp) -> Result<VerifyReport> {
        self.require_clean()?;
        restore::verify(&self.repo, self.codec.clone(), time)
    }

    /// History of one path
    pub fn list_increments(&self, index: &Index) -> Result<IncrementListing> {
        timeline::list_increments(&self.repo, index)
    }

    /// Every committed session
    pub fn sessions(&self) -> Result<Vec<SessionInfo>> {
        timeline::list_sessions(&self.repo)
    }

    /// Committed session times
    pub fn timeline(&self) -> Result<Timeline> {
        Timeline::load(&self.repo)
    }

    /// Resolve a user time specification to a committed session
    pub fn resolve_time(&self, spec: &str) -> Result<Timestamp> {
        let resolved = self.timeline()?.resolve_str(spec)?;
        debug!("Time {:?} resolved to {}", spec, resolved);
        Ok(resolved)
    }

    /// Register a session hook
    pub fn add_hook(&self, hook: Box<dyn SessionHook>) {
        self.hooks.add(hook);
    }
}

/// Builder for repository configuration
///
/// Settings only take effect when the repository is created; opening an
/// existing repository keeps its stored configuration.
///
/// # Default Values
///
/// - `compression_strategy`: adaptive gzip, skipping small and already
///   compressed files
/// - `quote_chars`: none
/// - `fsync`: true
/// - `checkpoint_interval`: 1000 entries
/// - `strict_ordering`: false
pub struct RewindBuilder {
    config: RepoConfig,
    codec: Option<Arc<dyn DeltaCodec>>,
    hooks: Vec<Box<dyn SessionHook>>,
}

impl RewindBuilder {
    /// Create a builder with default settings
    pub fn new() -> Self {
        RewindBuilder {
            config: RepoConfig::default(),
            codec: None,
            hooks: Vec::new(),
        }
    }

    /// Set compression strategy for increments and metadata snapshots
    pub fn compression_strategy(mut self, strategy: CompressionStrategy) -> Self {
        self.config.compression = strategy;
        self
    }

    /// Quote these characters in on-disk names
    pub fn quote_chars(mut self, chars: impl Into<String>) -> Self {
        self.config.quote_chars = Some(chars.into());
        self
    }

    /// Exclusion globs applied to every backup and comparison
    pub fn exclude_patterns(mut self, patterns: Vec<String>) -> Self {
        self.config.exclude_patterns = patterns;
        self
    }

    /// Whether to fsync files and directories at commit points
    pub fn fsync(mut self, fsync: bool) -> Self {
        self.config.fsync = fsync;
        self
    }

    /// Entries between session checkpoints
    pub fn checkpoint_interval(mut self, interval: u64) -> Self {
        self.config.checkpoint_interval = interval;
        self
    }

    /// Fail on out-of-order indices instead of skipping them
    pub fn strict_ordering(mut self, strict: bool) -> Self {
        self.config.strict_ordering = strict;
        self
    }

    /// Use a different delta codec
    pub fn codec(mut self, codec: Arc<dyn DeltaCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Register a session hook
    pub fn hook(mut self, hook: Box<dyn SessionHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Open the repository at `mirror`, creating it if needed
    pub fn build(self, mirror: &Path) -> Result<Rewind> {
        if self.config.checkpoint_interval == 0 {
            return Err(RewindError::InvalidConfiguration(
                "checkpoint interval must be positive".to_string(),
            ));
        }
        let mut rewind = Rewind::from_repository(Repository::init_or_open(mirror, self.config)?);
        if let Some(codec) = self.codec {
            rewind.codec = codec;
        }
        for hook in self.hooks {
            rewind.hooks.add(hook);
        }
        Ok(rewind)
    }
}

impl Default for RewindBuilder {
    fn default() -> Self {
        Self::new()
    }
}
