//! Increment store and writer
//!
//! Increments live under `rewind-data/increments/`, in a tree shaped like
//! the mirror. The increment for index `a/b/c` at time `T` is the file
//! `increments/a/b/c.<T>.<kind>[.gz]`, with every component passed through
//! the repository's [`PathMapping`].
//!
//! Kinds:
//!
//! - `diff`: reverse delta; patched onto the next newer content it yields
//!   the content at `T`
//! - `snapshot`: the full prior state (file content, a symlink, or an empty
//!   file standing in for a special node)
//! - `dir`: the path was a directory at `T`
//! - `missing`: nothing existed at the path at `T`
//!
//! An increment stamped `T` describes the state that was current at `T` and
//! was replaced by the session that followed.

use crate::collate::Indexed;
use crate::compression::{self, CompressionEngine};
use crate::diff::DeltaCodec;
use crate::entry::{Entry, EntryKind};
use crate::error::{Result, RewindError};
use crate::index::{Index, PathMapping};
use crate::scan::TEMP_PREFIX;
use crate::types::Timestamp;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Kind of an increment artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IncrementKind {
    /// Reverse delta against the next newer content
    Diff,
    /// Full copy of the prior state
    Snapshot,
    /// The prior state was a directory
    Dir,
    /// Nothing existed
    Missing,
}

impl IncrementKind {
    /// Name used in increment file names
    pub fn as_str(&self) -> &'static str {
        match self {
            IncrementKind::Diff => "diff",
            IncrementKind::Snapshot => "snapshot",
            IncrementKind::Dir => "dir",
            IncrementKind::Missing => "missing",
        }
    }

    /// Parse a file-name kind
    pub fn parse(s: &[u8]) -> Option<Self> {
        match s {
            b"diff" => Some(IncrementKind::Diff),
            b"snapshot" => Some(IncrementKind::Snapshot),
            b"dir" => Some(IncrementKind::Dir),
            b"missing" => Some(IncrementKind::Missing),
            _ => None,
        }
    }

    const ALL: [IncrementKind; 4] = [
        IncrementKind::Diff,
        IncrementKind::Snapshot,
        IncrementKind::Dir,
        IncrementKind::Missing,
    ];
}

impl fmt::Display for IncrementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One increment file on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Increment {
    /// Index the increment belongs to
    pub index: Index,
    /// Time at which the recorded state was current
    pub time: Timestamp,
    /// Artifact kind
    pub kind: IncrementKind,
    /// Whether the content is gzip-compressed
    pub compressed: bool,
    /// Location on disk
    pub path: PathBuf,
}

impl Increment {
    /// True for diff increments
    pub fn is_diff(&self) -> bool {
        self.kind == IncrementKind::Diff
    }

    /// Content bytes, decompressed
    pub fn read_content(&self) -> Result<Vec<u8>> {
        compression::read_file(&self.path, self.compressed)
    }

    /// Size on disk
    pub fn size(&self) -> Result<u64> {
        Ok(fs::symlink_metadata(&self.path)?.len())
    }

    /// Delete the artifact; a missing file is not an error
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                trace!("Removed increment {:?}", self.path);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Split an increment file name into `(base, time, kind, compressed)`
///
/// Parsing runs from the right so that bases may themselves contain dots.
pub fn parse_increment_name(name: &OsStr) -> Option<(OsString, Timestamp, IncrementKind, bool)> {
    let mut bytes = name.as_bytes();
    let compressed = bytes.ends_with(b".gz");
    if compressed {
        bytes = &bytes[..bytes.len() - 3];
    }
    let dot = bytes.iter().rposition(|b| *b == b'.')?;
    let kind = IncrementKind::parse(&bytes[dot + 1..])?;
    bytes = &bytes[..dot];
    let dot = bytes.iter().rposition(|b| *b == b'.')?;
    let time = Timestamp::parse_file_form(std::str::from_utf8(&bytes[dot + 1..]).ok()?)?;
    let base = &bytes[..dot];
    if base.is_empty() {
        return None;
    }
    Some((OsString::from_vec(base.to_vec()), time, kind, compressed))
}

/// Increments at one index, oldest first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementGroup {
    /// Shared index
    pub index: Index,
    /// Increments sorted by ascending time
    pub increments: Vec<Increment>,
}

impl Indexed for IncrementGroup {
    fn index(&self) -> &Index {
        &self.index
    }
}

impl IncrementGroup {
    /// Increment stamped exactly `time`
    pub fn at(&self, time: Timestamp) -> Option<&Increment> {
        self.increments.iter().find(|inc| inc.time == time)
    }

    /// Increments stamped `time` or later
    pub fn since(&self, time: Timestamp) -> impl Iterator<Item = &Increment> {
        self.increments.iter().filter(move |inc| inc.time >= time)
    }
}

/// Naming and lookup over the increments tree
#[derive(Debug, Clone)]
pub struct IncrementStore {
    root: PathBuf,
    mapping: PathMapping,
    fsync: bool,
}

impl IncrementStore {
    /// Store rooted at `root` (the `increments` directory)
    pub fn new(root: impl Into<PathBuf>, mapping: PathMapping, fsync: bool) -> Self {
        IncrementStore {
            root: root.into(),
            mapping,
            fsync,
        }
    }

    /// Root of the increments tree
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path mapping used for names
    pub fn mapping(&self) -> &PathMapping {
        &self.mapping
    }

    /// Directory holding the increments of `index`'s children
    pub fn dir_for(&self, index: &Index) -> PathBuf {
        self.mapping.to_path(&self.root, index)
    }

    /// Path of the increment for `index` at `time`
    pub fn path_for(
        &self,
        index: &Index,
        time: Timestamp,
        kind: IncrementKind,
        compressed: bool,
    ) -> Result<PathBuf> {
        let (parent, base) = match (index.parent(), index.file_name()) {
            (Some(parent), Some(base)) => (parent, base),
            _ => return Err(RewindError::internal("the root has no increments")),
        };
        let mut name = self.mapping.quote(base).into_owned();
        name.push(format!(".{}.{}", time, kind));
        if compressed {
            name.push(".gz");
        }
        Ok(self.dir_for(&parent).join(name))
    }

    /// Any increment for `index` at exactly `time`
    pub fn find_at(&self, index: &Index, time: Timestamp) -> Result<Option<Increment>> {
        for kind in IncrementKind::ALL {
            for compressed in [false, true] {
                let path = self.path_for(index, time, kind, compressed)?;
                if fs::symlink_metadata(&path).is_ok() {
                    return Ok(Some(Increment {
                        index: index.clone(),
                        time,
                        kind,
                        compressed,
                        path,
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Every increment of `index`, oldest first
    pub fn list(&self, index: &Index) -> Result<Vec<Increment>> {
        let (parent, base) = match (index.parent(), index.file_name()) {
            (Some(parent), Some(base)) => (parent, base.to_os_string()),
            _ => return Ok(Vec::new()),
        };
        let dir = self.dir_for(&parent);
        let mut found = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if let Some((quoted, time, kind, compressed)) = parse_increment_name(&name) {
                if self.mapping.unquote(&quoted)? == base {
                    found.push(Increment {
                        index: index.clone(),
                        time,
                        kind,
                        compressed,
                        path: entry.path(),
                    });
                }
            }
        }
        found.sort_by_key(|inc| inc.time);
        Ok(found)
    }

    /// Index-ordered stream of increment groups below `subtree`
    pub fn stream(&self, subtree: Option<&Index>) -> Result<IncrementStream> {
        IncrementStream::open(self, subtree)
    }

    fn sync(&self) -> bool {
        self.fsync
    }
}

/// A directory listing split into names, increments and child containers
struct Listing {
    parent: Index,
    names: std::collections::btree_map::IntoIter<OsString, Slot>,
}

#[derive(Default)]
struct Slot {
    increments: Vec<Increment>,
    subdir: Option<PathBuf>,
}

/// Lazy, index-ordered walk of the increments tree
///
/// Yields one [`IncrementGroup`] per index that has increments. Directories
/// are listed only when the walk reaches them.
pub struct IncrementStream {
    mapping: PathMapping,
    stack: Vec<Listing>,
}

impl IncrementStream {
    fn open(store: &IncrementStore, subtree: Option<&Index>) -> Result<Self> {
        let mut stream = IncrementStream {
            mapping: store.mapping.clone(),
            stack: Vec::new(),
        };
        match subtree {
            Some(index) if !index.is_root() => {
                let (parent, base) = match (index.parent(), index.file_name()) {
                    (Some(parent), Some(base)) => (parent, base.to_os_string()),
                    _ => return Ok(stream),
                };
                let mut slots = stream.list_dir(&store.dir_for(&parent), &parent)?;
                slots.retain(|name, _| *name == base);
                stream.stack.push(Listing {
                    parent,
                    names: slots.into_iter(),
                });
            }
            _ => {
                let slots = stream.list_dir(store.root(), &Index::root())?;
                stream.stack.push(Listing {
                    parent: Index::root(),
                    names: slots.into_iter(),
                });
            }
        }
        Ok(stream)
    }

    fn list_dir(&self, dir: &Path, parent: &Index) -> Result<BTreeMap<OsString, Slot>> {
        let mut slots: BTreeMap<OsString, Slot> = BTreeMap::new();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(slots),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if name.as_bytes().starts_with(TEMP_PREFIX.as_bytes()) {
                continue;
            }
            if entry.file_type()?.is_dir() {
                let unquoted = self.mapping.unquote(&name)?;
                slots.entry(unquoted).or_default().subdir = Some(entry.path());
                continue;
            }
            match parse_increment_name(&name) {
                Some((quoted, time, kind, compressed)) => {
                    let unquoted = self.mapping.unquote(&quoted)?;
                    let index = parent.join(unquoted.clone());
                    slots.entry(unquoted).or_default().increments.push(Increment {
                        index,
                        time,
                        kind,
                        compressed,
                        path: entry.path(),
                    });
                }
                None => warn!("Ignoring unrecognised file in increments: {:?}", entry.path()),
            }
        }
        Ok(slots)
    }
}

impl Iterator for IncrementStream {
    type Item = Result<IncrementGroup>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let top = self.stack.last_mut()?;
            let (name, mut slot) = match top.names.next() {
                Some(next) => next,
                None => {
                    self.stack.pop();
                    continue;
                }
            };
            let index = top.parent.join(name);

            // Children are listed now and walked after this group is returned
            if let Some(subdir) = slot.subdir.take() {
                match self.list_dir(&subdir, &index) {
                    Ok(slots) => self.stack.push(Listing {
                        parent: index.clone(),
                        names: slots.into_iter(),
                    }),
                    Err(e) => return Some(Err(e)),
                }
            }

            if !slot.increments.is_empty() {
                slot.increments.sort_by_key(|inc| inc.time);
                return Some(Ok(IncrementGroup {
                    index,
                    increments: slot.increments,
                }));
            }
        }
    }
}

/// Decides which increment a change needs and writes it
pub struct IncrementWriter {
    store: IncrementStore,
    codec: Arc<dyn DeltaCodec>,
    compression: CompressionEngine,
    files_written: u64,
    bytes_written: u64,
}

impl fmt::Debug for IncrementWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncrementWriter")
            .field("store", &self.store)
            .field("files_written", &self.files_written)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}

impl IncrementWriter {
    /// Create a writer over `store`
    pub fn new(store: IncrementStore, codec: Arc<dyn DeltaCodec>, compression: CompressionEngine) -> Self {
        IncrementWriter {
            store,
            codec,
            compression,
            files_written: 0,
            bytes_written: 0,
        }
    }

    /// Store written into
    pub fn store(&self) -> &IncrementStore {
        &self.store
    }

    /// Increment files written so far
    pub fn files_written(&self) -> u64 {
        self.files_written
    }

    /// Increment bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Record the prior state of a path that is about to change
    ///
    /// `prior` is the state being replaced and `current` the state replacing
    /// it. `prior_content` is required when the prior state is a regular file
    /// and `current_content` when both are regular files. Returns `None` when
    /// nothing needed recording.
    pub fn decide_and_write(
        &mut self,
        current: &Entry,
        prior: &Entry,
        current_content: Option<&[u8]>,
        prior_content: Option<&[u8]>,
        time: Timestamp,
    ) -> Result<Option<Increment>> {
        let index = &prior.index;
        if index.is_root() || (!current.exists() && !prior.exists()) {
            return Ok(None);
        }

        let (kind, payload): (IncrementKind, Vec<u8>) = match prior.kind {
            EntryKind::Absent => (IncrementKind::Missing, Vec::new()),
            EntryKind::Directory => {
                if current.is_dir() {
                    fs::create_dir_all(self.store.dir_for(index))?;
                }
                (IncrementKind::Dir, Vec::new())
            }
            EntryKind::Regular => {
                let prior_bytes = prior_content.ok_or_else(|| {
                    RewindError::internal(format!("no prior content supplied for {}", index))
                })?;
                match (current.kind, current_content) {
                    (EntryKind::Regular, Some(current_bytes)) => (
                        IncrementKind::Diff,
                        self.codec.reverse_delta(current_bytes, prior_bytes)?,
                    ),
                    _ => (IncrementKind::Snapshot, prior_bytes.to_vec()),
                }
            }
            _ => (IncrementKind::Snapshot, Vec::new()),
        };

        let time = self.free_time(index, time)?;
        self.write_artifact(prior, time, kind, payload).map(Some)
    }

    /// Replace a diff increment with a snapshot of the content it encodes
    ///
    /// Needed once the newer content the diff was computed against is about
    /// to be overwritten.
    pub fn diff_to_snapshot(&mut self, stale: &Increment, prior: &Entry, content: &[u8]) -> Result<Increment> {
        for compressed in [false, true] {
            let leftover = self
                .store
                .path_for(&stale.index, stale.time, IncrementKind::Snapshot, compressed)?;
            crate::entry::remove_node(&leftover)?;
        }
        let snapshot = self.write_artifact(prior, stale.time, IncrementKind::Snapshot, content.to_vec())?;
        stale.remove()?;
        debug!("Converted diff for {} at {} into a snapshot", stale.index, stale.time);
        Ok(snapshot)
    }

    fn write_artifact(
        &mut self,
        prior: &Entry,
        time: Timestamp,
        kind: IncrementKind,
        payload: Vec<u8>,
    ) -> Result<Increment> {
        let index = &prior.index;
        let compress = matches!(kind, IncrementKind::Diff | IncrementKind::Snapshot)
            && prior.is_reg()
            && self.compression.should_compress(&index.to_path(), payload.len() as u64);
        let path = self.store.path_for(index, time, kind, compress)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        if prior.is_symlink() {
            let target = prior.link_target.clone().unwrap_or_default();
            std::os::unix::fs::symlink(target, &path)?;
            prior.apply_to(&path)?;
        } else {
            let bytes = if compress {
                self.compression.compress(&payload)?
            } else {
                self.compression.record_raw();
                payload
            };
            let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
            file.write_all(&bytes)?;
            if self.store.sync() {
                file.sync_all()?;
            }
            drop(file);
            if prior.exists() {
                fs::set_permissions(&path, fs::Permissions::from_mode((prior.permissions & 0o7777) | 0o400))?;
                filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(prior.mtime, 0))?;
            }
            self.bytes_written += bytes.len() as u64;
        }
        self.files_written += 1;
        debug!("Wrote {} increment for {} at {}", kind, index, time);

        Ok(Increment {
            index: index.clone(),
            time,
            kind,
            compressed: compress,
            path,
        })
    }

    /// First time at or after `time` with no increment for `index`
    fn free_time(&self, index: &Index, time: Timestamp) -> Result<Timestamp> {
        let mut candidate = time;
        while let Some(existing) = self.store.find_at(index, candidate)? {
            warn!(
                "Increment {:?} already exists, advancing to {}",
                existing.path,
                candidate.next()
            );
            candidate = candidate.next();
        }
        Ok(candidate)
    }
}
