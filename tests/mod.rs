//! Main test module for Rewind
//!
//! This module includes all test suites:
//! - Integration tests for end-to-end scenarios
//! - Chaos tests for crash safety of backup and regression
//! - Property-based tests for invariants
//!
//! Shared fixtures live here so every suite builds trees the same way.

pub mod chaos;
pub mod integration;
pub mod property;

use ::rewind::*;
use filetime::FileTime;
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use walkdir::WalkDir;

/// What a tree holds at one relative path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Dir,
    File(Vec<u8>),
    Link(PathBuf),
}

/// Scratch directory with a source tree and a mirror next to it
pub struct Fixture {
    pub dir: TempDir,
    pub mirror: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mirror = dir.path().join("mirror");
        Fixture { dir, mirror }
    }

    /// A fresh, empty directory under the fixture
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Open or create the repository, without fsync to keep tests quick
    pub fn rewind(&self) -> Rewind {
        RewindBuilder::new().fsync(false).build(&self.mirror).unwrap()
    }

    /// Same as [`Fixture::rewind`] with a hook registered
    pub fn rewind_with(&self, hook: impl SessionHook + 'static) -> Rewind {
        let rewind = self.rewind();
        rewind.add_hook(Box::new(hook));
        rewind
    }
}

/// Write `content` at `root/rel` with a fixed mtime, creating parents
pub fn write_file(root: &Path, rel: &str, content: &[u8], mtime: i64) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
    filetime::set_file_mtime(&path, FileTime::from_unix_time(mtime, 0)).unwrap();
}

/// Build a tree of regular files, every file with the same mtime
pub fn build_tree(root: &Path, files: &[(&str, &[u8])], mtime: i64) {
    fs::create_dir_all(root).unwrap();
    for (rel, content) in files {
        write_file(root, rel, content, mtime);
    }
}

/// Everything under `root` except the repository's data directory
pub fn tree_contents(root: &Path) -> BTreeMap<String, Node> {
    let mut nodes = BTreeMap::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !(e.depth() == 1 && e.file_name() == "rewind-data"));
    for entry in walker {
        let entry = entry.unwrap();
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap()
            .to_string_lossy()
            .into_owned();
        let kind = entry.file_type();
        let node = if kind.is_dir() {
            Node::Dir
        } else if kind.is_symlink() {
            Node::Link(fs::read_link(entry.path()).unwrap())
        } else {
            Node::File(fs::read(entry.path()).unwrap())
        };
        nodes.insert(rel, node);
    }
    nodes
}

/// Regular files under both roots agree on mtime and permission bits
pub fn assert_same_file_metadata(expected: &Path, actual: &Path) {
    for entry in WalkDir::new(expected).min_depth(1) {
        let entry = entry.unwrap();
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(expected).unwrap();
        let want = entry.metadata().unwrap();
        let got = fs::symlink_metadata(actual.join(rel)).unwrap();
        assert_eq!(want.mtime(), got.mtime(), "mtime of {:?}", rel);
        assert_eq!(want.mode() & 0o7777, got.mode() & 0o7777, "mode of {:?}", rel);
    }
}

/// Regular files left in the increments directory
pub fn increment_files(mirror: &Path) -> Vec<PathBuf> {
    WalkDir::new(mirror.join("rewind-data").join("increments"))
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}

pub fn at(secs: i64) -> BackupOptions {
    BackupOptions {
        time: Some(Timestamp::from_secs(secs)),
        ..Default::default()
    }
}

pub fn t(secs: i64) -> Timestamp {
    Timestamp::from_secs(secs)
}

/// Interrupts the `nth` occurrence (1-based) of one step
pub struct StopAt {
    step: SessionStep,
    nth: usize,
    seen: AtomicUsize,
}

impl StopAt {
    pub fn new(step: SessionStep, nth: usize) -> Self {
        StopAt {
            step,
            nth,
            seen: AtomicUsize::new(0),
        }
    }
}

impl SessionHook for StopAt {
    fn on_step(&self, step: SessionStep, index: &Index) -> Result<()> {
        if step == self.step && self.seen.fetch_add(1, Ordering::SeqCst) + 1 == self.nth {
            return Err(RewindError::Interrupted(format!("{} {}", step, index)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod edge_cases {
    use super::*;

    #[test]
    fn test_empty_source_directory() {
        let fx = Fixture::new();
        let source = fx.path("empty");
        fs::create_dir_all(&source).unwrap();

        let rewind = fx.rewind();
        let stats = rewind.backup(&source, &at(10_000)).unwrap();
        assert_eq!(stats.new_entries, 0);
        assert!(tree_contents(&fx.mirror).is_empty());

        write_file(&source, "late.txt", b"arrived later", 500);
        rewind.backup(&source, &at(20_000)).unwrap();

        let target = fx.path("restored");
        rewind.restore(t(10_000), &target, &RestoreOptions::default()).unwrap();
        assert!(tree_contents(&target).is_empty());
    }

    #[test]
    fn test_empty_file_and_binary_content() {
        let fx = Fixture::new();
        let source = fx.path("src");
        let binary: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        build_tree(&source, &[("empty.bin", b""), ("binary.bin", &binary)], 100);

        let rewind = fx.rewind();
        rewind.backup(&source, &at(10_000)).unwrap();

        let mut flipped = binary.clone();
        flipped[5_000] ^= 0xff;
        write_file(&source, "binary.bin", &flipped, 200);
        write_file(&source, "empty.bin", b"no longer empty", 200);
        rewind.backup(&source, &at(20_000)).unwrap();

        let target = fx.path("restored");
        rewind.restore(t(10_000), &target, &RestoreOptions::default()).unwrap();
        assert_eq!(fs::read(target.join("binary.bin")).unwrap(), binary);
        assert_eq!(fs::read(target.join("empty.bin")).unwrap(), b"");
    }

    #[test]
    fn test_same_content_new_mtime_is_a_change() {
        let fx = Fixture::new();
        let source = fx.path("src");
        build_tree(&source, &[("a.txt", b"unchanged bytes")], 100);

        let rewind = fx.rewind();
        rewind.backup(&source, &at(10_000)).unwrap();
        filetime::set_file_mtime(source.join("a.txt"), FileTime::from_unix_time(999, 0)).unwrap();
        let stats = rewind.backup(&source, &at(20_000)).unwrap();
        assert_eq!(stats.changed_entries, 1);

        let target = fx.path("restored");
        rewind.restore(t(10_000), &target, &RestoreOptions::default()).unwrap();
        let meta = fs::metadata(target.join("a.txt")).unwrap();
        assert_eq!(meta.mtime(), 100);
    }

    #[test]
    fn test_restore_into_non_empty_target_is_refused() {
        let fx = Fixture::new();
        let source = fx.path("src");
        build_tree(&source, &[("a.txt", b"a")], 100);
        let rewind = fx.rewind();
        rewind.backup(&source, &at(10_000)).unwrap();

        let target = fx.path("occupied");
        build_tree(&target, &[("other.txt", b"mine")], 100);
        let err = rewind
            .restore(t(10_000), &target, &RestoreOptions::default())
            .unwrap_err();
        assert!(matches!(err, RewindError::TargetNotEmpty(_)));

        let forced = RestoreOptions {
            force: true,
            ..Default::default()
        };
        rewind.restore(t(10_000), &target, &forced).unwrap();
        assert_eq!(fs::read(target.join("a.txt")).unwrap(), b"a");
    }

    #[test]
    fn test_session_time_must_increase() {
        let fx = Fixture::new();
        let source = fx.path("src");
        build_tree(&source, &[("a.txt", b"a")], 100);
        let rewind = fx.rewind();
        rewind.backup(&source, &at(20_000)).unwrap();

        let err = rewind.backup(&source, &at(20_000)).unwrap_err();
        assert!(matches!(err, RewindError::InvalidSessionTime { .. }));
        let err = rewind.backup(&source, &at(10_000)).unwrap_err();
        assert!(matches!(err, RewindError::InvalidSessionTime { .. }));
        assert_eq!(rewind.state().unwrap(), RepoState::Clean { current: t(20_000) });
    }
}
