//! Chaos testing for Rewind
//!
//! Every crash-sensitive sequence fires a [`SessionStep`] hook. Returning
//! an error from the hook leaves the repository exactly as a kill at that
//! point would, so these tests interrupt backups and regressions at every
//! step and check that the repository always converges back to a
//! committed state.

use crate::*;
use ::rewind::storage::SessionLock;
use ::rewind::*;
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::MetadataExt;

/// Source trees of the committed session and the one that gets interrupted
struct Scenario {
    fx: Fixture,
    s1: PathBuf,
    s2: PathBuf,
}

impl Scenario {
    fn new() -> Self {
        Self::with_interval(1_000)
    }

    /// Repository that checkpoints every `interval` entries
    fn with_interval(interval: u64) -> Self {
        let fx = Fixture::new();
        let long: Vec<u8> = (0..6_000u32).map(|i| (i % 251) as u8).collect();
        let mut long_edit = long.clone();
        long_edit[3_000..3_010].copy_from_slice(b"EDITEDEDIT");

        let s1 = fx.path("s1");
        build_tree(
            &s1,
            &[
                ("a.bin", &long),
                ("b.txt", b"deleted in s2"),
                ("dir1/c.txt", b"edited in s2"),
                ("dir1/d.txt", b"untouched"),
                ("dir2/e.txt", b"dir2 becomes a file"),
                ("gone/f.txt", b"whole directory removed"),
            ],
            1_000,
        );

        let s2 = fx.path("s2");
        build_tree(&s2, &[("dir1/d.txt", b"untouched")], 1_000);
        write_file(&s2, "a.bin", &long_edit, 2_000);
        write_file(&s2, "dir1/c.txt", b"edited in s2, now longer", 2_000);
        write_file(&s2, "dir1/new.txt", b"added in s2", 2_000);
        write_file(&s2, "dir2", b"was a directory", 2_000);
        write_file(&s2, "fresh/g.txt", b"new directory", 2_000);

        RewindBuilder::new()
            .fsync(false)
            .checkpoint_interval(interval)
            .build(&fx.mirror)
            .unwrap()
            .backup(&s1, &at(10_000))
            .unwrap();
        Scenario { fx, s1, s2 }
    }

    /// Run the second session with `hook` installed; true if it was interrupted
    fn interrupted_backup(&self, hook: StopAt) -> bool {
        match self.fx.rewind_with(hook).backup(&self.s2, &at(20_000)) {
            Err(RewindError::Interrupted(_)) => true,
            Ok(_) => false,
            Err(e) => panic!("unexpected backup error: {}", e),
        }
    }

    /// The mirror is exactly the first session again
    fn assert_back_at_first_session(&self) {
        let rewind = self.fx.rewind();
        assert_eq!(rewind.state().unwrap(), RepoState::Clean { current: t(10_000) });
        assert_eq!(tree_contents(&self.fx.mirror), tree_contents(&self.s1));
        assert_same_file_metadata(&self.s1, &self.fx.mirror);
        assert!(increment_files(&self.fx.mirror).is_empty());

        let leftovers: Vec<_> = fs::read_dir(self.fx.mirror.join("rewind-data"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.contains(&t(20_000).to_string()))
            .collect();
        assert!(leftovers.is_empty(), "{:?}", leftovers);

        let options = CompareOptions {
            level: CompareLevel::Full,
            ..Default::default()
        };
        let differences = rewind
            .compare(&self.s1, t(10_000), &options)
            .unwrap()
            .map(|r| r.unwrap())
            .filter(|r| r.is_difference())
            .count();
        assert_eq!(differences, 0);
    }

    /// Both sessions restore exactly
    fn assert_both_sessions_restore(&self) {
        let rewind = self.fx.rewind();
        assert_eq!(rewind.state().unwrap(), RepoState::Clean { current: t(20_000) });
        assert_eq!(tree_contents(&self.fx.mirror), tree_contents(&self.s2));
        for (secs, expected) in [(10_000, &self.s1), (20_000, &self.s2)] {
            let target = self.fx.path(&format!("check-{}", secs));
            rewind.restore(t(secs), &target, &RestoreOptions::default()).unwrap();
            assert_eq!(tree_contents(&target), tree_contents(expected), "session {}", secs);
            assert_same_file_metadata(expected, &target);
        }
    }
}

/// Every file under the mirror, data directory included, with its metadata
fn full_snapshot(root: &Path) -> BTreeMap<PathBuf, (Option<Vec<u8>>, u32, i64)> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .map(|e| e.unwrap())
        .map(|e| {
            let meta = e.path().symlink_metadata().unwrap();
            let content = e.file_type().is_file().then(|| fs::read(e.path()).unwrap());
            let mtime = if e.file_type().is_dir() { 0 } else { meta.mtime() };
            (e.path().to_path_buf(), (content, meta.mode(), mtime))
        })
        .collect()
}

#[test]
fn test_backup_interrupted_at_every_step_regresses_cleanly() {
    for step in [SessionStep::IncrementWritten, SessionStep::MirrorUpdated] {
        for nth in 1..=8 {
            let scenario = Scenario::new();
            assert!(
                scenario.interrupted_backup(StopAt::new(step, nth)),
                "{} #{} never fired",
                step,
                nth
            );

            let rewind = scenario.fx.rewind();
            let result = rewind.regress(false).unwrap().unwrap();
            assert_eq!(result.regress_time, t(10_000));
            assert_eq!(result.unsuccessful_time, t(20_000));
            scenario.assert_back_at_first_session();

            // And the repository is usable again
            rewind.backup(&scenario.s2, &at(30_000)).unwrap();
            let then = scenario.fx.path("then");
            rewind.restore(t(10_000), &then, &RestoreOptions::default()).unwrap();
            assert_eq!(tree_contents(&then), tree_contents(&scenario.s1));
        }
    }
}

#[test]
fn test_regress_crash_after_temp_write() {
    let scenario = Scenario::new();
    assert!(scenario.interrupted_backup(StopAt::new(SessionStep::MirrorUpdated, 8)));

    let crashing = scenario.fx.rewind_with(StopAt::new(SessionStep::TempWritten, 1));
    assert!(matches!(crashing.regress(false), Err(RewindError::Interrupted(_))));

    // The temp file is complete, and every mirror file is one version or the other
    let old = tree_contents(&scenario.s1);
    let new = tree_contents(&scenario.s2);
    let mut temps = 0;
    for (rel, node) in tree_contents(&scenario.fx.mirror) {
        let name = Path::new(&rel).file_name().unwrap().to_string_lossy().into_owned();
        if name.starts_with(".rewind-tmp") {
            temps += 1;
            let Node::File(bytes) = node else { panic!("temp {} is not a file", rel) };
            assert!(old.values().any(|n| *n == Node::File(bytes.clone())), "partial temp {}", rel);
            continue;
        }
        assert!(
            old.get(&rel) == Some(&node) || new.get(&rel) == Some(&node),
            "{} is neither version",
            rel
        );
    }
    assert_eq!(temps, 1);

    scenario.fx.rewind().regress(false).unwrap().unwrap();
    scenario.assert_back_at_first_session();
}

#[test]
fn test_regress_crashes_repeatedly_and_converges() {
    for step in [SessionStep::Renamed, SessionStep::DirSynced, SessionStep::IncrementDeleted] {
        let scenario = Scenario::new();
        assert!(scenario.interrupted_backup(StopAt::new(SessionStep::MirrorUpdated, 8)));

        let mut attempts = 0;
        loop {
            attempts += 1;
            assert!(attempts < 100, "{} never converged", step);
            let rewind = scenario.fx.rewind_with(StopAt::new(step, 1));
            match rewind.regress(false) {
                Ok(Some(_)) => break,
                Ok(None) => break,
                Err(RewindError::Interrupted(_)) => {
                    assert!(matches!(
                        scenario.fx.rewind().state().unwrap(),
                        RepoState::NeedsRegress { .. }
                    ));
                }
                Err(e) => panic!("regress failed after {} crashes at {}: {}", attempts - 1, step, e),
            }
        }
        assert!(attempts > 1, "{} never fired", step);
        scenario.assert_back_at_first_session();
    }
}

#[test]
fn test_regress_is_idempotent() {
    let scenario = Scenario::new();
    assert!(scenario.interrupted_backup(StopAt::new(SessionStep::MirrorUpdated, 5)));

    let rewind = scenario.fx.rewind();
    assert!(rewind.regress(false).unwrap().is_some());
    let after_first = full_snapshot(&scenario.fx.mirror);

    assert!(rewind.regress(false).unwrap().is_none());
    assert_eq!(full_snapshot(&scenario.fx.mirror), after_first);
    scenario.assert_back_at_first_session();
}

#[test]
fn test_resume_completes_interrupted_session() {
    for (step, nth) in [
        (SessionStep::MirrorUpdated, 2),
        (SessionStep::MirrorUpdated, 7),
        (SessionStep::IncrementWritten, 4),
        (SessionStep::CheckpointWritten, 5),
    ] {
        let scenario = Scenario::with_interval(1);
        assert!(scenario.interrupted_backup(StopAt::new(step, nth)));
        assert!(scenario
            .fx
            .rewind()
            .repository()
            .checkpoint_path(t(20_000))
            .exists());

        let resumed = BackupOptions {
            resume: true,
            ..Default::default()
        };
        let stats = scenario.fx.rewind().backup(&scenario.s2, &resumed).unwrap();
        assert!(stats.resumed, "{} #{}", step, nth);
        assert_eq!(stats.session_time, Some(t(20_000)));
        scenario.assert_both_sessions_restore();
        assert!(scenario.fx.rewind().verify(t(10_000)).unwrap().is_valid());
    }
}

#[test]
fn test_resume_without_checkpoint_needs_regress() {
    let scenario = Scenario::new();
    assert!(scenario.interrupted_backup(StopAt::new(SessionStep::MirrorUpdated, 3)));

    let resumed = BackupOptions {
        resume: true,
        ..Default::default()
    };
    let rewind = scenario.fx.rewind();
    assert!(matches!(
        rewind.backup(&scenario.s2, &resumed),
        Err(RewindError::NeedsRegress { .. })
    ));
    rewind.regress(false).unwrap().unwrap();
    scenario.assert_back_at_first_session();
}

#[test]
fn test_crashed_first_session_is_discarded() {
    let fx = Fixture::new();
    let source = fx.path("src");
    build_tree(&source, &[("a.txt", b"a"), ("b.txt", b"b"), ("c/d.txt", b"d")], 100);

    let crashing = fx.rewind_with(StopAt::new(SessionStep::MirrorUpdated, 2));
    assert!(matches!(
        crashing.backup(&source, &at(10_000)),
        Err(RewindError::Interrupted(_))
    ));
    assert_eq!(fx.rewind().state().unwrap(), RepoState::Empty);

    let rewind = fx.rewind();
    rewind.backup(&source, &at(10_000)).unwrap();
    assert_eq!(rewind.state().unwrap(), RepoState::Clean { current: t(10_000) });
    assert_eq!(tree_contents(&fx.mirror), tree_contents(&source));
    assert!(rewind.regress(false).unwrap().is_none());
}

#[test]
fn test_live_foreign_lock_blocks_regress() {
    let scenario = Scenario::new();
    assert!(scenario.interrupted_backup(StopAt::new(SessionStep::MirrorUpdated, 3)));

    let rewind = scenario.fx.rewind();
    let lock = SessionLock {
        hostname: "another-host.invalid".to_string(),
        ..SessionLock::for_current_process(t(20_000))
    };
    fs::write(
        rewind.repository().lock_path(t(20_000)),
        serde_json::to_vec(&lock).unwrap(),
    )
    .unwrap();

    let err = rewind.regress(false).unwrap_err();
    assert!(err.is_concurrency());

    rewind.regress(true).unwrap().unwrap();
    scenario.assert_back_at_first_session();
}

#[test]
fn test_corrupt_marker_count_is_structural() {
    let scenario = Scenario::new();
    let rewind = scenario.fx.rewind();
    let data = scenario.fx.mirror.join("rewind-data");
    for secs in [20_000, 30_000] {
        fs::write(data.join(format!("current_mirror.{}.data", t(secs))), b"").unwrap();
    }
    let err = rewind.state().unwrap_err();
    assert!(matches!(err, RewindError::MarkerCount { count: 3 }));
    assert!(err.is_structural());
    assert!(rewind.regress(true).is_err());
}

#[test]
fn test_regress_without_lock_after_crash_before_marker_removal() {
    let scenario = Scenario::new();
    assert!(scenario.interrupted_backup(StopAt::new(SessionStep::MirrorUpdated, 4)));

    // Regress removes the lock before the marker; a kill in between leaves this
    let rewind = scenario.fx.rewind();
    let lock = rewind.repository().lock_path(t(20_000));
    assert!(lock.exists());
    fs::remove_file(&lock).unwrap();
    assert!(matches!(rewind.state().unwrap(), RepoState::NeedsRegress { .. }));

    rewind.regress(false).unwrap().unwrap();
    scenario.assert_back_at_first_session();
}

#[test]
fn test_regress_restores_mode_of_rebuilt_file() {
    use std::os::unix::fs::PermissionsExt;

    let mut saw_new_mode = false;
    for nth in 1..=2 {
        let fx = Fixture::new();
        let s1 = fx.path("s1");
        build_tree(&s1, &[("mode.txt", b"first version")], 100);
        fs::set_permissions(s1.join("mode.txt"), fs::Permissions::from_mode(0o644)).unwrap();
        fx.rewind().backup(&s1, &at(10_000)).unwrap();

        let s2 = fx.path("s2");
        write_file(&s2, "mode.txt", b"second version, longer", 200);
        fs::set_permissions(s2.join("mode.txt"), fs::Permissions::from_mode(0o600)).unwrap();
        let crashing = fx.rewind_with(StopAt::new(SessionStep::MirrorUpdated, nth));
        if crashing.backup(&s2, &at(20_000)).is_ok() {
            continue;
        }
        let mirrored = fx.mirror.join("mode.txt");
        saw_new_mode |= fs::metadata(&mirrored).unwrap().mode() & 0o7777 == 0o600;

        fx.rewind().regress(false).unwrap().unwrap();
        assert_eq!(fs::read(&mirrored).unwrap(), b"first version");
        assert_eq!(fs::metadata(&mirrored).unwrap().mode() & 0o7777, 0o644);
        assert_same_file_metadata(&s1, &fx.mirror);
    }
    assert!(saw_new_mode, "no run interrupted after the file was replaced");
}
