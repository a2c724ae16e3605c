//! Integration tests for end-to-end backup scenarios
//!
//! These drive the public [`Rewind`] handle through several sessions and
//! check restores, comparisons and listings against the trees that were
//! actually backed up.

use crate::*;
use ::rewind::*;
use std::fs;
use std::os::unix::fs::MetadataExt;

/// D1 and D2 of the reference scenario
fn two_generations(fx: &Fixture) -> (PathBuf, PathBuf) {
    let d1 = fx.path("d1");
    build_tree(
        &d1,
        &[
            ("readme.txt", b"version one of the readme"),
            ("obsolete.txt", b"removed in the second session"),
            ("docs/guide.md", b"# Guide\n\nStep one.\n"),
            ("docs/notes.txt", b"stays the same"),
        ],
        1_000,
    );
    std::os::unix::fs::symlink("readme.txt", d1.join("link")).unwrap();

    let d2 = fx.path("d2");
    build_tree(
        &d2,
        &[
            ("readme.txt", b"version two of the readme, a bit longer"),
            ("docs/guide.md", b"# Guide\n\nStep one.\n"),
            ("docs/notes.txt", b"stays the same"),
            ("added.txt", b"new in the second session"),
        ],
        1_000,
    );
    write_file(&d2, "readme.txt", b"version two of the readme, a bit longer", 2_000);
    std::os::unix::fs::symlink("readme.txt", d2.join("link")).unwrap();
    (d1, d2)
}

#[test]
fn test_two_session_scenario() {
    let fx = Fixture::new();
    let (d1, d2) = two_generations(&fx);
    let rewind = fx.rewind();

    rewind.backup(&d1, &at(10_000)).unwrap();
    let stats = rewind.backup(&d2, &at(20_000)).unwrap();
    assert_eq!(stats.changed_entries, 1);
    assert_eq!(stats.deleted_entries, 1);
    assert_eq!(stats.new_entries, 1);

    // The past, exactly
    let then = fx.path("then");
    rewind.restore(t(10_000), &then, &RestoreOptions::default()).unwrap();
    assert_eq!(tree_contents(&then), tree_contents(&d1));
    assert_same_file_metadata(&d1, &then);

    // The present, through "now"
    let now = fx.path("now");
    let time = rewind.resolve_time("now").unwrap();
    assert_eq!(time, t(20_000));
    rewind.restore(time, &now, &RestoreOptions::default()).unwrap();
    assert_eq!(tree_contents(&now), tree_contents(&d2));
    assert_same_file_metadata(&d2, &now);

    // The mirror itself is D2
    assert_eq!(tree_contents(&fx.mirror), tree_contents(&d2));

    for level in [CompareLevel::Meta, CompareLevel::Hash, CompareLevel::Full] {
        let options = CompareOptions {
            level,
            ..Default::default()
        };
        let differences: Vec<_> = rewind
            .compare(&d2, t(20_000), &options)
            .unwrap()
            .map(|r| r.unwrap())
            .filter(|r| r.is_difference())
            .collect();
        assert!(differences.is_empty(), "{:?}: {:?}", level, differences);
    }
}

#[test]
fn test_compare_against_older_session() {
    let fx = Fixture::new();
    let (d1, d2) = two_generations(&fx);
    let rewind = fx.rewind();
    rewind.backup(&d1, &at(10_000)).unwrap();
    rewind.backup(&d2, &at(20_000)).unwrap();

    // D1 against the older session reconstructs through increments
    let options = CompareOptions {
        level: CompareLevel::Full,
        ..Default::default()
    };
    let differences = rewind
        .compare(&d1, t(10_000), &options)
        .unwrap()
        .filter(|r| r.as_ref().map(|r| r.is_difference()).unwrap_or(true))
        .count();
    assert_eq!(differences, 0);

    // D2 against the older session shows the whole change set
    let reports: Vec<(String, CompareStatus)> = rewind
        .compare(&d2, t(10_000), &options)
        .unwrap()
        .map(|r| r.unwrap())
        .filter(|r| r.is_difference())
        .map(|r| (r.index.to_string(), r.status))
        .collect();
    assert_eq!(
        reports,
        vec![
            ("added.txt".to_string(), CompareStatus::New),
            ("obsolete.txt".to_string(), CompareStatus::Deleted),
            ("readme.txt".to_string(), CompareStatus::Changed),
        ]
    );
}

#[test]
fn test_long_history_of_one_file() {
    let fx = Fixture::new();
    let source = fx.path("src");
    fs::create_dir_all(&source).unwrap();
    let rewind = fx.rewind();

    let mut versions = Vec::new();
    for session in 1..=6i64 {
        let content: Vec<u8> = (0..session * 400)
            .map(|i| b"abcdefghij"[(i as usize * 7 + session as usize) % 10])
            .collect();
        write_file(&source, "log.txt", &content, session * 100);
        rewind.backup(&source, &at(session * 10_000)).unwrap();
        versions.push(content);
    }

    for (i, expected) in versions.iter().enumerate() {
        let time = t((i as i64 + 1) * 10_000);
        let target = fx.path(&format!("restore-{}", i));
        rewind.restore(time, &target, &RestoreOptions::default()).unwrap();
        assert_eq!(&fs::read(target.join("log.txt")).unwrap(), expected, "session {}", i + 1);
    }

    let back = rewind.resolve_time("5B").unwrap();
    assert_eq!(back, t(10_000));
    let listing = rewind
        .list_increments(&Index::from_relative_path(Path::new("log.txt")).unwrap())
        .unwrap();
    assert_eq!(listing.increments.len(), 5);
    assert_eq!(listing.increments[0].time, t(10_000));
    assert_eq!(listing.increments[4].time, t(50_000));
    assert!(rewind.verify(t(30_000)).unwrap().is_valid());
}

#[test]
fn test_subtree_restore() {
    let fx = Fixture::new();
    let (d1, d2) = two_generations(&fx);
    let rewind = fx.rewind();
    rewind.backup(&d1, &at(10_000)).unwrap();
    rewind.backup(&d2, &at(20_000)).unwrap();

    let target = fx.path("docs-only");
    let options = RestoreOptions {
        subtree: Some(Index::from_relative_path(Path::new("docs")).unwrap()),
        ..Default::default()
    };
    let result = rewind.restore(t(10_000), &target, &options).unwrap();
    assert_eq!(result.files_restored, 2);
    assert_eq!(tree_contents(&target), tree_contents(&d1.join("docs")));

    let missing = RestoreOptions {
        subtree: Some(Index::from_relative_path(Path::new("added.txt")).unwrap()),
        ..Default::default()
    };
    assert!(rewind.restore(t(10_000), &fx.path("nothing"), &missing).is_err());
}

#[test]
fn test_directory_replaced_by_file_and_back() {
    let fx = Fixture::new();
    let s1 = fx.path("s1");
    build_tree(&s1, &[("thing/inner.txt", b"inside a directory")], 100);
    let s2 = fx.path("s2");
    build_tree(&s2, &[("thing", b"now a plain file")], 200);
    let s3 = fx.path("s3");
    build_tree(&s3, &[("thing/other.txt", b"a directory again")], 300);

    let rewind = fx.rewind();
    rewind.backup(&s1, &at(10_000)).unwrap();
    rewind.backup(&s2, &at(20_000)).unwrap();
    rewind.backup(&s3, &at(30_000)).unwrap();

    for (secs, expected) in [(10_000, &s1), (20_000, &s2), (30_000, &s3)] {
        let target = fx.path(&format!("at-{}", secs));
        rewind.restore(t(secs), &target, &RestoreOptions::default()).unwrap();
        assert_eq!(tree_contents(&target), tree_contents(expected), "session {}", secs);
    }
}

#[test]
fn test_permission_only_change_is_versioned() {
    use std::os::unix::fs::PermissionsExt;

    let fx = Fixture::new();
    let source = fx.path("src");
    build_tree(&source, &[("mode.txt", b"same")], 100);
    let file = source.join("mode.txt");
    fs::set_permissions(&file, fs::Permissions::from_mode(0o644)).unwrap();

    let rewind = fx.rewind();
    rewind.backup(&source, &at(10_000)).unwrap();
    fs::set_permissions(&file, fs::Permissions::from_mode(0o600)).unwrap();
    let stats = rewind.backup(&source, &at(20_000)).unwrap();
    assert_eq!(stats.changed_entries, 1);

    for (secs, mode) in [(10_000, 0o644), (20_000, 0o600)] {
        let target = fx.path(&format!("at-{}", secs));
        rewind.restore(t(secs), &target, &RestoreOptions::default()).unwrap();
        let restored = target.join("mode.txt");
        assert_eq!(fs::read(&restored).unwrap(), b"same");
        assert_eq!(fs::metadata(&restored).unwrap().mode() & 0o7777, mode, "session {}", secs);
    }
}

#[test]
fn test_hardlinks_are_restored_as_links() {
    let fx = Fixture::new();
    let source = fx.path("src");
    build_tree(&source, &[("first.txt", b"shared inode")], 100);
    fs::hard_link(source.join("first.txt"), source.join("second.txt")).unwrap();

    let rewind = fx.rewind();
    rewind.backup(&source, &at(10_000)).unwrap();

    let target = fx.path("restored");
    let result = rewind.restore(t(10_000), &target, &RestoreOptions::default()).unwrap();
    assert_eq!(result.files_restored, 1);
    assert_eq!(result.hardlinks_restored, 1);
    let a = fs::metadata(target.join("first.txt")).unwrap();
    let b = fs::metadata(target.join("second.txt")).unwrap();
    assert_eq!(a.ino(), b.ino());
    assert_eq!(fs::read(target.join("second.txt")).unwrap(), b"shared inode");
}

#[test]
fn test_quoted_file_names() {
    let fx = Fixture::new();
    let source = fx.path("src");
    build_tree(&source, &[("time:12.txt", b"colon in the name"), ("dir:x/f", b"nested")], 100);

    let rewind = RewindBuilder::new()
        .fsync(false)
        .quote_chars(":")
        .build(&fx.mirror)
        .unwrap();
    rewind.backup(&source, &at(10_000)).unwrap();
    assert!(fx.mirror.join("time;05812.txt").is_file());
    assert!(fx.mirror.join("dir;058x/f").is_file());

    write_file(&source, "time:12.txt", b"colon in the name, edited", 200);
    rewind.backup(&source, &at(20_000)).unwrap();
    assert!(increment_files(&fx.mirror)
        .iter()
        .all(|p| !p.to_string_lossy().contains(':')));

    let target = fx.path("restored");
    rewind.restore(t(10_000), &target, &RestoreOptions::default()).unwrap();
    assert_eq!(fs::read(target.join("time:12.txt")).unwrap(), b"colon in the name");
    assert_eq!(fs::read(target.join("dir:x/f")).unwrap(), b"nested");
}

#[test]
fn test_exclusions() {
    let fx = Fixture::new();
    let source = fx.path("src");
    build_tree(
        &source,
        &[
            ("keep.txt", b"kept"),
            ("debug.log", b"excluded by extension"),
            ("target/build.o", b"excluded directory"),
            ("nested/target/x", b"also excluded"),
            ("nested/keep.log.txt", b"kept, not a .log"),
        ],
        100,
    );

    let rewind = RewindBuilder::new()
        .fsync(false)
        .exclude_patterns(vec!["target/".to_string()])
        .build(&fx.mirror)
        .unwrap();
    let options = BackupOptions {
        exclude: vec!["*.log".to_string()],
        ..at(10_000)
    };
    rewind.backup(&source, &options).unwrap();

    let mirrored: Vec<String> = tree_contents(&fx.mirror).into_keys().collect();
    assert_eq!(mirrored, vec!["keep.txt", "nested", "nested/keep.log.txt"]);
}

#[test]
fn test_verify_detects_tampered_mirror() {
    let fx = Fixture::new();
    let source = fx.path("src");
    build_tree(&source, &[("data.bin", b"0123456789")], 100);
    let rewind = fx.rewind();
    rewind.backup(&source, &at(10_000)).unwrap();
    assert!(rewind.verify(t(10_000)).unwrap().is_valid());

    // Same size and mtime, so only the digest can tell
    write_file(&fx.mirror, "data.bin", b"9876543210", 100);
    let report = rewind.verify(t(10_000)).unwrap();
    assert!(!report.is_valid());
    assert_eq!(report.mismatches, vec!["data.bin".to_string()]);
}

#[test]
fn test_sessions_listing() {
    let fx = Fixture::new();
    let (d1, d2) = two_generations(&fx);
    let rewind = fx.rewind();
    rewind.backup(&d1, &at(10_000)).unwrap();
    rewind.backup(&d2, &at(20_000)).unwrap();

    let sessions = rewind.sessions().unwrap();
    assert_eq!(sessions.len(), 2);
    assert!(!sessions[0].is_current);
    assert!(sessions[1].is_current);
    let stats = sessions[1].stats.as_ref().unwrap();
    assert_eq!(stats.previous_time, Some(t(10_000)));
    assert_eq!(stats.new_entries, 1);

    let timeline = rewind.timeline().unwrap();
    assert_eq!(timeline.sessions(), &[t(10_000), t(20_000)]);
    assert_eq!(rewind.resolve_time("15000").unwrap(), t(10_000));
    assert!(matches!(rewind.resolve_time("5000"), Err(RewindError::NoSessionAt(_))));
}

#[test]
fn test_interrupted_session_blocks_reads_until_regressed() {
    let fx = Fixture::new();
    let (d1, d2) = two_generations(&fx);
    fx.rewind().backup(&d1, &at(10_000)).unwrap();

    let crashing = fx.rewind_with(StopAt::new(SessionStep::MirrorUpdated, 2));
    assert!(matches!(
        crashing.backup(&d2, &at(20_000)),
        Err(RewindError::Interrupted(_))
    ));

    let rewind = fx.rewind();
    assert!(matches!(
        rewind.restore(t(10_000), &fx.path("blocked"), &RestoreOptions::default()),
        Err(RewindError::NeedsRegress { .. })
    ));
    assert!(matches!(
        rewind.backup(&d2, &at(30_000)),
        Err(RewindError::NeedsRegress { .. })
    ));

    // A forced backup regresses first, then runs normally
    let forced = BackupOptions {
        force: true,
        ..at(30_000)
    };
    let stats = rewind.backup(&d2, &forced).unwrap();
    assert_eq!(stats.previous_time, Some(t(10_000)));
    assert_eq!(rewind.state().unwrap(), RepoState::Clean { current: t(30_000) });
    assert_eq!(
        rewind.timeline().unwrap().sessions(),
        &[t(10_000), t(30_000)]
    );

    let then = fx.path("then");
    rewind.restore(t(10_000), &then, &RestoreOptions::default()).unwrap();
    assert_eq!(tree_contents(&then), tree_contents(&d1));
}
