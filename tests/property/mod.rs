//! Property-based testing for Rewind
//!
//! Uses proptest to verify invariants across randomly generated index
//! streams, file histories and tree histories.

use crate::*;
use ::rewind::collate::collate2;
use ::rewind::reducer::{Branch, OrderPolicy, TreeReducer};
use ::rewind::*;
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::MetadataExt;

/// Sorted, duplicate-free index sequences of depth 1 to 3
fn index_set_strategy() -> impl Strategy<Value = Vec<Index>> {
    proptest::collection::btree_set(proptest::collection::vec(0u8..6, 1..4), 0..40).prop_map(|set| {
        set.into_iter()
            .map(|parts| Index::from_components(parts.iter().map(|p| p.to_string())))
            .collect()
    })
}

fn ok_stream(items: &[Index]) -> Vec<Result<Index>> {
    items.iter().cloned().map(Ok).collect()
}

/// Sums the numeric components of every index it is fed
#[derive(Debug, Default, Serialize, Deserialize)]
struct SumBranch {
    total: u64,
}

fn weight(index: &Index) -> u64 {
    index
        .components()
        .iter()
        .map(|c| c.to_string_lossy().parse::<u64>().unwrap_or(0))
        .sum()
}

impl Branch for SumBranch {
    type Item = Index;
    type Context = ();

    fn new(_ctx: &mut ()) -> Self {
        SumBranch::default()
    }

    fn start(&mut self, _ctx: &mut (), item: Index) -> Result<()> {
        self.total += weight(&item);
        Ok(())
    }

    fn end(&mut self, _ctx: &mut ()) -> Result<()> {
        Ok(())
    }

    fn branch_complete(&mut self, _ctx: &mut (), child: Self) -> Result<()> {
        self.total += child.total;
        Ok(())
    }

    fn can_fast_process(&self, item: &Index) -> bool {
        item.len() == 3
    }

    fn fast_process(&mut self, _ctx: &mut (), item: Index) -> Result<()> {
        self.total += weight(&item);
        Ok(())
    }
}

fn finish(reducer: TreeReducer<SumBranch>) -> u64 {
    reducer.finish(&mut ()).unwrap().map(|b| b.total).unwrap_or(0)
}

/// Per-session contents of a small fixed set of paths
fn history_strategy() -> impl Strategy<Value = Vec<Vec<Option<Vec<u8>>>>> {
    let content = proptest::option::of(proptest::collection::vec(any::<u8>(), 0..300));
    let session = proptest::collection::vec(content, TREE_PATHS.len());
    proptest::collection::vec(session, 2..5)
}

const TREE_PATHS: &[&str] = &["a.txt", "b.bin", "d/c.txt", "d/e.txt", "d/f/g.dat"];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_collation_reconstructs_both_sides(a in index_set_strategy(), b in index_set_strategy()) {
        let pairs: Vec<_> = collate2(ok_stream(&a), ok_stream(&b))
            .map(|p| p.unwrap())
            .collect();

        let left: Vec<Index> = pairs.iter().filter_map(|p| p.left.clone()).collect();
        let right: Vec<Index> = pairs.iter().filter_map(|p| p.right.clone()).collect();
        prop_assert_eq!(&left, &a);
        prop_assert_eq!(&right, &b);

        for window in pairs.windows(2) {
            prop_assert!(window[0].index < window[1].index);
        }
        for pair in &pairs {
            prop_assert!(pair.left.is_some() || pair.right.is_some());
            if let Some(l) = &pair.left {
                prop_assert_eq!(l, &pair.index);
            }
            if let Some(r) = &pair.right {
                prop_assert_eq!(r, &pair.index);
            }
        }

        let union: BTreeSet<Index> = a.iter().chain(b.iter()).cloned().collect();
        prop_assert_eq!(pairs.len(), union.len());
    }

    #[test]
    fn prop_reducer_resume_matches_unsplit(indices in index_set_strategy(), split in 0usize..41) {
        let mut items = vec![Index::root()];
        items.extend(indices);
        let expected: u64 = items.iter().map(weight).sum();

        let mut whole = TreeReducer::<SumBranch>::new(OrderPolicy::Strict);
        for item in items.iter().cloned() {
            prop_assert!(whole.process(&mut (), item).unwrap());
        }
        prop_assert_eq!(finish(whole), expected);

        let split = split.min(items.len());
        let mut first = TreeReducer::<SumBranch>::new(OrderPolicy::Strict);
        for item in items[..split].iter().cloned() {
            first.process(&mut (), item).unwrap();
        }
        let bytes = bincode::serde::encode_to_vec(&first, bincode::config::standard()).unwrap();
        let (mut resumed, _): (TreeReducer<SumBranch>, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        prop_assert_eq!(resumed.processed(), split as u64);
        for item in items[split..].iter().cloned() {
            resumed.process(&mut (), item).unwrap();
        }
        prop_assert_eq!(finish(resumed), expected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_increment_chain_restores_every_version(
        versions in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..2_000), 2..5)
    ) {
        let fx = Fixture::new();
        let source = fx.path("src");
        fs::create_dir_all(&source).unwrap();
        let rewind = fx.rewind();

        for (i, content) in versions.iter().enumerate() {
            let session = i as i64 + 1;
            write_file(&source, "file.bin", content, session * 100);
            rewind.backup(&source, &at(session * 10_000)).unwrap();
        }

        for (i, content) in versions.iter().enumerate() {
            let session = i as i64 + 1;
            let target = fx.path(&format!("restore-{}", session));
            rewind.restore(t(session * 10_000), &target, &RestoreOptions::default()).unwrap();
            let restored = target.join("file.bin");
            prop_assert_eq!(&fs::read(&restored).unwrap(), content);
            let mtime = fs::metadata(&restored).unwrap().mtime();
            prop_assert_eq!(mtime, session * 100);
        }
    }

    #[test]
    fn prop_tree_history_restores_every_session(history in history_strategy()) {
        let fx = Fixture::new();
        let rewind = fx.rewind();
        let mut last: Vec<Option<Vec<u8>>> = vec![None; TREE_PATHS.len()];
        let mut mtimes = vec![0i64; TREE_PATHS.len()];
        let mut sessions = Vec::new();

        for (i, contents) in history.iter().enumerate() {
            let session = i as i64 + 1;
            let dir = fx.path(&format!("session-{}", session));
            fs::create_dir_all(&dir).unwrap();
            for (slot, content) in contents.iter().enumerate() {
                if *content != last[slot] {
                    mtimes[slot] = session * 100;
                }
                if let Some(bytes) = content {
                    write_file(&dir, TREE_PATHS[slot], bytes, mtimes[slot]);
                }
            }
            last = contents.clone();
            rewind.backup(&dir, &at(session * 10_000)).unwrap();
            sessions.push((session, dir));
        }

        for (session, dir) in &sessions {
            let target = fx.path(&format!("restore-{}", session));
            rewind.restore(t(session * 10_000), &target, &RestoreOptions::default()).unwrap();
            prop_assert_eq!(tree_contents(&target), tree_contents(dir));
        }
        prop_assert!(rewind.verify(t(10_000)).unwrap().is_valid());
    }
}
