//! Property tests for the log invariants.

use proptest::prelude::*;
use protobuf::Message;
use raft::eraftpb::{Entry, HardState, Snapshot};
use raftwal::{WalConfig, WalStore};
use tempfile::tempdir;

fn open_store(dir: &std::path::Path) -> WalStore {
    WalStore::open(WalConfig::builder().dir(dir.to_path_buf()).raft_id(1).build()).unwrap()
}

fn entry(index: u64, term: u64, data: &[u8]) -> Entry {
    let mut e = Entry::default();
    e.set_index(index);
    e.set_term(term);
    if !data.is_empty() {
        e.set_data(data.to_vec().into());
    }
    e
}

/// Entries 1..=n built from per-entry payloads and term increments.
fn batch(payloads: &[Vec<u8>], term_bumps: &[bool]) -> Vec<Entry> {
    let mut term = 1;
    payloads
        .iter()
        .zip(term_bumps)
        .enumerate()
        .map(|(i, (data, bump))| {
            if *bump {
                term += 1;
            }
            entry(i as u64 + 1, term, data)
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    // Every appended entry reads back individually, byte-exact.
    #[test]
    fn append_then_read_roundtrip(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..200), 1..40),
    ) {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let bumps = vec![false; payloads.len()];
        let batch = batch(&payloads, &bumps);
        store.save(&HardState::default(), &batch, &Snapshot::default()).unwrap();

        for want in &batch {
            let got = store.entries(want.get_index(), want.get_index() + 1, None).unwrap();
            prop_assert_eq!(got.len(), 1);
            prop_assert_eq!(got[0].get_data(), want.get_data());
            prop_assert_eq!(got[0].get_term(), want.get_term());
        }
    }

    // A size-capped read returns a non-empty prefix whose total either
    // covers the range or first exceeds the cap at its final element.
    #[test]
    fn range_reads_are_bounded_prefixes(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..200), 1..40),
        max_size in 0u64..4000,
    ) {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let bumps = vec![false; payloads.len()];
        let batch = batch(&payloads, &bumps);
        let n = batch.len() as u64;
        store.save(&HardState::default(), &batch, &Snapshot::default()).unwrap();

        let got = store.entries(1, n + 1, max_size).unwrap();
        prop_assert!(!got.is_empty());
        for (k, e) in got.iter().enumerate() {
            prop_assert_eq!(e.get_index(), k as u64 + 1);
        }

        let sizes: Vec<u64> = got.iter().map(|e| u64::from(e.compute_size())).collect();
        let total: u64 = sizes.iter().sum();
        if (got.len() as u64) < n {
            // Truncated: the cap was crossed by the last element only.
            prop_assert!(total > max_size);
            prop_assert!(total - sizes.last().unwrap() <= max_size);
        }
    }

    // term(i) agrees with the appended entry for every stored index.
    #[test]
    fn term_lookup_matches_entries(
        term_bumps in prop::collection::vec(any::<bool>(), 1..60),
    ) {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let payloads = vec![Vec::new(); term_bumps.len()];
        let batch = batch(&payloads, &term_bumps);
        store.save(&HardState::default(), &batch, &Snapshot::default()).unwrap();

        for want in &batch {
            prop_assert_eq!(store.term(want.get_index()).unwrap(), want.get_term());
        }
    }

    // Overwriting at index k drops everything at and above k.
    #[test]
    fn overwrite_truncates(
        n in 2u64..40,
        data in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let all: Vec<Entry> = (1..=n).map(|i| entry(i, 1, b"old")).collect();
        store.save(&HardState::default(), &all, &Snapshot::default()).unwrap();

        let k = 1 + n / 2;
        store.save(&HardState::default(), &[entry(k, 2, &data)], &Snapshot::default()).unwrap();

        prop_assert_eq!(store.last_index().unwrap(), k);
        prop_assert!(store.entries(k + 1, k + 2, None).is_err());
        let got = store.entries(1, k + 1, None).unwrap();
        prop_assert_eq!(got.len() as u64, k);
        prop_assert_eq!(got.last().unwrap().get_term(), 2);
        prop_assert_eq!(got.last().unwrap().get_data(), &data[..]);
    }

    // Close/reopen preserves every observable value.
    #[test]
    fn reopen_is_lossless(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..100), 1..30),
        term_bumps in prop::collection::vec(any::<bool>(), 1..30),
    ) {
        let dir = tempdir().unwrap();
        let n = payloads.len().min(term_bumps.len());
        let batch = batch(&payloads[..n], &term_bumps[..n]);
        let mut hs = HardState::default();
        hs.set_term(9);
        hs.set_commit(n as u64);
        {
            let store = open_store(dir.path());
            store.save(&hs, &batch, &Snapshot::default()).unwrap();
        }
        let store = open_store(dir.path());
        prop_assert_eq!(store.first_index().unwrap(), 1);
        prop_assert_eq!(store.last_index().unwrap(), n as u64);
        prop_assert_eq!(store.initial_state().unwrap().hard_state, hs);
        let got = store.entries(1, n as u64 + 1, None).unwrap();
        for (want, have) in batch.iter().zip(&got) {
            prop_assert_eq!(want.get_data(), have.get_data());
            prop_assert_eq!(want.get_term(), have.get_term());
        }
    }
}
