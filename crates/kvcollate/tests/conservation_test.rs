//! Property-based tests for the collation invariants.
//!
//! Uses proptest to check, over arbitrary deposit sequences: conservation
//! (no record lost or invented), partition locality, per-partition
//! sortedness, key-group uniqueness, and the bulk-read round trip under
//! varying request sizes.

use kvcollate::{Collator, CollatorConfig, Pair};
use proptest::prelude::*;
use std::collections::HashSet;
use tempfile::TempDir;

const PARTITIONS: usize = 8;

/// Strategy: up to a few hundred records with keys drawn from a small range
/// so duplicates and empty partitions both occur.
fn records_strategy() -> impl Strategy<Value = Vec<Pair<u32, u32>>> {
    prop::collection::vec((0u32..1024, any::<u32>()), 0..400)
        .prop_map(|raw| raw.into_iter().map(|(k, v)| Pair::new(k, v)).collect())
}

fn collate(records: &[Pair<u32, u32>], buf_count: usize) -> (TempDir, Collator<u32, u32>) {
    let dir = TempDir::new().unwrap();
    let config = CollatorConfig::default()
        .with_work_pref(dir.path().join("p"))
        .with_partition_count(PARTITIONS)
        .with_buf_count(buf_count);
    let mut collator: Collator<u32, u32> = Collator::new(config).unwrap();
    // Split the input across several deposits to vary buffer boundaries.
    for chunk in records.chunks(97.max(records.len() / 3 + 1)) {
        collator.deposit(chunk);
    }
    collator.close_deposit_stream().unwrap();
    collator.collate(2).unwrap();
    (dir, collator)
}

fn sorted_multiset(records: &[Pair<u32, u32>]) -> Vec<(u32, u32)> {
    let mut out: Vec<(u32, u32)> = records.iter().map(|p| (p.key, p.value)).collect();
    out.sort_unstable();
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Conservation + round trip: bulk reads return exactly the deposited
    /// multiset, whatever the request size.
    #[test]
    fn prop_bulk_read_returns_deposited_multiset(
        records in records_strategy(),
        request in 1usize..64,
    ) {
        let (_dir, collator) = collate(&records, 2);
        let reader = collator.bulk_reader().unwrap();

        let mut drained = Vec::new();
        loop {
            let n = reader.read(&mut drained, request).unwrap();
            if n == 0 {
                break;
            }
        }

        prop_assert_eq!(sorted_multiset(&drained), sorted_multiset(&records));
    }

    /// Partition locality and sortedness of the on-disk files.
    #[test]
    fn prop_partition_files_are_local_and_sorted(records in records_strategy()) {
        let (dir, _collator) = collate(&records, 2);

        for p_id in 0..PARTITIONS {
            let path = dir.path().join(format!("p.{}.part", p_id));
            let bytes = std::fs::read(path).unwrap();
            let stored: Vec<Pair<u32, u32>> = bytes
                .chunks_exact(Pair::<u32, u32>::WIDTH)
                .map(Pair::<u32, u32>::load)
                .collect();

            for pair in &stored {
                prop_assert_eq!(pair.key as usize % PARTITIONS, p_id);
            }
            for window in stored.windows(2) {
                prop_assert!(window[0].key <= window[1].key);
            }
        }
    }

    /// Key-group iteration yields each distinct key exactly once.
    #[test]
    fn prop_key_groups_cover_each_key_once(records in records_strategy()) {
        let (_dir, collator) = collate(&records, 3);

        let mut seen = Vec::new();
        let mut cursor = collator.begin().unwrap();
        while cursor != collator.end() {
            seen.push(cursor.key().unwrap());
            cursor.advance().unwrap();
        }

        let unique: HashSet<u32> = seen.iter().copied().collect();
        prop_assert_eq!(unique.len(), seen.len(), "no key may repeat");
        let expected: HashSet<u32> = records.iter().map(|p| p.key).collect();
        prop_assert_eq!(unique, expected);
    }
}
