//! Parallel per-partition sort phase.
//!
//! Partitions are statically striped across the workers: worker `t` of `n`
//! owns ids `t, t+n, t+2n, …` and touches no other partition, so the phase
//! needs no cross-worker synchronization. Each worker reuses one byte buffer
//! sized to the largest file in its stripe for both the read and the sorted
//! rewrite.

use super::CollateStats;
use crate::error::{CollateError, Result};
use crate::record::{decode_pairs, FixedWidth, Pair};
use crate::store::{rewrite_sorted, SealedPartition};
use std::fs::File;
use std::io::Read;
use std::thread;
use tracing::debug;

/// Sorts every partition file in place, using `workers` threads.
///
/// Returns gathered statistics iff `gather_stats` is set.
pub(crate) fn sort_partitions<K, V>(
    parts: &[SealedPartition],
    workers: usize,
    gather_stats: bool,
) -> Result<Option<CollateStats>>
where
    K: FixedWidth + Ord,
    V: FixedWidth,
{
    let workers = workers.clamp(1, parts.len());

    let results = thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|stripe| {
                scope.spawn(move || sort_stripe::<K, V>(parts, stripe, workers, gather_stats))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .map_err(|_| CollateError::WorkerPanicked("sort"))
            })
            .collect::<Vec<_>>()
    });

    let mut stats = CollateStats::default();
    for result in results {
        stats.absorb(result??);
    }
    debug!(workers, "partitions sorted");

    Ok(gather_stats.then_some(stats))
}

/// Sorts the stripe `stripe, stripe + step, …` in ascending id order.
fn sort_stripe<K, V>(
    parts: &[SealedPartition],
    stripe: usize,
    step: usize,
    gather_stats: bool,
) -> Result<CollateStats>
where
    K: FixedWidth + Ord,
    V: FixedWidth,
{
    let largest = parts
        .iter()
        .skip(stripe)
        .step_by(step)
        .map(|part| part.bytes)
        .max()
        .unwrap_or(0);

    let mut bytes = Vec::with_capacity(largest as usize);
    let mut pairs: Vec<Pair<K, V>> = Vec::new();
    let mut stats = CollateStats::default();

    for part in parts.iter().skip(stripe).step_by(step) {
        bytes.clear();
        File::open(&part.path)?.read_to_end(&mut bytes)?;

        pairs.clear();
        decode_pairs(&bytes, &mut pairs)?;
        pairs.sort_unstable_by(|a, b| a.key.cmp(&b.key));

        if gather_stats {
            accumulate(&pairs, &mut stats);
        }

        rewrite_sorted(&part.path, &pairs, &mut bytes)?;
    }

    Ok(stats)
}

/// Folds one sorted partition into the running statistics.
fn accumulate<K: Ord, V>(pairs: &[Pair<K, V>], stats: &mut CollateStats) {
    stats.pair_count += pairs.len() as u64;

    let mut i = 0;
    while i < pairs.len() {
        let mut j = i + 1;
        while j < pairs.len() && pairs[j].key == pairs[i].key {
            j += 1;
        }
        stats.unique_key_count += 1;
        stats.mode_frequency = stats.mode_frequency.max((j - i) as u64);
        i = j;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{partition_file_path, PartitionStore};
    use tempfile::TempDir;

    fn build_partition(dir: &TempDir, p_id: usize, keys: &[u32]) -> SealedPartition {
        let path = partition_file_path(&dir.path().join("sort"), p_id);
        let mut store: PartitionStore<u32, u32> = PartitionStore::create(path, 1024).unwrap();
        for (i, &key) in keys.iter().enumerate() {
            store.append(Pair::new(key, i as u32)).unwrap();
        }
        store.seal().unwrap()
    }

    fn read_keys(part: &SealedPartition) -> Vec<u32> {
        let bytes = std::fs::read(&part.path).unwrap();
        let mut pairs: Vec<Pair<u32, u32>> = Vec::new();
        decode_pairs(&bytes, &mut pairs).unwrap();
        pairs.into_iter().map(|pair| pair.key).collect()
    }

    #[test]
    fn test_sort_rewrites_each_partition() {
        let dir = TempDir::new().unwrap();
        let parts = vec![
            build_partition(&dir, 0, &[8, 0, 4, 0]),
            build_partition(&dir, 1, &[9, 1]),
            build_partition(&dir, 2, &[]),
        ];

        sort_partitions::<u32, u32>(&parts, 2, false).unwrap();

        assert_eq!(read_keys(&parts[0]), vec![0, 0, 4, 8]);
        assert_eq!(read_keys(&parts[1]), vec![1, 9]);
        assert_eq!(read_keys(&parts[2]), Vec::<u32>::new());
    }

    #[test]
    fn test_sort_preserves_multiset() {
        let dir = TempDir::new().unwrap();
        let keys = [7_u32, 7, 3, 99, 3, 7];
        let parts = vec![build_partition(&dir, 0, &keys)];

        sort_partitions::<u32, u32>(&parts, 1, false).unwrap();

        let mut expected = keys.to_vec();
        expected.sort_unstable();
        assert_eq!(read_keys(&parts[0]), expected);
    }

    #[test]
    fn test_stats_gathered_during_sort() {
        let dir = TempDir::new().unwrap();
        let parts = vec![
            build_partition(&dir, 0, &[2, 2, 2, 0]),
            build_partition(&dir, 1, &[5, 1]),
        ];

        let stats = sort_partitions::<u32, u32>(&parts, 2, true)
            .unwrap()
            .unwrap();
        assert_eq!(stats.pair_count, 6);
        assert_eq!(stats.unique_key_count, 4);
        assert_eq!(stats.mode_frequency, 3);
    }

    #[test]
    fn test_more_workers_than_partitions() {
        let dir = TempDir::new().unwrap();
        let parts = vec![build_partition(&dir, 0, &[2, 1])];

        sort_partitions::<u32, u32>(&parts, 16, false).unwrap();
        assert_eq!(read_keys(&parts[0]), vec![1, 2]);
    }
}
