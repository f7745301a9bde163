//! Disk-backed partition stores for the ingest phase.
//!
//! Each partition owns a small in-memory staging buffer and an append-only
//! temp file at `"{work_pref}.{p_id}.part"`. The mapper routes every record
//! to the partition selected by the low bits of its key hash; when a staging
//! buffer reaches its cap the partition's bytes are spilled to the file.
//! Files hold packed records with no framing and are only meaningful to the
//! collator that created them.

use crate::error::{CollateError, Result};
use crate::record::{encode_pairs, FixedWidth, KeyHasher, Pair};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Memory cap for one partition's staging buffer: 1 MiB.
pub const STAGING_BUF_BYTES: usize = 1024 * 1024;

/// Extension of the per-partition temp files.
pub const PARTITION_FILE_EXT: &str = "part";

/// Builds the temp-file path for partition `p_id` under `work_pref`.
///
/// The prefix is a path stem, not a directory: prefix `/tmp/x` and partition
/// 5 yield `/tmp/x.5.part`.
pub fn partition_file_path(work_pref: &Path, p_id: usize) -> PathBuf {
    let mut path = work_pref.as_os_str().to_os_string();
    path.push(format!(".{}.{}", p_id, PARTITION_FILE_EXT));
    PathBuf::from(path)
}

/// A sealed partition: its temp file is closed and fully written.
#[derive(Debug, Clone)]
pub struct SealedPartition {
    /// Path of the partition's temp file.
    pub path: PathBuf,
    /// Total bytes written to the file.
    pub bytes: u64,
}

/// One partition's staging buffer and write-open temp file.
pub struct PartitionStore<K, V> {
    path: PathBuf,
    staging: Vec<Pair<K, V>>,
    staging_cap: usize,
    file: BufWriter<File>,
    record: Vec<u8>,
    bytes_written: u64,
}

impl<K: FixedWidth + Ord, V: FixedWidth> PartitionStore<K, V> {
    /// Creates the partition's temp file and an empty staging buffer capped
    /// at `staging_cap` records.
    pub fn create(path: PathBuf, staging_cap: usize) -> Result<Self> {
        let file = BufWriter::new(File::create(&path)?);
        Ok(Self {
            path,
            staging: Vec::with_capacity(staging_cap),
            staging_cap,
            file,
            record: vec![0u8; Pair::<K, V>::WIDTH],
            bytes_written: 0,
        })
    }

    /// Appends one record, spilling the staging buffer when it hits the cap.
    pub fn append(&mut self, pair: Pair<K, V>) -> Result<()> {
        self.staging.push(pair);
        debug_assert!(self.staging.len() <= self.staging_cap);
        if self.staging.len() == self.staging_cap {
            self.flush()?;
        }
        Ok(())
    }

    /// Writes the staged records verbatim to the file and clears the buffer.
    pub fn flush(&mut self) -> Result<()> {
        for pair in &self.staging {
            pair.store(&mut self.record);
            self.file.write_all(&self.record)?;
        }
        self.bytes_written += (self.staging.len() * Pair::<K, V>::WIDTH) as u64;
        self.staging.clear();
        Ok(())
    }

    /// Flushes the remainder, releases the staging memory, and closes the
    /// file.
    pub fn seal(mut self) -> Result<SealedPartition> {
        if !self.staging.is_empty() {
            self.flush()?;
        }
        self.staging = Vec::new();
        self.file.flush()?;
        drop(self.file);
        Ok(SealedPartition {
            path: self.path,
            bytes: self.bytes_written,
        })
    }

    /// Path of the partition's temp file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<K, V> std::fmt::Debug for PartitionStore<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionStore")
            .field("path", &self.path)
            .field("staged", &self.staging.len())
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}

/// The full set of partition stores plus the key-routing state.
///
/// Owned exclusively by the mapper thread during ingest, which is what makes
/// every partition single-writer without per-partition locks.
pub struct PartitionSet<K, V, H> {
    stores: Vec<PartitionStore<K, V>>,
    hasher: H,
    mask: u64,
}

impl<K, V, H> PartitionSet<K, V, H>
where
    K: FixedWidth + Ord,
    V: FixedWidth,
    H: KeyHasher<K>,
{
    /// Creates `partition_count` stores under `work_pref`.
    ///
    /// Creation is all-or-nothing: if any file cannot be created, the files
    /// already created are removed before the error is returned, so a failed
    /// constructor never leaks temp files.
    pub fn create(work_pref: &Path, partition_count: usize, hasher: H) -> Result<Self> {
        let width = Pair::<K, V>::WIDTH;
        let staging_cap = if width == 0 { 0 } else { STAGING_BUF_BYTES / width };
        if staging_cap == 0 {
            return Err(CollateError::Config(format!(
                "record width {} does not fit the {} B staging buffer",
                width, STAGING_BUF_BYTES
            )));
        }

        let mut stores = Vec::with_capacity(partition_count);
        for p_id in 0..partition_count {
            let path = partition_file_path(work_pref, p_id);
            match PartitionStore::create(path, staging_cap) {
                Ok(store) => stores.push(store),
                Err(err) => {
                    for store in &stores {
                        let _ = fs::remove_file(store.path());
                    }
                    return Err(err);
                }
            }
        }
        debug!(partitions = partition_count, staging_cap, "partition stores created");

        Ok(Self {
            stores,
            hasher,
            mask: (partition_count - 1) as u64,
        })
    }

    /// Returns the partition id for `key`.
    pub fn partition_id(&self, key: &K) -> usize {
        (self.hasher.hash(key) & self.mask) as usize
    }

    /// Routes one record to its partition.
    pub fn route(&mut self, pair: Pair<K, V>) -> Result<()> {
        let p_id = self.partition_id(&pair.key);
        self.stores[p_id].append(pair)
    }

    /// Seals every partition, in id order.
    pub fn seal_all(self) -> Result<Vec<SealedPartition>> {
        let mut sealed = Vec::with_capacity(self.stores.len());
        for store in self.stores {
            sealed.push(store.seal()?);
        }
        Ok(sealed)
    }

    /// Number of partitions in the set.
    pub fn partition_count(&self) -> usize {
        self.stores.len()
    }
}

/// Rewrites a sorted in-memory image back to a partition file.
///
/// The file is removed and recreated rather than overwritten in place:
/// rewriting an existing inode can force the writer to serialize against the
/// journal entries of the earlier unflushed appends, halving throughput on
/// some filesystems.
pub(crate) fn rewrite_sorted<K: FixedWidth + Ord, V: FixedWidth>(
    path: &Path,
    pairs: &[Pair<K, V>],
    scratch: &mut Vec<u8>,
) -> Result<()> {
    encode_pairs(pairs, scratch);
    fs::remove_file(path)?;
    let mut file = File::create(path)?;
    file.write_all(scratch)?;
    Ok(())
}
