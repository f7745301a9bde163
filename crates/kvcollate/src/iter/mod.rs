//! Cursors over the collated partitions.
//!
//! Two access modes are provided, both streaming the partition files in id
//! order:
//!
//! - [`KeyGroupCursor`]: single-owner cursor that yields each unique key
//!   once, skipping over the run of records sharing it. Within a partition,
//!   equal keys are adjacent because the file is sorted; across partitions
//!   equal keys cannot occur because a key hashes to exactly one partition.
//! - [`BulkReader`]: mutex-guarded reader that hands out chunks of records
//!   to any number of threads. Each record is delivered at most once; the
//!   distribution among readers is unspecified.
//!
//! Both borrow the collator, so the temp files outlive every cursor.

use crate::error::Result;
use crate::record::{decode_pairs, FixedWidth, Pair};
use crate::store::SealedPartition;
use std::fs::File;
use std::io::Read;
use std::sync::Mutex;

/// Size of a cursor's read-ahead block: 5 MiB.
pub const READ_BLOCK_BYTES: usize = 5 * 1024 * 1024;

/// Largest record-aligned block size, so a read never splits a record.
fn aligned_block_bytes(record_width: usize) -> usize {
    (READ_BLOCK_BYTES / record_width).max(1) * record_width
}

/// Reads up to `max` bytes from `file` into `buf`, replacing its contents.
///
/// Returns the number of bytes read; 0 means end of file. Partition files
/// hold a whole number of records, so a full block is always record-aligned.
fn read_block(file: &mut File, buf: &mut Vec<u8>, max: usize) -> std::io::Result<usize> {
    buf.clear();
    let n = file.by_ref().take(max as u64).read_to_end(buf)?;
    Ok(n)
}

/// A cursor yielding each unique key of the collated collection exactly once.
///
/// Dereference with [`key`](Self::key); [`advance`](Self::advance) skips all
/// records sharing the current key. Single-threaded by design.
pub struct KeyGroupCursor<'c, K, V> {
    parts: &'c [SealedPartition],
    p_id: usize,
    file: Option<File>,
    block: Vec<Pair<K, V>>,
    block_idx: usize,
    byte_buf: Vec<u8>,
    current: Option<Pair<K, V>>,
    pos: u64,
    at_end: bool,
}

impl<'c, K: FixedWidth + Ord, V: FixedWidth> KeyGroupCursor<'c, K, V> {
    /// Creates a cursor positioned on the first record, reading ahead from
    /// partition 0. The cursor is terminal immediately if every partition is
    /// empty.
    pub(crate) fn new(parts: &'c [SealedPartition]) -> Result<Self> {
        let mut cursor = Self {
            parts,
            p_id: 0,
            file: None,
            block: Vec::new(),
            block_idx: 0,
            byte_buf: Vec::new(),
            current: None,
            pos: 0,
            at_end: false,
        };
        cursor.step_record()?;
        Ok(cursor)
    }

    /// Creates the terminal sentinel.
    pub(crate) fn terminal(parts: &'c [SealedPartition]) -> Self {
        Self {
            parts,
            p_id: parts.len(),
            file: None,
            block: Vec::new(),
            block_idx: 0,
            byte_buf: Vec::new(),
            current: None,
            pos: 0,
            at_end: true,
        }
    }

    /// Returns the key at the current position, or `None` at end.
    pub fn key(&self) -> Option<K> {
        self.current.map(|pair| pair.key)
    }

    /// Returns the record at the current position, or `None` at end.
    pub fn pair(&self) -> Option<Pair<K, V>> {
        self.current
    }

    /// Returns the absolute index of the current record in the collated
    /// sequence.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Returns `true` once the cursor has consumed every partition.
    pub fn at_end(&self) -> bool {
        self.at_end
    }

    /// Advances past every record sharing the current key.
    ///
    /// A no-op on a terminal cursor.
    pub fn advance(&mut self) -> Result<()> {
        let Some(group_key) = self.key() else {
            return Ok(());
        };
        loop {
            self.step_record()?;
            if self.at_end {
                return Ok(());
            }
            self.pos += 1;
            match self.current {
                Some(pair) if pair.key == group_key => continue,
                _ => return Ok(()),
            }
        }
    }

    /// Moves to the next record, refilling the block and hopping to the next
    /// partition as needed; sets the end flag when no record remains.
    fn step_record(&mut self) -> Result<()> {
        loop {
            if self.block_idx < self.block.len() {
                self.current = Some(self.block[self.block_idx]);
                self.block_idx += 1;
                return Ok(());
            }

            if self.p_id >= self.parts.len() {
                self.current = None;
                self.at_end = true;
                return Ok(());
            }

            if self.file.is_none() {
                self.file = Some(File::open(&self.parts[self.p_id].path)?);
            }
            let file = self.file.as_mut().unwrap();

            let n = read_block(
                file,
                &mut self.byte_buf,
                aligned_block_bytes(Pair::<K, V>::WIDTH),
            )?;
            if n == 0 {
                self.file = None;
                self.p_id += 1;
                continue;
            }

            self.block.clear();
            decode_pairs(&self.byte_buf, &mut self.block)?;
            self.block_idx = 0;
        }
    }
}

impl<K: FixedWidth + Ord, V: FixedWidth> PartialEq for KeyGroupCursor<'_, K, V> {
    fn eq(&self, other: &Self) -> bool {
        if self.at_end || other.at_end {
            return self.at_end && other.at_end;
        }
        self.p_id == other.p_id && self.pos == other.pos
    }
}

impl<K, V> std::fmt::Debug for KeyGroupCursor<'_, K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGroupCursor")
            .field("p_id", &self.p_id)
            .field("pos", &self.pos)
            .field("at_end", &self.at_end)
            .finish()
    }
}

/// Inner position of a [`BulkReader`], advanced under its mutex.
struct BulkState<K, V> {
    p_id: usize,
    file: Option<File>,
    byte_buf: Vec<u8>,
    _pairs: std::marker::PhantomData<Pair<K, V>>,
}

/// A thread-safe reader draining the collated records in bulk.
///
/// Share `&BulkReader` among any number of threads; each `read` hands the
/// caller a disjoint chunk. The mutex is a sleeping lock because the
/// critical section includes file I/O.
pub struct BulkReader<'c, K, V> {
    parts: &'c [SealedPartition],
    state: Mutex<BulkState<K, V>>,
}

impl<'c, K: FixedWidth + Ord, V: FixedWidth> BulkReader<'c, K, V> {
    pub(crate) fn new(parts: &'c [SealedPartition]) -> Self {
        Self {
            parts,
            state: Mutex::new(BulkState {
                p_id: 0,
                file: None,
                byte_buf: Vec::new(),
                _pairs: std::marker::PhantomData,
            }),
        }
    }

    /// Appends up to `count` records to `dst`, crossing partition boundaries
    /// as needed. Returns the number of records appended; 0 means the whole
    /// collection has been delivered.
    pub fn read(&self, dst: &mut Vec<Pair<K, V>>, count: usize) -> Result<usize> {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let state = &mut *state;

        let width = Pair::<K, V>::WIDTH;
        let mut appended = 0;
        while appended < count {
            if state.file.is_none() {
                if state.p_id >= self.parts.len() {
                    break;
                }
                state.file = Some(File::open(&self.parts[state.p_id].path)?);
            }

            let want = (count - appended)
                .saturating_mul(width)
                .min(aligned_block_bytes(width));
            let file = state.file.as_mut().unwrap();
            let n = read_block(file, &mut state.byte_buf, want)?;
            if n == 0 {
                state.file = None;
                state.p_id += 1;
                continue;
            }

            decode_pairs(&state.byte_buf, dst)?;
            appended += n / width;
        }
        Ok(appended)
    }
}

impl<K, V> std::fmt::Debug for BulkReader<'_, K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkReader").finish_non_exhaustive()
    }
}
