//! The collator facade: lifecycle, buffer hand-off, and phase transitions.
//!
//! # Architecture
//!
//! ```text
//! producers ──► BufferPool ──► mapper thread ──► PartitionSet ──► temp files
//!                                                                    │
//!                               KeyGroupCursor / BulkReader ◄── collate(n)
//! ```
//!
//! A collator moves through three phases:
//!
//! 1. **Ingesting**: producers check buffers out, fill them, and return
//!    them; the background mapper drains full buffers into the partition
//!    stores.
//! 2. **Closed**: the deposit stream has ended; every partition file holds
//!    its complete, unordered record multiset.
//! 3. **Collated**: every partition file has been rewritten with keys in
//!    non-decreasing order and may be iterated.
//!
//! Phase misuse that a caller can recover from (collating twice, iterating
//! before collating) is reported as [`CollateError::InvalidPhase`].
//! Collating while the deposit stream is still open is a fatal precondition
//! violation, as is dropping the collator with buffers still checked out.
//! Dropping the collator removes every temp file.

mod sort;

use crate::error::{CollateError, Result};
use crate::iter::{BulkReader, KeyGroupCursor};
use crate::pool::{BufferPool, PairBuf};
use crate::record::{FixedWidth, IdentityHasher, KeyHasher, Pair};
use crate::store::{partition_file_path, PartitionSet, SealedPartition};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// Default number of producer buffers.
///
/// Set it to at least the producer count to avoid throttling; twice the
/// producer count is a good heuristic.
pub const DEFAULT_BUF_COUNT: usize = 16;

/// Default number of partitions. Must be a power of two.
pub const DEFAULT_PARTITION_COUNT: usize = 512;

/// Default working-path prefix for the temp files.
pub const DEFAULT_WORK_PREF: &str = ".";

/// Lifecycle phase of a [`Collator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepting deposits; the mapper is running.
    Ingesting,
    /// Deposit stream closed; partition files are sealed but unordered.
    Closed,
    /// Partition files are sorted and ready for iteration.
    Collated,
}

/// Configuration for a [`Collator`].
#[derive(Debug, Clone)]
pub struct CollatorConfig {
    /// Path stem under which the partition temp files live.
    ///
    /// Partition `p` is stored at `"{work_pref}.{p}.part"`. Default: `"."`.
    pub work_pref: PathBuf,

    /// Number of producer buffers circulating through the pools.
    pub buf_count: usize,

    /// Number of partitions; must be a power of two.
    pub partition_count: usize,

    /// Gather pair/key statistics during the sort phase.
    pub compute_stats: bool,
}

impl Default for CollatorConfig {
    fn default() -> Self {
        Self {
            work_pref: PathBuf::from(DEFAULT_WORK_PREF),
            buf_count: DEFAULT_BUF_COUNT,
            partition_count: DEFAULT_PARTITION_COUNT,
            compute_stats: false,
        }
    }
}

impl CollatorConfig {
    /// Creates a configuration with a custom working-path prefix.
    pub fn with_work_pref(mut self, work_pref: impl Into<PathBuf>) -> Self {
        self.work_pref = work_pref.into();
        self
    }

    /// Creates a configuration with a custom buffer count.
    pub fn with_buf_count(mut self, buf_count: usize) -> Self {
        self.buf_count = buf_count;
        self
    }

    /// Creates a configuration with a custom partition count.
    pub fn with_partition_count(mut self, partition_count: usize) -> Self {
        self.partition_count = partition_count;
        self
    }

    /// Creates a configuration that gathers statistics during collation.
    pub fn with_compute_stats(mut self, compute_stats: bool) -> Self {
        self.compute_stats = compute_stats;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.buf_count == 0 {
            return Err(CollateError::Config("buf_count must be at least 1".into()));
        }
        if !self.partition_count.is_power_of_two() {
            return Err(CollateError::Config(format!(
                "partition_count must be a power of two, got {}",
                self.partition_count
            )));
        }
        Ok(())
    }
}

/// Statistics gathered during the sort phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollateStats {
    /// Total number of collated records.
    pub pair_count: u64,
    /// Number of distinct keys.
    pub unique_key_count: u64,
    /// Occurrence count of the most frequent key.
    pub mode_frequency: u64,
}

impl CollateStats {
    /// Folds another worker's totals into this one.
    pub(crate) fn absorb(&mut self, other: Self) {
        self.pair_count += other.pair_count;
        self.unique_key_count += other.unique_key_count;
        self.mode_frequency = self.mode_frequency.max(other.mode_frequency);
    }
}

/// Collates key-value records deposited concurrently by many producers.
///
/// Records are hashed into disk-backed partitions while producers deposit,
/// then each partition is sorted by key, and finally the grouped collection
/// is exposed through [`KeyGroupCursor`] and [`BulkReader`]. Temp files live
/// only as long as the collator; they are removed on drop even when the
/// deposit stream was never closed.
///
/// # Example
///
/// ```rust,ignore
/// use kvcollate::{Collator, CollatorConfig, Pair};
///
/// let config = CollatorConfig::default().with_work_pref("/tmp/job");
/// let mut collator: Collator<u32, u64> = Collator::new(config)?;
///
/// let mut buf = collator.checkout_buffer();
/// buf.push(Pair::new(7, 1));
/// collator.return_buffer(buf);
///
/// collator.close_deposit_stream()?;
/// collator.collate(4)?;
///
/// let mut cursor = collator.begin()?;
/// while cursor != collator.end() {
///     let key = cursor.key().unwrap();
///     cursor.advance()?;
/// }
/// ```
pub struct Collator<K, V, H = IdentityHasher> {
    config: CollatorConfig,
    pool: Arc<BufferPool<K, V>>,
    stream_incoming: Arc<AtomicBool>,
    mapper: Option<JoinHandle<PartitionSet<K, V, H>>>,
    sealed: Vec<SealedPartition>,
    phase: Phase,
    stats: Option<CollateStats>,
}

impl<K, V, H> Collator<K, V, H>
where
    K: FixedWidth + Ord,
    V: FixedWidth,
    H: KeyHasher<K> + Send + 'static,
{
    /// Creates a collator with a default-constructed hasher and starts the
    /// mapper.
    pub fn new(config: CollatorConfig) -> Result<Self>
    where
        H: Default,
    {
        Self::with_hasher(config, H::default())
    }

    /// Creates a collator that routes keys with `hasher` and starts the
    /// mapper.
    ///
    /// # Errors
    ///
    /// Returns [`CollateError::Config`] for an invalid configuration and
    /// I/O errors from creating the partition files. A failed constructor
    /// leaves no temp files behind.
    pub fn with_hasher(config: CollatorConfig, hasher: H) -> Result<Self> {
        config.validate()?;

        let set = PartitionSet::create(&config.work_pref, config.partition_count, hasher)?;
        let pool = Arc::new(BufferPool::new(config.buf_count));
        let stream_incoming = Arc::new(AtomicBool::new(true));

        let mapper = {
            let pool = Arc::clone(&pool);
            let incoming = Arc::clone(&stream_incoming);
            let spawned = thread::Builder::new()
                .name("kvcollate-mapper".into())
                .spawn(move || mapper_loop(pool, incoming, set));
            match spawned {
                Ok(handle) => handle,
                Err(err) => {
                    for p_id in 0..config.partition_count {
                        let _ = fs::remove_file(partition_file_path(&config.work_pref, p_id));
                    }
                    return Err(err.into());
                }
            }
        };
        debug!(
            work_pref = %config.work_pref.display(),
            buf_count = config.buf_count,
            partitions = config.partition_count,
            "collator ingesting"
        );

        Ok(Self {
            config,
            pool,
            stream_incoming,
            mapper: Some(mapper),
            sealed: Vec::new(),
            phase: Phase::Ingesting,
            stats: None,
        })
    }

    /// Checks out a free buffer for a producer, blocking until one is
    /// available.
    ///
    /// The block is the ingest back-pressure: with all buffers full, the
    /// producers wait for the mapper.
    ///
    /// # Panics
    ///
    /// Panics if the deposit stream has been closed.
    pub fn checkout_buffer(&self) -> PairBuf<K, V> {
        assert!(
            self.phase == Phase::Ingesting,
            "checkout_buffer after the deposit stream closed"
        );
        self.pool.checkout_free()
    }

    /// Returns a filled buffer for mapping.
    ///
    /// # Panics
    ///
    /// Panics if the deposit stream has been closed.
    pub fn return_buffer(&self, buf: PairBuf<K, V>) {
        assert!(
            self.phase == Phase::Ingesting,
            "return_buffer after the deposit stream closed"
        );
        self.pool.return_full(buf);
    }

    /// Copy-in convenience: deposits a slice of records through one buffer
    /// checkout.
    pub fn deposit(&self, pairs: &[Pair<K, V>]) {
        let mut buf = self.checkout_buffer();
        buf.extend_from_slice(pairs);
        self.return_buffer(buf);
    }

    /// Ends the deposit stream: joins the mapper after it drains the full
    /// pool, then flushes and seals every partition.
    ///
    /// All producers must have returned their buffers before this is called.
    pub fn close_deposit_stream(&mut self) -> Result<()> {
        self.ensure_phase(Phase::Ingesting, "close_deposit_stream")?;

        self.stream_incoming.store(false, Ordering::Release);
        let mapper = match self.mapper.take() {
            Some(handle) => handle,
            None => return Err(CollateError::WorkerPanicked("mapper")),
        };
        let set = mapper
            .join()
            .map_err(|_| CollateError::WorkerPanicked("mapper"))?;

        self.sealed = set.seal_all()?;
        self.phase = Phase::Closed;
        debug!(partitions = self.sealed.len(), "deposit stream closed");
        Ok(())
    }

    /// Sorts every partition file by key using `threads` parallel workers.
    ///
    /// Statistics are gathered during the sorted scan iff the configuration
    /// enabled `compute_stats`. A second call is rejected with
    /// [`CollateError::InvalidPhase`]; the sorted files are not touched.
    ///
    /// Calling this before [`close_deposit_stream`](Self::close_deposit_stream)
    /// is a fatal precondition violation and aborts the process.
    pub fn collate(&mut self, threads: usize) -> Result<()> {
        if self.phase == Phase::Ingesting {
            // The mapper is still running and the partition files are
            // incomplete; no result a caller could recover with exists.
            error!("collate called before close_deposit_stream");
            process::abort();
        }
        self.ensure_phase(Phase::Closed, "collate")?;

        self.stats = sort::sort_partitions::<K, V>(&self.sealed, threads, self.config.compute_stats)?;
        self.phase = Phase::Collated;
        debug!(threads, "collation finished");
        Ok(())
    }

    /// Returns a key-group cursor positioned on the first record.
    pub fn begin(&self) -> Result<KeyGroupCursor<'_, K, V>> {
        self.ensure_phase(Phase::Collated, "begin")?;
        KeyGroupCursor::new(&self.sealed)
    }

    /// Returns the terminal cursor.
    pub fn end(&self) -> KeyGroupCursor<'_, K, V> {
        KeyGroupCursor::terminal(&self.sealed)
    }

    /// Returns a thread-safe bulk reader over the collated records.
    pub fn bulk_reader(&self) -> Result<BulkReader<'_, K, V>> {
        self.ensure_phase(Phase::Collated, "bulk_reader")?;
        Ok(BulkReader::new(&self.sealed))
    }

    /// Total number of collated records.
    ///
    /// # Errors
    ///
    /// Returns [`CollateError::StatsUnavailable`] unless `compute_stats` was
    /// enabled for the collate run.
    pub fn pair_count(&self) -> Result<u64> {
        Ok(self.stats()?.pair_count)
    }

    /// Number of distinct keys.
    ///
    /// # Errors
    ///
    /// Returns [`CollateError::StatsUnavailable`] unless `compute_stats` was
    /// enabled for the collate run.
    pub fn unique_key_count(&self) -> Result<u64> {
        Ok(self.stats()?.unique_key_count)
    }

    /// Occurrence count of the most frequent key.
    ///
    /// # Errors
    ///
    /// Returns [`CollateError::StatsUnavailable`] unless `compute_stats` was
    /// enabled for the collate run.
    pub fn mode_frequency(&self) -> Result<u64> {
        Ok(self.stats()?.mode_frequency)
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of partitions.
    pub fn partition_count(&self) -> usize {
        self.config.partition_count
    }

    fn stats(&self) -> Result<CollateStats> {
        self.stats.ok_or(CollateError::StatsUnavailable)
    }

    fn ensure_phase(&self, expected: Phase, op: &'static str) -> Result<()> {
        if self.phase != expected {
            return Err(CollateError::InvalidPhase {
                op,
                phase: self.phase,
            });
        }
        Ok(())
    }
}

impl<K, V, H> Drop for Collator<K, V, H> {
    fn drop(&mut self) {
        if let Some(mapper) = self.mapper.take() {
            // Dropped while still ingesting: drain and discard.
            warn!("collator dropped before close_deposit_stream; deposited data is discarded");
            self.stream_incoming.store(false, Ordering::Release);
            if mapper.join().is_err() {
                error!("mapper worker panicked");
                process::abort();
            }
        }

        let outstanding = self.pool.outstanding();
        if outstanding != 0 {
            error!(outstanding, "collator dropped with buffers still checked out");
            process::abort();
        }

        for p_id in 0..self.config.partition_count {
            let path = partition_file_path(&self.config.work_pref, p_id);
            if let Err(err) = fs::remove_file(&path) {
                if err.kind() != ErrorKind::NotFound {
                    error!("failed to remove {}: {err}", path.display());
                    process::abort();
                }
            }
        }
        debug!("partition files removed");
    }
}

/// The background worker draining full buffers into the partition stores.
///
/// Sole writer of every partition during ingest. Exits once the stream has
/// been closed and the full pool is drained, handing the partition set back
/// through the join.
fn mapper_loop<K, V, H>(
    pool: Arc<BufferPool<K, V>>,
    incoming: Arc<AtomicBool>,
    mut set: PartitionSet<K, V, H>,
) -> PartitionSet<K, V, H>
where
    K: FixedWidth + Ord,
    V: FixedWidth,
    H: KeyHasher<K>,
{
    debug!("mapper started");
    loop {
        if let Some(buf) = pool.fetch_full() {
            for &pair in &buf {
                if let Err(err) = set.route(pair) {
                    // No caller can observe an error here, and the partition
                    // contents are already incomplete.
                    error!("partition append failed: {err}");
                    process::abort();
                }
            }
            pool.return_free(buf);
        } else if !incoming.load(Ordering::Acquire) {
            break;
        } else {
            std::hint::spin_loop();
        }
    }
    debug!("mapper drained");
    set
}
