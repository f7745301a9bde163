//! kvcollate - multi-producer key-value collation over disk-backed partitions.
//!
//! This crate collates a very large multiset of key-value records, deposited
//! concurrently by many producer threads, into a grouped on-disk collection:
//! all records sharing a key end up physically adjacent, with keys ordered
//! within each partition. The working set may be far larger than memory.
//!
//! # Components
//!
//! - [`Collator`]: the facade owning the buffer pool, the partition files,
//!   and the phase lifecycle
//! - [`BufferPool`]: spin-lock guarded free/full pools mediating
//!   producer→mapper hand-off with back-pressure
//! - [`KeyGroupCursor`] / [`BulkReader`]: cursors over the collated result
//!
//! # Example
//!
//! ```rust,ignore
//! use kvcollate::{Collator, CollatorConfig, Pair};
//!
//! let config = CollatorConfig::default().with_work_pref("/tmp/job");
//! let mut collator: Collator<u32, u64> = Collator::new(config)?;
//!
//! // Any number of producer threads share the collator by reference.
//! std::thread::scope(|scope| {
//!     scope.spawn(|| {
//!         let mut buf = collator.checkout_buffer();
//!         buf.push(Pair::new(42, 1));
//!         collator.return_buffer(buf);
//!     });
//! });
//!
//! collator.close_deposit_stream()?;
//! collator.collate(8)?;
//!
//! let mut cursor = collator.begin()?;
//! while cursor != collator.end() {
//!     println!("key {:?}", cursor.key());
//!     cursor.advance()?;
//! }
//! ```

#![deny(missing_docs)]

pub mod collator;
pub mod error;
pub mod iter;
pub mod pool;
pub mod record;
pub mod store;

pub use collator::{
    CollateStats, Collator, CollatorConfig, Phase, DEFAULT_BUF_COUNT, DEFAULT_PARTITION_COUNT,
};
pub use error::{CollateError, Result};
pub use iter::{BulkReader, KeyGroupCursor};
pub use pool::{BufferPool, ObjectPool, PairBuf, SpinLock};
pub use record::{FixedWidth, IdentityHasher, KeyHasher, Pair};
