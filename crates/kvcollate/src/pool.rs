//! Spin-lock guarded object pools for producer buffer hand-off.
//!
//! # Architecture
//!
//! Producers and the mapper exchange ownership of whole buffers rather than
//! individual records:
//!
//! ```text
//! producer ── checkout_free ──► fill ── return_full ──► mapper ── return_free ──┐
//!    ▲                                                                         │
//!    └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Both pools are LIFO stacks guarded by a [`SpinLock`]; every critical
//! section is a constant number of memory operations. The pool length is
//! mirrored in an atomic so emptiness can be probed without taking the lock;
//! that read is advisory and callers that need progress must loop.

use crate::record::Pair;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A buffer of records exchanged between one producer and the mapper.
///
/// Capacity is chosen by the producer that fills it; clearing on return to
/// the free pool keeps the allocation for reuse.
pub type PairBuf<K, V> = Vec<Pair<K, V>>;

/// A busy-waiting mutual-exclusion lock for short critical sections.
///
/// Acquire spins on an atomic flag; release is a store with release ordering
/// performed by the guard's `Drop`. Not reentrant; fairness is not provided.
/// Hold times must stay bounded by a constant number of memory operations.
pub struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// The lock provides the exclusion that makes sharing sound.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates an unlocked spin lock owning `value`.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, busy-waiting until it is free.
    pub fn lock(&self) -> SpinGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Read-only wait keeps the cache line shared between contenders.
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
        SpinGuard { lock: self }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpinLock").finish_non_exhaustive()
    }
}

/// RAII guard for a [`SpinLock`]; releases the lock on drop.
pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// A thread-safe LIFO stack of reusable objects.
#[derive(Debug)]
pub struct ObjectPool<T> {
    items: SpinLock<Vec<T>>,
    len: AtomicUsize,
}

impl<T> ObjectPool<T> {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self {
            items: SpinLock::new(Vec::new()),
            len: AtomicUsize::new(0),
        }
    }

    /// Adds `item` to the pool.
    pub fn push(&self, item: T) {
        let mut items = self.items.lock();
        items.push(item);
        self.len.fetch_add(1, Ordering::Release);
    }

    /// Tries to pop the most recently pushed object.
    ///
    /// Returns `None` when the pool is observed empty. The emptiness probe is
    /// taken without the lock, so a concurrent `push` may be missed; callers
    /// that require an object must loop.
    pub fn fetch(&self) -> Option<T> {
        if self.is_empty() {
            return None;
        }

        let mut items = self.items.lock();
        let item = items.pop();
        if item.is_some() {
            self.len.fetch_sub(1, Ordering::Release);
        }
        item
    }

    /// Returns the advisory number of pooled objects.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Returns `true` if the pool is observed empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for ObjectPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The pair of linked pools mediating producer→mapper hand-off.
///
/// A buffer is always in exactly one of three places: the free pool, the
/// full pool, or checked out by one producer. The total buffer count is
/// fixed for the lifetime of the pool.
#[derive(Debug)]
pub struct BufferPool<K, V> {
    free: ObjectPool<PairBuf<K, V>>,
    full: ObjectPool<PairBuf<K, V>>,
    buf_count: usize,
}

impl<K, V> BufferPool<K, V> {
    /// Creates a pool of `buf_count` empty buffers, all free.
    pub fn new(buf_count: usize) -> Self {
        let free = ObjectPool::new();
        for _ in 0..buf_count {
            free.push(PairBuf::new());
        }
        Self {
            free,
            full: ObjectPool::new(),
            buf_count,
        }
    }

    /// Checks out a free buffer, busy-waiting until one is available.
    ///
    /// The wait is the ingest back-pressure: producers stall here when the
    /// mapper cannot keep up, which bounds resident memory.
    pub fn checkout_free(&self) -> PairBuf<K, V> {
        loop {
            if let Some(buf) = self.free.fetch() {
                return buf;
            }
            std::hint::spin_loop();
        }
    }

    /// Returns a filled buffer for the mapper to consume.
    pub fn return_full(&self, buf: PairBuf<K, V>) {
        self.full.push(buf);
    }

    /// Tries to fetch a filled buffer.
    pub fn fetch_full(&self) -> Option<PairBuf<K, V>> {
        self.full.fetch()
    }

    /// Returns a drained buffer to the free pool, clearing it first.
    pub fn return_free(&self, mut buf: PairBuf<K, V>) {
        buf.clear();
        self.free.push(buf);
    }

    /// Returns the configured total buffer count.
    pub fn buf_count(&self) -> usize {
        self.buf_count
    }

    /// Returns the advisory number of buffers currently checked out.
    pub fn outstanding(&self) -> usize {
        self.buf_count - self.free.len() - self.full.len()
    }

    /// Returns `true` if the full pool is observed empty.
    pub fn full_is_empty(&self) -> bool {
        self.full.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_object_pool_lifo() {
        let pool = ObjectPool::new();
        pool.push(1);
        pool.push(2);
        pool.push(3);

        assert_eq!(pool.len(), 3);
        assert_eq!(pool.fetch(), Some(3));
        assert_eq!(pool.fetch(), Some(2));
        assert_eq!(pool.fetch(), Some(1));
        assert_eq!(pool.fetch(), None);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_object_pool_concurrent_push_fetch() {
        let pool = Arc::new(ObjectPool::new());
        let mut handles = Vec::new();

        for t in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    pool.push(t * 1000 + i);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut seen = Vec::new();
        while let Some(item) = pool.fetch() {
            seen.push(item);
        }
        seen.sort_unstable();
        let expected: Vec<_> = (0..4000).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_buffer_pool_conservation() {
        let pool: BufferPool<u32, u32> = BufferPool::new(4);
        assert_eq!(pool.buf_count(), 4);
        assert_eq!(pool.outstanding(), 0);

        let mut a = pool.checkout_free();
        let b = pool.checkout_free();
        assert_eq!(pool.outstanding(), 2);

        a.push(Pair::new(1, 2));
        pool.return_full(a);
        assert_eq!(pool.outstanding(), 1);

        let fetched = pool.fetch_full().unwrap();
        assert_eq!(fetched.len(), 1);
        pool.return_free(fetched);
        pool.return_free(b);
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.full_is_empty());
    }

    #[test]
    fn test_return_free_clears_but_keeps_capacity() {
        let pool: BufferPool<u32, u32> = BufferPool::new(1);
        let mut buf = pool.checkout_free();
        buf.reserve(1024);
        let cap = buf.capacity();
        buf.push(Pair::new(1, 1));
        pool.return_free(buf);

        let buf = pool.checkout_free();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), cap);
    }

    #[test]
    fn test_spin_lock_mutual_exclusion() {
        let counter = Arc::new(SpinLock::new(0u64));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    *counter.lock() += 1;
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*counter.lock(), 80_000);
    }
}
