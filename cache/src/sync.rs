//! Synchronization primitives with optional loom support.
//!
//! This module provides atomic types that work with both std and loom,
//! enabling concurrency testing with loom while using efficient std
//! atomics in production. It also hosts the bounded-tries read/write
//! spinlock used for per-cache metadata.

#[cfg(not(feature = "loom"))]
pub use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering, fence};

#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering, fence};

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};

/// Retry budget for user-facing operations that must stay soft-real-time.
pub const TRIES_FAST: u64 = 200;

/// Retry budget for operations that may wait a little longer.
pub const TRIES_SLOW: u64 = 10_000;

/// Retry budget for administrative operations that must succeed.
pub const TRIES_GUARANTEE: u64 = u64::MAX;

/// Spin loop hint for busy waiting.
///
/// In production (non-loom), this uses `std::hint::spin_loop()` which
/// provides a hint to the CPU that we're in a spin-wait loop.
///
/// Under loom, this yields to allow other threads to make progress,
/// which is necessary for loom's model checking to work correctly.
#[inline]
pub fn spin_loop() {
    #[cfg(not(feature = "loom"))]
    std::hint::spin_loop();

    #[cfg(feature = "loom")]
    loom::thread::yield_now();
}

const WRITE_LOCKED: u32 = 1 << 31;

/// A reader/writer spinlock with a bounded retry budget.
///
/// Readers share the lock; a writer excludes everyone. Acquisition spins
/// for at most `tries` attempts and then gives up, so callers can bound
/// the time they are willing to wait ([`TRIES_FAST`] on user-facing
/// paths, [`TRIES_GUARANTEE`] on administrative ones).
///
/// Critical sections guarded by this lock must stay short; there is no
/// parking, only spinning.
pub(crate) struct ReadWriteSpinLock<T> {
    state: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is mediated by the reader/writer protocol on
// `state`; a write guard implies exclusive access, read guards imply
// shared access.
unsafe impl<T: Send> Send for ReadWriteSpinLock<T> {}
unsafe impl<T: Send + Sync> Sync for ReadWriteSpinLock<T> {}

impl<T> ReadWriteSpinLock<T> {
    pub fn new(data: T) -> Self {
        Self {
            state: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire a shared read lock within `tries` attempts.
    pub fn try_read(&self, tries: u64) -> Option<ReadSpinGuard<'_, T>> {
        let mut attempt = 0u64;
        while attempt < tries {
            let state = self.state.load(Ordering::Relaxed);
            if state & WRITE_LOCKED == 0
                && self
                    .state
                    .compare_exchange_weak(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return Some(ReadSpinGuard { lock: self });
            }
            spin_loop();
            attempt += 1;
        }
        None
    }

    /// Acquire the exclusive write lock within `tries` attempts.
    pub fn try_write(&self, tries: u64) -> Option<WriteSpinGuard<'_, T>> {
        let mut attempt = 0u64;
        while attempt < tries {
            if self
                .state
                .compare_exchange_weak(0, WRITE_LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Some(WriteSpinGuard { lock: self });
            }
            spin_loop();
            attempt += 1;
        }
        None
    }

    /// Acquire a shared read lock, spinning until it is granted.
    pub fn read(&self) -> ReadSpinGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_read(TRIES_GUARANTEE) {
                return guard;
            }
        }
    }

    /// Acquire the exclusive write lock, spinning until it is granted.
    pub fn write(&self) -> WriteSpinGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_write(TRIES_GUARANTEE) {
                return guard;
            }
        }
    }
}

pub(crate) struct ReadSpinGuard<'a, T> {
    lock: &'a ReadWriteSpinLock<T>,
}

impl<T> Drop for ReadSpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

impl<T> Deref for ReadSpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding a read guard excludes writers.
        unsafe { &*self.lock.data.get() }
    }
}

pub(crate) struct WriteSpinGuard<'a, T> {
    lock: &'a ReadWriteSpinLock<T>,
}

impl<T> Drop for WriteSpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
    }
}

impl<T> Deref for WriteSpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding the write guard implies exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for WriteSpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the write guard implies exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_read_write_roundtrip() {
        let lock = ReadWriteSpinLock::new(41);
        {
            let mut guard = lock.write();
            *guard += 1;
        }
        assert_eq!(*lock.read(), 42);
    }

    #[test]
    fn test_readers_share() {
        let lock = ReadWriteSpinLock::new(());
        let first = lock.try_read(1).unwrap();
        let second = lock.try_read(1).unwrap();
        drop(first);
        drop(second);
    }

    #[test]
    fn test_writer_excludes() {
        let lock = ReadWriteSpinLock::new(());
        let write = lock.try_write(1).unwrap();
        assert!(lock.try_read(16).is_none());
        assert!(lock.try_write(16).is_none());
        drop(write);
        assert!(lock.try_write(1).is_some());
    }

    #[test]
    fn test_contended_counter() {
        let lock = Arc::new(ReadWriteSpinLock::new(0u64));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        *lock.write() += 1;
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(*lock.read(), 40_000);
    }
}
