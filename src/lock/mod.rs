//! Fine-grained locks, split into a `RawLock`/`Lock<R, T>` pair: a `RawLock`
//! knows only how to acquire/release itself, and `Lock<R, T>` pairs one with
//! an `UnsafeCell<T>` to get a safe, RAII-guarded critical section.
//!
//! Two `RawLock`s are provided: [`spinlock::RawSpinlock`] for the
//! uncontended, non-sleeping locks (`lsid_lock`, `lsuper_lock`, `size_lock`,
//! `snapshot_lock`), and [`sleepable::RawSleepableLock`] for `freeze_lock`,
//! which must be able to block a thread until melt.

pub mod sleepable;
pub mod spinlock;

pub use sleepable::{SleepableLock, SleepableLockGuard};
pub use spinlock::{Spinlock, SpinlockGuard};

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};

/// A lock that knows only how to exclude other holders of itself; it does not
/// know about the data it protects.
pub trait RawLock {
    fn acquire(&self);
    fn release(&self);
}

/// A `RawLock` paired with the data it protects.
pub struct Lock<R: RawLock, T> {
    lock: R,
    data: UnsafeCell<T>,
}

// SAFETY: `R::acquire`/`release` provide the mutual exclusion `UnsafeCell`
// needs to be shared across threads.
unsafe impl<R: RawLock + Send, T: Send> Sync for Lock<R, T> {}

impl<R: RawLock, T> Lock<R, T> {
    pub const fn new(lock: R, data: T) -> Self {
        Self {
            lock,
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> Guard<'_, R, T> {
        self.lock.acquire();
        Guard { lock: self }
    }

    /// Returns a mutable reference without acquiring the lock.
    ///
    /// # Safety
    /// The caller must ensure no other thread is concurrently accessing the
    /// data, e.g. during single-threaded setup/teardown.
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

pub struct Guard<'s, R: RawLock, T> {
    lock: &'s Lock<R, T>,
}

impl<R: RawLock, T> Deref for Guard<'_, R, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T> DerefMut for Guard<'_, R, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<R: RawLock, T> Drop for Guard<'_, R, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}
