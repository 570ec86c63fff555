//! Busy-waiting lock for the hot, uncontended paths: `lsid_lock`,
//! `lsuper_lock`, `size_lock`, `snapshot_lock`.
//!
//! A hosted engine has no interrupt controller to mask around the critical
//! section, so this is just the atomic compare-exchange spin itself, without
//! the IRQ-disable pairing a kernel-level spinlock would need.

use std::hint::spin_loop;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{Lock, RawLock};

pub struct RawSpinlock {
    locked: AtomicBool,
}

pub type Spinlock<T> = Lock<RawSpinlock, T>;
pub type SpinlockGuard<'s, T> = super::Guard<'s, RawSpinlock, T>;

impl RawSpinlock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }
}

impl Default for RawSpinlock {
    fn default() -> Self {
        Self::new()
    }
}

impl RawLock for RawSpinlock {
    fn acquire(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
    }

    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl<T> Spinlock<T> {
    pub const fn new_spinlock(data: T) -> Self {
        Lock::new(RawSpinlock::new(), data)
    }
}
