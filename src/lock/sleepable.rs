//! A lock whose guard can put the calling thread to sleep until another
//! holder wakes it — the `freeze_lock` primitive ("mutex, may sleep").
//!
//! Pairs a `std::sync::Mutex` with a `Condvar`, the natural hosted
//! equivalent of a spinlock-plus-wait-channel pairing with no cooperative
//! process scheduler to park against.

use std::sync::{Condvar, Mutex, MutexGuard};

pub struct SleepableLock<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> SleepableLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            mutex: Mutex::new(data),
            condvar: Condvar::new(),
        }
    }

    pub fn lock(&self) -> SleepableLockGuard<'_, T> {
        SleepableLockGuard {
            inner: Some(self.mutex.lock().expect("freeze lock poisoned")),
            condvar: &self.condvar,
        }
    }
}

pub struct SleepableLockGuard<'s, T> {
    inner: Option<MutexGuard<'s, T>>,
    condvar: &'s Condvar,
}

impl<T> std::ops::Deref for SleepableLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.inner.as_ref().expect("guard consumed")
    }
}

impl<T> std::ops::DerefMut for SleepableLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner.as_mut().expect("guard consumed")
    }
}

impl<T> SleepableLockGuard<'_, T> {
    /// Atomically release the lock and block until [`wakeup`](Self::wakeup)
    /// is called by another holder; reacquires the lock before returning.
    pub fn sleep(&mut self) {
        let guard = self.inner.take().expect("guard consumed");
        let guard = self.condvar.wait(guard).expect("freeze lock poisoned");
        self.inner = Some(guard);
    }

    /// Wake every thread sleeping on this lock.
    pub fn wakeup(&self) {
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn sleep_wakes_on_signal() {
        let lock = Arc::new(SleepableLock::new(false));
        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let mut guard = lock.lock();
                while !*guard {
                    guard.sleep();
                }
            })
        };
        thread::sleep(Duration::from_millis(20));
        let mut guard = lock.lock();
        *guard = true;
        guard.wakeup();
        drop(guard);
        waiter.join().unwrap();
    }
}
