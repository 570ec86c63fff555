//! The LSID state machine.
//!
//! Six monotonic counters under one lock, maintaining
//! `oldest <= prev_written <= written <= permanent <= completed <= flush <= latest`
//! at every observation point.

use crate::error::{Error, Result};
use crate::lock::spinlock::RawSpinlock;
use crate::lock::Lock;

pub type Lsid = u64;

pub const INVALID_LSID: Lsid = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LsidSnapshot {
    pub oldest: Lsid,
    pub prev_written: Lsid,
    pub written: Lsid,
    pub permanent: Lsid,
    pub completed: Lsid,
    pub flush: Lsid,
    pub latest: Lsid,
}

impl LsidSnapshot {
    pub const fn zero() -> Self {
        Self {
            oldest: 0,
            prev_written: 0,
            written: 0,
            permanent: 0,
            completed: 0,
            flush: 0,
            latest: 0,
        }
    }

    /// Checks the monotonic ordering invariant across all six counters.
    pub fn is_ordered(&self) -> bool {
        self.oldest <= self.prev_written
            && self.prev_written <= self.written
            && self.written <= self.permanent
            && self.permanent <= self.completed
            && self.completed <= self.flush
            && self.flush <= self.latest
    }
}

pub struct LsidState {
    inner: Lock<RawSpinlock, LsidSnapshot>,
}

impl LsidState {
    pub fn new(initial: LsidSnapshot) -> Self {
        debug_assert!(initial.is_ordered());
        Self {
            inner: Lock::new(RawSpinlock::new(), initial),
        }
    }

    pub fn snapshot(&self) -> LsidSnapshot {
        *self.inner.lock()
    }

    fn mutate(&self, f: impl FnOnce(&mut LsidSnapshot)) -> Result<()> {
        let mut guard = self.inner.lock();
        let mut next = *guard;
        f(&mut next);
        if !next.is_ordered() {
            debug_assert!(false, "lsid ordering invariant violated: {next:?}");
            return Err(Error::InvalidLsid(format!(
                "ordering invariant violated: {next:?}"
            )));
        }
        *guard = next;
        Ok(())
    }

    /// Reserves `n` fresh LSIDs, advancing `latest`, and returns the first
    /// one assigned.
    pub fn advance_latest(&self, n: u64) -> Result<Lsid> {
        let mut first = 0;
        self.mutate(|s| {
            first = s.latest;
            s.latest += n;
        })?;
        Ok(first)
    }

    pub fn set_completed(&self, lsid: Lsid) -> Result<()> {
        self.mutate(|s| s.completed = s.completed.max(lsid))
    }

    /// A FLUSH has landed; everything up to `up_to_lsid` is now crash-safe.
    pub fn promote_permanent(&self, up_to_lsid: Lsid) -> Result<()> {
        self.mutate(|s| s.permanent = s.permanent.max(up_to_lsid).min(s.completed))
    }

    pub fn set_written(&self, lsid: Lsid) -> Result<()> {
        self.mutate(|s| {
            s.prev_written = s.written;
            s.written = s.written.max(lsid);
        })
    }

    /// Advances `oldest`. `is_valid_pack` is consulted to validate that
    /// `lsid` equals `written` or references a valid pack header in
    /// `[oldest, written)`.
    pub fn set_oldest(&self, lsid: Lsid, is_valid_pack: impl FnOnce(Lsid) -> bool) -> Result<()> {
        let current = self.snapshot();
        if lsid != current.written && !(current.oldest..current.written).contains(&lsid) {
            return Err(Error::InvalidLsid(format!(
                "oldest candidate {lsid} outside [{}, {})",
                current.oldest, current.written
            )));
        }
        if lsid != current.written && !is_valid_pack(lsid) {
            return Err(Error::InvalidLsid(format!(
                "oldest candidate {lsid} does not reference a valid pack header"
            )));
        }
        self.mutate(|s| s.oldest = lsid)
    }

    /// Used by redo and `clear_log` to force every counter to the same
    /// value, e.g. after replaying to `cursor` or resetting to 0.
    pub fn reset_all(&self, lsid: Lsid) -> Result<()> {
        let mut guard = self.inner.lock();
        *guard = LsidSnapshot {
            oldest: lsid,
            prev_written: lsid,
            written: lsid,
            permanent: lsid,
            completed: lsid,
            flush: lsid,
            latest: lsid,
        };
        Ok(())
    }

    /// Restores a previously observed snapshot wholesale, bypassing the
    /// ordering check (the snapshot was valid when it was taken). Used to
    /// roll `clear_log` back after a sync failure.
    pub fn restore(&self, snapshot: LsidSnapshot) {
        *self.inner.lock() = snapshot;
    }

    pub fn set_flush(&self, lsid: Lsid) -> Result<()> {
        self.mutate(|s| s.flush = s.flush.max(lsid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_latest_assigns_contiguous_ranges() {
        let s = LsidState::new(LsidSnapshot::zero());
        assert_eq!(s.advance_latest(10).unwrap(), 0);
        assert_eq!(s.advance_latest(5).unwrap(), 10);
        assert_eq!(s.snapshot().latest, 15);
    }

    #[test]
    fn rejects_out_of_order_update() {
        let s = LsidState::new(LsidSnapshot::zero());
        s.advance_latest(10).unwrap();
        // written may not exceed completed (0 here).
        assert!(s.set_written(5).is_err());
    }

    #[test]
    fn set_oldest_requires_valid_pack_or_equal_written() {
        let s = LsidState::new(LsidSnapshot::zero());
        s.advance_latest(20).unwrap();
        s.set_completed(20).unwrap();
        s.promote_permanent(20).unwrap();
        s.set_written(20).unwrap();

        assert!(s.set_oldest(20, |_| false).is_ok());
        let s = LsidState::new(LsidSnapshot {
            oldest: 0,
            prev_written: 10,
            written: 10,
            permanent: 10,
            completed: 10,
            flush: 10,
            latest: 20,
        });
        assert!(s.set_oldest(5, |l| l == 5).is_ok());
        assert!(s.set_oldest(5, |_| false).is_err());
    }
}
