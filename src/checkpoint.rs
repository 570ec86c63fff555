//! The checkpoint loop: periodically snapshots `oldest_lsid`/`written_lsid`
//! into the super sector so redo on the next boot doesn't have to replay
//! further back than necessary.
//!
//! Generalises a "sync after N transactions" periodic commit discipline into
//! "sync every N milliseconds", driven by `checkpoint_interval_ms`.

use crate::clock::Clock;
use crate::device::BlockDevice;
use crate::error::Result;
use crate::lock::spinlock::RawSpinlock;
use crate::lock::Lock;
use crate::lsid::LsidState;
use crate::superblock::{self, Super};

struct State {
    interval_ms: u64,
    last_run_ms: u64,
}

/// Owns the super-sector write lock (`lsuper_lock`) and decides when a
/// checkpoint is due.
pub struct CheckpointLoop {
    state: Lock<RawSpinlock, State>,
}

impl CheckpointLoop {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            state: Lock::new(
                RawSpinlock::new(),
                State {
                    interval_ms,
                    last_run_ms: 0,
                },
            ),
        }
    }

    pub fn set_interval_ms(&self, interval_ms: u64) {
        self.state.lock().interval_ms = interval_ms;
    }

    pub fn interval_ms(&self) -> u64 {
        self.state.lock().interval_ms
    }

    pub fn is_due(&self, clock: &dyn Clock) -> bool {
        let state = self.state.lock();
        clock.now_millis().saturating_sub(state.last_run_ms) >= state.interval_ms
    }

    /// Takes a checkpoint unconditionally: snapshots the current lsid set
    /// into `base`, writes both super mirrors, and records the run time.
    /// Returns the super image actually written, for the caller to keep as
    /// its cached copy.
    pub fn run(
        &self,
        dev: &dyn BlockDevice,
        clock: &dyn Clock,
        base: &Super,
        lsids: &LsidState,
    ) -> Result<Super> {
        let mut sb = base.clone();
        sb.apply_lsids(&lsids.snapshot());
        superblock::write_super(dev, &sb)?;
        self.state.lock().last_run_ms = clock.now_millis();
        Ok(sb)
    }

    /// Runs a checkpoint only if the interval has elapsed since the last one.
    pub fn run_if_due(
        &self,
        dev: &dyn BlockDevice,
        clock: &dyn Clock,
        base: &Super,
        lsids: &LsidState,
    ) -> Result<Option<Super>> {
        if !self.is_due(clock) {
            return Ok(None);
        }
        self.run(dev, clock, base, lsids).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::lsid::LsidSnapshot;
    use crate::testing::MemBlockDevice;

    fn sample_super() -> Super {
        Super {
            sector_size: 512,
            snapshot_metadata_size: 2,
            uuid: [1u8; 16],
            name: [0u8; 64],
            ring_buffer_size: 1024,
            oldest_lsid: 0,
            written_lsid: 0,
            device_size: 4096,
            log_checksum_salt: 0,
        }
    }

    #[test]
    fn skips_run_before_interval_elapses() {
        let dev = MemBlockDevice::new(512, 4096);
        let clock = ManualClock::new();
        let loop_ = CheckpointLoop::new(1000);
        let lsids = LsidState::new(LsidSnapshot::zero());
        let sb = sample_super();

        assert!(loop_.run_if_due(&dev, &clock, &sb, &lsids).unwrap().is_none());
        clock.advance(999);
        assert!(loop_.run_if_due(&dev, &clock, &sb, &lsids).unwrap().is_none());
        clock.advance(1);
        assert!(loop_.run_if_due(&dev, &clock, &sb, &lsids).unwrap().is_some());
    }

    #[test]
    fn run_persists_current_lsids_into_super() {
        let dev = MemBlockDevice::new(512, 4096);
        let clock = ManualClock::new();
        let loop_ = CheckpointLoop::new(0);
        let lsids = LsidState::new(LsidSnapshot::zero());
        lsids.advance_latest(50).unwrap();
        lsids.set_completed(50).unwrap();
        lsids.promote_permanent(50).unwrap();
        lsids.set_written(50).unwrap();

        let sb = sample_super();
        let written = loop_.run(&dev, &clock, &sb, &lsids).unwrap();
        assert_eq!(written.written_lsid, 50);

        let back = superblock::read_super(&dev).unwrap();
        assert_eq!(back.written_lsid, 50);
    }
}
