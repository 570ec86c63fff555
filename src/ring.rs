//! The ring-buffer allocator: maps an LSID range onto sectors in the log
//! device's circular region.
//!
//! A flat modulo over a fixed `start`/`size` pair, addressed by LSID rather
//! than a transaction-local tail counter.

use crate::lsid::Lsid;

/// A fixed ring: `ring_size` sectors starting at `ring_start` on the log
/// device, used to place pack headers/payloads for a contiguous LSID span.
#[derive(Clone, Copy, Debug)]
pub struct Ring {
    pub ring_start: u64,
    pub ring_size: u64,
}

impl Ring {
    pub fn new(ring_start: u64, ring_size: u64) -> Self {
        debug_assert!(ring_size > 0);
        Self {
            ring_start,
            ring_size,
        }
    }

    /// Maps an LSID to its absolute sector offset on the log device.
    pub fn lsid_to_offset(&self, lsid: Lsid) -> u64 {
        self.ring_start + (lsid % self.ring_size)
    }

    /// Whether writing `n_sectors` starting at `latest` would overtake
    /// `oldest`, i.e. wrap the ring onto data that hasn't been reclaimed yet.
    pub fn would_overflow(&self, oldest: Lsid, latest: Lsid, n_sectors: u64) -> bool {
        debug_assert!(latest >= oldest);
        latest - oldest + n_sectors > self.ring_size
    }

    /// Sectors still available for new packs before the ring catches up to
    /// `oldest`.
    pub fn free_sectors(&self, oldest: Lsid, latest: Lsid) -> u64 {
        self.ring_size.saturating_sub(latest - oldest)
    }
}
