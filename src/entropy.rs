//! Random-number source: an external collaborator used to generate the
//! superblock UUID and the per-epoch log-checksum salt on `clear_log`. The
//! engine never seeds its own OS RNG; callers inject one.

pub trait EntropySource: Send + Sync {
    fn fill(&self, buf: &mut [u8]);

    fn next_u32(&self) -> u32 {
        let mut buf = [0u8; 4];
        self.fill(&mut buf);
        u32::from_le_bytes(buf)
    }
}

/// A small, deterministic xorshift generator for tests — not suitable for
/// production use, where the host is expected to inject a real OS RNG.
pub struct DeterministicEntropy {
    state: std::sync::atomic::AtomicU64,
}

impl DeterministicEntropy {
    pub fn new(seed: u64) -> Self {
        Self {
            state: std::sync::atomic::AtomicU64::new(seed | 1),
        }
    }

    fn next(&self) -> u64 {
        use std::sync::atomic::Ordering;
        let mut x = self.state.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state.store(x, Ordering::Relaxed);
        x
    }
}

impl EntropySource for DeterministicEntropy {
    fn fill(&self, buf: &mut [u8]) {
        let mut i = 0;
        while i < buf.len() {
            let bytes = self.next().to_le_bytes();
            let n = bytes.len().min(buf.len() - i);
            buf[i..i + n].copy_from_slice(&bytes[..n]);
            i += n;
        }
    }
}
