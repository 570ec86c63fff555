//! In-memory block device and helpers shared by this crate's own tests and
//! available to downstream callers who want to exercise the engine without
//! real disks.

use std::sync::Mutex;

use crate::device::BlockDevice;

pub struct MemBlockDevice {
    sector_size: usize,
    max_io_sectors: usize,
    supports_fua: bool,
    data: Mutex<Vec<u8>>,
    flush_count: std::sync::atomic::AtomicU64,
}

impl MemBlockDevice {
    pub fn new(sector_size: usize, sector_count: u64) -> Self {
        Self {
            sector_size,
            max_io_sectors: usize::MAX,
            supports_fua: false,
            data: Mutex::new(vec![0u8; sector_size * sector_count as usize]),
            flush_count: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn with_max_io_sectors(mut self, n: usize) -> Self {
        self.max_io_sectors = n;
        self
    }

    pub fn with_fua(mut self) -> Self {
        self.supports_fua = true;
        self
    }

    pub fn flush_count(&self) -> u64 {
        self.flush_count.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Directly corrupts a byte, for redo/crash-recovery tests.
    pub fn corrupt_byte(&self, offset: usize) {
        let mut data = self.data.lock().unwrap();
        data[offset] ^= 0xFF;
    }
}

impl BlockDevice for MemBlockDevice {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        (self.data.lock().unwrap().len() / self.sector_size) as u64
    }

    fn max_io_sectors(&self) -> usize {
        self.max_io_sectors
    }

    fn supports_fua(&self) -> bool {
        self.supports_fua
    }

    fn read_at(&self, sector_off: u64, buf: &mut [u8]) -> std::io::Result<()> {
        let data = self.data.lock().unwrap();
        let start = sector_off as usize * self.sector_size;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, sector_off: u64, buf: &[u8]) -> std::io::Result<()> {
        let mut data = self.data.lock().unwrap();
        let start = sector_off as usize * self.sector_size;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> std::io::Result<()> {
        self.flush_count
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}
