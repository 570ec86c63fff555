//! Typed, checksum-aware sector I/O.
//!
//! One read/write call per logical unit, with the checksum check folded into
//! the read path for the structures that carry one (superblock, log-pack
//! header, snapshot sector). Plain data sectors have no sector-level
//! checksum of their own — their integrity is covered by the owning
//! log-pack record's checksum instead.

use crate::checksum;
use crate::device::BlockDevice;
use crate::error::{Error, Result};

/// Reads one sector with no checksum verification.
pub fn read_sector(dev: &dyn BlockDevice, sector_off: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; dev.sector_size()];
    dev.read_at(sector_off, &mut buf)?;
    Ok(buf)
}

/// Reads one sector and verifies the checksum embedded at `checksum_offset`.
pub fn read_checked_sector(
    dev: &dyn BlockDevice,
    sector_off: u64,
    checksum_offset: usize,
) -> Result<Vec<u8>> {
    let buf = read_sector(dev, sector_off)?;
    if !checksum::verify(&buf[checksum_offset..]) {
        return Err(Error::Checksum { sector: sector_off });
    }
    Ok(buf)
}

pub fn write_sector(dev: &dyn BlockDevice, sector_off: u64, buf: &[u8]) -> Result<()> {
    debug_assert_eq!(buf.len(), dev.sector_size());
    dev.write_at(sector_off, buf)?;
    Ok(())
}

/// Reads `count` contiguous sectors starting at `sector_off` in as few calls
/// as `dev.max_io_sectors()` allows.
pub fn read_sectors(dev: &dyn BlockDevice, sector_off: u64, count: u64) -> Result<Vec<u8>> {
    let sector_size = dev.sector_size();
    let mut out = vec![0u8; sector_size * count as usize];
    let max = dev.max_io_sectors().max(1) as u64;
    let mut done = 0u64;
    while done < count {
        let batch = (count - done).min(max);
        let start = (done * sector_size as u64) as usize;
        let end = ((done + batch) * sector_size as u64) as usize;
        dev.read_at(sector_off + done, &mut out[start..end])?;
        done += batch;
    }
    Ok(out)
}

pub fn write_sectors(dev: &dyn BlockDevice, sector_off: u64, buf: &[u8]) -> Result<()> {
    let sector_size = dev.sector_size();
    debug_assert_eq!(buf.len() % sector_size, 0);
    let count = (buf.len() / sector_size) as u64;
    let max = dev.max_io_sectors().max(1) as u64;
    let mut done = 0u64;
    while done < count {
        let batch = (count - done).min(max);
        let start = (done * sector_size as u64) as usize;
        let end = ((done + batch) * sector_size as u64) as usize;
        dev.write_at(sector_off + done, &buf[start..end])?;
        done += batch;
    }
    Ok(())
}
