//! The super sector: mirrored metadata describing the log/ring layout.
//!
//! A magic-tagged, fixed-layout struct read straight out of a sector's
//! bytes; `zerocopy`'s derives check size/alignment at the type level
//! instead of a hand-written `const_assert!` over a raw pointer cast.

use log::warn;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::checksum;
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::lsid::{Lsid, LsidSnapshot};
use crate::sector;

/// Current on-disk format version. Bump on any layout change.
pub const FORMAT_VERSION: u32 = 1;

/// Reserved first page of the log device, ahead of super0.
pub const RESERVED_PAGE_SIZE: u64 = 4096;

#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawSuper {
    pub checksum: u32,
    pub format_version: u32,
    pub sector_size: u32,
    _pad0: u32,
    pub snapshot_metadata_size: u64,
    pub uuid: [u8; 16],
    pub name: [u8; 64],
    pub ring_buffer_size: u64,
    pub oldest_lsid: u64,
    pub written_lsid: u64,
    pub device_size: u64,
    pub log_checksum_salt: u32,
    _pad1: u32,
}

/// In-memory, ergonomic view of the super sector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Super {
    pub sector_size: u32,
    pub snapshot_metadata_size: u64,
    pub uuid: [u8; 16],
    pub name: [u8; 64],
    pub ring_buffer_size: u64,
    pub oldest_lsid: Lsid,
    pub written_lsid: Lsid,
    pub device_size: u64,
    pub log_checksum_salt: u32,
}

impl Super {
    pub fn layout(&self) -> Layout {
        Layout::new(self.sector_size as u64, self.snapshot_metadata_size)
    }

    /// The device's identity as a parsed UUID.
    pub fn uuid(&self) -> uuid::Uuid {
        uuid::Uuid::from_bytes(self.uuid)
    }

    fn to_raw(&self) -> RawSuper {
        RawSuper {
            checksum: 0,
            format_version: FORMAT_VERSION,
            sector_size: self.sector_size,
            _pad0: 0,
            snapshot_metadata_size: self.snapshot_metadata_size,
            uuid: self.uuid,
            name: self.name,
            ring_buffer_size: self.ring_buffer_size,
            oldest_lsid: self.oldest_lsid,
            written_lsid: self.written_lsid,
            device_size: self.device_size,
            log_checksum_salt: self.log_checksum_salt,
            _pad1: 0,
        }
    }

    fn to_sector_bytes(&self, sector_size: usize) -> Vec<u8> {
        let raw = self.to_raw();
        let mut buf = vec![0u8; sector_size];
        let raw_bytes = raw.as_bytes();
        buf[..raw_bytes.len()].copy_from_slice(raw_bytes);
        checksum::stamp(&mut buf, 0);
        buf
    }

    fn from_sector_bytes(buf: &[u8]) -> Result<Self> {
        if !checksum::verify(buf) {
            return Err(Error::Checksum { sector: 0 });
        }
        let raw_len = std::mem::size_of::<RawSuper>();
        let raw = RawSuper::read_from_bytes(&buf[..raw_len])
            .map_err(|_| Error::InvalidArgument("super sector truncated".into()))?;
        if raw.format_version != FORMAT_VERSION {
            return Err(Error::InvalidArgument(format!(
                "unsupported super format version {}",
                raw.format_version
            )));
        }
        if raw.oldest_lsid > raw.written_lsid {
            return Err(Error::InvalidArgument(
                "oldest_lsid > written_lsid in super sector".into(),
            ));
        }
        Ok(Self {
            sector_size: raw.sector_size,
            snapshot_metadata_size: raw.snapshot_metadata_size,
            uuid: raw.uuid,
            name: raw.name,
            ring_buffer_size: raw.ring_buffer_size,
            oldest_lsid: raw.oldest_lsid,
            written_lsid: raw.written_lsid,
            device_size: raw.device_size,
            log_checksum_salt: raw.log_checksum_salt,
        })
    }

    /// Snapshots the current LSID state into this super image (only the two
    /// fields the spec names the super as storing).
    pub fn apply_lsids(&mut self, lsids: &LsidSnapshot) {
        self.oldest_lsid = lsids.oldest;
        self.written_lsid = lsids.written;
    }
}

/// Fixed on-disk layout, derivable from `sector_size` and
/// `snapshot_metadata_size` alone.
#[derive(Clone, Copy, Debug)]
pub struct Layout {
    pub sector_size: u64,
    pub snapshot_metadata_size: u64,
}

impl Layout {
    pub fn new(sector_size: u64, snapshot_metadata_size: u64) -> Self {
        Self {
            sector_size,
            snapshot_metadata_size,
        }
    }

    pub fn super0_sector(&self) -> u64 {
        RESERVED_PAGE_SIZE / self.sector_size
    }

    pub fn metadata_start_sector(&self) -> u64 {
        self.super0_sector() + 1
    }

    pub fn super1_sector(&self) -> u64 {
        self.metadata_start_sector() + self.snapshot_metadata_size
    }

    pub fn ring_start_sector(&self) -> u64 {
        self.super1_sector() + 1
    }
}

/// Reads super0, falling back to super1 on checksum failure.
pub fn read_super(dev: &dyn BlockDevice) -> Result<Super> {
    // The layout needed to locate super1 depends on fields stored *inside*
    // the super sector itself, so super0 is parsed first to discover it,
    // and only consulted again if super0 turns out to be corrupt.
    let sector_size = dev.sector_size() as u64;
    let probe_layout = Layout::new(sector_size, 0);
    let super0_off = probe_layout.super0_sector();

    let super0_bytes = sector::read_sector(dev, super0_off)?;
    match Super::from_sector_bytes(&super0_bytes) {
        Ok(sb) => Ok(sb),
        Err(e) => {
            warn!("super0 invalid ({e}), falling back to super1");
            let layout = guess_layout_from_raw(&super0_bytes, sector_size);
            let super1_off = layout.super1_sector();
            let super1_bytes = sector::read_sector(dev, super1_off)?;
            Super::from_sector_bytes(&super1_bytes).map_err(|e2| {
                log::error!("both super0 and super1 are invalid: {e} / {e2}");
                Error::InvalidArgument("both super mirrors are corrupt".into())
            })
        }
    }
}

/// Best-effort extraction of `snapshot_metadata_size` from a possibly
/// corrupt super0, so super1 can still be located. Falls back to zero
/// (adjacent to super0) if even the raw bytes don't look sane.
fn guess_layout_from_raw(buf: &[u8], sector_size: u64) -> Layout {
    let raw_len = std::mem::size_of::<RawSuper>();
    if buf.len() >= raw_len {
        if let Ok(raw) = RawSuper::read_from_bytes(&buf[..raw_len]) {
            return Layout::new(sector_size, raw.snapshot_metadata_size);
        }
    }
    Layout::new(sector_size, 0)
}

/// Writes super0 then super1, with a FLUSH between them so super0 never
/// transiently precedes a corrupted super1 on disk.
pub fn write_super(dev: &dyn BlockDevice, sb: &Super) -> Result<()> {
    let layout = sb.layout();
    let bytes = sb.to_sector_bytes(dev.sector_size());
    sector::write_sector(dev, layout.super0_sector(), &bytes)?;
    dev.flush()?;
    sector::write_sector(dev, layout.super1_sector(), &bytes)?;
    dev.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemBlockDevice;

    fn sample_super() -> Super {
        Super {
            sector_size: 512,
            snapshot_metadata_size: 8,
            uuid: [7u8; 16],
            name: [0u8; 64],
            ring_buffer_size: 1024,
            oldest_lsid: 0,
            written_lsid: 0,
            device_size: 2048,
            log_checksum_salt: 0xDEAD_BEEF,
        }
    }

    #[test]
    fn round_trips_through_write_read() {
        let dev = MemBlockDevice::new(512, 4096);
        let sb = sample_super();
        write_super(&dev, &sb).unwrap();
        let back = read_super(&dev).unwrap();
        assert_eq!(back, sb);
    }

    #[test]
    fn falls_back_to_super1_on_corruption() {
        let dev = MemBlockDevice::new(512, 4096);
        let sb = sample_super();
        write_super(&dev, &sb).unwrap();
        let layout = sb.layout();
        let corrupt_offset = (layout.super0_sector() as usize) * 512 + 10;
        dev.corrupt_byte(corrupt_offset);
        let back = read_super(&dev).unwrap();
        assert_eq!(back, sb);
    }

    #[test]
    fn fails_when_both_mirrors_corrupt() {
        let dev = MemBlockDevice::new(512, 4096);
        let sb = sample_super();
        write_super(&dev, &sb).unwrap();
        let layout = sb.layout();
        dev.corrupt_byte((layout.super0_sector() as usize) * 512 + 10);
        dev.corrupt_byte((layout.super1_sector() as usize) * 512 + 10);
        assert!(read_super(&dev).is_err());
    }
}
