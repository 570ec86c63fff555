//! Log-pack header and records: the unit of atomic write to the log device.
//!
//! Several logged writes batch behind one on-disk header array and replay in
//! header order; the header additionally carries a per-record checksum and
//! an epoch salt so a stale pack left over from a previous `clear_log` epoch
//! is rejected instead of replayed.

use arrayvec::ArrayVec;
use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::checksum;
use crate::config::MAX_RECORDS_PER_PACK;
use crate::error::{Error, Result};
use crate::lsid::Lsid;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RecordFlags: u32 {
        /// A live record backed by real payload data.
        const IS_EXIST = 1 << 0;
        /// Filler record with no payload, used to align a pack's payload to
        /// the ring boundary so it doesn't wrap mid-record.
        const IS_PADDING = 1 << 1;
        /// A discard (TRIM) request: `io_size` sectors at `io_offset` are
        /// logically zeroed; no payload follows in the ring.
        const IS_DISCARD = 1 << 2;
    }
}

#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawRecord {
    flags: u32,
    lsid_local: u32,
    io_offset: u64,
    io_size: u32,
    checksum: u32,
}

#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawHeader {
    checksum: u32,
    n_records: u32,
    total_io_size: u32,
    salt: u32,
    logpack_lsid: u64,
    records: [RawRecord; MAX_RECORDS_PER_PACK],
}

/// One logged write: a data-device sector range plus the checksum of its
/// payload, computed by the caller over the actual bytes that will follow
/// this header in the ring.
#[derive(Clone, Copy, Debug)]
pub struct WriteRequest {
    pub io_offset: u64,
    pub io_size: u32,
    pub payload_checksum: u32,
}

#[derive(Clone, Debug)]
pub struct Record {
    pub flags: RecordFlags,
    pub lsid_local: u32,
    pub io_offset: u64,
    pub io_size: u32,
    pub checksum: u32,
}

impl Record {
    fn from_raw(raw: &RawRecord) -> Self {
        Self {
            flags: RecordFlags::from_bits_truncate(raw.flags),
            lsid_local: raw.lsid_local,
            io_offset: raw.io_offset,
            io_size: raw.io_size,
            checksum: raw.checksum,
        }
    }

    fn to_raw(&self) -> RawRecord {
        RawRecord {
            flags: self.flags.bits(),
            lsid_local: self.lsid_local,
            io_offset: self.io_offset,
            io_size: self.io_size,
            checksum: self.checksum,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LogPackHeader {
    pub logpack_lsid: Lsid,
    pub records: ArrayVec<Record, MAX_RECORDS_PER_PACK>,
}

impl LogPackHeader {
    /// Total payload sectors across all non-padding, non-discard records.
    pub fn total_io_size(&self) -> u32 {
        self.records
            .iter()
            .filter(|r| r.flags.contains(RecordFlags::IS_EXIST))
            .map(|r| r.io_size)
            .sum()
    }

    /// How many sectors this header occupies once serialised. Real records
    /// only take a fixed-size struct each, so a pack with few records packs
    /// into one sector; one with many spills into more (a multi-sector
    /// header is allowed, unlike the single-sector superblock).
    pub fn header_sectors(&self, sector_size: usize) -> u64 {
        header_byte_len(sector_size).div_ceil(sector_size) as u64
    }

    /// `header_sectors` sectors of header + `total_io_size` sectors of
    /// payload this pack occupies in the ring.
    pub fn physical_blocks(&self, sector_size: usize) -> u64 {
        self.header_sectors(sector_size) + self.total_io_size() as u64
    }

    pub fn to_header_bytes(&self, sector_size: usize, salt: u32) -> Vec<u8> {
        let mut raw = RawHeader {
            checksum: 0,
            n_records: self.records.len() as u32,
            total_io_size: self.total_io_size(),
            salt,
            logpack_lsid: self.logpack_lsid,
            records: [RawRecord {
                flags: 0,
                lsid_local: 0,
                io_offset: 0,
                io_size: 0,
                checksum: 0,
            }; MAX_RECORDS_PER_PACK],
        };
        for (i, r) in self.records.iter().enumerate() {
            raw.records[i] = r.to_raw();
        }
        let n_sectors = self.header_sectors(sector_size) as usize;
        let mut buf = vec![0u8; n_sectors * sector_size];
        let raw_bytes = raw.as_bytes();
        buf[..raw_bytes.len()].copy_from_slice(raw_bytes);
        checksum::stamp(&mut buf, 0);
        buf
    }
}

/// Byte length of the fixed-capacity `RawHeader` (only the first
/// `24 + n_records * size_of::<RawRecord>()` bytes are meaningful, but the
/// checksum covers the whole serialised buffer either way).
fn header_byte_len(sector_size: usize) -> usize {
    std::mem::size_of::<RawHeader>().max(sector_size)
}

/// Number of sectors a log-pack header always occupies for a given device
/// sector size, regardless of how many records it actually holds. Callers
/// (redo, the pipeline) use this to size their header read before they know
/// `n_records`.
pub fn header_sector_count(sector_size: usize) -> u64 {
    header_byte_len(sector_size).div_ceil(sector_size) as u64
}

/// Parses and validates a log-pack header sector: checksum, epoch salt,
/// record count, and strictly increasing `lsid_local`.
pub fn parse_header(buf: &[u8], expected_salt: u32) -> Result<LogPackHeader> {
    if !checksum::verify(buf) {
        return Err(Error::Checksum { sector: 0 });
    }
    let raw_len = std::mem::size_of::<RawHeader>();
    let raw = RawHeader::read_from_bytes(&buf[..raw_len])
        .map_err(|_| Error::InvalidArgument("log pack header truncated".into()))?;

    if raw.salt != expected_salt {
        return Err(Error::InvalidArgument(
            "log pack header belongs to a stale epoch".into(),
        ));
    }
    if raw.n_records as usize > MAX_RECORDS_PER_PACK {
        return Err(Error::InvalidArgument("log pack header n_records out of range".into()));
    }

    let mut records = ArrayVec::new();
    let mut expected_local = 0u32;
    let mut total = 0u32;
    for i in 0..raw.n_records as usize {
        let record = Record::from_raw(&raw.records[i]);
        if record.lsid_local != expected_local {
            return Err(Error::InvalidArgument(format!(
                "log pack record {i} has out-of-order lsid_local {}",
                record.lsid_local
            )));
        }
        if record.flags.contains(RecordFlags::IS_EXIST) {
            total += record.io_size;
        }
        expected_local += 1;
        records.push(record);
    }
    if total != raw.total_io_size {
        return Err(Error::InvalidArgument(
            "log pack header total_io_size disagrees with its records".into(),
        ));
    }

    Ok(LogPackHeader {
        logpack_lsid: raw.logpack_lsid,
        records,
    })
}

/// Greedily packs as many `requests[..]` as fit under `max_logpack_pb`
/// physical blocks (header + payload), consuming from the front. Returns the
/// built header and the number of requests consumed; always consumes at
/// least one request if `max_logpack_pb >= 1 + requests[0].io_size`.
pub fn build_pack(
    logpack_lsid: Lsid,
    requests: &[WriteRequest],
    max_logpack_pb: u32,
    sector_size: usize,
) -> (LogPackHeader, usize) {
    let mut records = ArrayVec::new();
    let mut used_pb: u64 = header_sector_count(sector_size); // the header itself
    let mut consumed = 0;

    for req in requests {
        if records.len() >= MAX_RECORDS_PER_PACK {
            break;
        }
        let next_pb = used_pb + req.io_size as u64;
        if consumed > 0 && next_pb > max_logpack_pb as u64 {
            break;
        }
        records.push(Record {
            flags: RecordFlags::IS_EXIST,
            lsid_local: consumed as u32,
            io_offset: req.io_offset,
            io_size: req.io_size,
            checksum: req.payload_checksum,
        });
        used_pb = next_pb;
        consumed += 1;
    }

    (
        LogPackHeader {
            logpack_lsid,
            records,
        },
        consumed,
    )
}

/// Builds a padding record filling `io_size` sectors with no payload
/// meaning, used to round a pack's tail up to a ring wrap boundary.
pub fn padding_record(lsid_local: u32, io_size: u32) -> Record {
    Record {
        flags: RecordFlags::IS_PADDING,
        lsid_local,
        io_offset: 0,
        io_size,
        checksum: 0,
    }
}

/// Builds a single-record pack logging a discard (TRIM) of `io_size`
/// sectors at `io_offset` on the data device. A discard record carries no
/// payload in the ring — only the header sector(s) occupy LSID space.
pub fn build_discard_pack(logpack_lsid: Lsid, io_offset: u64, io_size: u32) -> LogPackHeader {
    let mut records = ArrayVec::new();
    records.push(Record {
        flags: RecordFlags::IS_DISCARD,
        lsid_local: 0,
        io_offset,
        io_size,
        checksum: 0,
    });
    LogPackHeader {
        logpack_lsid,
        records,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_pack_respects_budget_and_consumes_at_least_one() {
        let requests = vec![
            WriteRequest {
                io_offset: 0,
                io_size: 4,
                payload_checksum: 1,
            },
            WriteRequest {
                io_offset: 4,
                io_size: 4,
                payload_checksum: 2,
            },
            WriteRequest {
                io_offset: 8,
                io_size: 100,
                payload_checksum: 3,
            },
        ];
        let header_pb = header_sector_count(512);
        let (pack, consumed) = build_pack(10, &requests, header_pb as u32 + 8, 512);
        assert_eq!(consumed, 2);
        assert_eq!(pack.total_io_size(), 8);
        assert_eq!(pack.physical_blocks(512), header_pb + 8);

        let (_pack, consumed) = build_pack(10, &requests[2..], 1, 512);
        assert_eq!(consumed, 1, "must consume at least one oversized request");
    }

    #[test]
    fn header_round_trips_through_sector_bytes() {
        let requests = vec![WriteRequest {
            io_offset: 42,
            io_size: 8,
            payload_checksum: 0xBEEF,
        }];
        let (pack, _) = build_pack(7, &requests, 512, 512);
        let bytes = pack.to_header_bytes(512, 0xCAFE);
        assert_eq!(bytes.len() as u64, pack.header_sectors(512) * 512);
        let parsed = parse_header(&bytes, 0xCAFE).unwrap();
        assert_eq!(parsed.logpack_lsid, 7);
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].io_offset, 42);
        assert_eq!(parsed.records[0].checksum, 0xBEEF);
    }

    #[test]
    fn rejects_pack_from_a_different_epoch_salt() {
        let requests = vec![WriteRequest {
            io_offset: 0,
            io_size: 1,
            payload_checksum: 1,
        }];
        let (pack, _) = build_pack(1, &requests, 512, 512);
        let bytes = pack.to_header_bytes(512, 0x1111);
        assert!(parse_header(&bytes, 0x2222).is_err());
    }
}
