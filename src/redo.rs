//! Crash recovery: replays the ring from `written_lsid` forward, applying
//! every valid pack to the data device.
//!
//! Read the header, then copy each logged block to its home location, one
//! pack at a time, stopping at the first header that doesn't check out.
//! Redo must also tell a genuinely corrupt tail apart from one that was
//! merely in flight at crash time, and rewrite the ring so a stale tail
//! can't be replayed twice.

use crate::checksum;
use crate::device::BlockDevice;
use crate::error::Result;
use crate::logpack::{self, LogPackHeader, RecordFlags};
use crate::lsid::Lsid;
use crate::ring::Ring;
use crate::sector;

/// Outcome of a redo pass, for logging/diagnostics and for the caller to
/// decide whether a rewrite of the ring tail is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedoReport {
    /// The first lsid after the last pack that replayed cleanly.
    pub cursor: Lsid,
    /// Whether a partial/corrupt tail pack was found and truncated.
    pub truncated_tail: bool,
}

/// Replays packs from `from_lsid` (inclusive) through the ring, applying
/// each valid pack's payload to `data_dev` at the record's `io_offset`.
/// Stops at the first pack whose header fails checksum/salt/lsid
/// validation, or whose payload sectors can't be fully read — that lsid
/// becomes the new `written_lsid` cursor. Re-running redo from the new
/// cursor is always a no-op.
pub fn redo(
    log_dev: &dyn BlockDevice,
    data_dev: &dyn BlockDevice,
    ring: &Ring,
    salt: u32,
    from_lsid: Lsid,
    latest_lsid: Lsid,
) -> Result<RedoReport> {
    let sector_size = log_dev.sector_size();
    let header_sectors = logpack::header_sector_count(sector_size);
    let mut cursor = from_lsid;

    while cursor < latest_lsid {
        let header_off = ring.lsid_to_offset(cursor);
        let header_bytes = match sector::read_sectors(log_dev, header_off, header_sectors) {
            Ok(b) => b,
            Err(_) => {
                log::warn!("redo: failed to read header at lsid {cursor}, stopping");
                return Ok(RedoReport {
                    cursor,
                    truncated_tail: true,
                });
            }
        };

        let header = match logpack::parse_header(&header_bytes, salt) {
            Ok(h) if h.logpack_lsid == cursor => h,
            Ok(h) => {
                log::warn!(
                    "redo: header at lsid {cursor} claims lsid {}, stopping",
                    h.logpack_lsid
                );
                return Ok(RedoReport {
                    cursor,
                    truncated_tail: true,
                });
            }
            Err(e) => {
                log::warn!("redo: invalid header at lsid {cursor} ({e}), stopping");
                return Ok(RedoReport {
                    cursor,
                    truncated_tail: true,
                });
            }
        };

        let outcome = match apply_pack(log_dev, data_dev, ring, &header, cursor, header_sectors) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("redo: failed to apply pack at lsid {cursor} ({e}), stopping");
                return Ok(RedoReport {
                    cursor,
                    truncated_tail: true,
                });
            }
        };
        match outcome {
            ApplyOutcome::Full => {
                cursor += header.physical_blocks(sector_size);
            }
            ApplyOutcome::Partial {
                records_applied,
                error,
            } => {
                log::warn!(
                    "redo: partial payload for pack at lsid {cursor} ({error}), \
                     rewriting header with {records_applied} of {} records and stopping",
                    header.records.len()
                );
                let truncated = LogPackHeader {
                    logpack_lsid: header.logpack_lsid,
                    records: header.records[..records_applied].iter().cloned().collect(),
                };
                let new_cursor = cursor + truncated.physical_blocks(sector_size);
                let header_off = ring.lsid_to_offset(cursor);
                let rewritten = truncated.to_header_bytes(sector_size, salt);
                sector::write_sectors(log_dev, header_off, &rewritten)?;
                return Ok(RedoReport {
                    cursor: new_cursor,
                    truncated_tail: true,
                });
            }
        }
    }

    Ok(RedoReport {
        cursor,
        truncated_tail: false,
    })
}

/// Outcome of applying one pack's records to the data device: either every
/// record applied cleanly, or the `k`-th record's payload failed to read
/// back intact, in which case records `0..k` have already been applied and
/// the caller must rewrite the on-disk header to cover only those.
enum ApplyOutcome {
    Full,
    Partial {
        records_applied: usize,
        error: crate::error::Error,
    },
}

fn apply_pack(
    log_dev: &dyn BlockDevice,
    data_dev: &dyn BlockDevice,
    ring: &Ring,
    header: &LogPackHeader,
    pack_lsid: Lsid,
    header_sectors: u64,
) -> Result<ApplyOutcome> {
    let mut payload_lsid = pack_lsid + header_sectors;
    for (i, record) in header.records.iter().enumerate() {
        if record.flags.contains(RecordFlags::IS_PADDING) {
            payload_lsid += record.io_size as u64;
            continue;
        }
        if record.flags.contains(RecordFlags::IS_DISCARD) {
            data_dev.discard(record.io_offset, record.io_size as u64)?;
            continue;
        }
        if !record.flags.contains(RecordFlags::IS_EXIST) {
            continue;
        }

        let payload_off = ring.lsid_to_offset(payload_lsid);
        let payload = sector::read_sectors(log_dev, payload_off, record.io_size as u64)?;
        if checksum::checksum(&payload) != record.checksum {
            return Ok(ApplyOutcome::Partial {
                records_applied: i,
                error: crate::error::Error::Checksum { sector: payload_off },
            });
        }
        sector::write_sectors(data_dev, record.io_offset, &payload)?;
        payload_lsid += record.io_size as u64;
    }
    Ok(ApplyOutcome::Full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logpack::{build_pack, WriteRequest};
    use crate::testing::MemBlockDevice;

    fn write_payload_and_header(
        log_dev: &MemBlockDevice,
        ring: &Ring,
        salt: u32,
        lsid: Lsid,
        io_offset: u64,
        payload: &[u8],
    ) -> Lsid {
        let sector_size = log_dev.sector_size();
        let n_sectors = (payload.len() / sector_size) as u32;
        let checksum = checksum::checksum(payload);
        let header_sectors = logpack::header_sector_count(sector_size);

        let requests = vec![WriteRequest {
            io_offset,
            io_size: n_sectors,
            payload_checksum: checksum,
        }];
        let (header, consumed) = build_pack(lsid, &requests, u32::MAX, sector_size);
        assert_eq!(consumed, 1);

        let header_bytes = header.to_header_bytes(sector_size, salt);
        sector::write_sectors(log_dev, ring.lsid_to_offset(lsid), &header_bytes).unwrap();
        let payload_off = ring.lsid_to_offset(lsid + header_sectors);
        sector::write_sectors(log_dev, payload_off, payload).unwrap();

        lsid + header.physical_blocks(sector_size)
    }

    #[test]
    fn replays_a_clean_pack_to_the_data_device() {
        let ring = Ring::new(0, 4096);
        let log_dev = MemBlockDevice::new(512, 4096);
        let data_dev = MemBlockDevice::new(512, 256);
        let payload = vec![0xABu8; 512 * 3];

        let next = write_payload_and_header(&log_dev, &ring, 7, 0, 10, &payload);

        let report = redo(&log_dev, &data_dev, &ring, 7, 0, next).unwrap();
        assert_eq!(report.cursor, next);
        assert!(!report.truncated_tail);

        let written = sector::read_sectors(&data_dev, 10, 3).unwrap();
        assert_eq!(written, payload);
    }

    #[test]
    fn stops_and_reports_truncation_on_bad_payload_checksum() {
        let ring = Ring::new(0, 4096);
        let log_dev = MemBlockDevice::new(512, 4096);
        let data_dev = MemBlockDevice::new(512, 256);
        let payload = vec![0x11u8; 512 * 2];
        let next = write_payload_and_header(&log_dev, &ring, 3, 0, 0, &payload);

        log_dev.corrupt_byte(
            (ring.lsid_to_offset(logpack::header_sector_count(512)) as usize) * 512 + 4,
        );

        let report = redo(&log_dev, &data_dev, &ring, 3, 0, next).unwrap();
        assert!(report.truncated_tail);
        // The pack's only record failed to apply, so the rewritten header
        // covers zero records: the new cursor sits right past the header
        // sectors, with nothing copied to the data device.
        let header_sectors = logpack::header_sector_count(512);
        assert_eq!(report.cursor, header_sectors);

        let rewritten = sector::read_sectors(&log_dev, ring.lsid_to_offset(0), header_sectors)
            .unwrap();
        let header = logpack::parse_header(&rewritten, 3).unwrap();
        assert_eq!(header.records.len(), 0);
    }

    #[test]
    fn rewrites_header_to_cover_only_records_applied_before_a_bad_one() {
        let ring = Ring::new(0, 4096);
        let log_dev = MemBlockDevice::new(512, 4096);
        let data_dev = MemBlockDevice::new(512, 256);
        let sector_size = 512usize;
        let header_sectors = logpack::header_sector_count(sector_size);

        let good_payload = vec![0xAAu8; sector_size * 2];
        let bad_payload = vec![0xBBu8; sector_size * 3];

        let requests = vec![
            WriteRequest {
                io_offset: 0,
                io_size: 2,
                payload_checksum: checksum::checksum(&good_payload),
            },
            WriteRequest {
                io_offset: 2,
                io_size: 3,
                // Deliberately wrong so the second record's payload fails
                // the checksum check on replay.
                payload_checksum: checksum::checksum(&bad_payload) ^ 1,
            },
        ];
        let (header, consumed) = build_pack(0, &requests, u32::MAX, sector_size);
        assert_eq!(consumed, 2);

        let header_bytes = header.to_header_bytes(sector_size, 9);
        sector::write_sectors(&log_dev, ring.lsid_to_offset(0), &header_bytes).unwrap();
        let good_off = ring.lsid_to_offset(header_sectors);
        sector::write_sectors(&log_dev, good_off, &good_payload).unwrap();
        let bad_off = ring.lsid_to_offset(header_sectors + 2);
        sector::write_sectors(&log_dev, bad_off, &bad_payload).unwrap();

        let latest = header_sectors + 5;
        let report = redo(&log_dev, &data_dev, &ring, 9, 0, latest).unwrap();
        assert!(report.truncated_tail);
        // Only the first record (2 sectors) was applied; the new cursor sits
        // right after it, not at the original pack's full extent.
        assert_eq!(report.cursor, header_sectors + 2);

        let written = sector::read_sectors(&data_dev, 0, 2).unwrap();
        assert_eq!(written, good_payload);

        let rewritten = sector::read_sectors(&log_dev, ring.lsid_to_offset(0), header_sectors)
            .unwrap();
        let parsed = logpack::parse_header(&rewritten, 9).unwrap();
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].io_offset, 0);
    }

    #[test]
    fn stops_cleanly_at_missing_header_past_latest() {
        let ring = Ring::new(0, 4096);
        let log_dev = MemBlockDevice::new(512, 4096);
        let data_dev = MemBlockDevice::new(512, 256);
        let report = redo(&log_dev, &data_dev, &ring, 0, 5, 5).unwrap();
        assert_eq!(report.cursor, 5);
        assert!(!report.truncated_tail);
    }
}
