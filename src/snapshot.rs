//! Snapshot metadata store: named, LSID-tagged marks an operator can later
//! roll back to.
//!
//! The on-disk layout — a bitmap of occupied slots plus a fixed array of
//! records per sector, checksummed as a unit — packs a fixed number of
//! fixed-size entries per block and addresses them by block/offset
//! division. The in-memory id/name/lsid indices are an ordinary in-process
//! index layered over those records.

use std::collections::{BTreeMap, HashMap};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::checksum;
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::lock::sleepable::SleepableLock;
use crate::lsid::Lsid;
use crate::sector;

/// Records per on-disk snapshot sector.
pub const RECORDS_PER_SECTOR: usize = 32;

const NAME_LEN: usize = 64;

#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawEntry {
    id: u32,
    _pad: u32,
    lsid: u64,
    timestamp: u64,
    name: [u8; NAME_LEN],
}

#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawSector {
    checksum: u32,
    occupied: u32,
    entries: [RawEntry; RECORDS_PER_SECTOR],
}

/// Byte length of the fixed-size `RawSector` (mirrors
/// `logpack::header_byte_len`): at least one device sector, more if the
/// struct doesn't fit in one.
fn raw_sector_byte_len(sector_size: usize) -> usize {
    std::mem::size_of::<RawSector>().max(sector_size)
}

/// Number of device sectors one on-disk snapshot sector spans, given the
/// device's sector size. `RawSector` (checksum + bitmap + 32 entries) is
/// larger than one 512-byte sector, so this is usually > 1; callers must
/// read/write this many contiguous device sectors per logical snapshot
/// sector rather than truncating to one.
pub fn device_sectors_per_snapshot_sector(sector_size: usize) -> u64 {
    raw_sector_byte_len(sector_size).div_ceil(sector_size) as u64
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub id: u32,
    pub lsid: Lsid,
    pub timestamp: u64,
    pub name: String,
}

fn encode_name(name: &str) -> Result<[u8; NAME_LEN]> {
    let bytes = name.as_bytes();
    if bytes.len() >= NAME_LEN {
        return Err(Error::InvalidArgument(format!(
            "snapshot name longer than {} bytes",
            NAME_LEN - 1
        )));
    }
    let mut buf = [0u8; NAME_LEN];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(buf)
}

fn decode_name(buf: &[u8; NAME_LEN]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

struct Slot {
    id: u32,
    lsid: Lsid,
    timestamp: u64,
    name: String,
}

struct State {
    /// One `Vec<Option<Slot>>` per on-disk sector, index == slot index within
    /// that sector.
    sectors: Vec<Vec<Option<Slot>>>,
    by_id: HashMap<u32, (usize, usize)>,
    by_name: HashMap<String, u32>,
    by_lsid: BTreeMap<Lsid, Vec<u32>>,
    next_id: u32,
}

impl State {
    fn empty(n_sectors: usize) -> Self {
        Self {
            sectors: (0..n_sectors)
                .map(|_| (0..RECORDS_PER_SECTOR).map(|_| None).collect())
                .collect(),
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            by_lsid: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn record_of(&self, sector_idx: usize, slot_idx: usize) -> SnapshotRecord {
        let slot = self.sectors[sector_idx][slot_idx].as_ref().unwrap();
        SnapshotRecord {
            id: slot.id,
            lsid: slot.lsid,
            timestamp: slot.timestamp,
            name: slot.name.clone(),
        }
    }
}

/// The snapshot metadata store, guarded by a lock allowed to block while it
/// persists sectors to disk (`snapshot_lock`).
pub struct SnapshotStore {
    state: SleepableLock<State>,
}

impl SnapshotStore {
    pub fn new(n_sectors: usize) -> Self {
        Self {
            state: SleepableLock::new(State::empty(n_sectors)),
        }
    }

    /// Loads the store from `n_sectors` logical snapshot sectors starting at
    /// `start_sector` on the device, each spanning
    /// `device_sectors_per_snapshot_sector(dev.sector_size())` device
    /// sectors. A sector that fails its checksum is treated as empty rather
    /// than aborting the whole load, and logged.
    pub fn load(dev: &dyn BlockDevice, start_sector: u64, n_sectors: usize) -> Result<Self> {
        let spss = device_sectors_per_snapshot_sector(dev.sector_size());
        let mut state = State::empty(n_sectors);
        for i in 0..n_sectors {
            let dev_off = start_sector + i as u64 * spss;
            let bytes = sector::read_sectors(dev, dev_off, spss)?;
            if !checksum::verify(&bytes) {
                log::warn!("snapshot sector {i} failed checksum, treating as empty");
                continue;
            }
            let raw_len = std::mem::size_of::<RawSector>();
            let raw = match RawSector::read_from_bytes(&bytes[..raw_len]) {
                Ok(raw) => raw,
                Err(_) => {
                    log::warn!("snapshot sector {i} truncated, treating as empty");
                    continue;
                }
            };
            for slot_idx in 0..RECORDS_PER_SECTOR {
                if raw.occupied & (1 << slot_idx) == 0 {
                    continue;
                }
                let entry = &raw.entries[slot_idx];
                let name = decode_name(&entry.name);
                state.sectors[i][slot_idx] = Some(Slot {
                    id: entry.id,
                    lsid: entry.lsid,
                    timestamp: entry.timestamp,
                    name: name.clone(),
                });
                state.by_id.insert(entry.id, (i, slot_idx));
                state.by_name.insert(name, entry.id);
                state.by_lsid.entry(entry.lsid).or_default().push(entry.id);
                state.next_id = state.next_id.max(entry.id + 1);
            }
        }
        Ok(Self {
            state: SleepableLock::new(state),
        })
    }

    /// Persists every sector back to disk, recomputing checksums. Each
    /// logical snapshot sector is written across
    /// `device_sectors_per_snapshot_sector(dev.sector_size())` contiguous
    /// device sectors, matching `load`'s layout.
    pub fn sync(&self, dev: &dyn BlockDevice, start_sector: u64) -> Result<()> {
        let spss = device_sectors_per_snapshot_sector(dev.sector_size());
        let mut guard = self.state.lock();
        for (i, sector_slots) in guard.sectors.iter().enumerate() {
            let mut raw = RawSector {
                checksum: 0,
                occupied: 0,
                entries: [RawEntry {
                    id: 0,
                    _pad: 0,
                    lsid: 0,
                    timestamp: 0,
                    name: [0u8; NAME_LEN],
                }; RECORDS_PER_SECTOR],
            };
            for (slot_idx, slot) in sector_slots.iter().enumerate() {
                if let Some(slot) = slot {
                    raw.occupied |= 1 << slot_idx;
                    raw.entries[slot_idx] = RawEntry {
                        id: slot.id,
                        _pad: 0,
                        lsid: slot.lsid,
                        timestamp: slot.timestamp,
                        name: encode_name(&slot.name)?,
                    };
                }
            }
            let mut buf = vec![0u8; spss as usize * dev.sector_size()];
            let raw_bytes = raw.as_bytes();
            buf[..raw_bytes.len()].copy_from_slice(raw_bytes);
            checksum::stamp(&mut buf, 0);
            sector::write_sectors(dev, start_sector + i as u64 * spss, &buf)?;
        }
        drop(guard);
        dev.flush()?;
        Ok(())
    }

    pub fn add(&self, name: &str, lsid: Lsid, timestamp: u64) -> Result<u32> {
        encode_name(name)?;
        let mut guard = self.state.lock();
        if guard.by_name.contains_key(name) {
            return Err(Error::NameConflict(name.to_string()));
        }
        let free = guard
            .sectors
            .iter()
            .enumerate()
            .find_map(|(si, slots)| slots.iter().position(|s| s.is_none()).map(|ei| (si, ei)));
        let (si, ei) = free.ok_or(Error::Busy)?;
        let id = guard.next_id;
        guard.next_id += 1;
        guard.sectors[si][ei] = Some(Slot {
            id,
            lsid,
            timestamp,
            name: name.to_string(),
        });
        guard.by_id.insert(id, (si, ei));
        guard.by_name.insert(name.to_string(), id);
        guard.by_lsid.entry(lsid).or_default().push(id);
        Ok(id)
    }

    pub fn del(&self, id: u32) -> Result<()> {
        let mut guard = self.state.lock();
        let (si, ei) = guard
            .by_id
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("snapshot id {id}")))?;
        let slot = guard.sectors[si][ei].take().unwrap();
        guard.by_name.remove(&slot.name);
        if let Some(ids) = guard.by_lsid.get_mut(&slot.lsid) {
            ids.retain(|&i| i != id);
            if ids.is_empty() {
                guard.by_lsid.remove(&slot.lsid);
            }
        }
        Ok(())
    }

    /// Deletes by name.
    pub fn del_by_name(&self, name: &str) -> Result<()> {
        let id = {
            let guard = self.state.lock();
            *guard
                .by_name
                .get(name)
                .ok_or_else(|| Error::NotFound(name.to_string()))?
        };
        self.del(id)
    }

    /// Deletes every snapshot whose lsid falls in `[from, to)`, returning how
    /// many were removed.
    pub fn del_range(&self, from: Lsid, to: Lsid) -> usize {
        let ids: Vec<u32> = {
            let guard = self.state.lock();
            guard
                .by_lsid
                .range(from..to)
                .flat_map(|(_, ids)| ids.iter().copied())
                .collect()
        };
        let mut n = 0;
        for id in ids {
            if self.del(id).is_ok() {
                n += 1;
            }
        }
        n
    }

    pub fn get(&self, id: u32) -> Option<SnapshotRecord> {
        let guard = self.state.lock();
        let (si, ei) = *guard.by_id.get(&id)?;
        Some(guard.record_of(si, ei))
    }

    pub fn get_by_name(&self, name: &str) -> Option<SnapshotRecord> {
        let guard = self.state.lock();
        let id = *guard.by_name.get(name)?;
        let (si, ei) = *guard.by_id.get(&id)?;
        Some(guard.record_of(si, ei))
    }

    pub fn n_records_range(&self, from: Lsid, to: Lsid) -> usize {
        let guard = self.state.lock();
        guard.by_lsid.range(from..to).map(|(_, ids)| ids.len()).sum()
    }

    pub fn list_range(&self, from: Lsid, to: Lsid) -> Vec<SnapshotRecord> {
        let guard = self.state.lock();
        guard
            .by_lsid
            .range(from..to)
            .flat_map(|(_, ids)| ids.iter().copied())
            .filter_map(|id| {
                let (si, ei) = *guard.by_id.get(&id)?;
                Some(guard.record_of(si, ei))
            })
            .collect()
    }

    /// Lists up to `limit` records with id >= `start_id`, in id order.
    pub fn list_from(&self, start_id: u32, limit: usize) -> Vec<SnapshotRecord> {
        let guard = self.state.lock();
        let mut ids: Vec<u32> = guard.by_id.keys().copied().filter(|&i| i >= start_id).collect();
        ids.sort_unstable();
        ids.into_iter()
            .take(limit)
            .map(|id| {
                let (si, ei) = guard.by_id[&id];
                guard.record_of(si, ei)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemBlockDevice;

    #[test]
    fn add_get_del_round_trip() {
        let store = SnapshotStore::new(1);
        let id = store.add("before-migration", 100, 1000).unwrap();
        let rec = store.get(id).unwrap();
        assert_eq!(rec.name, "before-migration");
        assert_eq!(rec.lsid, 100);
        store.del(id).unwrap();
        assert!(store.get(id).is_none());
    }

    #[test]
    fn rejects_duplicate_names() {
        let store = SnapshotStore::new(1);
        store.add("tag", 1, 0).unwrap();
        assert!(matches!(store.add("tag", 2, 0), Err(Error::NameConflict(_))));
    }

    #[test]
    fn del_range_removes_only_matching_lsids() {
        let store = SnapshotStore::new(2);
        store.add("a", 10, 0).unwrap();
        store.add("b", 20, 0).unwrap();
        store.add("c", 30, 0).unwrap();
        let removed = store.del_range(10, 25);
        assert_eq!(removed, 2);
        assert!(store.get_by_name("c").is_some());
    }

    #[test]
    fn persists_across_sync_and_load() {
        let dev = MemBlockDevice::new(512, 16);
        let store = SnapshotStore::new(2);
        store.add("keep", 5, 42).unwrap();
        store.sync(&dev, 0).unwrap();

        let reloaded = SnapshotStore::load(&dev, 0, 2).unwrap();
        let rec = reloaded.get_by_name("keep").unwrap();
        assert_eq!(rec.lsid, 5);
    }

    #[test]
    fn full_sector_returns_busy() {
        let store = SnapshotStore::new(1);
        for i in 0..RECORDS_PER_SECTOR {
            store.add(&format!("s{i}"), i as u64, 0).unwrap();
        }
        assert!(matches!(store.add("overflow", 999, 0), Err(Error::Busy)));
    }
}
