//! Per-log version bookkeeping.
//!
//! Every secondary log owns a [`VersionIndex`]: the current version of each
//! chunk id plus the location of its latest entry, which gives exact
//! invalidated-byte accounting. The index is persisted to a compact
//! snapshot file next to the log; a missing or corrupt snapshot is treated
//! as empty and the next scan rebuilds the state (recovery then keeps the
//! highest version seen per chunk).
//!
//! Tombstones (removed chunks) stay in the index until the log's epoch is
//! reset; pruning them earlier could resurrect stale entries from segments
//! that have not been reorganised yet.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use tracing::warn;

use crate::config::{ChunkId, Version};
use crate::error::{LogError, LogResult};

/// Magic of the version snapshot file.
pub const SNAPSHOT_MAGIC: &[u8; 4] = b"DXVS";

/// Location marker for "not on disk".
pub const SEGMENT_NONE: u16 = u16::MAX;

const SNAPSHOT_ENTRY_BYTES: usize = 8 + 2 + 4;

#[derive(Debug, Clone, Copy)]
struct Slot {
    epoch: u16,
    version: u32,
    tombstone: bool,
    segment: u16,
    entry_bytes: u32,
}

/// The outcome of recording a freshly written entry's location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// The entry is current; the previous location (if any) is returned so
    /// the caller can account it as invalidated.
    Current(Option<(u16, u32)>),
    /// The chunk moved on (newer version or tombstone) while the entry was
    /// in flight; the entry itself is already stale.
    Stale,
}

pub struct VersionIndex {
    slots: Mutex<HashMap<ChunkId, Slot>>,
    epoch: AtomicU16,
}

impl VersionIndex {
    pub fn new(epoch: u16) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            epoch: AtomicU16::new(epoch),
        }
    }

    #[inline]
    pub fn epoch(&self) -> u16 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Starts a new version-space generation (log reset or takeover).
    pub fn bump_epoch(&self) -> u16 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Returns the version for the next entry of `cid` and makes it
    /// current. Monotonic per chunk id within an epoch; a removed chunk
    /// resumes counting after its last live version.
    pub fn next_version(&self, cid: ChunkId) -> Version {
        use std::collections::hash_map::Entry;

        let epoch = self.epoch();
        let mut slots = self.slots.lock();
        match slots.entry(cid) {
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    epoch,
                    version: 0,
                    tombstone: false,
                    segment: SEGMENT_NONE,
                    entry_bytes: 0,
                });
                Version::new(epoch, 0)
            }
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if slot.epoch != epoch {
                    slot.epoch = epoch;
                    slot.version = 0;
                } else {
                    slot.version = slot.version.wrapping_add(1);
                }
                // The previous location stays until the new entry's
                // record_location supersedes it.
                slot.tombstone = false;
                Version::new(epoch, slot.version)
            }
        }
    }

    /// Records where the entry for `(cid, version)` landed on disk.
    pub fn record_location(
        &self,
        cid: ChunkId,
        version: Version,
        segment: u16,
        entry_bytes: u32,
    ) -> Recorded {
        let mut slots = self.slots.lock();
        let slot = match slots.get_mut(&cid) {
            Some(slot) => slot,
            None => return Recorded::Stale,
        };
        if slot.tombstone || slot.epoch != version.epoch || slot.version != version.version {
            return Recorded::Stale;
        }
        let old = (slot.segment != SEGMENT_NONE).then_some((slot.segment, slot.entry_bytes));
        slot.segment = segment;
        slot.entry_bytes = entry_bytes;
        Recorded::Current(old)
    }

    /// Marks `cid` removed. Returns the latest entry's location so the
    /// caller can account its bytes as invalidated; a second call is a
    /// no-op.
    pub fn invalidate(&self, cid: ChunkId) -> Option<(u16, u32)> {
        let epoch = self.epoch();
        let mut slots = self.slots.lock();
        let slot = slots.entry(cid).or_insert(Slot {
            epoch,
            version: 0,
            tombstone: false,
            segment: SEGMENT_NONE,
            entry_bytes: 0,
        });
        if slot.tombstone {
            return None;
        }
        slot.tombstone = true;
        (slot.segment != SEGMENT_NONE).then_some((slot.segment, slot.entry_bytes))
    }

    /// Current version of `cid`; [`Version::INVALID`] for a tombstone.
    pub fn current(&self, cid: ChunkId) -> Option<Version> {
        let slots = self.slots.lock();
        slots.get(&cid).map(|slot| {
            if slot.tombstone {
                Version::INVALID
            } else {
                Version::new(slot.epoch, slot.version)
            }
        })
    }

    /// Bulk readout; tombstones are reported as [`Version::INVALID`].
    pub fn for_all(&self, mut cb: impl FnMut(ChunkId, Version)) {
        let slots = self.slots.lock();
        for (cid, slot) in slots.iter() {
            let version = if slot.tombstone {
                Version::INVALID
            } else {
                Version::new(slot.epoch, slot.version)
            };
            cb(*cid, version);
        }
    }

    /// Seeds the index from a recovery scan: adopts `(cid, version)` when
    /// it is newer than anything recorded.
    pub fn adopt_scanned(&self, cid: ChunkId, version: Version, segment: u16, entry_bytes: u32) {
        let mut slots = self.slots.lock();
        let slot = slots.entry(cid).or_insert(Slot {
            epoch: version.epoch,
            version: version.version,
            tombstone: false,
            segment,
            entry_bytes,
        });
        if slot.tombstone {
            return;
        }
        let current = Version::new(slot.epoch, slot.version);
        if version >= current {
            slot.epoch = version.epoch;
            slot.version = version.version;
            slot.segment = segment;
            slot.entry_bytes = entry_bytes;
        }
        if version.epoch > self.epoch() {
            self.epoch.store(version.epoch, Ordering::Release);
        }
    }

    /// Writes the snapshot atomically (temp file + rename).
    pub fn write_snapshot(&self, path: &Path) -> LogResult<()> {
        let mut body = Vec::with_capacity(16 + self.len() * SNAPSHOT_ENTRY_BYTES);
        body.extend_from_slice(SNAPSHOT_MAGIC);

        {
            let slots = self.slots.lock();
            let mut count = [0u8; 4];
            LittleEndian::write_u32(&mut count, slots.len() as u32);
            body.extend_from_slice(&count);

            let mut entry = [0u8; SNAPSHOT_ENTRY_BYTES];
            for (cid, slot) in slots.iter() {
                LittleEndian::write_u64(&mut entry[0..8], cid.as_u64());
                LittleEndian::write_u16(&mut entry[8..10], slot.epoch);
                let version = if slot.tombstone {
                    u32::MAX
                } else {
                    slot.version
                };
                LittleEndian::write_u32(&mut entry[10..14], version);
                body.extend_from_slice(&entry);
            }
        }

        let mut crc = [0u8; 4];
        LittleEndian::write_u32(&mut crc, crate::header::payload_crc(&body));
        body.extend_from_slice(&crc);

        let tmp = path.with_extension("ver.tmp");
        fs::write(&tmp, &body)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Loads a snapshot, replacing the in-memory state. A missing, short or
    /// corrupt file leaves the index empty (the next recovery scan rebuilds
    /// it) and reports 0 entries.
    pub fn load_snapshot(&self, path: &Path) -> LogResult<usize> {
        let body = match fs::read(path) {
            Ok(body) => body,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(LogError::from(err)),
        };

        match Self::parse_snapshot(&body) {
            Ok(entries) => {
                let mut max_epoch = self.epoch();
                let mut slots = self.slots.lock();
                slots.clear();
                let count = entries.len();
                for (cid, version) in entries {
                    max_epoch = max_epoch.max(version.epoch);
                    slots.insert(
                        cid,
                        Slot {
                            epoch: version.epoch,
                            version: if version.is_tombstone() {
                                0
                            } else {
                                version.version
                            },
                            tombstone: version.is_tombstone(),
                            segment: SEGMENT_NONE,
                            entry_bytes: 0,
                        },
                    );
                }
                drop(slots);
                self.epoch.store(max_epoch, Ordering::Release);
                Ok(count)
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "discarding corrupt version snapshot");
                self.slots.lock().clear();
                Ok(0)
            }
        }
    }

    fn parse_snapshot(body: &[u8]) -> LogResult<Vec<(ChunkId, Version)>> {
        if body.len() < 12 || &body[..4] != SNAPSHOT_MAGIC {
            return Err(LogError::corruption("bad version snapshot magic"));
        }
        let crc_off = body.len() - 4;
        let stored = LittleEndian::read_u32(&body[crc_off..]);
        if stored != crate::header::payload_crc(&body[..crc_off]) {
            return Err(LogError::corruption("version snapshot checksum mismatch"));
        }
        let count = LittleEndian::read_u32(&body[4..8]) as usize;
        if crc_off != 8 + count * SNAPSHOT_ENTRY_BYTES {
            return Err(LogError::corruption("version snapshot length mismatch"));
        }

        let mut entries = Vec::with_capacity(count);
        let mut at = 8;
        for _ in 0..count {
            let cid = ChunkId::new(LittleEndian::read_u64(&body[at..]));
            let epoch = LittleEndian::read_u16(&body[at + 8..]);
            let version = LittleEndian::read_u32(&body[at + 10..]);
            entries.push((cid, Version::new(epoch, version)));
            at += SNAPSHOT_ENTRY_BYTES;
        }
        Ok(entries)
    }
}

/// Reorg-owned scratch map of current versions, refreshed per pass and
/// reused between them.
pub struct TemporaryVersions {
    map: HashMap<ChunkId, Version>,
}

impl TemporaryVersions {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            map: HashMap::with_capacity(capacity),
        }
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn fill_from(&mut self, index: &VersionIndex) {
        self.map.clear();
        index.for_all(|cid, version| {
            self.map.insert(cid, version);
        });
    }

    #[inline]
    pub fn get(&self, cid: ChunkId) -> Option<Version> {
        self.map.get(&cid).copied()
    }

    pub fn for_each(&self, mut cb: impl FnMut(ChunkId, Version)) {
        for (cid, version) in &self.map {
            cb(*cid, *version);
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn versions_are_monotonic() {
        let index = VersionIndex::new(0);
        let cid = ChunkId::from_parts(1, 42);
        assert_eq!(index.next_version(cid), Version::new(0, 0));
        assert_eq!(index.next_version(cid), Version::new(0, 1));
        assert_eq!(index.next_version(cid), Version::new(0, 2));
        assert_eq!(index.current(cid), Some(Version::new(0, 2)));
    }

    #[test]
    fn invalidate_is_idempotent_and_resumable() {
        let index = VersionIndex::new(0);
        let cid = ChunkId::from_parts(1, 7);
        let v = index.next_version(cid);
        assert_eq!(index.record_location(cid, v, 3, 128), Recorded::Current(None));

        assert_eq!(index.invalidate(cid), Some((3, 128)));
        assert_eq!(index.invalidate(cid), None);
        assert_eq!(index.current(cid), Some(Version::INVALID));

        // A later put resurrects the chunk with a strictly newer version.
        assert_eq!(index.next_version(cid), Version::new(0, 1));
    }

    #[test]
    fn stale_locations_are_reported() {
        let index = VersionIndex::new(0);
        let cid = ChunkId::from_parts(1, 7);
        let v0 = index.next_version(cid);
        let v1 = index.next_version(cid);
        // v0's write completes after v1 claimed the version counter.
        assert_eq!(index.record_location(cid, v0, 0, 64), Recorded::Stale);
        assert_eq!(index.record_location(cid, v1, 1, 64), Recorded::Current(None));
    }

    #[test]
    fn supersede_returns_old_location() {
        let index = VersionIndex::new(0);
        let cid = ChunkId::from_parts(1, 7);
        let v0 = index.next_version(cid);
        index.record_location(cid, v0, 0, 64);
        let v1 = index.next_version(cid);
        assert_eq!(
            index.record_location(cid, v1, 2, 80),
            Recorded::Current(Some((0, 64)))
        );
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("range.ver");

        let index = VersionIndex::new(1);
        let live = ChunkId::from_parts(1, 1);
        let dead = ChunkId::from_parts(1, 2);
        index.next_version(live);
        index.next_version(live);
        index.next_version(dead);
        index.invalidate(dead);
        index.write_snapshot(&path).expect("write");

        let loaded = VersionIndex::new(0);
        assert_eq!(loaded.load_snapshot(&path).expect("load"), 2);
        assert_eq!(loaded.current(live), Some(Version::new(1, 1)));
        assert_eq!(loaded.current(dead), Some(Version::INVALID));
        assert_eq!(loaded.epoch(), 1);
    }

    #[test]
    fn corrupt_snapshot_is_treated_as_empty() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("range.ver");

        let index = VersionIndex::new(0);
        index.next_version(ChunkId::from_parts(1, 1));
        index.write_snapshot(&path).expect("write");

        let mut body = std::fs::read(&path).expect("read");
        let mid = body.len() / 2;
        body[mid] ^= 0xFF;
        std::fs::write(&path, &body).expect("rewrite");

        let loaded = VersionIndex::new(0);
        assert_eq!(loaded.load_snapshot(&path).expect("load"), 0);
        assert!(loaded.is_empty());
    }

    #[test]
    fn missing_snapshot_is_empty() {
        let dir = TempDir::new().expect("tempdir");
        let loaded = VersionIndex::new(0);
        assert_eq!(
            loaded.load_snapshot(&dir.path().join("nope.ver")).expect("load"),
            0
        );
    }
}
