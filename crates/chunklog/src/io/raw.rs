//! Raw block device backend.
//!
//! The device is one big slab: a 4 KiB header page holds a magic and a
//! fixed directory of preallocated "files"; the slabs follow. Everything
//! is served from a single writable mapping. Removal frees the directory
//! slot but keeps the slab's extent recorded so a later create of the same
//! or smaller size can reuse it.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use memmap2::MmapMut;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{LogError, LogResult};

use super::{check_span, LogFile};

/// Magic of a formatted raw device.
pub const RAW_DEVICE_MAGIC: &[u8; 4] = b"DXRW";

const RAW_HEADER_SIZE: u64 = 4096;
const NAME_BYTES: usize = 64;
/// `[file_id: u32][name: 64][offset: u64][length: u64]`
const DIR_ENTRY_SIZE: usize = 4 + NAME_BYTES + 8 + 8;
const DIR_ENTRY_COUNT: usize = (RAW_HEADER_SIZE as usize - 8) / DIR_ENTRY_SIZE;

const ID_OFFSET: usize = 0;
const NAME_OFFSET: usize = 4;
const SLAB_OFFSET: usize = 4 + NAME_BYTES;
const SLAB_LENGTH: usize = SLAB_OFFSET + 8;

#[derive(Debug)]
pub struct RawDevice {
    mmap: Mutex<MmapMut>,
    len: u64,
}

#[derive(Debug, Clone, Copy)]
struct DirEntry {
    slot: usize,
    file_id: u32,
    offset: u64,
    length: u64,
}

impl RawDevice {
    /// Opens (formatting if necessary) the device at `path`.
    pub fn open(path: &Path) -> LogResult<Arc<Self>> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < RAW_HEADER_SIZE * 2 {
            return Err(LogError::invalid_argument(format!(
                "raw device {} too small ({len} bytes)",
                path.display()
            )));
        }

        // The mapping is exclusively owned; all access goes through the
        // mutex below.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        if &mmap[..4] != RAW_DEVICE_MAGIC {
            debug!(path = %path.display(), "formatting raw device");
            mmap[..RAW_HEADER_SIZE as usize].fill(0);
            mmap[..4].copy_from_slice(RAW_DEVICE_MAGIC);
            mmap.flush_range(0, RAW_HEADER_SIZE as usize)?;
        }

        Ok(Arc::new(Self {
            mmap: Mutex::new(mmap),
            len,
        }))
    }

    fn entry(mmap: &MmapMut, slot: usize) -> DirEntry {
        let at = 8 + slot * DIR_ENTRY_SIZE;
        DirEntry {
            slot,
            file_id: LittleEndian::read_u32(&mmap[at + ID_OFFSET..]),
            offset: LittleEndian::read_u64(&mmap[at + SLAB_OFFSET..]),
            length: LittleEndian::read_u64(&mmap[at + SLAB_LENGTH..]),
        }
    }

    fn entry_name(mmap: &MmapMut, slot: usize) -> [u8; NAME_BYTES] {
        let at = 8 + slot * DIR_ENTRY_SIZE + NAME_OFFSET;
        let mut name = [0u8; NAME_BYTES];
        name.copy_from_slice(&mmap[at..at + NAME_BYTES]);
        name
    }

    fn find(mmap: &MmapMut, name: &[u8; NAME_BYTES]) -> Option<DirEntry> {
        (0..DIR_ENTRY_COUNT)
            .map(|slot| Self::entry(mmap, slot))
            .find(|e| e.file_id != 0 && &Self::entry_name(mmap, e.slot) == name)
    }

    fn padded_name(name: &str) -> LogResult<[u8; NAME_BYTES]> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > NAME_BYTES {
            return Err(LogError::invalid_argument(format!(
                "raw slab name must be 1..={NAME_BYTES} bytes: {name:?}"
            )));
        }
        let mut padded = [0u8; NAME_BYTES];
        padded[..bytes.len()].copy_from_slice(bytes);
        Ok(padded)
    }

    pub fn lookup(&self, name: &str) -> Option<(u64, u64)> {
        let padded = Self::padded_name(name).ok()?;
        let mmap = self.mmap.lock();
        Self::find(&mmap, &padded).map(|e| (e.offset, e.length))
    }

    /// Allocates (or replaces) a slab of at least `size` bytes.
    fn allocate(&self, name: &str, size: u64) -> LogResult<(usize, u64, u64)> {
        let padded = Self::padded_name(name)?;
        let mut mmap = self.mmap.lock();

        if let Some(existing) = Self::find(&mmap, &padded) {
            Self::free_slot(&mut mmap, existing.slot);
        }

        // Prefer a freed extent that fits; otherwise carve new space after
        // the current high-water mark.
        let mut reuse: Option<DirEntry> = None;
        let mut fresh: Option<usize> = None;
        let mut high_water = RAW_HEADER_SIZE;
        for slot in 0..DIR_ENTRY_COUNT {
            let entry = Self::entry(&mmap, slot);
            high_water = high_water.max(entry.offset + entry.length);
            if entry.file_id != 0 {
                continue;
            }
            if entry.length >= size && reuse.map_or(true, |r| entry.length < r.length) {
                reuse = Some(entry);
            } else if entry.length == 0 && fresh.is_none() {
                fresh = Some(slot);
            }
        }

        let (slot, offset, length) = match reuse {
            Some(entry) => (entry.slot, entry.offset, entry.length),
            None => {
                let slot = fresh.ok_or_else(|| {
                    LogError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "raw device directory is full",
                    ))
                })?;
                let offset = high_water.div_ceil(RAW_HEADER_SIZE) * RAW_HEADER_SIZE;
                if offset + size > self.len {
                    return Err(LogError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "raw device is full",
                    )));
                }
                (slot, offset, size)
            }
        };

        let file_id = Self::next_file_id(&mut mmap);
        let at = 8 + slot * DIR_ENTRY_SIZE;
        LittleEndian::write_u32(&mut mmap[at + ID_OFFSET..at + ID_OFFSET + 4], file_id);
        mmap[at + NAME_OFFSET..at + NAME_OFFSET + NAME_BYTES].copy_from_slice(&padded);
        LittleEndian::write_u64(&mut mmap[at + SLAB_OFFSET..at + SLAB_OFFSET + 8], offset);
        LittleEndian::write_u64(&mut mmap[at + SLAB_LENGTH..at + SLAB_LENGTH + 8], length);

        // A fresh log must not inherit stale terminators.
        mmap[offset as usize..(offset + length) as usize].fill(0);
        mmap.flush_range(0, RAW_HEADER_SIZE as usize)?;

        Ok((slot, offset, length))
    }

    fn next_file_id(mmap: &mut MmapMut) -> u32 {
        let id = LittleEndian::read_u32(&mmap[4..8]).max(1);
        LittleEndian::write_u32(&mut mmap[4..8], id.wrapping_add(1).max(1));
        id
    }

    fn free_slot(mmap: &mut MmapMut, slot: usize) {
        let at = 8 + slot * DIR_ENTRY_SIZE;
        LittleEndian::write_u32(&mut mmap[at + ID_OFFSET..at + ID_OFFSET + 4], 0);
        mmap[at + NAME_OFFSET..at + NAME_OFFSET + NAME_BYTES].fill(0);
    }

    pub fn rename(&self, from: &str, to: &str) -> LogResult<()> {
        let from = Self::padded_name(from)?;
        let to_padded = Self::padded_name(to)?;
        let mut mmap = self.mmap.lock();

        if let Some(existing) = Self::find(&mmap, &to_padded) {
            Self::free_slot(&mut mmap, existing.slot);
        }
        let entry = Self::find(&mmap, &from).ok_or_else(|| {
            LogError::invalid_argument("raw slab to rename does not exist")
        })?;
        let at = 8 + entry.slot * DIR_ENTRY_SIZE + NAME_OFFSET;
        mmap[at..at + NAME_BYTES].copy_from_slice(&to_padded);
        mmap.flush_range(0, RAW_HEADER_SIZE as usize)?;
        Ok(())
    }

    fn remove(&self, slot: usize) -> LogResult<()> {
        let mut mmap = self.mmap.lock();
        Self::free_slot(&mut mmap, slot);
        mmap.flush_range(0, RAW_HEADER_SIZE as usize)?;
        Ok(())
    }

    fn read(&self, base: u64, dst: &mut [u8], offset: u64) {
        let mmap = self.mmap.lock();
        let at = (base + offset) as usize;
        dst.copy_from_slice(&mmap[at..at + dst.len()]);
    }

    fn write(&self, base: u64, src: &[u8], offset: u64) {
        let mut mmap = self.mmap.lock();
        let at = (base + offset) as usize;
        mmap[at..at + src.len()].copy_from_slice(src);
    }

    fn sync(&self, base: u64, len: u64) -> LogResult<()> {
        let mmap = self.mmap.lock();
        mmap.flush_range(base as usize, len as usize)?;
        Ok(())
    }
}

/// One preallocated file inside a [`RawDevice`].
pub struct RawFile {
    device: Arc<RawDevice>,
    slot: usize,
    base: u64,
    size: u64,
}

impl RawFile {
    pub fn create(device: Arc<RawDevice>, name: String, size: u64) -> LogResult<Self> {
        let (slot, base, size) = device.allocate(&name, size)?;
        Ok(Self {
            device,
            slot,
            base,
            size,
        })
    }

    pub fn open(device: Arc<RawDevice>, name: String) -> LogResult<Self> {
        let padded = RawDevice::padded_name(&name)?;
        let mmap = device.mmap.lock();
        let entry = RawDevice::find(&mmap, &padded).ok_or_else(|| {
            LogError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("raw slab {name:?} not found"),
            ))
        })?;
        drop(mmap);
        Ok(Self {
            slot: entry.slot,
            base: entry.offset,
            size: entry.length,
            device,
        })
    }
}

impl LogFile for RawFile {
    fn length(&self) -> u64 {
        self.size
    }

    fn read_at(&self, dst: &mut [u8], offset: u64) -> LogResult<()> {
        check_span(self.size, offset, dst.len())?;
        self.device.read(self.base, dst, offset);
        Ok(())
    }

    fn write_at(&self, src: &[u8], offset: u64) -> LogResult<()> {
        check_span(self.size, offset, src.len())?;
        self.device.write(self.base, src, offset);
        Ok(())
    }

    fn sync(&self) -> LogResult<()> {
        self.device.sync(self.base, self.size)
    }

    fn close_and_remove(&self) -> LogResult<()> {
        self.device.remove(self.slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn device(dir: &TempDir, len: usize) -> Arc<RawDevice> {
        let path = dir.path().join("disk.raw");
        std::fs::write(&path, vec![0u8; len]).expect("device file");
        RawDevice::open(&path).expect("open device")
    }

    #[test]
    fn create_open_remove_cycle_preserves_other_slabs() {
        let dir = TempDir::new().expect("tempdir");
        let device = device(&dir, 1024 * 1024);

        let a = RawFile::create(device.clone(), "a.sec".into(), 64 * 1024).expect("a");
        let b = RawFile::create(device.clone(), "b.sec".into(), 64 * 1024).expect("b");
        a.write_at(&[0xAA; 128], 0).expect("write a");
        b.write_at(&[0xBB; 128], 0).expect("write b");

        a.close_and_remove().expect("remove a");
        assert!(device.lookup("a.sec").is_none());

        let b2 = RawFile::open(device.clone(), "b.sec".into()).expect("reopen b");
        let mut out = [0u8; 128];
        b2.read_at(&mut out, 0).expect("read b");
        assert!(out.iter().all(|&x| x == 0xBB));
    }

    #[test]
    fn freed_extents_are_reused_and_zeroed() {
        let dir = TempDir::new().expect("tempdir");
        let device = device(&dir, 256 * 1024);

        let a = RawFile::create(device.clone(), "a.sec".into(), 128 * 1024).expect("a");
        let base = a.base;
        a.write_at(&[0x7E; 64], 0).expect("write");
        a.close_and_remove().expect("remove");

        // The device cannot fit a second 128 KiB slab, so the freed extent
        // must be reused.
        let b = RawFile::create(device.clone(), "b.sec".into(), 128 * 1024).expect("b");
        assert_eq!(b.base, base);
        let mut out = [0u8; 64];
        b.read_at(&mut out, 0).expect("read");
        assert!(out.iter().all(|&x| x == 0));
    }

    #[test]
    fn survives_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("disk.raw");
        std::fs::write(&path, vec![0u8; 256 * 1024]).expect("device file");

        {
            let device = RawDevice::open(&path).expect("open");
            let f = RawFile::create(device, "log.sec".into(), 32 * 1024).expect("create");
            f.write_at(b"persistent", 100).expect("write");
            f.sync().expect("sync");
        }

        let device = RawDevice::open(&path).expect("reopen");
        let f = RawFile::open(device, "log.sec".into()).expect("open file");
        let mut out = [0u8; 10];
        f.read_at(&mut out, 100).expect("read");
        assert_eq!(&out, b"persistent");
    }
}
