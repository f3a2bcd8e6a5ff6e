//! Disk access behind one positioned-I/O interface.
//!
//! Three interchangeable backends:
//! - [`buffered`]: ordinary positioned file I/O through the page cache.
//! - [`direct`]: unbuffered I/O (`O_DIRECT` where available); rejects
//!   misaligned spans, the caller aligns.
//! - [`raw`]: a whole block device managed as a slab of preallocated
//!   files behind a small on-device directory.
//!
//! Files are fixed-size: logs never grow, they wrap or rotate.
//!
//! Backends that require alignment report it through
//! [`LogFile::alignment`] and fail misaligned spans with
//! `InvalidArgument`. The log layers write through [`write_span`], which
//! widens a span to page boundaries when needed: boundary pages are read
//! back, the tail of the last page is padded, and one aligned write is
//! issued from an aligned scratch buffer.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::buf::AlignedBuf;
use crate::config::{AccessMode, LogConfig};
use crate::error::{LogError, LogResult};

pub mod buffered;
pub mod direct;
pub mod raw;

pub use raw::RAW_DEVICE_MAGIC;

/// Positioned access to one fixed-size log file.
pub trait LogFile: Send + Sync {
    /// Fixed size of the file in bytes.
    fn length(&self) -> u64;

    /// Required alignment of offsets, lengths and buffer pointers; 1 when
    /// the backend accepts arbitrary spans.
    fn alignment(&self) -> usize {
        1
    }

    /// Fills `dst` from `offset`. The span must lie inside the file and
    /// satisfy [`LogFile::alignment`].
    fn read_at(&self, dst: &mut [u8], offset: u64) -> LogResult<()>;

    /// Writes `src` at `offset`. The span must lie inside the file and
    /// satisfy [`LogFile::alignment`].
    fn write_at(&self, src: &[u8], offset: u64) -> LogResult<()>;

    /// Flushes outstanding writes to the device.
    fn sync(&self) -> LogResult<()>;

    /// Closes the file and releases its storage.
    fn close_and_remove(&self) -> LogResult<()>;
}

/// Writes `src` at `offset`, honouring the file's alignment contract.
///
/// Aligned spans go straight to the backend. Misaligned spans are widened
/// to page boundaries through an aligned scratch buffer: the boundary
/// pages are read back so neighbouring bytes survive, the tail of the
/// last page is padded (zero from the scratch allocation), and a single
/// aligned write is issued.
pub(crate) fn write_span(file: &dyn LogFile, src: &[u8], offset: u64) -> LogResult<()> {
    if src.is_empty() {
        return Ok(());
    }
    let align = file.alignment();
    if align <= 1
        || (offset % align as u64 == 0
            && src.len() % align == 0
            && src.as_ptr() as usize % align == 0)
    {
        return file.write_at(src, offset);
    }

    check_span(file.length(), offset, src.len())?;
    let start = offset / align as u64 * align as u64;
    let end = (offset + src.len() as u64).div_ceil(align as u64) * align as u64;
    let end = end.min(file.length().div_ceil(align as u64) * align as u64);
    let span = (end - start) as usize;

    let mut scratch = AlignedBuf::new(span, align)?;
    let head = (offset - start) as usize;
    if head != 0 {
        file.read_at(&mut scratch.as_mut_slice()[..align], start)?;
    }
    let tail_start = head + src.len();
    if tail_start % align != 0 {
        let last_page = span - align;
        // The head read already covered a single-page span.
        if !(head != 0 && last_page == 0) {
            file.read_at(
                &mut scratch.as_mut_slice()[last_page..],
                start + last_page as u64,
            )?;
        }
    }

    scratch.as_mut_slice()[head..tail_start].copy_from_slice(src);
    file.write_at(scratch.as_slice(), start)
}

/// Opens log files in the access mode picked at startup.
#[derive(Debug)]
pub struct DiskBackend {
    mode: AccessMode,
    page_size: usize,
    raw: Option<Arc<raw::RawDevice>>,
}

impl DiskBackend {
    pub fn open(config: &LogConfig) -> LogResult<Self> {
        let raw = match config.access_mode {
            AccessMode::Raw => {
                let path = config.raw_device_path.as_ref().ok_or_else(|| {
                    LogError::invalid_argument("raw access mode requires raw_device_path")
                })?;
                Some(raw::RawDevice::open(path)?)
            }
            _ => None,
        };

        Ok(Self {
            mode: config.access_mode,
            page_size: config.flash_page_size,
            raw,
        })
    }

    #[inline]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Buffer alignment the backend expects from pooled buffers.
    #[inline]
    pub fn alignment(&self) -> usize {
        match self.mode {
            AccessMode::Buffered => 1,
            AccessMode::Direct | AccessMode::Raw => self.page_size,
        }
    }

    /// Creates a fixed-size log file, replacing any previous one.
    pub fn create(&self, path: &Path, size: u64) -> LogResult<Box<dyn LogFile>> {
        match self.mode {
            AccessMode::Buffered => Ok(Box::new(buffered::BufferedFile::create(path, size)?)),
            AccessMode::Direct => Ok(Box::new(direct::DirectFile::create(
                path,
                size,
                self.page_size,
            )?)),
            AccessMode::Raw => {
                let device = self.raw.as_ref().expect("raw device is open");
                Ok(Box::new(raw::RawFile::create(
                    device.clone(),
                    slab_name(path)?,
                    size,
                )?))
            }
        }
    }

    /// Opens an existing log file.
    pub fn open_existing(&self, path: &Path) -> LogResult<Box<dyn LogFile>> {
        match self.mode {
            AccessMode::Buffered => Ok(Box::new(buffered::BufferedFile::open(path)?)),
            AccessMode::Direct => Ok(Box::new(direct::DirectFile::open(path, self.page_size)?)),
            AccessMode::Raw => {
                let device = self.raw.as_ref().expect("raw device is open");
                Ok(Box::new(raw::RawFile::open(device.clone(), slab_name(path)?)?))
            }
        }
    }

    /// Whether a log file exists under this backend.
    pub fn exists(&self, path: &Path) -> bool {
        match self.mode {
            AccessMode::Buffered | AccessMode::Direct => path.is_file(),
            AccessMode::Raw => match (self.raw.as_ref(), slab_name(path)) {
                (Some(device), Ok(name)) => device.lookup(&name).is_some(),
                _ => false,
            },
        }
    }

    /// Renames a log file (atomic takeover of a recovered range).
    pub fn rename(&self, from: &Path, to: &Path) -> LogResult<()> {
        match self.mode {
            AccessMode::Buffered | AccessMode::Direct => {
                std::fs::rename(from, to).map_err(LogError::from)
            }
            AccessMode::Raw => {
                let device = self.raw.as_ref().expect("raw device is open");
                device.rename(&slab_name(from)?, &slab_name(to)?)
            }
        }
    }
}

fn slab_name(path: &Path) -> LogResult<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.to_string())
        .ok_or_else(|| LogError::invalid_argument(format!("bad log file name: {}", path.display())))
}

pub(crate) fn read_full_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        while !buf.is_empty() {
            let read = file.read_at(buf, offset)?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "log file read past end",
                ));
            }
            buf = &mut buf[read..];
            offset += read as u64;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            let read = file.seek_read(buf, offset)?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "log file read past end",
                ));
            }
            buf = &mut buf[read..];
            offset += read as u64;
        }
        Ok(())
    }
}

pub(crate) fn write_full_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        while !buf.is_empty() {
            let written = file.write_at(buf, offset)?;
            if written == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "log file write returned zero",
                ));
            }
            buf = &buf[written..];
            offset += written as u64;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            let written = file.seek_write(buf, offset)?;
            if written == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "log file write returned zero",
                ));
            }
            buf = &buf[written..];
            offset += written as u64;
        }
        Ok(())
    }
}

pub(crate) fn check_span(file_len: u64, offset: u64, len: usize) -> LogResult<()> {
    if offset.checked_add(len as u64).map_or(true, |end| end > file_len) {
        return Err(LogError::invalid_argument(format!(
            "I/O span {offset}+{len} exceeds log file size {file_len}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogConfig;
    use tempfile::TempDir;

    fn backend(dir: &TempDir, mode: AccessMode) -> DiskBackend {
        let mut cfg = LogConfig::default();
        cfg.access_mode = mode;
        if mode == AccessMode::Raw {
            let device = dir.path().join("device.raw");
            // A 4 MiB file stands in for the block device.
            std::fs::write(&device, vec![0u8; 4 * 1024 * 1024]).expect("device file");
            cfg.raw_device_path = Some(device);
        }
        DiskBackend::open(&cfg).expect("backend")
    }

    /// Reads an arbitrary span the way the log layers do: through an
    /// aligned scratch buffer covering the widened span.
    fn read_span(file: &dyn LogFile, dst: &mut [u8], offset: u64) {
        let align = file.alignment();
        if align <= 1 {
            file.read_at(dst, offset).expect("read");
            return;
        }
        let start = offset / align as u64 * align as u64;
        let end = (offset + dst.len() as u64).div_ceil(align as u64) * align as u64;
        let mut scratch = AlignedBuf::new((end - start) as usize, align).expect("scratch");
        file.read_at(scratch.as_mut_slice(), start).expect("read");
        let head = (offset - start) as usize;
        dst.copy_from_slice(&scratch.as_slice()[head..head + dst.len()]);
    }

    #[test]
    fn round_trip_all_modes() {
        for mode in [AccessMode::Buffered, AccessMode::Direct, AccessMode::Raw] {
            let dir = TempDir::new().expect("tempdir");
            let backend = backend(&dir, mode);
            let path = dir.path().join("log-0.sec");

            let file = backend.create(&path, 64 * 1024).expect("create");
            assert_eq!(file.length(), 64 * 1024);

            let payload = vec![0x5A_u8; 9000];
            write_span(file.as_ref(), &payload, 12_345).expect("write");
            file.sync().expect("sync");

            let mut out = vec![0u8; 9000];
            read_span(file.as_ref(), &mut out, 12_345);
            assert_eq!(out, payload, "mode {mode}");

            assert!(backend.exists(&path));
            file.close_and_remove().expect("remove");
            assert!(!backend.exists(&path));
        }
    }

    #[test]
    fn write_span_preserves_neighbouring_bytes() {
        let dir = TempDir::new().expect("tempdir");
        let backend = backend(&dir, AccessMode::Direct);
        let file = backend
            .create(&dir.path().join("log.sec"), 64 * 1024)
            .expect("create");
        let page = file.alignment();

        let seed = vec![0x11u8; 4 * page];
        write_span(file.as_ref(), &seed, 0).expect("seed");

        // An unaligned overwrite spanning a page boundary.
        let span = vec![0x22u8; page + 500];
        write_span(file.as_ref(), &span, (page - 250) as u64).expect("overwrite");

        let mut out = vec![0u8; 4 * page];
        read_span(file.as_ref(), &mut out, 0);
        assert!(out[..page - 250].iter().all(|&b| b == 0x11));
        assert!(out[page - 250..2 * page + 250].iter().all(|&b| b == 0x22));
        assert!(out[2 * page + 250..].iter().all(|&b| b == 0x11));
    }

    #[test]
    fn spans_are_bounds_checked() {
        let dir = TempDir::new().expect("tempdir");
        let backend = backend(&dir, AccessMode::Buffered);
        let file = backend
            .create(&dir.path().join("log.sec"), 4096)
            .expect("create");
        let err = file.write_at(&[0u8; 8], 4092).unwrap_err();
        assert!(matches!(err, LogError::InvalidArgument(_)));
    }

    #[test]
    fn raw_mode_requires_device_path() {
        let mut cfg = LogConfig::default();
        cfg.access_mode = AccessMode::Raw;
        let err = DiskBackend::open(&cfg).unwrap_err();
        assert!(matches!(err, LogError::InvalidArgument(_)));
    }
}
