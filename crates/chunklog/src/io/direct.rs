//! Unbuffered log files with page-aligned device access.
//!
//! ## Alignment Contract
//!
//! Offsets, buffer lengths, and buffer pointers must be multiples of the
//! flash page size. The backend trusts the caller and returns
//! [`LogError::InvalidArgument`] for misalignment instead of realigning
//! or copying buffers internally; the log layers widen their spans to
//! page boundaries (and pad the tail of the last page) before submitting.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{LogError, LogResult};

use super::{check_span, read_full_at, write_full_at, LogFile};

/// Records the alignment contract enforced by the direct I/O backend.
#[derive(Clone, Copy, Debug)]
struct AlignmentContract {
    page: usize,
}

impl AlignmentContract {
    fn new(page: usize) -> Self {
        debug_assert!(page > 0);
        debug_assert!(page.is_power_of_two());
        Self { page }
    }

    fn require_offset(&self, offset: u64) -> LogResult<()> {
        if offset % self.page as u64 != 0 {
            return Err(LogError::invalid_argument(format!(
                "direct I/O offset {offset} is not a multiple of the {} byte page",
                self.page
            )));
        }
        Ok(())
    }

    fn require_len(&self, len: usize) -> LogResult<()> {
        if len % self.page != 0 {
            return Err(LogError::invalid_argument(format!(
                "direct I/O length {len} is not a multiple of the {} byte page",
                self.page
            )));
        }
        Ok(())
    }

    fn require_ptr(&self, ptr: usize) -> LogResult<()> {
        if ptr % self.page != 0 {
            return Err(LogError::invalid_argument(format!(
                "direct I/O buffer 0x{ptr:X} is not aligned to the {} byte page",
                self.page
            )));
        }
        Ok(())
    }

    fn require_slice(&self, slice: &[u8]) -> LogResult<()> {
        self.require_len(slice.len())?;
        self.require_ptr(slice.as_ptr() as usize)
    }
}

pub struct DirectFile {
    file: File,
    path: PathBuf,
    size: u64,
    contract: AlignmentContract,
}

impl DirectFile {
    pub fn create(path: &Path, size: u64, page: usize) -> LogResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = open_direct(path, true)?;
        file.set_len(size)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            size,
            contract: AlignmentContract::new(page),
        })
    }

    pub fn open(path: &Path, page: usize) -> LogResult<Self> {
        let file = open_direct(path, false)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            size,
            contract: AlignmentContract::new(page),
        })
    }
}

impl LogFile for DirectFile {
    fn length(&self) -> u64 {
        self.size
    }

    fn alignment(&self) -> usize {
        self.contract.page
    }

    fn read_at(&self, dst: &mut [u8], offset: u64) -> LogResult<()> {
        if dst.is_empty() {
            return Ok(());
        }
        check_span(self.size, offset, dst.len())?;
        self.contract.require_offset(offset)?;
        self.contract.require_slice(dst)?;
        read_full_at(&self.file, dst, offset).map_err(LogError::from)
    }

    fn write_at(&self, src: &[u8], offset: u64) -> LogResult<()> {
        if src.is_empty() {
            return Ok(());
        }
        check_span(self.size, offset, src.len())?;
        self.contract.require_offset(offset)?;
        self.contract.require_slice(src)?;
        write_full_at(&self.file, src, offset).map_err(LogError::from)
    }

    fn sync(&self) -> LogResult<()> {
        self.file.sync_data().map_err(LogError::from)
    }

    fn close_and_remove(&self) -> LogResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(LogError::from(err)),
        }
    }
}

#[cfg(target_os = "linux")]
fn open_direct(path: &Path, create: bool) -> LogResult<File> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut options = OpenOptions::new();
    options
        .read(true)
        .write(true)
        .create(create)
        .truncate(create)
        .mode(0o644)
        .custom_flags(libc::O_DIRECT | libc::O_DSYNC);

    match options.open(path) {
        Ok(file) => Ok(file),
        Err(err) if err.raw_os_error() == Some(libc::EINVAL) => {
            // Filesystem without O_DIRECT support (e.g. tmpfs).
            warn!(path = %path.display(), "O_DIRECT unsupported here, falling back to page cache");
            let mut fallback = OpenOptions::new();
            fallback
                .read(true)
                .write(true)
                .create(create)
                .truncate(create)
                .mode(0o644)
                .custom_flags(libc::O_DSYNC);
            fallback.open(path).map_err(LogError::from)
        }
        Err(err) => Err(LogError::from(err)),
    }
}

#[cfg(target_os = "macos")]
fn open_direct(path: &Path, create: bool) -> LogResult<File> {
    use std::os::unix::io::AsRawFd;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .truncate(create)
        .open(path)?;
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
    if rc == -1 {
        return Err(LogError::from(std::io::Error::last_os_error()));
    }
    Ok(file)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn open_direct(path: &Path, create: bool) -> LogResult<File> {
    warn!(path = %path.display(), "no unbuffered I/O on this platform, using page cache");
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .truncate(create)
        .open(path)
        .map_err(LogError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::AlignedBuf;
    use tempfile::TempDir;

    const PAGE: usize = 4096;

    #[test]
    fn aligned_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let file = DirectFile::create(&dir.path().join("log.sec"), 64 * 1024, PAGE)
            .expect("create");
        assert_eq!(file.alignment(), PAGE);

        let mut buf = AlignedBuf::new(PAGE, PAGE).expect("buf");
        buf.as_mut_slice().fill(0x42);
        file.write_at(buf.as_slice(), PAGE as u64).expect("write");

        let mut out = AlignedBuf::new(PAGE, PAGE).expect("out");
        file.read_at(out.as_mut_slice(), PAGE as u64).expect("read");
        assert!(out.as_slice().iter().all(|&b| b == 0x42));
    }

    #[test]
    fn enforces_alignment_on_write() {
        let dir = TempDir::new().expect("tempdir");
        let file = DirectFile::create(&dir.path().join("log.sec"), 64 * 1024, PAGE)
            .expect("create");

        let mut aligned = AlignedBuf::new(PAGE, PAGE).expect("buf");
        aligned.as_mut_slice().fill(0xAA);
        let err = file.write_at(aligned.as_slice(), 1).unwrap_err();
        assert!(matches!(err, LogError::InvalidArgument(_)), "offset");

        let backing = vec![0u8; PAGE + 1];
        let misaligned = &backing[1..1 + PAGE];
        assert_ne!(misaligned.as_ptr() as usize % PAGE, 0);
        let err = file.write_at(misaligned, 0).unwrap_err();
        assert!(matches!(err, LogError::InvalidArgument(_)), "buffer");
    }

    #[test]
    fn enforces_alignment_on_read() {
        let dir = TempDir::new().expect("tempdir");
        let file = DirectFile::create(&dir.path().join("log.sec"), 64 * 1024, PAGE)
            .expect("create");

        let mut short = AlignedBuf::new(PAGE / 2, PAGE).expect("buf");
        let err = file.read_at(short.as_mut_slice(), 0).unwrap_err();
        assert!(matches!(err, LogError::InvalidArgument(_)), "length");
    }
}
