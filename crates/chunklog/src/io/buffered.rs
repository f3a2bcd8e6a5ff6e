//! Page-cache backed log files.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{LogError, LogResult};

use super::{check_span, read_full_at, write_full_at, LogFile};

pub struct BufferedFile {
    file: File,
    path: PathBuf,
    size: u64,
}

impl BufferedFile {
    /// Creates (or truncates) a fixed-size log file.
    pub fn create(path: &Path, size: u64) -> LogResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            size,
        })
    }

    pub fn open(path: &Path) -> LogResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            size,
        })
    }
}

impl LogFile for BufferedFile {
    fn length(&self) -> u64 {
        self.size
    }

    fn read_at(&self, dst: &mut [u8], offset: u64) -> LogResult<()> {
        check_span(self.size, offset, dst.len())?;
        read_full_at(&self.file, dst, offset).map_err(LogError::from)
    }

    fn write_at(&self, src: &[u8], offset: u64) -> LogResult<()> {
        check_span(self.size, offset, src.len())?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_preallocates() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("log.prim");
        let file = BufferedFile::create(&path, 8192).expect("create");
        assert_eq!(file.length(), 8192);
        assert_eq!(std::fs::metadata(&path).expect("meta").len(), 8192);
    }

    #[test]
    fn reopen_keeps_contents() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("log.prim");
        {
            let file = BufferedFile::create(&path, 4096).expect("create");
            file.write_at(b"chunk", 100).expect("write");
            file.sync().expect("sync");
        }
        let file = BufferedFile::open(&path).expect("open");
        let mut out = [0u8; 5];
        file.read_at(&mut out, 100).expect("read");
        assert_eq!(&out, b"chunk");
    }
}
