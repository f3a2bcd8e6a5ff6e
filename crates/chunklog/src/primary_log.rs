//! The shared primary log.
//!
//! A single sequential file that gives small batches a fast first hop to
//! durability before their entries reach the per-range secondary logs.
//! Only the disk writer thread appends. Every batch ends with a zero
//! sentinel so a crash-time scan knows where valid data stops; the log is
//! reset (position zero) once every contributing range has flushed its
//! coalescing buffer, which implicitly invalidates the old contents.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::buf::PooledBuf;
use crate::error::LogResult;
use crate::header::TERMINATOR;
use crate::io::{write_span, DiskBackend, LogFile};
use crate::metrics::LogMetrics;

pub const PRIMARY_LOG_FILE: &str = "primary.plog";

pub struct PrimaryLog {
    file: Box<dyn LogFile>,
    size: u64,
    write_pos: Mutex<u64>,
    metrics: Arc<LogMetrics>,
}

impl PrimaryLog {
    pub fn create(
        backend: &DiskBackend,
        dir: &Path,
        size: u64,
        metrics: Arc<LogMetrics>,
    ) -> LogResult<Self> {
        let file = backend.create(&dir.join(PRIMARY_LOG_FILE), size)?;
        Ok(Self {
            file,
            size,
            write_pos: Mutex::new(0),
            metrics,
        })
    }

    /// Bytes appended since the last reset.
    pub fn occupied(&self) -> u64 {
        *self.write_pos.lock()
    }

    /// Appends the batch in `buf` (its filled prefix) plus the trailing
    /// sentinel. Returns `false` without writing when the log is out of
    /// space; the caller then drains the secondary-log buffers and resets.
    pub fn try_append(&self, buf: &mut PooledBuf) -> LogResult<bool> {
        let len = buf.pos();
        if len == 0 {
            return Ok(true);
        }
        debug_assert!(len < buf.capacity(), "batch buffer reserves a sentinel byte");

        let mut pos = self.write_pos.lock();
        if *pos + len as u64 + 1 > self.size {
            return Ok(false);
        }

        // The byte after the batch is zero from the pool; write it along
        // with the data to terminate the scanable region.
        buf.as_mut_slice()[len] = TERMINATOR;
        write_span(self.file.as_ref(), &buf.as_slice()[..len + 1], *pos)?;
        *pos += len as u64;
        self.metrics.record_primary_write(len as u64);
        Ok(true)
    }

    /// Truncates the log to zero. All staged data must already be durable
    /// in the secondary logs.
    pub fn reset(&self) -> LogResult<()> {
        let mut pos = self.write_pos.lock();
        if *pos == 0 {
            return Ok(());
        }
        debug!(occupied = *pos, "resetting primary log");
        write_span(self.file.as_ref(), &[TERMINATOR], 0)?;
        *pos = 0;
        Ok(())
    }

    pub fn sync(&self) -> LogResult<()> {
        self.file.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::BufferPool;
    use crate::config::LogConfig;
    use crate::io::DiskBackend;
    use tempfile::TempDir;

    fn primary(dir: &TempDir, size: u64) -> PrimaryLog {
        let cfg = LogConfig::default();
        let backend = DiskBackend::open(&cfg).expect("backend");
        PrimaryLog::create(&backend, dir.path(), size, Arc::new(LogMetrics::new()))
            .expect("primary log")
    }

    #[test]
    fn batches_advance_the_position() {
        let dir = TempDir::new().expect("tempdir");
        let log = primary(&dir, 64 * 1024);
        let pool = BufferPool::new(8192, 4096);

        let mut batch = pool.get(100).expect("buf");
        batch.put(&[0x01; 100]);
        assert!(log.try_append(&mut batch).expect("append"));
        assert_eq!(log.occupied(), 100);

        let mut batch = pool.get(50).expect("buf");
        batch.put(&[0x02; 50]);
        assert!(log.try_append(&mut batch).expect("append"));
        assert_eq!(log.occupied(), 150);
    }

    #[test]
    fn full_log_reports_and_resets() {
        let dir = TempDir::new().expect("tempdir");
        let log = primary(&dir, 8192);
        let pool = BufferPool::new(8192, 4096);

        let mut batch = pool.get(8000).expect("buf");
        batch.put(&[0x03; 8000]);
        assert!(log.try_append(&mut batch).expect("append"));

        let mut batch = pool.get(500).expect("buf");
        batch.put(&[0x04; 500]);
        assert!(!log.try_append(&mut batch).expect("append"));

        log.reset().expect("reset");
        assert_eq!(log.occupied(), 0);
        assert!(log.try_append(&mut batch).expect("append"));
    }
}
