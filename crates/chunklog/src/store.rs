//! The log store facade.
//!
//! [`LogStore`] owns the whole peer-side logging pipeline: the write
//! buffer and its processing thread, the disk writer, the reorganisation
//! thread, the shared primary log and the catalog of backup ranges (one
//! secondary log plus coalescing buffer each). The chunk component talks
//! to this type only; collaborators (the recovered-chunk sink and the
//! clock) are injected at construction.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::buf::BufferPool;
use crate::config::{ChunkId, LogConfig, RangeKey};
use crate::error::{LogError, LogResult};
use crate::io::DiskBackend;
use crate::metrics::{LogMetrics, LogMetricsSnapshot};
use crate::primary_log::PrimaryLog;
use crate::reorg::{spawn_reorg_thread, ReorgHandle};
use crate::secondary_buffer::SecondaryLogBuffer;
use crate::secondary_log::{Chunk, RecoveryMetadata, SecondaryLog};
use crate::version::TemporaryVersions;
use crate::write_buffer::{spawn_process_thread, PrimaryWriteBuffer, ProcessContext};
use crate::writer::WriterPool;

/// Receives the chunks restored by a recovery, in batches.
pub trait ChunkSink: Send + Sync {
    fn put_recovered_chunks(&self, chunks: &[Chunk]);
}

/// Coarse time source for entry timestamps.
pub trait Clock: Send + Sync {
    fn now_seconds(&self) -> u32;
}

/// Seconds since the store was opened.
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_seconds(&self) -> u32 {
        self.started.elapsed().as_secs() as u32
    }
}

/// One backup range: its secondary log and coalescing buffer.
pub(crate) struct BackupRange {
    pub log: SecondaryLog,
    pub buffer: SecondaryLogBuffer,
}

/// All backup ranges this peer persists, keyed by the packed range key.
pub(crate) struct Catalog {
    ranges: RwLock<HashMap<u32, Arc<BackupRange>>>,
}

impl Catalog {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            ranges: RwLock::new(HashMap::new()),
        })
    }

    pub fn get(&self, packed: u32) -> Option<Arc<BackupRange>> {
        self.ranges.read().get(&packed).cloned()
    }

    pub fn keys(&self) -> Vec<u32> {
        let mut keys: Vec<u32> = self.ranges.read().keys().copied().collect();
        keys.sort_unstable();
        keys
    }
}

pub struct LogStore {
    config: LogConfig,
    backend: DiskBackend,
    catalog: Arc<Catalog>,
    pool: Arc<BufferPool>,
    metrics: Arc<LogMetrics>,
    write_buffer: PrimaryWriteBuffer,
    writer: Option<WriterPool>,
    reorg: ReorgHandle,
    primary: Option<Arc<PrimaryLog>>,
    clock: Box<dyn Clock>,
    sink: Box<dyn ChunkSink>,
    flush_lock: Mutex<()>,
    recovering: Mutex<HashSet<u32>>,
    closed: AtomicBool,
    process_thread: Option<JoinHandle<()>>,
    reorg_thread: Option<JoinHandle<()>>,
}

impl LogStore {
    /// Opens the store with the system clock.
    pub fn open(config: LogConfig, sink: Box<dyn ChunkSink>) -> LogResult<Self> {
        Self::open_with_clock(config, sink, Box::new(SystemClock::new()))
    }

    pub fn open_with_clock(
        config: LogConfig,
        sink: Box<dyn ChunkSink>,
        clock: Box<dyn Clock>,
    ) -> LogResult<Self> {
        let config = config.normalized();
        std::fs::create_dir_all(&config.root_dir)?;

        let backend = DiskBackend::open(&config)?;
        let metrics = Arc::new(LogMetrics::new());
        let pool = Arc::new(BufferPool::new(
            config.log_segment_size,
            config.flash_page_size,
        ));
        let catalog = Catalog::new();

        let primary = if config.two_level_logging {
            Some(Arc::new(PrimaryLog::create(
                &backend,
                &config.root_dir,
                config.primary_log_size,
                metrics.clone(),
            )?))
        } else {
            None
        };

        let reorg = ReorgHandle::new();
        let writer = WriterPool::spawn(
            catalog.clone(),
            primary.clone(),
            pool.clone(),
            reorg.clone(),
        );

        let write_buffer = PrimaryWriteBuffer::new(&config, metrics.clone());
        let process_thread = spawn_process_thread(
            &write_buffer,
            ProcessContext {
                catalog: catalog.clone(),
                pool: pool.clone(),
                writer: writer.sender(),
                reorg: reorg.clone(),
                two_level_logging: config.two_level_logging,
                log_segment_size: config.log_segment_size,
            },
        );
        let reorg_thread =
            spawn_reorg_thread(reorg.clone(), catalog.clone(), pool.clone(), &config);

        info!(%config, "log store opened");
        Ok(Self {
            config,
            backend,
            catalog,
            pool,
            metrics,
            write_buffer,
            writer: Some(writer),
            reorg,
            primary,
            clock,
            sink,
            flush_lock: Mutex::new(()),
            recovering: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            process_thread: Some(process_thread),
            reorg_thread: Some(reorg_thread),
        })
    }

    #[inline]
    fn ensure_open(&self) -> LogResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(LogError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn range(&self, owner: u16, range_id: u16) -> LogResult<Arc<BackupRange>> {
        let key = RangeKey::new(owner, range_id);
        self.catalog.get(key.packed()).ok_or_else(|| {
            LogError::invalid_argument(format!("unknown backup range {key}"))
        })
    }

    /// Creates the secondary log and buffer for a backup range, reopening
    /// persisted state when the log already exists on disk. Idempotent.
    pub fn init_backup_range(&self, owner: u16, range_id: u16) -> LogResult<()> {
        self.ensure_open()?;
        let key = RangeKey::new(owner, range_id);
        let mut ranges = self.catalog.ranges.write();
        if ranges.contains_key(&key.packed()) {
            return Ok(());
        }

        let path = self.config.root_dir.join(SecondaryLog::file_name(key));
        let log = if self.backend.exists(&path) {
            debug!(%key, "reopening persisted backup range");
            SecondaryLog::open_existing(
                &self.backend,
                &self.config.root_dir,
                key,
                key.owner,
                &self.config,
                self.metrics.clone(),
            )?
        } else {
            SecondaryLog::create(
                &self.backend,
                &self.config.root_dir,
                key,
                &self.config,
                self.metrics.clone(),
            )?
        };

        let buffer =
            SecondaryLogBuffer::new(self.config.secondary_log_buffer_size, self.pool.clone());
        ranges.insert(key.packed(), Arc::new(BackupRange { log, buffer }));
        Ok(())
    }

    /// Takes over (or freshly creates) the backup range of a failed peer.
    /// With `is_new_peer` the range starts empty on this peer; otherwise
    /// the existing log is renamed to its new identity and the version
    /// epoch is bumped.
    pub fn init_recovered_backup_range(
        &self,
        owner: u16,
        range_id: u16,
        original_owner: u16,
        original_range_id: u16,
        is_new_peer: bool,
    ) -> LogResult<()> {
        self.ensure_open()?;
        if is_new_peer {
            return self.init_backup_range(owner, range_id);
        }

        let old_key = RangeKey::new(original_owner, original_range_id);
        let new_key = RangeKey::new(owner, range_id);
        if self.recovering.lock().contains(&old_key.packed()) {
            return Err(LogError::busy(format!(
                "backup range {old_key} is being recovered"
            )));
        }

        let mut ranges = self.catalog.ranges.write();
        if let Some(old_range) = ranges.remove(&old_key.packed()) {
            // Settle in-memory state before the files move.
            if let Some(buffered) = old_range.buffer.take() {
                old_range.log.append_batch(buffered.filled())?;
                old_range.buffer.release(buffered);
            }
            old_range.log.write_version_snapshot()?;
        } else if !self
            .backend
            .exists(&self.config.root_dir.join(SecondaryLog::file_name(old_key)))
        {
            warn!(%old_key, "no log to take over, creating {new_key} fresh");
            drop(ranges);
            return self.init_backup_range(owner, range_id);
        }

        let dir = &self.config.root_dir;
        self.backend.rename(
            &dir.join(SecondaryLog::file_name(old_key)),
            &dir.join(SecondaryLog::file_name(new_key)),
        )?;
        let old_ver = dir.join(format!("sec_{:04X}_{}.ver", old_key.owner, old_key.range_id));
        let new_ver = dir.join(format!("sec_{:04X}_{}.ver", new_key.owner, new_key.range_id));
        match std::fs::rename(&old_ver, &new_ver) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(LogError::from(err)),
        }

        // Entries logged before the takeover omit their creator when it
        // matched the failed owner; keep reconstructing them with it.
        let log = SecondaryLog::open_existing(
            &self.backend,
            dir,
            new_key,
            original_owner,
            &self.config,
            self.metrics.clone(),
        )?;
        log.versions().bump_epoch();
        let buffer =
            SecondaryLogBuffer::new(self.config.secondary_log_buffer_size, self.pool.clone());
        ranges.insert(new_key.packed(), Arc::new(BackupRange { log, buffer }));
        info!(%old_key, %new_key, "took over backup range");
        Ok(())
    }

    /// Commits one chunk replica to the write buffer. Blocks while the
    /// ring is full; returns once the entry (chained if large) is in.
    pub fn put_log_data(
        &self,
        owner: u16,
        range_id: u16,
        chunk_id: ChunkId,
        original_owner: u16,
        payload: &[u8],
    ) -> LogResult<()> {
        self.ensure_open()?;
        let range = self.range(owner, range_id)?;
        let timestamp = self
            .config
            .use_timestamps
            .then(|| self.clock.now_seconds());
        self.write_buffer.put_log_data(
            payload,
            chunk_id,
            range_id,
            owner,
            original_owner,
            timestamp,
            &range.log,
        )
    }

    /// Decodes a batch of `(chunk_id, length, payload)` tuples and logs
    /// each one. Returns the number of chunks logged.
    ///
    /// Wire format, little-endian: `[count: u32][(cid: u64, len: u32,
    /// payload: len bytes) x count]`.
    pub fn incoming_log_chunks(&self, buf: &[u8], owner: u16, range_id: u16) -> LogResult<usize> {
        self.ensure_open()?;
        if buf.len() < 4 {
            return Err(LogError::invalid_argument("log chunk batch too short"));
        }
        let count = LittleEndian::read_u32(buf) as usize;
        let mut at = 4;
        for i in 0..count {
            if at + 12 > buf.len() {
                return Err(LogError::invalid_argument(format!(
                    "log chunk batch truncated at entry {i}"
                )));
            }
            let cid = ChunkId::new(LittleEndian::read_u64(&buf[at..]));
            let len = LittleEndian::read_u32(&buf[at + 8..]) as usize;
            at += 12;
            if at + len > buf.len() {
                return Err(LogError::invalid_argument(format!(
                    "log chunk batch truncated in entry {i} payload"
                )));
            }
            self.put_log_data(owner, range_id, cid, cid.creator(), &buf[at..at + len])?;
            at += len;
        }
        Ok(count)
    }

    /// Decodes a batch of chunk ids and invalidates each one.
    ///
    /// Wire format, little-endian: `[count: u32][cid: u64 x count]`.
    pub fn incoming_remove_chunks(
        &self,
        buf: &[u8],
        owner: u16,
        range_id: u16,
    ) -> LogResult<usize> {
        self.ensure_open()?;
        if buf.len() < 4 {
            return Err(LogError::invalid_argument("remove batch too short"));
        }
        let count = LittleEndian::read_u32(buf) as usize;
        if buf.len() < 4 + count * 8 {
            return Err(LogError::invalid_argument("remove batch truncated"));
        }

        let key = RangeKey::new(owner, range_id);
        let range = self.range(owner, range_id)?;
        let mut wants_reorg = false;
        for i in 0..count {
            let cid = ChunkId::new(LittleEndian::read_u64(&buf[4 + i * 8..]));
            wants_reorg |= range.log.invalidate(cid);
        }
        // One snapshot write persists the whole remove batch.
        range.log.write_version_snapshot()?;
        if wants_reorg {
            self.reorg.request(key, false);
        }
        Ok(count)
    }

    /// Restores every live chunk of a backup range through the sink.
    pub fn recover_backup_range(&self, owner: u16, range_id: u16) -> LogResult<RecoveryMetadata> {
        self.ensure_open()?;
        let key = RangeKey::new(owner, range_id);
        let range = self.range(owner, range_id)?;

        if !self.recovering.lock().insert(key.packed()) {
            return Err(LogError::busy(format!(
                "backup range {key} is already being recovered"
            )));
        }
        self.reorg.block();

        let result = (|| {
            // Versions are read before the flush, as the flush only moves
            // already-versioned bytes to disk.
            let mut temp = TemporaryVersions::with_capacity(range.log.versions().len() + 1);
            temp.fill_from(range.log.versions());

            self.write_buffer.flush_and_wait();
            if let Some(writer) = self.writer.as_ref() {
                writer.wait_idle();
            }
            if let Some(buffered) = range.buffer.take() {
                range.log.append_batch(buffered.filled())?;
                range.buffer.release(buffered);
            }

            let meta = range
                .log
                .recover(&temp, |batch| self.sink.put_recovered_chunks(&batch))?;
            range.log.write_version_snapshot()?;
            Ok(meta)
        })();

        self.reorg.unblock();
        self.recovering.lock().remove(&key.packed());
        result
    }

    /// Restores chunks from a secondary log file outside the catalog.
    pub fn recover_backup_range_from_file(&self, path: &Path) -> LogResult<Vec<Chunk>> {
        self.ensure_open()?;
        SecondaryLog::recover_from_file(path, &self.config)
    }

    /// Seals and deletes a backup range and its on-disk state.
    pub fn remove_backup_range(&self, owner: u16, range_id: u16) -> LogResult<()> {
        self.ensure_open()?;
        let key = RangeKey::new(owner, range_id);
        if self.recovering.lock().contains(&key.packed()) {
            return Err(LogError::busy(format!(
                "backup range {key} is being recovered"
            )));
        }

        let removed = self.catalog.ranges.write().remove(&key.packed());
        match removed {
            Some(range) => {
                if let Some(buffered) = range.buffer.take() {
                    range.buffer.release(buffered);
                }
                range.log.close_and_remove()?;
                info!(%key, "removed backup range");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Drains the ring, every coalescing buffer and the writer queue, then
    /// rotates the primary log. Serialised; a concurrent caller waits for
    /// the running flush instead of repeating it.
    pub fn flush_data_to_secondary_logs(&self) -> LogResult<()> {
        self.ensure_open()?;
        let guard = match self.flush_lock.try_lock() {
            Some(guard) => guard,
            None => {
                // Another thread is flushing; wait for it.
                drop(self.flush_lock.lock());
                return Ok(());
            }
        };

        self.write_buffer.flush_and_wait();
        if let Some(writer) = self.writer.as_ref() {
            writer.wait_idle();
        }

        for packed in self.catalog.keys() {
            let Some(range) = self.catalog.get(packed) else { continue };
            if let Some(buffered) = range.buffer.take() {
                range.log.append_batch(buffered.filled())?;
                range.buffer.release(buffered);
            }
            range.log.write_version_snapshot()?;
        }

        if let Some(primary) = self.primary.as_ref() {
            primary.reset()?;
        }
        drop(guard);
        Ok(())
    }

    /// Wakes the processing thread for an immediate flush of the write
    /// buffer (e.g. before a barrier in the network protocol).
    pub fn initiate_priority_flush(&self) {
        self.write_buffer.initiate_priority_flush();
    }

    pub fn metrics(&self) -> LogMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Stops the pipeline: producers fail with [`LogError::Shutdown`], the
    /// processing thread drains the ring, the writer drains its queue and
    /// all persistent state is synced.
    pub fn close(&mut self) -> LogResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("closing log store");

        self.write_buffer.shutdown();
        if let Some(thread) = self.process_thread.take() {
            let _ = thread.join();
        }
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown();
        }
        self.reorg.shutdown();
        if let Some(thread) = self.reorg_thread.take() {
            let _ = thread.join();
        }

        for packed in self.catalog.keys() {
            if let Some(range) = self.catalog.get(packed) {
                if let Some(buffered) = range.buffer.take() {
                    range.log.append_batch(buffered.filled())?;
                    range.buffer.release(buffered);
                }
                range.log.write_version_snapshot()?;
                range.log.sync()?;
            }
        }
        if let Some(primary) = self.primary.as_ref() {
            primary.sync()?;
        }
        info!("log store closed");
        Ok(())
    }
}

impl Drop for LogStore {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(%err, "error while closing log store");
        }
    }
}
