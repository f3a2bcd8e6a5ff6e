//! Segmented per-range secondary logs.
//!
//! A secondary log is the durable home of one backup range: a fixed-size
//! file of `2 x backup_range_size`, partitioned into segments. Entries are
//! appended in secondary-header format; a zero byte terminates the written
//! prefix of every segment that is not completely full, and no entry ever
//! straddles a segment boundary. In-memory segment metadata tracks used
//! and invalidated bytes, which drives reorganisation.
//!
//! Concurrency: the disk writer thread appends under the read side of the
//! per-log access lock, the reorganiser compacts under the write side.
//! Segment metadata and the version index have their own short locks so
//! invalidations from network threads never wait on disk I/O.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::buf::BufferPool;
use crate::config::{ChunkId, LogConfig, RangeKey, Version};
use crate::error::{LogError, LogResult};
use crate::header::{self, EntryHeader, TERMINATOR};
use crate::io::{write_span, DiskBackend, LogFile};
use crate::metrics::LogMetrics;
use crate::version::{Recorded, TemporaryVersions, VersionIndex};

/// Delivery batch size of the recovery stream.
const RECOVERY_BATCH_CHUNKS: usize = 256;

/// Lifecycle of one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Empty,
    Open,
    Full,
    /// Holds invalidated bytes; a candidate for reorganisation.
    Invalidating,
    Reorganising,
}

#[derive(Debug, Clone, Copy)]
pub struct SegmentInfo {
    pub used: u32,
    pub invalid: u32,
    pub state: SegmentState,
}

impl SegmentInfo {
    const fn empty() -> Self {
        Self {
            used: 0,
            invalid: 0,
            state: SegmentState::Empty,
        }
    }

    #[inline]
    fn free(&self, segment_size: usize) -> usize {
        segment_size - self.used as usize
    }

    #[inline]
    fn invalid_ratio(&self) -> f64 {
        if self.used == 0 {
            0.0
        } else {
            self.invalid as f64 / self.used as f64
        }
    }
}

/// An opaque payload restored from a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub chunk_id: ChunkId,
    pub version: Version,
    pub payload: Vec<u8>,
}

/// Outcome of recovering one backup range.
#[derive(Debug, Clone, Default)]
pub struct RecoveryMetadata {
    pub chunks: u64,
    pub tombstones: u64,
    pub bytes: u64,
    pub errors: Vec<String>,
}

/// What an append pass learned about the log's health.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppendReport {
    /// A segment crossed the invalidation threshold or space ran short;
    /// the caller should schedule this log for reorganisation.
    pub wants_reorg: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReorgReport {
    pub segments_compacted: usize,
    pub bytes_freed: u64,
}

pub struct SecondaryLog {
    key: RangeKey,
    /// Creator node for entries that omit `original_owner`. Differs from
    /// `key.owner` after this peer took the range over from a failed
    /// peer; the chunk component re-registers takeovers after a restart.
    entry_owner: u16,
    file: Box<dyn LogFile>,
    version_path: PathBuf,
    segment_size: usize,
    segment_count: usize,
    use_checksum: bool,
    reorg_threshold: f64,
    versions: VersionIndex,
    segments: Mutex<Vec<SegmentInfo>>,
    /// Writers take the read side, the reorganiser the write side.
    access: RwLock<()>,
    metrics: Arc<LogMetrics>,
}

impl SecondaryLog {
    pub fn file_name(key: RangeKey) -> String {
        format!("sec_{:04X}_{}.slog", key.owner, key.range_id)
    }

    fn version_file(dir: &Path, key: RangeKey) -> PathBuf {
        dir.join(format!("sec_{:04X}_{}.ver", key.owner, key.range_id))
    }

    /// Creates a fresh log for `key`.
    pub fn create(
        backend: &DiskBackend,
        dir: &Path,
        key: RangeKey,
        config: &LogConfig,
        metrics: Arc<LogMetrics>,
    ) -> LogResult<Self> {
        let file = backend.create(&dir.join(Self::file_name(key)), config.secondary_log_size())?;
        debug!(%key, size = config.secondary_log_size(), "created secondary log");
        Ok(Self::assemble(
            file,
            dir,
            key,
            key.owner,
            config,
            VersionIndex::new(0),
            metrics,
        ))
    }

    /// Opens an existing log, rebuilding segment metadata and the version
    /// index from the snapshot plus a scan of the written prefixes.
    /// `entry_owner` is the creator node of entries without an explicit
    /// `original_owner` (the previous owner when taking a range over).
    pub fn open_existing(
        backend: &DiskBackend,
        dir: &Path,
        key: RangeKey,
        entry_owner: u16,
        config: &LogConfig,
        metrics: Arc<LogMetrics>,
    ) -> LogResult<Self> {
        let file = backend.open_existing(&dir.join(Self::file_name(key)))?;
        let versions = VersionIndex::new(0);
        versions.load_snapshot(&Self::version_file(dir, key))?;
        let log = Self::assemble(file, dir, key, entry_owner, config, versions, metrics);
        log.rebuild_from_disk()?;
        Ok(log)
    }

    fn assemble(
        file: Box<dyn LogFile>,
        dir: &Path,
        key: RangeKey,
        entry_owner: u16,
        config: &LogConfig,
        versions: VersionIndex,
        metrics: Arc<LogMetrics>,
    ) -> Self {
        let segment_count = config.segments_per_log();
        Self {
            key,
            entry_owner,
            file,
            version_path: Self::version_file(dir, key),
            segment_size: config.log_segment_size,
            segment_count,
            use_checksum: config.use_checksum,
            reorg_threshold: config.reorg_utilisation_threshold,
            versions,
            segments: Mutex::new(vec![SegmentInfo::empty(); segment_count]),
            access: RwLock::new(()),
            metrics,
        }
    }

    #[inline]
    pub fn key(&self) -> RangeKey {
        self.key
    }

    #[inline]
    pub fn versions(&self) -> &VersionIndex {
        &self.versions
    }

    /// Next version for `cid`; called by the ingest path.
    #[inline]
    pub fn next_version(&self, cid: ChunkId) -> Version {
        self.versions.next_version(cid)
    }

    /// Bytes of live plus invalidated data across all segments.
    pub fn occupied(&self) -> u64 {
        let segments = self.segments.lock();
        segments.iter().map(|s| s.used as u64).sum()
    }

    /// Worst per-segment invalidation ratio; drives the round-robin scan.
    pub fn worst_invalid_ratio(&self) -> f64 {
        let segments = self.segments.lock();
        segments
            .iter()
            .map(SegmentInfo::invalid_ratio)
            .fold(0.0, f64::max)
    }

    pub fn segment_infos(&self) -> Vec<SegmentInfo> {
        self.segments.lock().clone()
    }

    /// Appends a batch of whole secondary-format entries.
    ///
    /// Entries are packed into maximal runs, each run one positioned write
    /// that never straddles a segment boundary and is terminated by a zero
    /// byte unless the segment runs completely full.
    pub fn append_batch(&self, data: &[u8]) -> LogResult<AppendReport> {
        let entries = self.parse_entries(data)?;
        if entries.is_empty() {
            return Ok(AppendReport::default());
        }

        let _guard = self.access.read();
        let mut report = AppendReport::default();
        let mut idx = 0;

        while idx < entries.len() {
            let remaining: usize = entries[idx..].iter().map(|e| e.size).sum();
            let (seg_idx, urgent) = self.segment_for_insert(remaining, entries[idx].size)?;
            report.wants_reorg |= urgent;

            let (free, used) = {
                let segments = self.segments.lock();
                (
                    segments[seg_idx].free(self.segment_size),
                    segments[seg_idx].used as usize,
                )
            };

            // Take the longest entry run that fits the chosen segment.
            let mut end = idx;
            let mut run_bytes = 0;
            while end < entries.len() && run_bytes + entries[end].size <= free {
                run_bytes += entries[end].size;
                end += 1;
            }
            if end == idx {
                return Err(LogError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("secondary log {} is full", self.key),
                )));
            }

            let run_start = entries[idx].offset;
            let write_pos = (seg_idx * self.segment_size + used) as u64;
            write_span(
                self.file.as_ref(),
                &data[run_start..run_start + run_bytes],
                write_pos,
            )?;
            if used + run_bytes < self.segment_size {
                write_span(self.file.as_ref(), &[TERMINATOR], write_pos + run_bytes as u64)?;
            }

            {
                let mut segments = self.segments.lock();
                let info = &mut segments[seg_idx];
                info.used += run_bytes as u32;
                info.state = if info.free(self.segment_size) == 0 {
                    SegmentState::Full
                } else {
                    SegmentState::Open
                };
            }

            for entry in &entries[idx..end] {
                match self.versions.record_location(
                    entry.cid,
                    entry.version,
                    seg_idx as u16,
                    entry.size as u32,
                ) {
                    Recorded::Current(Some((old_seg, old_bytes))) => {
                        self.mark_invalid(old_seg as usize, old_bytes);
                    }
                    Recorded::Current(None) => {}
                    Recorded::Stale => {
                        // Superseded while in flight; dead on arrival.
                        self.mark_invalid(seg_idx, entry.size as u32);
                    }
                }
            }

            self.metrics.record_secondary_write(run_bytes as u64);
            idx = end;
        }

        report.wants_reorg |= self.worst_invalid_ratio() > self.reorg_threshold;
        Ok(report)
    }

    /// Marks the latest entry of `cid` removed. Returns true when the log
    /// now wants a reorganisation pass.
    pub fn invalidate(&self, cid: ChunkId) -> bool {
        if let Some((seg, bytes)) = self.versions.invalidate(cid) {
            if (seg as usize) < self.segment_count {
                self.mark_invalid(seg as usize, bytes);
            }
        }
        self.worst_invalid_ratio() > self.reorg_threshold
    }

    fn mark_invalid(&self, seg_idx: usize, bytes: u32) {
        let mut segments = self.segments.lock();
        let info = &mut segments[seg_idx];
        info.invalid = (info.invalid + bytes).min(info.used);
        if matches!(info.state, SegmentState::Open | SegmentState::Full) {
            info.state = SegmentState::Invalidating;
        }
    }

    /// Picks the least-used segment that fits `len` (ties to the lowest
    /// index). Batches longer than one segment continue in the segment
    /// that fits at least their first entry; when not even that fits,
    /// the emptiest segment is returned and the log is flagged for
    /// urgent reorganisation.
    fn segment_for_insert(&self, len: usize, first_entry: usize) -> LogResult<(usize, bool)> {
        let segments = self.segments.lock();

        for want in [len, first_entry] {
            let fit = segments
                .iter()
                .enumerate()
                .filter(|(_, s)| {
                    s.state != SegmentState::Reorganising && s.free(self.segment_size) >= want
                })
                .min_by_key(|(idx, s)| (s.used, *idx))
                .map(|(idx, _)| idx);
            if let Some(idx) = fit {
                return Ok((idx, false));
            }
        }

        let emptiest = segments
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state != SegmentState::Reorganising)
            .max_by_key(|(idx, s)| (s.free(self.segment_size), usize::MAX - *idx))
            .map(|(idx, _)| idx)
            .ok_or_else(|| {
                LogError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("secondary log {} has no writable segment", self.key),
                ))
            })?;
        Ok((emptiest, true))
    }

    /// One reorganisation pass: compacts up to `budget` segments whose
    /// invalidation ratio exceeds the threshold (`force` compacts the
    /// worst segment regardless), then persists the version snapshot.
    pub fn reorganise(
        &self,
        temp: &mut TemporaryVersions,
        pool: &BufferPool,
        budget: usize,
        force: bool,
    ) -> LogResult<ReorgReport> {
        let _guard = self.access.write();
        temp.fill_from(&self.versions);

        let mut report = ReorgReport::default();
        for round in 0..budget {
            let candidate = {
                let mut segments = self.segments.lock();
                let candidate = segments
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.invalid > 0 && s.state != SegmentState::Reorganising)
                    .max_by(|(_, a), (_, b)| {
                        a.invalid_ratio()
                            .partial_cmp(&b.invalid_ratio())
                            .expect("ratios are finite")
                    })
                    .map(|(idx, s)| (idx, s.invalid_ratio()));
                match candidate {
                    Some((idx, ratio))
                        if ratio > self.reorg_threshold || (force && round == 0) =>
                    {
                        segments[idx].state = SegmentState::Reorganising;
                        Some(idx)
                    }
                    _ => None,
                }
            };

            let Some(seg_idx) = candidate else { break };
            let freed = self.reorganise_segment(seg_idx, temp, pool)?;
            report.segments_compacted += 1;
            report.bytes_freed += freed;
        }

        if report.segments_compacted > 0 {
            self.versions.write_snapshot(&self.version_path)?;
            self.metrics.record_reorg_pass(report.bytes_freed);
        }
        Ok(report)
    }

    /// Compacts one segment: survivors are rewritten densely, merged into
    /// another partially-used segment when they fit there.
    ///
    /// The caller holds the access lock write-side and has set the segment
    /// to `Reorganising`.
    fn reorganise_segment(
        &self,
        seg_idx: usize,
        temp: &TemporaryVersions,
        pool: &BufferPool,
    ) -> LogResult<u64> {
        let used = {
            let segments = self.segments.lock();
            segments[seg_idx].used as usize
        };
        if used == 0 {
            let mut segments = self.segments.lock();
            segments[seg_idx].state = SegmentState::Empty;
            return Ok(0);
        }

        let mut src = pool.get(self.segment_size)?;
        // Pool buffers are page-aligned and segments are page multiples,
        // so rounding the length up keeps the read inside the contract.
        let align = self.file.alignment();
        let read_len = if align > 1 {
            used.div_ceil(align) * align
        } else {
            used
        };
        self.file.read_at(
            &mut src.as_mut_slice()[..read_len],
            (seg_idx * self.segment_size) as u64,
        )?;
        src.set_pos(used);

        let mut out = pool.get(used)?;
        let mut survivors = Vec::new();
        let mut at = 0;
        while at < used {
            let slice = &src.as_slice()[at..used];
            if slice[0] == TERMINATOR {
                break;
            }
            let entry = match header::decode(slice) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(key = %self.key, segment = seg_idx, %err, "stopping reorg scan at corrupt entry");
                    break;
                }
            };
            let size = entry.entry_size();
            if size > slice.len() {
                warn!(key = %self.key, segment = seg_idx, "entry overruns segment, stopping reorg scan");
                break;
            }
            let cid = entry.chunk_id(self.entry_owner);
            let keep = match temp.get(cid) {
                Some(current) if current.is_tombstone() => false,
                Some(current) => {
                    current == entry.version
                }
                // Unknown to the version store: keep, recovery arbitrates.
                None => true,
            };
            if keep {
                out.put(&slice[..size]);
                survivors.push((cid, entry.version, size));
            }
            at += size;
        }

        let surviving = out.pos();
        let freed = (used - surviving) as u64;

        // Merge into another partially-used segment when possible, so the
        // source drains to empty; otherwise compact in place.
        let merge_target = if surviving > 0 {
            let segments = self.segments.lock();
            segments
                .iter()
                .enumerate()
                .filter(|(idx, s)| {
                    *idx != seg_idx
                        && s.state == SegmentState::Open
                        && s.free(self.segment_size) >= surviving
                })
                .min_by_key(|(idx, s)| (s.free(self.segment_size), *idx))
                .map(|(idx, _)| idx)
        } else {
            None
        };

        let (dest_idx, dest_off) = match merge_target {
            Some(dest) => {
                let off = {
                    let segments = self.segments.lock();
                    segments[dest].used as usize
                };
                (dest, off)
            }
            None => (seg_idx, 0),
        };

        if surviving > 0 {
            let write_pos = (dest_idx * self.segment_size + dest_off) as u64;
            write_span(self.file.as_ref(), &out.as_slice()[..surviving], write_pos)?;
            if dest_off + surviving < self.segment_size {
                write_span(self.file.as_ref(), &[TERMINATOR], write_pos + surviving as u64)?;
            }
            for (cid, version, size) in &survivors {
                let _ = self
                    .versions
                    .record_location(*cid, *version, dest_idx as u16, *size as u32);
            }
        }

        {
            let mut segments = self.segments.lock();
            if dest_idx == seg_idx {
                let info = &mut segments[seg_idx];
                info.used = surviving as u32;
                info.invalid = 0;
                info.state = if surviving == 0 {
                    SegmentState::Empty
                } else {
                    SegmentState::Open
                };
            } else {
                let dest = &mut segments[dest_idx];
                dest.used += surviving as u32;
                if dest.free(self.segment_size) == 0 {
                    dest.state = SegmentState::Full;
                }
                let info = &mut segments[seg_idx];
                info.used = 0;
                info.invalid = 0;
                info.state = SegmentState::Empty;
            }
        }
        if dest_idx != seg_idx || surviving == 0 {
            // The drained source starts over with a clean terminator.
            write_span(
                self.file.as_ref(),
                &[TERMINATOR],
                (seg_idx * self.segment_size) as u64,
            )?;
        }

        trace!(key = %self.key, segment = seg_idx, surviving, freed, "reorganised segment");
        pool.release(src);
        pool.release(out);
        Ok(freed)
    }

    /// Streams the highest live version of every chunk to `deliver` in
    /// batches. `temp` holds the versions read before the flush; chunks it
    /// marks as tombstoned are counted, not delivered. Corrupt entries are
    /// skipped and reported in the metadata.
    pub fn recover(
        &self,
        temp: &TemporaryVersions,
        mut deliver: impl FnMut(Vec<Chunk>),
    ) -> LogResult<RecoveryMetadata> {
        let _guard = self.access.write();
        let mut meta = RecoveryMetadata::default();
        let mut best: HashMap<ChunkId, Candidate> = HashMap::new();

        scan_log(
            self.file.as_ref(),
            self.segment_size,
            self.segment_count,
            self.use_checksum,
            &mut meta.errors,
            |_seg, _off, entry, payload| {
                let cid = entry.chunk_id(self.entry_owner);
                match temp.get(cid) {
                    Some(current) if current.is_tombstone() => return,
                    Some(current) if current != entry.version => return,
                    _ => {}
                }
                merge_candidate(&mut best, cid, entry, payload);
            },
        )?;

        let mut tombstones = 0u64;
        let mut tombstoned_cids = std::collections::HashSet::new();
        // Count removals the version store still remembers.
        for (cid, version) in temp_entries(temp) {
            if version.is_tombstone() && tombstoned_cids.insert(cid) {
                tombstones += 1;
            }
        }
        meta.tombstones = tombstones;

        let mut batch = Vec::with_capacity(RECOVERY_BATCH_CHUNKS);
        for (cid, candidate) in best {
            match candidate.into_chunk(cid) {
                Ok(chunk) => {
                    meta.chunks += 1;
                    meta.bytes += chunk.payload.len() as u64;
                    batch.push(chunk);
                    if batch.len() == RECOVERY_BATCH_CHUNKS {
                        deliver(std::mem::take(&mut batch));
                    }
                }
                Err(err) => meta.errors.push(err),
            }
        }
        if !batch.is_empty() {
            deliver(batch);
        }

        self.metrics.record_recovered_chunks(meta.chunks);
        for _ in 0..meta.errors.len() {
            self.metrics.record_recovery_error();
        }
        Ok(meta)
    }

    /// Recovers chunks from a secondary log file without a catalog. The
    /// version snapshot next to the file is honoured when present;
    /// otherwise the highest version seen per chunk wins.
    pub fn recover_from_file(path: &Path, config: &LogConfig) -> LogResult<Vec<Chunk>> {
        let backend = DiskBackend::open(config)?;
        let file = backend.open_existing(path)?;
        let segment_size = config.log_segment_size;
        let segment_count = (file.length() / segment_size as u64) as usize;

        let versions = VersionIndex::new(0);
        versions.load_snapshot(&path.with_extension("ver"))?;
        let mut temp = TemporaryVersions::with_capacity(versions.len());
        temp.fill_from(&versions);

        let mut best: HashMap<ChunkId, Candidate> = HashMap::new();
        let mut errors = Vec::new();
        let owner = 0;
        scan_log(
            file.as_ref(),
            segment_size,
            segment_count,
            config.use_checksum,
            &mut errors,
            |_seg, _off, entry, payload| {
                let cid = entry.chunk_id(owner);
                match temp.get(cid) {
                    Some(current) if current.is_tombstone() => return,
                    Some(current) if current != entry.version => return,
                    _ => {}
                }
                merge_candidate(&mut best, cid, entry, payload);
            },
        )?;
        for err in &errors {
            warn!(path = %path.display(), %err, "skipped corrupt entry during file recovery");
        }

        let mut chunks = Vec::with_capacity(best.len());
        for (cid, candidate) in best {
            match candidate.into_chunk(cid) {
                Ok(chunk) => chunks.push(chunk),
                Err(err) => warn!(path = %path.display(), %err, "dropping incomplete chain"),
            }
        }
        chunks.sort_by_key(|c| c.chunk_id);
        Ok(chunks)
    }

    /// Rebuilds segment metadata and version locations after a reopen.
    fn rebuild_from_disk(&self) -> LogResult<()> {
        let mut errors = Vec::new();
        let mut seen: Vec<(usize, ChunkId, Version, u32)> = Vec::new();
        let mut used = vec![0u32; self.segment_count];

        scan_log(
            self.file.as_ref(),
            self.segment_size,
            self.segment_count,
            false,
            &mut errors,
            |seg, off, entry, _payload| {
                let size = entry.entry_size() as u32;
                used[seg] = (off + entry.entry_size()) as u32;
                let cid = entry.chunk_id(self.entry_owner);
                self.versions.adopt_scanned(cid, entry.version, seg as u16, size);
                seen.push((seg, cid, entry.version, size));
            },
        )?;
        for err in &errors {
            warn!(key = %self.key, %err, "corrupt entry while rebuilding segment metadata");
        }

        let mut segments = self.segments.lock();
        for (seg, info) in segments.iter_mut().enumerate() {
            info.used = used[seg];
            info.invalid = 0;
            info.state = if info.used == 0 {
                SegmentState::Empty
            } else if info.free(self.segment_size) == 0 {
                SegmentState::Full
            } else {
                SegmentState::Open
            };
        }
        drop(segments);

        // Second pass: everything that is not the current version counts
        // as invalidated.
        for (seg, cid, version, size) in seen {
            let dead = match self.versions.current(cid) {
                Some(current) => current.is_tombstone() || current != version,
                None => false,
            };
            if dead {
                self.mark_invalid(seg, size);
            }
        }
        Ok(())
    }

    /// Persists the version snapshot.
    pub fn write_version_snapshot(&self) -> LogResult<()> {
        self.versions.write_snapshot(&self.version_path)
    }

    pub fn sync(&self) -> LogResult<()> {
        self.file.sync()
    }

    /// Closes the log and deletes its file and snapshot.
    pub fn close_and_remove(&self) -> LogResult<()> {
        self.file.close_and_remove()?;
        match std::fs::remove_file(&self.version_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(LogError::from(err)),
        }
    }

    fn parse_entries(&self, data: &[u8]) -> LogResult<Vec<ParsedEntry>> {
        let mut entries = Vec::new();
        let mut at = 0;
        while at < data.len() {
            if data[at] == TERMINATOR {
                break;
            }
            let entry = header::decode(&data[at..])?;
            let size = entry.entry_size();
            if at + size > data.len() {
                return Err(LogError::corruption(format!(
                    "batch entry at {at} overruns the batch ({size} bytes)"
                )));
            }
            if size > self.segment_size {
                return Err(LogError::invalid_argument(format!(
                    "entry of {size} bytes exceeds segment size {}",
                    self.segment_size
                )));
            }
            entries.push(ParsedEntry {
                offset: at,
                size,
                cid: entry.chunk_id(self.entry_owner),
                version: entry.version,
            });
            at += size;
        }
        Ok(entries)
    }
}

#[derive(Debug, Clone, Copy)]
struct ParsedEntry {
    offset: usize,
    size: usize,
    cid: ChunkId,
    version: Version,
}

struct Candidate {
    version: Version,
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
}

impl Candidate {
    fn new(version: Version, chain_count: usize) -> Self {
        Self {
            version,
            parts: vec![None; chain_count],
            received: 0,
        }
    }

    fn add_part(&mut self, idx: usize, payload: &[u8]) {
        if idx < self.parts.len() && self.parts[idx].is_none() {
            self.parts[idx] = Some(payload.to_vec());
            self.received += 1;
        }
    }

    fn into_chunk(self, cid: ChunkId) -> Result<Chunk, String> {
        if self.received != self.parts.len() {
            return Err(format!(
                "incomplete chain for {cid}: {}/{} parts",
                self.received,
                self.parts.len()
            ));
        }
        let mut payload = Vec::new();
        for part in self.parts {
            payload.extend_from_slice(&part.expect("all parts received"));
        }
        Ok(Chunk {
            chunk_id: cid,
            version: self.version,
            payload,
        })
    }
}

fn merge_candidate(
    best: &mut HashMap<ChunkId, Candidate>,
    cid: ChunkId,
    entry: &EntryHeader,
    payload: &[u8],
) {
    let (chain_id, chain_count) = entry.chain.unwrap_or((0, 1));
    let candidate = best
        .entry(cid)
        .or_insert_with(|| Candidate::new(entry.version, chain_count as usize));
    if entry.version > candidate.version {
        *candidate = Candidate::new(entry.version, chain_count as usize);
    } else if entry.version < candidate.version {
        return;
    }
    candidate.add_part(chain_id as usize, payload);
}

fn temp_entries(temp: &TemporaryVersions) -> Vec<(ChunkId, Version)> {
    let mut out = Vec::with_capacity(temp.len());
    temp.for_each(|cid, version| out.push((cid, version)));
    out
}

/// Walks every segment's written prefix, handing each decodable entry to
/// `cb`. Undecodable data ends the segment's scan and is reported through
/// `errors`; checksum mismatches skip just the entry.
fn scan_log(
    file: &dyn LogFile,
    segment_size: usize,
    segment_count: usize,
    verify_checksum: bool,
    errors: &mut Vec<String>,
    mut cb: impl FnMut(usize, usize, &EntryHeader, &[u8]),
) -> LogResult<()> {
    // Aligned allocation: segment reads are whole pages in direct mode.
    let mut scan = crate::buf::AlignedBuf::new(segment_size, file.alignment().max(1))?;
    for seg in 0..segment_count {
        file.read_at(scan.as_mut_slice(), (seg * segment_size) as u64)?;
        let buf = scan.as_slice();
        let mut at = 0;
        while at < segment_size {
            if buf[at] == TERMINATOR {
                break;
            }
            let entry = match header::decode(&buf[at..]) {
                Ok(entry) => entry,
                Err(err) => {
                    errors.push(format!("segment {seg} offset {at}: {err}"));
                    break;
                }
            };
            let size = entry.entry_size();
            if at + size > segment_size {
                errors.push(format!(
                    "segment {seg} offset {at}: entry of {size} bytes overruns segment"
                ));
                break;
            }
            let payload = &buf[at + entry.size()..at + size];
            if verify_checksum {
                if let Some(stored) = entry.checksum {
                    let actual = header::payload_crc(payload);
                    if stored != actual {
                        errors.push(format!(
                            "segment {seg} offset {at}: checksum mismatch (stored {stored:08X}, computed {actual:08X})"
                        ));
                        at += size;
                        continue;
                    }
                }
            }
            cb(seg, at, &entry, payload);
            at += size;
        }
    }
    Ok(())
}
