//! The primary write buffer and its processing thread.
//!
//! All incoming log data funnels through one ring buffer. Network handler
//! threads append entries (already framed with primary headers) and bump a
//! per-range byte counter; the processing thread periodically drains the
//! ring, sorts the entries by backup range, converts headers where the
//! range goes straight to its secondary log, and hands the sorted buffers
//! to the disk writer.
//!
//! The ring pointers are 31-bit modular counters (`& 0x7FFF_FFFF`) so a
//! wrap of the counter space still orders correctly; the free-space check
//! keeps the original overflow clause. All readable bytes live between the
//! read and write pointer.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::buf::{BufferPool, PooledBuf, SMALL_BUFFER_POOL_COUNT};
use crate::config::{ChunkId, LogConfig, RangeKey};
use crate::error::{LogError, LogResult};
use crate::header::{self, PrimaryHeaderSpec, MAX_CHAIN_COUNT, MAX_HEADER_SIZE};
use crate::metrics::LogMetrics;
use crate::reorg::ReorgHandle;
use crate::secondary_log::SecondaryLog;
use crate::store::Catalog;
use crate::writer::WriterJob;

/// Pointer arithmetic is modular over 2^31.
const POINTER_MASK: u32 = 0x7FFF_FFFF;

/// Backing storage of the ring.
///
/// Producers write only the region they reserved between the write pointer
/// and the read pointer while holding the producer lock; the processing
/// thread reads only published bytes between the read and write pointer.
/// The regions are disjoint, which is what makes the aliasing sound.
struct RingBytes {
    data: UnsafeCell<Box<[u8]>>,
}

unsafe impl Send for RingBytes {}
unsafe impl Sync for RingBytes {}

impl RingBytes {
    fn new(capacity: usize) -> Self {
        Self {
            data: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
        }
    }

    /// Safety: the caller must only read bytes published by `write_ptr`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn slice(&self) -> &mut [u8] {
        &mut *self.data.get()
    }
}

/// Copies `src` into the ring at logical position `pos`, wrapping.
fn ring_write(ring: &mut [u8], pos: usize, src: &[u8]) {
    let capacity = ring.len();
    let pos = pos % capacity;
    let first = src.len().min(capacity - pos);
    ring[pos..pos + first].copy_from_slice(&src[..first]);
    if first < src.len() {
        ring[..src.len() - first].copy_from_slice(&src[first..]);
    }
}

struct RingShared {
    ring: RingBytes,
    capacity: u32,
    read_ptr: AtomicU32,
    write_ptr: AtomicU32,
    priority_flush: AtomicBool,
    shutting_down: AtomicBool,
    /// Serializes producers; held across the ring copy.
    producer: Mutex<()>,
    /// Guards the per-range counters and pointer publication. Held only
    /// for tiny critical sections.
    meta: Mutex<HashMap<u32, usize>>,

    max_entry_size: usize,
    flush_threshold: usize,
    secondary_log_buffer_size: usize,
    use_checksum: bool,
    process_timeout: Duration,
    metrics: Arc<LogMetrics>,
}

impl RingShared {
    #[inline]
    fn bytes_in_buffer(&self) -> usize {
        let read = self.read_ptr.load(Ordering::Acquire);
        let write = self.write_ptr.load(Ordering::Acquire);
        if write >= read {
            (write - read) as usize
        } else {
            (write + (POINTER_MASK - read) + 1) as usize
        }
    }
}

/// The ingestion side of the ring.
pub(crate) struct PrimaryWriteBuffer {
    shared: Arc<RingShared>,
}

impl PrimaryWriteBuffer {
    pub fn new(config: &LogConfig, metrics: Arc<LogMetrics>) -> Self {
        let capacity = config.write_buffer_size;
        debug!(capacity, "initialized primary write buffer");
        Self {
            shared: Arc::new(RingShared {
                ring: RingBytes::new(capacity),
                capacity: capacity as u32,
                read_ptr: AtomicU32::new(0),
                write_ptr: AtomicU32::new(0),
                priority_flush: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                producer: Mutex::new(()),
                meta: Mutex::new(HashMap::new()),
                max_entry_size: config.max_entry_size(),
                flush_threshold: config.flush_threshold(),
                secondary_log_buffer_size: config.secondary_log_buffer_size,
                use_checksum: config.use_checksum,
                process_timeout: Duration::from_millis(config.process_timeout_ms),
                metrics,
            }),
        }
    }

    /// Commits one log entry (split into chained sub-entries when large)
    /// to the ring and updates the per-range counter. Blocks while the
    /// ring is full or too many ranges have pending bytes; returns only
    /// once the full entry is committed.
    #[allow(clippy::too_many_arguments)]
    pub fn put_log_data(
        &self,
        payload: &[u8],
        chunk_id: ChunkId,
        range_id: u16,
        owner: u16,
        original_owner: u16,
        timestamp: Option<u32>,
        sec_log: &SecondaryLog,
    ) -> LogResult<()> {
        let shared = &*self.shared;
        let version = sec_log.next_version(chunk_id);

        let payload_len = payload.len();
        if payload_len == 0 {
            return Err(LogError::invalid_argument("no payload for log entry"));
        }

        // Large entries are split and chained; every part carries a full
        // header and fits within one maximum-sized entry.
        let part_cap = shared.max_entry_size - MAX_HEADER_SIZE;
        let num_parts = payload_len.div_ceil(part_cap);
        if num_parts > MAX_CHAIN_COUNT as usize {
            return Err(LogError::invalid_argument(format!(
                "chunk of {payload_len} bytes needs {num_parts} parts, chain limit is {MAX_CHAIN_COUNT}"
            )));
        }

        let (mut head, head_size) = header::encode_primary(&PrimaryHeaderSpec {
            chunk_id,
            payload_len: payload_len as u32,
            version,
            range_id,
            owner,
            original_owner,
            timestamp,
            with_checksum: shared.use_checksum,
            chained: num_parts > 1,
        });
        let total = num_parts * head_size + payload_len;
        if total > shared.capacity as usize {
            return Err(LogError::invalid_argument(format!(
                "entry of {total} bytes exceeds the write buffer ({})",
                shared.capacity
            )));
        }

        let key = RangeKey::new(owner, range_id).packed();
        let _producer = shared.producer.lock();

        // Wait for ring space and a free slot in the range map.
        let write_abs = loop {
            if shared.shutting_down.load(Ordering::Acquire) {
                return Err(LogError::Shutdown);
            }
            let read_abs = shared.read_ptr.load(Ordering::Acquire);
            let write_abs = shared.write_ptr.load(Ordering::Acquire);

            let front = read_abs.wrapping_add(shared.capacity) & POINTER_MASK;
            let end = write_abs.wrapping_add(total as u32) & POINTER_MASK;
            let has_space =
                front > end || (front < read_abs && end > read_abs);
            // Saturation blocks every admission until a flush steals the
            // counters, whether or not this range is already tracked.
            let map_open = shared.meta.lock().len() < SMALL_BUFFER_POOL_COUNT;

            if has_space && map_open {
                break write_abs;
            }
            shared.priority_flush.store(true, Ordering::Release);
            shared.metrics.record_ring_full_wait();
            thread::yield_now();
        };

        // Safety: the region [write_abs, write_abs + total) is unreadable
        // until we publish the new write pointer below, and no other
        // producer runs while we hold the producer lock.
        let ring = unsafe { shared.ring.slice() };
        let capacity = shared.capacity as usize;
        let mut pos = write_abs as usize % capacity;
        let mut payload_off = 0usize;

        for part in 0..num_parts {
            let part_payload = (payload_len - payload_off).min(part_cap);
            let part_slice = &payload[payload_off..payload_off + part_payload];

            if num_parts > 1 {
                header::set_chaining(&mut head[..head_size], part as u8, num_parts as u8);
                header::adjust_length(&mut head[..head_size], part_payload as u32);
            }
            if shared.use_checksum {
                header::set_checksum(&mut head[..head_size], header::payload_crc(part_slice));
            }

            ring_write(ring, pos, &head[..head_size]);
            ring_write(ring, pos + head_size, part_slice);
            pos = (pos + head_size + part_payload) % capacity;
            payload_off += part_payload;
        }

        {
            let mut meta = shared.meta.lock();
            *meta.entry(key).or_insert(0) += total;
            shared
                .write_ptr
                .store(write_abs.wrapping_add(total as u32) & POINTER_MASK, Ordering::Release);
        }
        shared.metrics.record_ingest(1, total as u64);
        Ok(())
    }

    /// Wakes the processing thread for an immediate flush.
    pub fn initiate_priority_flush(&self) {
        self.shared.priority_flush.store(true, Ordering::Release);
    }

    /// Triggers a flush and waits until the ring is empty.
    pub fn flush_and_wait(&self) {
        while self.shared.bytes_in_buffer() > 0 {
            self.shared.priority_flush.store(true, Ordering::Release);
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Signals shutdown; producers fail with `Shutdown` from now on and
    /// the processing thread drains the ring once more before exiting.
    pub fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::Release);
    }
}

/// Everything the processing thread needs to sort and dispatch.
pub(crate) struct ProcessContext {
    pub catalog: Arc<Catalog>,
    pub pool: Arc<BufferPool>,
    pub writer: Sender<WriterJob>,
    pub reorg: ReorgHandle,
    pub two_level_logging: bool,
    pub log_segment_size: usize,
}

pub(crate) fn spawn_process_thread(
    buffer: &PrimaryWriteBuffer,
    ctx: ProcessContext,
) -> JoinHandle<()> {
    let shared = buffer.shared.clone();
    thread::Builder::new()
        .name("chunklog-process".into())
        .spawn(move || process_loop(shared, ctx))
        .expect("spawn processing thread")
}

fn process_loop(shared: Arc<RingShared>, ctx: ProcessContext) {
    let mut last_flush = Instant::now();
    debug!("processing thread running");

    loop {
        let shutting_down = shared.shutting_down.load(Ordering::Acquire);

        let pending = shared.bytes_in_buffer();
        let mut flush = false;
        if shared.priority_flush.swap(false, Ordering::AcqRel) {
            flush = true;
            shared.metrics.record_priority_flush();
        }
        if pending > shared.flush_threshold {
            if !flush {
                shared.metrics.record_threshold_flush();
            }
            flush = true;
        } else if last_flush.elapsed() > shared.process_timeout {
            if !flush && pending > 0 {
                shared.metrics.record_timer_flush();
            }
            flush = true;
        }

        if flush || shutting_down {
            if let Err(err) = flush_ring(&shared, &ctx) {
                error!(%err, "could not flush write buffer");
            }
            ctx.reorg.grant_access();
            last_flush = Instant::now();
        } else {
            ctx.reorg.grant_access();
            thread::sleep(Duration::from_micros(100));
        }

        if shutting_down {
            break;
        }
    }
    debug!("processing thread exits");
}

/// One buffer node per backup range with pending bytes: the range's
/// entries, packed into pooled segments.
struct BufferNode {
    segments: Vec<PooledBuf>,
    /// Entries converted to secondary format; goes straight to the
    /// secondary log.
    convert: bool,
    /// Bytes still expected; sizes the next pooled segment.
    expected: usize,
}

impl BufferNode {
    fn new(expected: usize, convert: bool) -> Self {
        Self {
            segments: Vec::with_capacity(1),
            convert,
            expected,
        }
    }

    fn append(
        &mut self,
        ring: &[u8],
        pos: usize,
        entry_size: usize,
        pool: &BufferPool,
        segment_cap: usize,
    ) -> LogResult<()> {
        let needed = if self.convert {
            entry_size - header::conversion_shrink(ring[pos % ring.len()])
        } else {
            entry_size
        };

        let fits = self
            .segments
            .last()
            .map_or(false, |seg| seg.remaining() >= needed);
        if !fits {
            let size = self.expected.clamp(needed, segment_cap);
            self.segments.push(pool.get(size)?);
        }

        let seg = self.segments.last_mut().expect("segment present");
        if self.convert {
            header::convert_and_put(ring, pos, entry_size, seg)?;
        } else {
            header::ring_copy(ring, pos, entry_size, seg);
        }
        self.expected = self.expected.saturating_sub(entry_size);
        Ok(())
    }
}

/// Drains the ring: sorts pending bytes by backup range and dispatches
/// them to the writer (see the module docs for the routing policy).
fn flush_ring(shared: &RingShared, ctx: &ProcessContext) -> LogResult<()> {
    // Snapshot ring state and steal the per-range counters.
    let (bytes, read_abs, pending) = {
        let mut meta = shared.meta.lock();
        let bytes = shared.bytes_in_buffer();
        let read_abs = shared.read_ptr.load(Ordering::Acquire);
        let pending = std::mem::take(&mut *meta);
        (bytes, read_abs, pending)
    };
    if bytes == 0 {
        return Ok(());
    }

    // Safety: only published bytes [read_abs, read_abs + bytes) are read.
    let ring: &[u8] = unsafe { shared.ring.slice() };
    let capacity = ring.len();

    // One node per range, in first-seen counter order.
    let mut order: Vec<u32> = Vec::with_capacity(pending.len());
    let mut nodes: HashMap<u32, BufferNode> = HashMap::with_capacity(pending.len());
    let mut primary_batch_size = 0usize;
    for (&key, &size) in &pending {
        let convert = size >= shared.secondary_log_buffer_size;
        if !convert {
            primary_batch_size += size;
        }
        order.push(key);
        nodes.insert(key, BufferNode::new(size, convert));
    }
    order.sort_unstable();

    // Walk the ring, dispatching each entry to its node. Headers split by
    // the wrap are reassembled through a scratch buffer.
    let mut scratch = [0u8; MAX_HEADER_SIZE];
    let mut bytes_read = 0usize;
    while bytes_read < bytes {
        let pos = (read_abs as usize + bytes_read) % capacity;
        let bytes_until_end = capacity - pos;

        let type_byte = ring[pos];
        let decoded = if header::is_readable(type_byte, bytes_until_end) {
            header::decode(&ring[pos..])?
        } else {
            // The header wraps; reassemble it, staying inside the
            // published bytes.
            let avail = (bytes - bytes_read).min(MAX_HEADER_SIZE);
            header::ring_read(ring, pos, &mut scratch[..avail]);
            header::decode(&scratch[..avail])?
        };

        let entry_size = decoded.entry_size();
        let (range_id, owner) = decoded.routing.ok_or_else(|| {
            LogError::corruption("ring entry without routing prefix")
        })?;
        let key = RangeKey::new(owner, range_id).packed();

        if !nodes.contains_key(&key) {
            // A counter this flush did not steal; treat as tentative.
            warn!(key, "ring entry for range without counter");
            order.push(key);
            nodes.insert(key, BufferNode::new(entry_size, false));
        }
        nodes
            .get_mut(&key)
            .expect("node present")
            .append(ring, pos, entry_size, &ctx.pool, ctx.log_segment_size)?;
        bytes_read += entry_size;
    }

    // Dispatch in range order: direct nodes as secondary writes, small
    // nodes through the coalescing buffers, leftovers to the primary log.
    let mut primary_batch: Option<PooledBuf> = if ctx.two_level_logging && primary_batch_size > 0
    {
        Some(ctx.pool.get(primary_batch_size + 1)?)
    } else {
        None
    };

    for key in order {
        let Some(node) = nodes.remove(&key) else { continue };
        let range_key = RangeKey::from_packed(key);
        let range = ctx.catalog.get(key);

        for seg in node.segments {
            if seg.pos() == 0 {
                ctx.pool.release(seg);
                continue;
            }
            let Some(range) = range.as_ref() else {
                warn!(%range_key, "dropping flushed entries for removed range");
                ctx.pool.release(seg);
                continue;
            };

            if node.convert {
                send_job(
                    &ctx.writer,
                    WriterJob::Secondary {
                        key: range_key,
                        buf: seg,
                        drain_buffer_first: true,
                    },
                );
            } else {
                match range.buffer.buffer_data(&seg, seg.pos())? {
                    Some(combined) => {
                        send_job(
                            &ctx.writer,
                            WriterJob::Secondary {
                                key: range_key,
                                buf: combined,
                                drain_buffer_first: false,
                            },
                        );
                    }
                    None => {
                        shared.metrics.record_buffered_batch();
                        if let Some(batch) = primary_batch.as_mut() {
                            batch.put(seg.filled());
                        }
                    }
                }
                ctx.pool.release(seg);
            }
        }
    }

    if let Some(batch) = primary_batch {
        if batch.pos() > 0 {
            send_job(&ctx.writer, WriterJob::Primary { buf: batch });
        } else {
            ctx.pool.release(batch);
        }
    }

    shared.read_ptr.store(
        read_abs.wrapping_add(bytes as u32) & POINTER_MASK,
        Ordering::Release,
    );
    trace!(bytes, "flushed write buffer");
    Ok(())
}

fn send_job(writer: &Sender<WriterJob>, job: WriterJob) {
    // A full queue blocks the processing thread; that is the backpressure.
    if writer.send(job).is_err() {
        error!("writer queue closed, dropping job");
    }
}
