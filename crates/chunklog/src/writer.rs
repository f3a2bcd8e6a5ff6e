//! The disk writer.
//!
//! One bounded queue, one consumer thread: the processing thread submits
//! sorted buffers and blocks when the queue is full, which is the only
//! backpressure between sorting and the disk. A single consumer keeps the
//! per-range FIFO (a direct secondary write must not overtake the bytes
//! still sitting in that range's coalescing buffer, so it drains the
//! buffer first).

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Receiver, Sender};
use tracing::{debug, error, warn};

use crate::buf::{BufferPool, PooledBuf};
use crate::config::RangeKey;
use crate::error::LogError;
use crate::primary_log::PrimaryLog;
use crate::reorg::ReorgHandle;
use crate::store::Catalog;

/// Queue depth; a power of two like the original job ring.
const WRITER_QUEUE_DEPTH: usize = 16;

pub(crate) enum WriterJob {
    /// Append a batch of secondary-format entries to a range's log.
    Secondary {
        key: RangeKey,
        buf: PooledBuf,
        /// Entries older than this batch may still sit in the range's
        /// coalescing buffer; write those first.
        drain_buffer_first: bool,
    },
    /// Append the accumulated small-range batch to the primary log.
    Primary { buf: PooledBuf },
    /// Reply on the channel once every job before this one is on disk.
    Barrier(Sender<()>),
    Shutdown,
}

pub(crate) struct WriterPool {
    sender: Sender<WriterJob>,
    handle: Option<JoinHandle<()>>,
}

impl WriterPool {
    pub fn spawn(
        catalog: Arc<Catalog>,
        primary: Option<Arc<PrimaryLog>>,
        pool: Arc<BufferPool>,
        reorg: ReorgHandle,
    ) -> Self {
        let (sender, receiver) = bounded(WRITER_QUEUE_DEPTH);
        let handle = thread::Builder::new()
            .name("chunklog-writer".into())
            .spawn(move || writer_loop(receiver, catalog, primary, pool, reorg))
            .expect("spawn writer thread");
        Self {
            sender,
            handle: Some(handle),
        }
    }

    pub fn sender(&self) -> Sender<WriterJob> {
        self.sender.clone()
    }

    /// Blocks until every job submitted before this call hit the disk.
    pub fn wait_idle(&self) {
        let (ack, done) = bounded(1);
        if self.sender.send(WriterJob::Barrier(ack)).is_ok() {
            let _ = done.recv();
        }
    }

    /// Drains the queue and stops the thread.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.sender.send(WriterJob::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Drop for WriterPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn writer_loop(
    receiver: Receiver<WriterJob>,
    catalog: Arc<Catalog>,
    primary: Option<Arc<PrimaryLog>>,
    pool: Arc<BufferPool>,
    reorg: ReorgHandle,
) {
    debug!("writer thread running");
    while let Ok(job) = receiver.recv() {
        match job {
            WriterJob::Secondary {
                key,
                buf,
                drain_buffer_first,
            } => {
                write_secondary(&catalog, &pool, &reorg, key, buf, drain_buffer_first);
            }
            WriterJob::Primary { mut buf } => {
                if let Some(primary) = primary.as_ref() {
                    write_primary(primary, &catalog, &pool, &reorg, &mut buf);
                }
                pool.release(buf);
            }
            WriterJob::Barrier(ack) => {
                let _ = ack.send(());
            }
            WriterJob::Shutdown => break,
        }
    }
    debug!("writer thread exits");
}

fn write_secondary(
    catalog: &Catalog,
    pool: &BufferPool,
    reorg: &ReorgHandle,
    key: RangeKey,
    buf: PooledBuf,
    drain_buffer_first: bool,
) {
    let Some(range) = catalog.get(key.packed()) else {
        warn!(%key, "secondary write for removed range dropped");
        pool.release(buf);
        return;
    };

    if drain_buffer_first {
        if let Some(buffered) = range.buffer.take() {
            append_or_report(catalog, reorg, key, buffered.filled());
            range.buffer.release(buffered);
        }
    }
    append_or_report(catalog, reorg, key, buf.filled());
    pool.release(buf);
}

fn append_or_report(catalog: &Catalog, reorg: &ReorgHandle, key: RangeKey, data: &[u8]) {
    let Some(range) = catalog.get(key.packed()) else {
        return;
    };
    match range.log.append_batch(data) {
        Ok(report) => {
            if report.wants_reorg {
                reorg.request(key, false);
            }
        }
        Err(LogError::Io(err)) => {
            error!(%key, %err, "secondary log write failed");
            reorg.request(key, true);
        }
        Err(err) => error!(%key, %err, "secondary log rejected batch"),
    }
}

fn write_primary(
    primary: &PrimaryLog,
    catalog: &Catalog,
    pool: &BufferPool,
    reorg: &ReorgHandle,
    buf: &mut PooledBuf,
) {
    match primary.try_append(buf) {
        Ok(true) => return,
        Ok(false) => {}
        Err(err) => {
            error!(%err, "primary log write failed");
            return;
        }
    }

    // Out of space: everything staged here is also in the coalescing
    // buffers, so drain those to their secondary logs and start over.
    debug!("primary log full, draining secondary log buffers");
    for key in catalog.keys() {
        let range_key = RangeKey::from_packed(key);
        if let Some(range) = catalog.get(key) {
            if let Some(buffered) = range.buffer.take() {
                append_or_report(catalog, reorg, range_key, buffered.filled());
                range.buffer.release(buffered);
            }
        }
    }
    if let Err(err) = primary.reset() {
        error!(%err, "primary log reset failed");
        return;
    }
    match primary.try_append(buf) {
        Ok(true) => {}
        Ok(false) => error!("batch exceeds the primary log size, dropped"),
        Err(err) => error!(%err, "primary log write failed"),
    }
}
