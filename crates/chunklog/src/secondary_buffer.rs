//! Per-range coalescing buffer.
//!
//! Small batches for one `(owner, range)` are delayed here until roughly
//! one flash-page-sized write is worth issuing. The buffer only ever holds
//! whole entries in secondary-log format, in append order.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::buf::{BufferPool, PooledBuf};
use crate::error::LogResult;

pub struct SecondaryLogBuffer {
    capacity: usize,
    pool: Arc<BufferPool>,
    inner: Mutex<Option<PooledBuf>>,
}

impl SecondaryLogBuffer {
    pub fn new(capacity: usize, pool: Arc<BufferPool>) -> Self {
        Self {
            capacity,
            pool,
            inner: Mutex::new(None),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().as_ref().map_or(true, |buf| buf.pos() == 0)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().as_ref().map_or(0, |buf| buf.pos())
    }

    /// Appends `len` bytes of whole entries from `data` when they fit.
    /// Otherwise drains the buffered prefix and returns it combined with
    /// the new bytes; the caller writes the combined batch to the
    /// secondary log, preserving append order.
    pub fn buffer_data(&self, data: &PooledBuf, len: usize) -> LogResult<Option<PooledBuf>> {
        let bytes = &data.filled()[..len];
        let mut inner = self.inner.lock();
        let buffered = inner.as_ref().map_or(0, |buf| buf.pos());

        if buffered + len <= self.capacity {
            let buf = match inner.as_mut() {
                Some(buf) => buf,
                None => inner.insert(self.pool.get(self.capacity)?),
            };
            buf.put(bytes);
            return Ok(None);
        }

        let mut combined = self.pool.get(buffered + len)?;
        if let Some(old) = inner.take() {
            combined.put(old.filled());
            self.pool.release(old);
        }
        combined.put(bytes);
        Ok(Some(combined))
    }

    /// Drains the buffered prefix for an explicit flush.
    pub fn take(&self) -> Option<PooledBuf> {
        let mut inner = self.inner.lock();
        match inner.take() {
            Some(buf) if buf.pos() > 0 => Some(buf),
            Some(buf) => {
                // Keep the empty allocation for the next append.
                *inner = Some(buf);
                None
            }
            None => None,
        }
    }

    /// Hands a drained or combined buffer back to the pool.
    pub fn release(&self, buf: PooledBuf) {
        self.pool.release(buf);
    }
}
