//! Counters for the logging pipeline.
//!
//! A [`LogMetrics`] sink is created by the caller and passed in at
//! construction; there is no process-wide registry. Readers take cheap
//! [`LogMetricsSnapshot`] copies.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct LogMetrics {
    entries_ingested: AtomicU64,
    bytes_ingested: AtomicU64,
    ring_full_waits: AtomicU64,
    priority_flushes: AtomicU64,
    threshold_flushes: AtomicU64,
    timer_flushes: AtomicU64,
    primary_writes: AtomicU64,
    primary_bytes: AtomicU64,
    secondary_writes: AtomicU64,
    secondary_bytes: AtomicU64,
    buffered_batches: AtomicU64,
    reorg_passes: AtomicU64,
    reorg_bytes_freed: AtomicU64,
    recovered_chunks: AtomicU64,
    recovery_errors: AtomicU64,
}

impl LogMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_ingest(&self, entries: u64, bytes: u64) {
        self.entries_ingested.fetch_add(entries, Ordering::Relaxed);
        self.bytes_ingested.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_ring_full_wait(&self) {
        self.ring_full_waits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_priority_flush(&self) {
        self.priority_flushes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_threshold_flush(&self) {
        self.threshold_flushes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_timer_flush(&self) {
        self.timer_flushes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_primary_write(&self, bytes: u64) {
        self.primary_writes.fetch_add(1, Ordering::Relaxed);
        self.primary_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_secondary_write(&self, bytes: u64) {
        self.secondary_writes.fetch_add(1, Ordering::Relaxed);
        self.secondary_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_buffered_batch(&self) {
        self.buffered_batches.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_reorg_pass(&self, bytes_freed: u64) {
        self.reorg_passes.fetch_add(1, Ordering::Relaxed);
        self.reorg_bytes_freed.fetch_add(bytes_freed, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_recovered_chunks(&self, chunks: u64) {
        self.recovered_chunks.fetch_add(chunks, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_recovery_error(&self) {
        self.recovery_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LogMetricsSnapshot {
        LogMetricsSnapshot {
            entries_ingested: self.entries_ingested.load(Ordering::Relaxed),
            bytes_ingested: self.bytes_ingested.load(Ordering::Relaxed),
            ring_full_waits: self.ring_full_waits.load(Ordering::Relaxed),
            priority_flushes: self.priority_flushes.load(Ordering::Relaxed),
            threshold_flushes: self.threshold_flushes.load(Ordering::Relaxed),
            timer_flushes: self.timer_flushes.load(Ordering::Relaxed),
            primary_writes: self.primary_writes.load(Ordering::Relaxed),
            primary_bytes: self.primary_bytes.load(Ordering::Relaxed),
            secondary_writes: self.secondary_writes.load(Ordering::Relaxed),
            secondary_bytes: self.secondary_bytes.load(Ordering::Relaxed),
            buffered_batches: self.buffered_batches.load(Ordering::Relaxed),
            reorg_passes: self.reorg_passes.load(Ordering::Relaxed),
            reorg_bytes_freed: self.reorg_bytes_freed.load(Ordering::Relaxed),
            recovered_chunks: self.recovered_chunks.load(Ordering::Relaxed),
            recovery_errors: self.recovery_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`LogMetrics`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMetricsSnapshot {
    pub entries_ingested: u64,
    pub bytes_ingested: u64,
    pub ring_full_waits: u64,
    pub priority_flushes: u64,
    pub threshold_flushes: u64,
    pub timer_flushes: u64,
    pub primary_writes: u64,
    pub primary_bytes: u64,
    pub secondary_writes: u64,
    pub secondary_bytes: u64,
    pub buffered_batches: u64,
    pub reorg_passes: u64,
    pub reorg_bytes_freed: u64,
    pub recovered_chunks: u64,
    pub recovery_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = LogMetrics::new();
        metrics.record_ingest(3, 300);
        metrics.record_secondary_write(4096);
        metrics.record_reorg_pass(128);

        let snap = metrics.snapshot();
        assert_eq!(snap.entries_ingested, 3);
        assert_eq!(snap.bytes_ingested, 300);
        assert_eq!(snap.secondary_writes, 1);
        assert_eq!(snap.secondary_bytes, 4096);
        assert_eq!(snap.reorg_bytes_freed, 128);
    }
}
