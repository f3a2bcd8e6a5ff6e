//! Peer-side durable backup logging for a distributed in-memory chunk
//! store.
//!
//! Remote peers replicate their chunks here; this crate turns many small
//! concurrent append requests into large, sorted, per-range sequential
//! disk writes and keeps the logs compact in the background.
//!
//! ## Architecture Overview
//!
//! - **Ingestion**: network handlers call
//!   [`LogStore::put_log_data`] (or hand in encoded batches via
//!   [`LogStore::incoming_log_chunks`]); entries land in one ring buffer
//!   with per-range byte counters.
//! - **Sorting**: a processing thread drains the ring, groups entries by
//!   `(owner, range)`, and converts headers for ranges that go straight
//!   to their secondary log.
//! - **Staging**: small batches coalesce in per-range buffers and are
//!   double-written to a shared primary log for durability until enough
//!   bytes accumulate for one flash-page-sized secondary write.
//! - **Persistence**: a disk writer thread feeds the per-range segmented
//!   secondary logs through one of three I/O backends (buffered, direct,
//!   raw device).
//! - **Reorganisation**: a background thread compacts segments by live
//!   version once enough bytes are invalidated.
//!
//! ## Ordering Guarantees
//!
//! Within one backup range, entries become durable in the order
//! `put_log_data` returned and versions per chunk id are strictly
//! increasing within an epoch. Across ranges there is no ordering
//! guarantee.
//!
//! ## Threads
//!
//! The store runs three named threads (`chunklog-process`,
//! `chunklog-writer`, `chunklog-reorg`); producers are the caller's
//! threads. [`LogStore::close`] drains and joins all of them.

pub mod buf;
pub mod config;
pub mod error;
pub mod header;
pub mod io;
pub mod metrics;
pub mod version;

mod primary_log;
mod reorg;
mod secondary_buffer;
mod secondary_log;
mod store;
mod write_buffer;
mod writer;

pub use config::{AccessMode, ChunkId, LogConfig, RangeKey, Version};
pub use error::{LogError, LogResult};
pub use metrics::{LogMetrics, LogMetricsSnapshot};
pub use secondary_log::{Chunk, RecoveryMetadata, SecondaryLog, SegmentInfo, SegmentState};
pub use store::{ChunkSink, Clock, LogStore, SystemClock};
