//! End-to-end scenarios for the ingestion pipeline: ring, sort stage,
//! two-level staging and the writer.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;

use chunklog::{Chunk, ChunkId, ChunkSink, LogConfig, LogError, LogStore};

const OWNER: u16 = 0x0002;

#[derive(Default)]
struct CollectSink {
    chunks: Arc<Mutex<Vec<Chunk>>>,
}

impl ChunkSink for CollectSink {
    fn put_recovered_chunks(&self, chunks: &[Chunk]) {
        self.chunks.lock().extend_from_slice(chunks);
    }
}

fn small_config(dir: &TempDir) -> LogConfig {
    LogConfig {
        root_dir: dir.path().join("log"),
        write_buffer_size: 64 * 1024,
        flash_page_size: 4096,
        log_segment_size: 8192,
        secondary_log_buffer_size: 4096,
        primary_log_size: 1024 * 1024,
        backup_range_size: 16 * 1024,
        use_checksum: true,
        process_timeout_ms: 50,
        ..LogConfig::default()
    }
    .normalized()
}

fn open_store(config: LogConfig) -> (LogStore, Arc<Mutex<Vec<Chunk>>>) {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = CollectSink {
        chunks: collected.clone(),
    };
    let store = LogStore::open(config, Box::new(sink)).expect("open store");
    (store, collected)
}

fn recovered_sorted(collected: &Mutex<Vec<Chunk>>) -> Vec<Chunk> {
    let mut chunks = collected.lock().clone();
    chunks.sort_by_key(|c| c.chunk_id);
    chunks
}

/// Small batch with two-level logging: everything lands in the primary
/// log and the range's coalescing buffer, nothing in the secondary log.
#[test]
fn small_batches_stage_in_the_primary_log() {
    let dir = TempDir::new().expect("tempdir");
    let (store, collected) = open_store(small_config(&dir));
    store.init_backup_range(OWNER, 0).expect("init range");

    for i in 0..10u64 {
        let cid = ChunkId::from_parts(OWNER, i);
        store
            .put_log_data(OWNER, 0, cid, OWNER, &[i as u8; 100])
            .expect("put");
    }

    // Let the timer flush drain the ring without forcing the buffers out.
    thread::sleep(Duration::from_millis(300));

    let metrics = store.metrics();
    assert_eq!(metrics.entries_ingested, 10);
    assert!(metrics.primary_writes >= 1, "small batch goes to the primary log");
    assert!(metrics.primary_bytes >= 10 * 100, "all payloads staged");
    assert_eq!(metrics.secondary_writes, 0, "nothing hits the secondary log yet");
    assert!(metrics.buffered_batches >= 1, "entries coalesce per range");

    // An explicit flush moves the buffered entries to the secondary log.
    store.flush_data_to_secondary_logs().expect("flush");
    assert!(store.metrics().secondary_writes >= 1);

    store.recover_backup_range(OWNER, 0).expect("recover");
    let chunks = recovered_sorted(&collected);
    assert_eq!(chunks.len(), 10);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_id, ChunkId::from_parts(OWNER, i as u64));
        assert_eq!(chunk.payload, vec![i as u8; 100]);
    }
}

/// Large entries split into chained parts and reassemble on recovery.
#[test]
fn large_entries_chain_and_reassemble() {
    let dir = TempDir::new().expect("tempdir");
    let config = small_config(&dir);
    let max_entry = config.max_entry_size();
    let (store, collected) = open_store(config);
    store.init_backup_range(OWNER, 0).expect("init range");

    // Three parts: two full ones and a remainder.
    let payload: Vec<u8> = (0..3 * max_entry - 10).map(|i| i as u8).collect();
    let cid = ChunkId::from_parts(OWNER, 0x2A);
    store
        .put_log_data(OWNER, 0, cid, OWNER, &payload)
        .expect("put");

    store.flush_data_to_secondary_logs().expect("flush");
    store.recover_backup_range(OWNER, 0).expect("recover");

    let chunks = recovered_sorted(&collected);
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].chunk_id, cid);
    assert_eq!(chunks[0].payload, payload);
}

/// Enough volume to wrap the ring many times; no entry is torn.
#[test]
fn ring_wraps_preserve_entries() {
    let dir = TempDir::new().expect("tempdir");
    let config = LogConfig {
        // Room for ~350 KiB of entries in the secondary log.
        backup_range_size: 512 * 1024,
        ..small_config(&dir)
    }
    .normalized();
    let (store, collected) = open_store(config);
    store.init_backup_range(OWNER, 0).expect("init range");

    // ~300 KiB through a 64 KiB ring, with payload sizes chosen so that
    // headers land on every possible wrap position over time.
    let mut expected = Vec::new();
    for i in 0..1000u64 {
        let cid = ChunkId::from_parts(OWNER, i);
        let payload = vec![(i % 251) as u8; 257 + (i % 93) as usize];
        store
            .put_log_data(OWNER, 0, cid, OWNER, &payload)
            .expect("put");
        expected.push((cid, payload));
    }

    store.flush_data_to_secondary_logs().expect("flush");
    store.recover_backup_range(OWNER, 0).expect("recover");

    let chunks = recovered_sorted(&collected);
    assert_eq!(chunks.len(), expected.len());
    for (chunk, (cid, payload)) in chunks.iter().zip(&expected) {
        assert_eq!(chunk.chunk_id, *cid);
        assert_eq!(&chunk.payload, payload, "payload of {cid}");
    }
}

/// Saturating the range map forces a priority flush; the overflowing put
/// blocks until the flush makes room, then everything is durable.
#[test]
fn range_map_saturation_forces_a_flush() {
    let dir = TempDir::new().expect("tempdir");
    let config = LogConfig {
        // Keep the timer out of the way so only the saturated range map
        // can trigger the flush.
        process_timeout_ms: 10_000,
        ..small_config(&dir)
    }
    .normalized();
    let (store, collected) = open_store(config);

    // One more range than the map admits at once.
    let ranges: Vec<u16> = (0..33).collect();
    for &range_id in &ranges {
        store.init_backup_range(OWNER, range_id).expect("init range");
    }
    for &range_id in &ranges {
        let cid = ChunkId::from_parts(OWNER, range_id as u64);
        store
            .put_log_data(OWNER, range_id, cid, OWNER, &[range_id as u8; 64])
            .expect("put");
    }

    let metrics = store.metrics();
    assert!(metrics.ring_full_waits >= 1, "the 33rd put had to wait");
    assert!(metrics.priority_flushes >= 1, "the wait signalled a flush");

    store.flush_data_to_secondary_logs().expect("flush");
    for &range_id in &ranges {
        store.recover_backup_range(OWNER, range_id).expect("recover");
    }
    let chunks = recovered_sorted(&collected);
    assert_eq!(chunks.len(), ranges.len());
    for (chunk, &range_id) in chunks.iter().zip(&ranges) {
        assert_eq!(chunk.payload, vec![range_id as u8; 64]);
    }
}

/// Two consecutive flushes with nothing in between: the second is a no-op
/// for the disk.
#[test]
fn idle_flush_writes_nothing() {
    let dir = TempDir::new().expect("tempdir");
    let (store, _collected) = open_store(small_config(&dir));
    store.init_backup_range(OWNER, 0).expect("init range");

    let cid = ChunkId::from_parts(OWNER, 1);
    store
        .put_log_data(OWNER, 0, cid, OWNER, &[0x77; 200])
        .expect("put");
    store.flush_data_to_secondary_logs().expect("flush");

    let before = store.metrics();
    store.flush_data_to_secondary_logs().expect("second flush");
    let after = store.metrics();
    assert_eq!(before.secondary_writes, after.secondary_writes);
    assert_eq!(before.primary_writes, after.primary_writes);
}

/// Operations after close fail with `Shutdown`.
#[test]
fn closed_store_rejects_operations() {
    let dir = TempDir::new().expect("tempdir");
    let (mut store, _collected) = open_store(small_config(&dir));
    store.init_backup_range(OWNER, 0).expect("init range");
    store.close().expect("close");

    let cid = ChunkId::from_parts(OWNER, 1);
    let err = store
        .put_log_data(OWNER, 0, cid, OWNER, &[1, 2, 3])
        .unwrap_err();
    assert!(matches!(err, LogError::Shutdown));
    let err = store.flush_data_to_secondary_logs().unwrap_err();
    assert!(matches!(err, LogError::Shutdown));
}

/// Payload and argument validation at the boundary.
#[test]
fn invalid_arguments_are_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let (store, _collected) = open_store(small_config(&dir));
    store.init_backup_range(OWNER, 0).expect("init range");

    let cid = ChunkId::from_parts(OWNER, 1);
    let err = store.put_log_data(OWNER, 0, cid, OWNER, &[]).unwrap_err();
    assert!(matches!(err, LogError::InvalidArgument(_)));

    let err = store
        .put_log_data(OWNER, 9, cid, OWNER, &[1, 2, 3])
        .unwrap_err();
    assert!(matches!(err, LogError::InvalidArgument(_)), "unknown range");
}
