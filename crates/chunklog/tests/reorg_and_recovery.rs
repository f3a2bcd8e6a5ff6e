//! Reorganisation and recovery scenarios: invalidation-driven compaction,
//! restart recovery, and takeover of a failed peer's range.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use tempfile::TempDir;

use chunklog::{Chunk, ChunkId, ChunkSink, LogConfig, LogStore, SecondaryLog};

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

fn reorg_config(dir: &TempDir) -> LogConfig {
    LogConfig {
        root_dir: dir.path().join("log"),
        write_buffer_size: 4 * 1024 * 1024,
        flash_page_size: 4096,
        log_segment_size: 64 * 1024,
        secondary_log_buffer_size: 8 * 1024,
        primary_log_size: 4 * 1024 * 1024,
        backup_range_size: 2 * 1024 * 1024,
        reorg_utilisation_threshold: 0.60,
        use_checksum: true,
        process_timeout_ms: 20,
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

fn remove_batch(cids: &[ChunkId]) -> Vec<u8> {
    let mut buf = vec![0u8; 4 + cids.len() * 8];
    LittleEndian::write_u32(&mut buf, cids.len() as u32);
    for (i, cid) in cids.iter().enumerate() {
        LittleEndian::write_u64(&mut buf[4 + i * 8..], cid.as_u64());
    }
    buf
}

/// Invalidating most of a log triggers background compaction that
/// reclaims the dead bytes; a subsequent recovery sees only live chunks.
#[test]
fn reorganisation_reclaims_invalidated_chunks() {
    let dir = TempDir::new().expect("tempdir");
    let (store, collected) = open_store(reorg_config(&dir));
    store.init_backup_range(OWNER, 0).expect("init range");

    let cids: Vec<ChunkId> = (0..1000).map(|i| ChunkId::from_parts(OWNER, i)).collect();
    for (i, cid) in cids.iter().enumerate() {
        store
            .put_log_data(OWNER, 0, *cid, OWNER, &[(i % 256) as u8; 1024])
            .expect("put");
    }
    store.flush_data_to_secondary_logs().expect("flush");
    assert!(store.metrics().secondary_bytes >= 1000 * 1024);

    store
        .incoming_remove_chunks(&remove_batch(&cids[..800]), OWNER, 0)
        .expect("remove");

    // Compaction runs in the background; wait for it to reclaim space.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let metrics = store.metrics();
        if metrics.reorg_passes >= 1 && metrics.reorg_bytes_freed > 0 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "no reorganisation within 10s: {metrics:?}"
        );
        thread::sleep(Duration::from_millis(20));
    }

    store.recover_backup_range(OWNER, 0).expect("recover");
    let mut chunks = collected.lock().clone();
    chunks.sort_by_key(|c| c.chunk_id);
    assert_eq!(chunks.len(), 200);
    for (chunk, (i, cid)) in chunks.iter().zip(cids.iter().enumerate().skip(800)) {
        assert_eq!(chunk.chunk_id, *cid);
        assert_eq!(chunk.payload, vec![(i % 256) as u8; 1024]);
    }
}

/// Restart recovery: reopen persisted state and restore exactly the
/// chunks whose latest entry was not removed, at their last payload.
#[test]
fn recovery_after_restart_restores_latest_payloads() {
    let dir = TempDir::new().expect("tempdir");
    let config = reorg_config(&dir);

    let cids: Vec<ChunkId> = (0..1000).map(|i| ChunkId::from_parts(OWNER, i)).collect();
    {
        let (store, _collected) = open_store(config.clone());
        store.init_backup_range(OWNER, 0).expect("init range");

        // Ten generations per chunk; only the last one must survive.
        for generation in 0..10u8 {
            for cid in &cids {
                let fill = generation.wrapping_add(cid.local_id() as u8);
                store
                    .put_log_data(OWNER, 0, *cid, OWNER, &[fill; 64])
                    .expect("put");
            }
        }
        store
            .incoming_remove_chunks(&remove_batch(&cids[900..]), OWNER, 0)
            .expect("remove");
        store.flush_data_to_secondary_logs().expect("flush");
        // The store is dropped here; drop closes and syncs.
    }

    let (store, collected) = open_store(config);
    store.init_backup_range(OWNER, 0).expect("reopen range");
    let meta = store.recover_backup_range(OWNER, 0).expect("recover");

    assert_eq!(meta.chunks, 900);
    assert_eq!(meta.tombstones, 100);
    assert!(meta.errors.is_empty(), "recovery errors: {:?}", meta.errors);

    let mut chunks = collected.lock().clone();
    chunks.sort_by_key(|c| c.chunk_id);
    assert_eq!(chunks.len(), 900);
    for (chunk, cid) in chunks.iter().zip(&cids[..900]) {
        let fill = 9u8.wrapping_add(cid.local_id() as u8);
        assert_eq!(chunk.chunk_id, *cid);
        assert_eq!(chunk.payload, vec![fill; 64], "latest payload of {cid}");
    }

    // New writes continue with versions above everything recovered.
    store
        .put_log_data(OWNER, 0, cids[0], OWNER, &[0xFF; 64])
        .expect("put after recovery");
}

/// Takeover: a recovered backup range is renamed atomically and keeps its
/// contents under the new identity.
#[test]
fn takeover_renames_the_backup_range() {
    let dir = TempDir::new().expect("tempdir");
    let (store, collected) = open_store(reorg_config(&dir));

    const FAILED_PEER: u16 = 0x0009;
    store.init_backup_range(FAILED_PEER, 3).expect("init range");
    let cid = ChunkId::from_parts(FAILED_PEER, 42);
    store
        .put_log_data(FAILED_PEER, 3, cid, FAILED_PEER, b"survives takeover")
        .expect("put");
    store.flush_data_to_secondary_logs().expect("flush");

    store
        .init_recovered_backup_range(OWNER, 7, FAILED_PEER, 3, false)
        .expect("takeover");

    store.recover_backup_range(OWNER, 7).expect("recover");
    let chunks = collected.lock().clone();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].payload, b"survives takeover");

    // The old identity is gone.
    assert!(store.recover_backup_range(FAILED_PEER, 3).is_err());
}

/// A secondary log file can be recovered standalone, without a store.
#[test]
fn recover_from_file_matches_catalog_recovery() {
    let dir = TempDir::new().expect("tempdir");
    let config = reorg_config(&dir);
    let (store, _collected) = open_store(config.clone());
    store.init_backup_range(OWNER, 0).expect("init range");

    // Creator 0 so the standalone scan reconstructs the same chunk ids.
    let cids: Vec<ChunkId> = (0..50).map(|i| ChunkId::from_parts(0, i)).collect();
    for (i, cid) in cids.iter().enumerate() {
        store
            .put_log_data(OWNER, 0, *cid, 0, &[i as u8; 128])
            .expect("put");
    }
    store.flush_data_to_secondary_logs().expect("flush");

    let path = config
        .root_dir
        .join(SecondaryLog::file_name(chunklog::RangeKey::new(OWNER, 0)));
    let chunks = store
        .recover_backup_range_from_file(&path)
        .expect("recover from file");

    assert_eq!(chunks.len(), 50);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_id, cids[i]);
        assert_eq!(chunk.payload, vec![i as u8; 128]);
    }
}
