//! The reorganisation thread.
//!
//! Background compaction of the secondary logs, driven by urgent requests
//! (a log ran short of space) and a round-robin scan for logs whose worst
//! segment exceeds the utilisation threshold. The processing thread grants
//! access on every loop iteration; the grant keeps compaction from
//! competing with a flush burst for the same disk. Recovery blocks the
//! thread entirely for its duration.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use crate::buf::BufferPool;
use crate::config::{LogConfig, RangeKey};
use crate::store::Catalog;
use crate::version::TemporaryVersions;

/// Segments compacted per pass before the lock is released.
const REORG_SEGMENTS_PER_PASS: usize = 2;

/// How long to wait for an access grant before proceeding anyway (the
/// ingestion side may simply be idle).
const GRANT_TIMEOUT: Duration = Duration::from_millis(10);

/// Idle sleep when no log wants compaction.
const IDLE_SLEEP: Duration = Duration::from_millis(50);

#[derive(Default)]
struct ReorgState {
    urgent: VecDeque<RangeKey>,
    queued: HashSet<u32>,
    /// Recovery holds the thread off while > 0.
    blockers: usize,
    /// A compaction pass is running right now.
    active: bool,
}

struct ReorgShared {
    state: Mutex<ReorgState>,
    cv: Condvar,
    access_granted: AtomicBool,
    shutdown: AtomicBool,
}

/// Cheap handle for scheduling and cooperation.
#[derive(Clone)]
pub(crate) struct ReorgHandle {
    shared: Arc<ReorgShared>,
}

impl ReorgHandle {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ReorgShared {
                state: Mutex::new(ReorgState::default()),
                cv: Condvar::new(),
                access_granted: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Queues `key` for compaction. Urgent requests (a writer ran out of
    /// space) jump the queue and compact even below the threshold.
    pub fn request(&self, key: RangeKey, urgent: bool) {
        let mut state = self.shared.state.lock();
        if state.queued.insert(key.packed()) || urgent {
            if urgent {
                state.urgent.push_front(key);
            } else {
                state.urgent.push_back(key);
            }
            self.shared.cv.notify_all();
        }
    }

    /// Called by the processing thread on every loop iteration.
    pub fn grant_access(&self) {
        self.shared.access_granted.store(true, Ordering::Release);
    }

    /// Holds the thread off (recovery). Waits for a running pass to end.
    pub fn block(&self) {
        let mut state = self.shared.state.lock();
        state.blockers += 1;
        while state.active {
            self.shared.cv.wait(&mut state);
        }
    }

    pub fn unblock(&self) {
        let mut state = self.shared.state.lock();
        state.blockers = state.blockers.saturating_sub(1);
        drop(state);
        self.shared.cv.notify_all();
    }

    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.cv.notify_all();
    }
}

pub(crate) fn spawn_reorg_thread(
    handle: ReorgHandle,
    catalog: Arc<Catalog>,
    pool: Arc<BufferPool>,
    config: &LogConfig,
) -> JoinHandle<()> {
    let threshold = config.reorg_utilisation_threshold;
    // Size the scratch store for a log full of small entries.
    let temp_capacity = (config.secondary_log_size() / 64).min(1 << 20) as usize;
    thread::Builder::new()
        .name("chunklog-reorg".into())
        .spawn(move || reorg_loop(handle, catalog, pool, threshold, temp_capacity))
        .expect("spawn reorganisation thread")
}

fn reorg_loop(
    handle: ReorgHandle,
    catalog: Arc<Catalog>,
    pool: Arc<BufferPool>,
    threshold: f64,
    temp_capacity: usize,
) {
    let shared = &*handle.shared;
    let mut temp = TemporaryVersions::with_capacity(temp_capacity);
    let mut cursor = 0usize;
    debug!("reorganisation thread running");

    while !shared.shutdown.load(Ordering::Acquire) {
        wait_for_grant(shared);
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        // Pick a target: urgent queue first, then the round-robin scan.
        let target = {
            let mut state = shared.state.lock();
            while state.blockers > 0 && !shared.shutdown.load(Ordering::Acquire) {
                shared.cv.wait(&mut state);
            }
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }

            let urgent = state.urgent.pop_front();
            if let Some(key) = urgent {
                state.queued.remove(&key.packed());
                state.active = true;
                Some((key, true))
            } else {
                drop(state);
                match scan_for_candidate(&catalog, &mut cursor, threshold) {
                    Some(key) => {
                        let mut state = shared.state.lock();
                        if state.blockers > 0 {
                            // Recovery started while scanning.
                            None
                        } else {
                            state.active = true;
                            Some((key, false))
                        }
                    }
                    None => None,
                }
            }
        };

        let Some((key, force)) = target else {
            thread::sleep(IDLE_SLEEP);
            continue;
        };

        if let Some(range) = catalog.get(key.packed()) {
            match range
                .log
                .reorganise(&mut temp, &pool, REORG_SEGMENTS_PER_PASS, force)
            {
                Ok(report) => {
                    if report.segments_compacted > 0 {
                        trace!(
                            %key,
                            segments = report.segments_compacted,
                            freed = report.bytes_freed,
                            "compacted secondary log"
                        );
                    }
                }
                Err(err) => error!(%key, %err, "reorganisation failed"),
            }
        }

        let mut state = shared.state.lock();
        state.active = false;
        drop(state);
        shared.cv.notify_all();
    }
    debug!("reorganisation thread exits");
}

fn wait_for_grant(shared: &ReorgShared) {
    let deadline = Instant::now() + GRANT_TIMEOUT;
    while !shared.access_granted.swap(false, Ordering::AcqRel) {
        if Instant::now() >= deadline || shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Next log past `cursor` whose worst segment exceeds the threshold.
fn scan_for_candidate(
    catalog: &Catalog,
    cursor: &mut usize,
    threshold: f64,
) -> Option<RangeKey> {
    let keys = catalog.keys();
    if keys.is_empty() {
        return None;
    }
    for step in 0..keys.len() {
        let idx = (*cursor + step) % keys.len();
        let packed = keys[idx];
        if let Some(range) = catalog.get(packed) {
            if range.log.worst_invalid_ratio() > threshold {
                *cursor = idx + 1;
                return Some(RangeKey::from_packed(packed));
            }
        }
    }
    *cursor = cursor.wrapping_add(1);
    None
}
