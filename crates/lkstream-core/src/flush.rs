//! Group-commit durability scheduler.
//!
//! One long-lived task per broker coalesces fsyncs across partitions:
//! appends in `group` mode mark their partition dirty and return
//! immediately; the scheduler flushes the dirty set when either the oldest
//! dirty mark exceeds `fsync_interval_ms` or the unsynced byte total
//! crosses `fsync_group_bytes`. Partitions write new data concurrently with
//! a flush — their mark simply re-enters the next dirty set.

use crate::config::Config;
use crate::metrics::{EngineMetrics, Timer};
use crate::partition::Partition;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Consecutive flush failures before the scheduler reports the broker
/// degraded (writes rejected, reads keep working).
const DEGRADED_AFTER_FAILURES: u32 = 3;

type PartitionKey = (String, u32);

/// One partition's outstanding unsynced bytes. Byte counts are kept per
/// partition so a failed or deleted partition releases exactly its own
/// share of the inflight total.
struct DirtyPartition {
    handle: Weak<Partition>,
    bytes: u64,
}

#[derive(Default)]
struct DirtyState {
    partitions: HashMap<PartitionKey, DirtyPartition>,
    oldest_mark: Option<Instant>,
    pending_bytes: u64,
}

struct FlushStats {
    flushes_total: AtomicU64,
    partitions_flushed_total: AtomicU64,
    synced_bytes_total: AtomicU64,
}

/// Point-in-time view of the scheduler's counters.
#[derive(Debug, Clone)]
pub struct FlushStatsSnapshot {
    pub flushes_total: u64,
    pub partitions_flushed_total: u64,
    pub synced_bytes_total: u64,
    pub inflight_bytes: u64,
}

/// Coalesces segment/index fsyncs across partitions and tracks the
/// written-but-not-durable byte count used for producer backpressure.
///
/// Holds only weak handles to partitions; partitions hold an `Arc` to the
/// scheduler solely to mark themselves dirty.
pub struct FlushScheduler {
    interval: Duration,
    group_bytes: u64,
    registry: Mutex<HashMap<PartitionKey, Weak<Partition>>>,
    dirty: Mutex<DirtyState>,
    inflight_bytes: AtomicU64,
    notify: Notify,
    shutdown: AtomicBool,
    consecutive_failures: AtomicU32,
    stats: FlushStats,
}

impl FlushScheduler {
    pub(crate) fn new(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            interval: Duration::from_millis(config.fsync_interval_ms.max(1)),
            group_bytes: config.fsync_group_bytes,
            registry: Mutex::new(HashMap::new()),
            dirty: Mutex::new(DirtyState::default()),
            inflight_bytes: AtomicU64::new(0),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            stats: FlushStats {
                flushes_total: AtomicU64::new(0),
                partitions_flushed_total: AtomicU64::new(0),
                synced_bytes_total: AtomicU64::new(0),
            },
        })
    }

    /// Start the background flush loop.
    pub(crate) fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run().await })
    }

    /// Make a partition reachable for flushing. Weak by design — a dropped
    /// partition silently leaves the dirty set.
    pub(crate) fn register(&self, topic: &str, partition: u32, handle: Weak<Partition>) {
        self.registry
            .lock()
            .insert((topic.to_string(), partition), handle);
    }

    pub(crate) fn unregister(&self, topic: &str, partition: u32) {
        let key = (topic.to_string(), partition);
        self.registry.lock().remove(&key);

        // Release the partition's own unsynced bytes: they can never become
        // durable now and must not be credited to a later flush cycle.
        let released = {
            let mut dirty = self.dirty.lock();
            let released = dirty
                .partitions
                .remove(&key)
                .map(|entry| entry.bytes)
                .unwrap_or(0);
            dirty.pending_bytes = dirty.pending_bytes.saturating_sub(released);
            if dirty.partitions.is_empty() {
                dirty.oldest_mark = None;
            }
            released
        };
        if released > 0 {
            self.inflight_bytes.fetch_sub(released, Ordering::AcqRel);
            EngineMetrics::set_inflight_bytes(self.inflight_bytes.load(Ordering::Relaxed));
        }
    }

    /// Record `bytes` of freshly written, not-yet-durable data for a
    /// partition and enter it into the dirty set.
    pub(crate) fn mark_dirty(&self, topic: &str, partition: u32, bytes: u64) {
        let key = (topic.to_string(), partition);
        let handle = match self.registry.lock().get(&key) {
            Some(weak) => weak.clone(),
            None => {
                warn!(topic, partition, "Dirty mark for unregistered partition");
                return;
            }
        };

        self.inflight_bytes.fetch_add(bytes, Ordering::AcqRel);
        let (pending, first_mark) = {
            let mut dirty = self.dirty.lock();
            dirty
                .partitions
                .entry(key)
                .and_modify(|entry| entry.bytes += bytes)
                .or_insert_with(|| DirtyPartition { handle, bytes });
            let first_mark = dirty.oldest_mark.is_none();
            if first_mark {
                dirty.oldest_mark = Some(Instant::now());
            }
            dirty.pending_bytes += bytes;
            (dirty.pending_bytes, first_mark)
        };
        EngineMetrics::set_inflight_bytes(self.inflight_bytes.load(Ordering::Relaxed));

        // The first mark arms the interval deadline in the worker; the byte
        // trigger fires a flush outright.
        if first_mark || pending >= self.group_bytes {
            self.notify.notify_one();
        }
    }

    /// Bytes written but not yet made durable, across all partitions.
    pub fn inflight_bytes(&self) -> u64 {
        self.inflight_bytes.load(Ordering::Acquire)
    }

    /// True after repeated flush failures; the broker stops accepting
    /// writes until an operator intervenes.
    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures.load(Ordering::Acquire) >= DEGRADED_AFTER_FAILURES
    }

    pub fn stats(&self) -> FlushStatsSnapshot {
        FlushStatsSnapshot {
            flushes_total: self.stats.flushes_total.load(Ordering::Relaxed),
            partitions_flushed_total: self.stats.partitions_flushed_total.load(Ordering::Relaxed),
            synced_bytes_total: self.stats.synced_bytes_total.load(Ordering::Relaxed),
            inflight_bytes: self.inflight_bytes.load(Ordering::Relaxed),
        }
    }

    /// Flush everything currently dirty, regardless of triggers. Used for
    /// shutdown and tests.
    pub async fn flush_now(&self) {
        self.flush_cycle().await;
    }

    /// Stop the background loop after one final flush.
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    async fn run(self: Arc<Self>) {
        debug!(
            interval_ms = self.interval.as_millis() as u64,
            group_bytes = self.group_bytes,
            "Group-commit scheduler started"
        );
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                self.flush_cycle().await;
                info!("Group-commit scheduler stopped");
                return;
            }

            let (deadline, pending) = {
                let dirty = self.dirty.lock();
                (dirty.oldest_mark.map(|mark| mark + self.interval), dirty.pending_bytes)
            };

            if pending >= self.group_bytes && pending > 0 {
                self.flush_cycle().await;
                continue;
            }

            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        self.flush_cycle().await;
                        continue;
                    }
                    tokio::select! {
                        biased;
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(deadline - now) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Swap the dirty set out atomically, then sync each partition in the
    /// snapshot. Offsets up to each partition's `next_offset` at flush
    /// start become durable.
    ///
    /// Only bytes whose partition actually synced leave the inflight total;
    /// a partition whose fsync failed re-enters the dirty set with its byte
    /// count intact so the next cycle retries it. Bytes of partitions that
    /// were dropped entirely are released without being credited as synced.
    async fn flush_cycle(&self) {
        let snapshot: Vec<(PartitionKey, DirtyPartition)> = {
            let mut dirty = self.dirty.lock();
            let snapshot: Vec<_> = dirty.partitions.drain().collect();
            dirty.pending_bytes = 0;
            dirty.oldest_mark = None;
            snapshot
        };
        if snapshot.is_empty() {
            return;
        }

        let timer = Timer::new();
        let mut flushed = 0u64;
        let mut synced_bytes = 0u64;
        let mut released_bytes = 0u64;
        let mut retry: Vec<(PartitionKey, DirtyPartition)> = Vec::new();

        for (key, entry) in snapshot {
            let Some(handle) = entry.handle.upgrade() else {
                released_bytes += entry.bytes;
                continue;
            };
            match handle.flush().await {
                Ok(()) => {
                    flushed += 1;
                    synced_bytes += entry.bytes;
                    released_bytes += entry.bytes;
                }
                Err(e) => {
                    error!(
                        topic = %key.0,
                        partition = key.1,
                        error = %e,
                        "Partition flush failed; will retry"
                    );
                    retry.push((key, entry));
                }
            }
        }

        let failed = !retry.is_empty();
        if failed {
            let mut dirty = self.dirty.lock();
            for (key, entry) in retry {
                let bytes = entry.bytes;
                dirty.pending_bytes += bytes;
                // The partition may have re-marked itself dirty during the
                // flush; fold the unflushed bytes into that entry.
                dirty
                    .partitions
                    .entry(key)
                    .and_modify(|existing| existing.bytes += bytes)
                    .or_insert(entry);
            }
            dirty.oldest_mark.get_or_insert_with(Instant::now);
        }

        self.inflight_bytes.fetch_sub(released_bytes, Ordering::AcqRel);
        EngineMetrics::set_inflight_bytes(self.inflight_bytes.load(Ordering::Relaxed));

        if failed {
            self.consecutive_failures.fetch_add(1, Ordering::AcqRel);
        } else {
            self.consecutive_failures.store(0, Ordering::Release);
        }

        self.stats.flushes_total.fetch_add(1, Ordering::Relaxed);
        self.stats
            .partitions_flushed_total
            .fetch_add(flushed, Ordering::Relaxed);
        self.stats
            .synced_bytes_total
            .fetch_add(synced_bytes, Ordering::Relaxed);

        EngineMetrics::increment_flushes();
        EngineMetrics::add_bytes_flushed(synced_bytes);
        EngineMetrics::record_flush_duration(timer.elapsed());

        debug!(
            partitions = flushed,
            synced_bytes,
            elapsed_us = timer.elapsed_us(),
            "Group commit flushed"
        );
    }
}
