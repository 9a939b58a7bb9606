//! A single partition: serialized appends over the segment log, atomic
//! offset publication, hot-tail reads, and push delivery to subscribers.

use crate::config::{Config, FsyncMode};
use crate::flush::FlushScheduler;
use crate::hot_tail::HotTail;
use crate::metrics::{EngineMetrics, Timer};
use crate::storage::Log;
use crate::{Error, Record, Result};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info, warn};

/// Records buffered per subscription before the sender awaits the
/// consumer's read rate.
const SUBSCRIPTION_BUFFER: usize = 128;
/// Batch shape used by the subscription pump.
const SUBSCRIBE_BATCH_MSGS: usize = 64;
const SUBSCRIBE_BATCH_BYTES: u64 = 1024 * 1024;
/// How long the pump parks between wakeup re-checks while caught up.
const SUBSCRIBE_PARK: Duration = Duration::from_millis(500);

/// Partition lifecycle. Only `Active` accepts appends; `Draining` still
/// serves reads and commits; `Closed` rejects everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PartitionState {
    Initializing = 0,
    Recovering = 1,
    Active = 2,
    Draining = 3,
    Closed = 4,
}

impl PartitionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Initializing,
            1 => Self::Recovering,
            2 => Self::Active,
            3 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

/// Snapshot returned by `describe`.
#[derive(Debug, Clone)]
pub struct PartitionInfo {
    pub topic: String,
    pub partition: u32,
    pub earliest_offset: u64,
    pub next_offset: u64,
    pub durable_offset: u64,
    pub segment_count: usize,
    pub state: PartitionState,
}

/// One partition of a topic.
///
/// Appends are serialized by the write half of the log lock; readers share
/// the read half and then scan immutable mmap snapshots. `next_offset` is
/// published atomically after the in-memory state is updated, so offsets
/// returned to a producer are immediately readable — durability follows
/// separately per the fsync mode.
pub struct Partition {
    topic: String,
    id: u32,
    fsync_mode: FsyncMode,
    log: RwLock<Log>,
    hot_tail: HotTail,
    next_offset: AtomicU64,
    durable_offset: AtomicU64,
    state: AtomicU8,
    append_notify: Notify,
    scheduler: Arc<FlushScheduler>,
}

impl Partition {
    /// Directory of this partition under the persist root.
    pub(crate) fn dir(config: &Config, topic: &str, id: u32) -> PathBuf {
        config
            .persist_dir
            .join("topics")
            .join(topic)
            .join(format!("part{}", id))
    }

    /// Open a partition, recovering on-disk state, and register it with the
    /// group-commit scheduler.
    pub(crate) async fn open(
        config: &Config,
        scheduler: Arc<FlushScheduler>,
        topic: &str,
        id: u32,
    ) -> Result<Arc<Self>> {
        let dir = Self::dir(config, topic, id);
        let (log, report) = Log::open(&dir, config)?;

        let partition = Arc::new(Self {
            topic: topic.to_string(),
            id,
            fsync_mode: config.fsync_mode,
            log: RwLock::new(log),
            hot_tail: HotTail::new(config.hot_tail_entries),
            next_offset: AtomicU64::new(report.next_offset),
            // Everything recovery kept is on stable storage.
            durable_offset: AtomicU64::new(report.next_offset),
            state: AtomicU8::new(PartitionState::Initializing as u8),
            append_notify: Notify::new(),
            scheduler: scheduler.clone(),
        });

        partition.set_state(PartitionState::Recovering);
        partition.rebuild_hot_tail(config.hot_tail_entries).await?;
        partition.set_state(PartitionState::Active);

        scheduler.register(topic, id, Arc::downgrade(&partition));

        info!(
            topic,
            partition = id,
            next_offset = report.next_offset,
            segments = report.segment_count,
            "Partition active"
        );
        Ok(partition)
    }

    /// Warm the ring with the last K frames of the active segment.
    async fn rebuild_hot_tail(&self, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Ok(());
        }
        let next = self.next_offset.load(Ordering::Acquire);
        if next == 0 {
            return Ok(());
        }
        let log = self.log.read().await;
        let start = next.saturating_sub(capacity as u64).max(log.active_base());
        let records = log.read_from(start, capacity, u64::MAX, next)?;
        self.hot_tail.push_batch(&records);
        Ok(())
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> PartitionState {
        PartitionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: PartitionState) {
        self.state.store(state as u8, Ordering::Release);
        // Waiters re-check state after every wakeup.
        self.append_notify.notify_waiters();
    }

    /// Offset the next accepted record will receive.
    pub fn next_offset(&self) -> u64 {
        self.next_offset.load(Ordering::Acquire)
    }

    /// Highest offset bound known durable on stable storage.
    pub fn durable_offset(&self) -> u64 {
        self.durable_offset.load(Ordering::Acquire)
    }

    /// Append a batch of records, assigning consecutive offsets.
    ///
    /// Atomic with respect to ordering: the whole batch lands adjacently,
    /// and a failure assigns no offsets at all. Relative order across
    /// concurrent callers is the order the append lock is acquired.
    pub async fn append_many(&self, mut records: Vec<Record>) -> Result<Vec<u64>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        if self.state() != PartitionState::Active {
            return Err(Error::ClosedPartition);
        }

        let timer = Timer::new();
        let values: Vec<bytes::Bytes> = records.iter().map(|r| r.value.clone()).collect();

        let mut log = self.log.write().await;
        // A drain may have begun while this call waited on the lock.
        if self.state() != PartitionState::Active {
            return Err(Error::ClosedPartition);
        }

        let start = self.next_offset.load(Ordering::Acquire);
        let outcome = log.append_batch(&values, start, self.fsync_mode == FsyncMode::Sync)?;

        let now = Utc::now();
        for (i, record) in records.iter_mut().enumerate() {
            record.offset = start + i as u64;
            record.timestamp = now;
        }
        self.hot_tail.push_batch(&records);

        let end = start + records.len() as u64;
        self.next_offset.store(end, Ordering::Release);
        drop(log);

        match self.fsync_mode {
            FsyncMode::Sync => {
                self.durable_offset.fetch_max(end, Ordering::AcqRel);
            }
            FsyncMode::Group => {
                self.scheduler
                    .mark_dirty(&self.topic, self.id, outcome.bytes_written);
            }
            FsyncMode::None => {}
        }

        self.append_notify.notify_waiters();

        EngineMetrics::add_records_appended(records.len() as u64);
        EngineMetrics::add_bytes_appended(outcome.bytes_written);
        EngineMetrics::record_append_latency_us(timer.elapsed_us());
        debug!(
            topic = %self.topic,
            partition = self.id,
            first_offset = start,
            count = records.len(),
            "Appended batch"
        );

        Ok((start..end).collect())
    }

    /// Read up to `max_msgs` records / `max_bytes` frame bytes starting at
    /// `offset`. Served from the hot-tail ring when it covers the offset,
    /// from disk otherwise. Empty when `offset >= next_offset`.
    pub async fn read_from(
        &self,
        offset: u64,
        max_msgs: usize,
        max_bytes: u64,
    ) -> Result<Vec<Record>> {
        if self.state() == PartitionState::Closed {
            return Err(Error::ClosedPartition);
        }

        let next = self.next_offset.load(Ordering::Acquire);
        if offset >= next || max_msgs == 0 {
            return Ok(Vec::new());
        }

        if let Some(records) = self.hot_tail.read_from(offset, max_msgs, max_bytes) {
            EngineMetrics::increment_hot_tail_hits();
            EngineMetrics::add_records_read(records.len() as u64);
            return Ok(records);
        }

        let log = self.log.read().await;
        let records = log.read_from(offset, max_msgs, max_bytes, next)?;
        EngineMetrics::add_records_read(records.len() as u64);
        Ok(records)
    }

    /// Block until `next_offset > offset` or the timeout elapses. Returns
    /// whether the offset became available.
    pub async fn wait_for_offset(&self, offset: u64, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.next_offset() > offset {
                return true;
            }
            if self.state() == PartitionState::Closed {
                return false;
            }

            let mut notified = std::pin::pin!(self.append_notify.notified());
            notified.as_mut().enable();
            // The append may have landed between the check and enabling.
            if self.next_offset() > offset {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.next_offset() > offset;
            }
        }
    }

    /// Register a subscriber pushed every record from `from_offset` on.
    ///
    /// Delivery is a long-lived task per subscription: it drains the log,
    /// then parks on the partition's append notification; channel capacity
    /// backpressures delivery to the consumer's read rate.
    pub fn subscribe(self: &Arc<Self>, from_offset: u64) -> Result<Subscription> {
        if self.state() == PartitionState::Closed {
            return Err(Error::ClosedPartition);
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancel_notify = Arc::new(Notify::new());

        let partition = self.clone();
        let task_cancelled = cancelled.clone();
        let task_cancel_notify = cancel_notify.clone();
        let task = tokio::spawn(async move {
            let mut cursor = from_offset;
            loop {
                if task_cancelled.load(Ordering::Acquire)
                    || partition.state() == PartitionState::Closed
                {
                    break;
                }

                let batch = match partition
                    .read_from(cursor, SUBSCRIBE_BATCH_MSGS, SUBSCRIBE_BATCH_BYTES)
                    .await
                {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(
                            topic = %partition.topic,
                            partition = partition.id,
                            error = %e,
                            "Subscription read failed; dropping subscriber"
                        );
                        break;
                    }
                };

                if batch.is_empty() {
                    tokio::select! {
                        _ = task_cancel_notify.notified() => {}
                        _ = partition.wait_for_offset(cursor, SUBSCRIBE_PARK) => {}
                    }
                    continue;
                }

                for record in batch {
                    let delivered_to = record.offset + 1;
                    tokio::select! {
                        _ = task_cancel_notify.notified() => return,
                        sent = tx.send(record) => {
                            if sent.is_err() {
                                // Receiver dropped: disconnection unregisters.
                                return;
                            }
                        }
                    }
                    cursor = delivered_to;
                }
            }
        });

        Ok(Subscription {
            receiver: rx,
            cancelled,
            cancel_notify,
            task,
        })
    }

    /// Sync the active segment and index, then publish the durability
    /// event. Runs on cloned file handles so appenders are not blocked for
    /// the duration of the fsync.
    pub(crate) async fn flush(&self) -> Result<()> {
        let target = self.next_offset.load(Ordering::Acquire);
        let (segment, index) = {
            let log = self.log.read().await;
            log.flush_handles()?
        };
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            segment.sync_data()?;
            index.sync_data()
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        self.durable_offset.fetch_max(target, Ordering::AcqRel);
        Ok(())
    }

    pub async fn earliest_offset(&self) -> u64 {
        self.log.read().await.earliest_offset()
    }

    pub async fn describe(&self) -> PartitionInfo {
        let (earliest, segment_count) = {
            let log = self.log.read().await;
            (log.earliest_offset(), log.segment_count())
        };
        PartitionInfo {
            topic: self.topic.clone(),
            partition: self.id,
            earliest_offset: earliest,
            next_offset: self.next_offset(),
            durable_offset: self.durable_offset(),
            segment_count,
            state: self.state(),
        }
    }

    /// Stop accepting appends; reads and commits continue.
    pub(crate) fn begin_drain(&self) {
        self.set_state(PartitionState::Draining);
    }

    /// Reject all further operations.
    pub(crate) fn close(&self) {
        self.set_state(PartitionState::Closed);
        self.scheduler.unregister(&self.topic, self.id);
    }
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .field("next_offset", &self.next_offset())
            .field("state", &self.state())
            .finish()
    }
}

/// Handle to a push subscription. Dropping it (or calling `cancel`) removes
/// the waiter from the partition and stops delivery.
pub struct Subscription {
    receiver: mpsc::Receiver<Record>,
    cancelled: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
    task: tokio::task::JoinHandle<()>,
}

impl Subscription {
    /// Next pushed record; `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<Record> {
        self.receiver.recv().await
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.cancel_notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    async fn open_partition(config: &Config) -> (Arc<Partition>, Arc<FlushScheduler>) {
        let scheduler = FlushScheduler::new(config);
        let partition = Partition::open(config, scheduler.clone(), "orders", 0)
            .await
            .unwrap();
        (partition, scheduler)
    }

    fn test_config(dir: &TempDir) -> Config {
        Config::default()
            .with_persist_dir(dir.path())
            .with_hot_tail_entries(4)
            .with_index_every_n(2)
    }

    fn records(values: &[&str]) -> Vec<Record> {
        values
            .iter()
            .map(|v| Record::new(Bytes::copy_from_slice(v.as_bytes())))
            .collect()
    }

    #[tokio::test]
    async fn test_offsets_are_contiguous_across_batches() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (partition, _scheduler) = open_partition(&config).await;

        let first = partition.append_many(records(&["a", "b"])).await.unwrap();
        let second = partition.append_many(records(&["c"])).await.unwrap();
        assert_eq!(first, vec![0, 1]);
        assert_eq!(second, vec![2]);
        assert_eq!(partition.next_offset(), 3);

        let all = partition.read_from(0, 10, u64::MAX).await.unwrap();
        let offsets: Vec<u64> = all.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
        assert_eq!(all[2].value, Bytes::from("c"));
    }

    #[tokio::test]
    async fn test_round_trip_ignores_batch_boundaries() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir).with_hot_tail_entries(0);
        let (partition, _scheduler) = open_partition(&config).await;

        let values = ["v0", "v1", "v2", "v3", "v4"];
        partition.append_many(records(&values[..2])).await.unwrap();
        partition.append_many(records(&values[2..3])).await.unwrap();
        partition.append_many(records(&values[3..])).await.unwrap();

        let all = partition.read_from(0, values.len(), u64::MAX).await.unwrap();
        assert_eq!(all.len(), values.len());
        for (i, record) in all.iter().enumerate() {
            assert_eq!(record.offset, i as u64);
            assert_eq!(record.value, Bytes::copy_from_slice(values[i].as_bytes()));
        }
    }

    #[tokio::test]
    async fn test_hot_tail_serves_recent_offsets_with_keys() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (partition, _scheduler) = open_partition(&config).await;

        let batch = vec![Record::with_key(Bytes::from("k"), Bytes::from("v"))];
        partition.append_many(batch).await.unwrap();

        // Ring hit preserves the key; a disk read cannot.
        let hot = partition.read_from(0, 10, u64::MAX).await.unwrap();
        assert_eq!(hot[0].key, Some(Bytes::from("k")));
    }

    #[tokio::test]
    async fn test_reads_fall_back_to_disk_behind_ring() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir); // ring of 4
        let (partition, _scheduler) = open_partition(&config).await;

        partition
            .append_many(records(&["0", "1", "2", "3", "4", "5"]))
            .await
            .unwrap();

        // Offset 0 was evicted from the ring; the read comes from disk.
        let old = partition.read_from(0, 2, u64::MAX).await.unwrap();
        assert_eq!(old.len(), 2);
        assert_eq!(old[0].offset, 0);
        assert_eq!(old[0].value, Bytes::from("0"));
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        {
            let (partition, scheduler) = open_partition(&config).await;
            partition.append_many(records(&["m1", "m2"])).await.unwrap();
            scheduler.flush_now().await;
        }

        let (partition, _scheduler) = open_partition(&config).await;
        assert_eq!(partition.next_offset(), 2);
        assert_eq!(partition.durable_offset(), 2);

        let stored = partition.read_from(0, 10, u64::MAX).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].value, Bytes::from("m1"));

        partition.append_many(records(&["m3"])).await.unwrap();
        let stored = partition.read_from(0, 10, u64::MAX).await.unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[2].offset, 2);
    }

    #[tokio::test]
    async fn test_group_mode_durability_lags_until_flush() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (partition, scheduler) = open_partition(&config).await;

        partition.append_many(records(&["a", "b"])).await.unwrap();
        assert_eq!(partition.next_offset(), 2);
        assert_eq!(partition.durable_offset(), 0);
        assert!(scheduler.inflight_bytes() > 0);

        scheduler.flush_now().await;
        assert_eq!(partition.durable_offset(), 2);
        assert_eq!(scheduler.inflight_bytes(), 0);
    }

    #[tokio::test]
    async fn test_close_releases_unsynced_inflight_bytes() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (partition, scheduler) = open_partition(&config).await;

        partition.append_many(records(&["a", "b"])).await.unwrap();
        assert!(scheduler.inflight_bytes() > 0);

        // Closing unregisters the partition; its dirty bytes leave the
        // backpressure gate without ever counting as synced.
        partition.close();
        assert_eq!(scheduler.inflight_bytes(), 0);

        scheduler.flush_now().await;
        assert_eq!(scheduler.stats().synced_bytes_total, 0);
    }

    #[tokio::test]
    async fn test_dropped_partition_bytes_released_without_sync_credit() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (partition, scheduler) = open_partition(&config).await;

        partition.append_many(records(&["a"])).await.unwrap();
        assert!(scheduler.inflight_bytes() > 0);

        drop(partition);
        scheduler.flush_now().await;

        assert_eq!(scheduler.inflight_bytes(), 0);
        assert_eq!(scheduler.stats().synced_bytes_total, 0);
        assert_eq!(scheduler.stats().partitions_flushed_total, 0);
    }

    #[tokio::test]
    async fn test_sync_mode_is_durable_on_return() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir).with_fsync_mode(FsyncMode::Sync);
        let (partition, scheduler) = open_partition(&config).await;

        partition.append_many(records(&["a"])).await.unwrap();
        assert_eq!(partition.durable_offset(), 1);
        assert_eq!(scheduler.inflight_bytes(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_offset() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (partition, _scheduler) = open_partition(&config).await;

        assert!(!partition.wait_for_offset(0, Duration::from_millis(20)).await);

        let producer = partition.clone();
        let waiter = {
            let partition = partition.clone();
            tokio::spawn(async move { partition.wait_for_offset(0, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        producer.append_many(records(&["x"])).await.unwrap();

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_subscribe_receives_next_append() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (partition, _scheduler) = open_partition(&config).await;

        let mut subscription = partition.subscribe(partition.next_offset()).unwrap();
        let offsets = partition.append_many(records(&["pushed"])).await.unwrap();

        let record = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .expect("subscriber should be woken")
            .expect("subscription alive");
        assert_eq!(record.offset, offsets[0]);
        assert_eq!(record.value, Bytes::from("pushed"));
    }

    #[tokio::test]
    async fn test_subscribe_replays_from_old_offset() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (partition, _scheduler) = open_partition(&config).await;

        partition.append_many(records(&["a", "b", "c"])).await.unwrap();

        let mut subscription = partition.subscribe(0).unwrap();
        for expected in 0..3u64 {
            let record = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(record.offset, expected);
        }
    }

    #[tokio::test]
    async fn test_cancelled_subscription_stops() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (partition, _scheduler) = open_partition(&config).await;

        let subscription = partition.subscribe(0).unwrap();
        subscription.cancel();
        assert!(subscription.is_cancelled());
    }

    #[tokio::test]
    async fn test_draining_rejects_appends_allows_reads() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (partition, _scheduler) = open_partition(&config).await;

        partition.append_many(records(&["a"])).await.unwrap();
        partition.begin_drain();

        assert!(matches!(
            partition.append_many(records(&["b"])).await,
            Err(Error::ClosedPartition)
        ));
        assert_eq!(partition.read_from(0, 10, u64::MAX).await.unwrap().len(), 1);

        partition.close();
        assert!(matches!(
            partition.read_from(0, 10, u64::MAX).await,
            Err(Error::ClosedPartition)
        ));
    }

    #[tokio::test]
    async fn test_describe() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (partition, _scheduler) = open_partition(&config).await;
        partition.append_many(records(&["a", "b"])).await.unwrap();

        let info = partition.describe().await;
        assert_eq!(info.topic, "orders");
        assert_eq!(info.partition, 0);
        assert_eq!(info.earliest_offset, 0);
        assert_eq!(info.next_offset, 2);
        assert_eq!(info.state, PartitionState::Active);
        assert_eq!(info.segment_count, 1);
    }
}
