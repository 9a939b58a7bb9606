//! The broker: owns every topic, routes produce calls to partitions, gates
//! writes with backpressure, validates commits, and drives shutdown.

use crate::flush::{FlushScheduler, FlushStatsSnapshot};
use crate::hash::partition_for_key;
use crate::offset_store::OffsetStore;
use crate::partition::{PartitionInfo, Subscription};
use crate::topic::Topic;
use crate::{Config, Error, FsyncMode, Record, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Record cap per fetch call; the byte budget is the caller's.
const FETCH_MAX_MSGS: usize = 1000;

/// A single-node event log broker. One value owns all mutable state;
/// construct with [`Broker::open`], which recovers everything on disk
/// before serving.
pub struct Broker {
    config: Config,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    scheduler: Arc<FlushScheduler>,
    flush_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    offsets: OffsetStore,
    closed: AtomicBool,
}

impl Broker {
    /// Open a broker rooted at `config.persist_dir`, recovering all topics,
    /// partitions and committed offsets found there.
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(config.persist_dir.join("topics"))?;

        let offsets = OffsetStore::open(&config.persist_dir)?;
        let scheduler = FlushScheduler::new(&config);
        let flush_task = if config.fsync_mode == FsyncMode::Group {
            Some(scheduler.spawn())
        } else {
            None
        };

        let broker = Self {
            config,
            topics: RwLock::new(HashMap::new()),
            scheduler,
            flush_task: parking_lot::Mutex::new(flush_task),
            offsets,
            closed: AtomicBool::new(false),
        };

        let recovered = broker.recover_topics().await?;
        info!(
            persist_dir = %broker.config.persist_dir.display(),
            topics = recovered,
            "Broker open"
        );
        Ok(broker)
    }

    /// Rediscover topics from the directory layout: each directory under
    /// `topics/` is a topic whose partition count is its set of `part{N}`
    /// subdirectories, which must be contiguous from 0.
    async fn recover_topics(&self) -> Result<usize> {
        let topics_dir = self.config.persist_dir.join("topics");
        let mut recovered = 0;

        for entry in std::fs::read_dir(&topics_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };

            let mut pids = Vec::new();
            for part_entry in std::fs::read_dir(&path)? {
                let part_path = part_entry?.path();
                if !part_path.is_dir() {
                    continue;
                }
                if let Some(part_name) = part_path.file_name().and_then(|n| n.to_str()) {
                    if let Some(pid) = part_name.strip_prefix("part") {
                        if let Ok(pid) = pid.parse::<u32>() {
                            pids.push(pid);
                        }
                    }
                }
            }
            if pids.is_empty() {
                warn!(topic = %name, "Skipping topic directory without partitions");
                continue;
            }

            pids.sort_unstable();
            let count = pids.len() as u32;
            if pids != (0..count).collect::<Vec<u32>>() {
                return Err(Error::RecoveryCorruption(format!(
                    "topic '{}' has non-contiguous partitions {:?}",
                    name, pids
                )));
            }

            let topic = Topic::open(&self.config, self.scheduler.clone(), name.clone(), count)
                .await?;
            self.topics.write().await.insert(name, Arc::new(topic));
            recovered += 1;
        }

        Ok(recovered)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ClosedBroker);
        }
        Ok(())
    }

    async fn topic(&self, name: &str) -> Result<Arc<Topic>> {
        self.topics
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TopicNotFound(name.to_string()))
    }

    fn validate_name(kind: &str, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidConfig(format!("{} name is empty", kind)));
        }
        if name.contains('/') || name.contains('\\') || name.starts_with('.') {
            return Err(Error::InvalidConfig(format!(
                "{} name '{}' is not a valid directory component",
                kind, name
            )));
        }
        // "__" is the field separator in offset file names.
        if name.contains("__") {
            return Err(Error::InvalidConfig(format!(
                "{} name '{}' must not contain \"__\"",
                kind, name
            )));
        }
        Ok(())
    }

    /// Create a topic with a fixed partition count. Idempotent when called
    /// again with the same count; conflicting counts fail.
    pub async fn create_topic(&self, name: &str, partition_count: u32) -> Result<Arc<Topic>> {
        self.ensure_open()?;
        Self::validate_name("topic", name)?;
        if partition_count == 0 {
            return Err(Error::InvalidConfig(
                "partition_count must be at least 1".to_string(),
            ));
        }

        let mut topics = self.topics.write().await;
        if let Some(existing) = topics.get(name) {
            if existing.partition_count() == partition_count {
                return Ok(existing.clone());
            }
            return Err(Error::TopicExists {
                name: name.to_string(),
                existing: existing.partition_count(),
                requested: partition_count,
            });
        }

        let topic = Arc::new(
            Topic::open(
                &self.config,
                self.scheduler.clone(),
                name.to_string(),
                partition_count,
            )
            .await?,
        );
        topics.insert(name.to_string(), topic.clone());
        Ok(topic)
    }

    /// Append `values` to one partition of `topic`: the key's stable-hash
    /// partition when a non-empty key is given, the next round-robin
    /// partition otherwise. All values land consecutively on that
    /// partition; the call fails whole or returns every offset.
    pub async fn produce(
        &self,
        topic: &str,
        key: Option<Bytes>,
        values: Vec<Bytes>,
    ) -> Result<(u32, Vec<u64>)> {
        self.ensure_open()?;
        if self.scheduler.is_degraded() {
            return Err(Error::Io(io::Error::other(
                "broker degraded after repeated flush failures; writes disabled",
            )));
        }

        let topic_ref = self.topic(topic).await?;

        if self.config.fsync_mode == FsyncMode::Group {
            let batch_bytes: u64 = values.iter().map(|v| 4 + v.len() as u64).sum();
            let inflight = self.scheduler.inflight_bytes();
            if inflight + batch_bytes > self.config.inflight_max_bytes {
                return Err(Error::Backpressure {
                    inflight,
                    cap: self.config.inflight_max_bytes,
                });
            }
        }

        let pid = match key.as_ref() {
            Some(k) if !k.is_empty() => partition_for_key(k, topic_ref.partition_count()),
            _ => topic_ref.next_round_robin(),
        };

        let records: Vec<Record> = values
            .into_iter()
            .map(|value| match key.as_ref() {
                Some(k) if !k.is_empty() => Record::with_key(k.clone(), value),
                _ => Record::new(value),
            })
            .collect();

        let offsets = topic_ref.partition(pid)?.append_many(records).await?;
        Ok((pid, offsets))
    }

    /// Read records from a partition starting at `offset`, bounded by
    /// `max_bytes` of frame data.
    pub async fn fetch(
        &self,
        topic: &str,
        partition: u32,
        offset: u64,
        max_bytes: u64,
    ) -> Result<Vec<Record>> {
        self.ensure_open()?;
        let topic_ref = self.topic(topic).await?;
        topic_ref
            .partition(partition)?
            .read_from(offset, FETCH_MAX_MSGS, max_bytes)
            .await
    }

    /// Register a push subscription from `from_offset`.
    pub async fn subscribe(
        &self,
        topic: &str,
        partition: u32,
        from_offset: u64,
    ) -> Result<Subscription> {
        self.ensure_open()?;
        let topic_ref = self.topic(topic).await?;
        let partition_ref = topic_ref.partition(partition)?;

        let earliest = partition_ref.earliest_offset().await;
        if from_offset < earliest {
            return Err(Error::OffsetOutOfRange {
                offset: from_offset,
                earliest,
                next: partition_ref.next_offset(),
            });
        }
        partition_ref.subscribe(from_offset)
    }

    /// Durably record the next offset `group` will read from the partition.
    /// Offsets beyond `next_offset` are rejected.
    pub async fn commit_offset(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        offset: u64,
    ) -> Result<()> {
        self.ensure_open()?;
        Self::validate_name("group", group)?;

        let topic_ref = self.topic(topic).await?;
        let partition_ref = topic_ref.partition(partition)?;
        let next = partition_ref.next_offset();
        if offset > next {
            return Err(Error::OffsetOutOfRange {
                offset,
                earliest: partition_ref.earliest_offset().await,
                next,
            });
        }

        self.offsets.commit(group, topic, partition, offset).await
    }

    pub async fn committed_offset(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> Result<Option<u64>> {
        self.ensure_open()?;
        self.offsets.read_committed(group, topic, partition).await
    }

    pub async fn list_topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.read().await.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub async fn list_groups(&self) -> Result<Vec<String>> {
        self.offsets.groups().await
    }

    pub async fn describe_partition(&self, topic: &str, partition: u32) -> Result<PartitionInfo> {
        self.ensure_open()?;
        let topic_ref = self.topic(topic).await?;
        Ok(topic_ref.partition(partition)?.describe().await)
    }

    /// Drop a topic and delete its directory. Committed offsets referring
    /// to it are left behind; they are meaningless without the topic.
    pub async fn delete_topic(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let topic = {
            let mut topics = self.topics.write().await;
            topics
                .remove(name)
                .ok_or_else(|| Error::TopicNotFound(name.to_string()))?
        };

        for partition in topic.partitions() {
            partition.begin_drain();
            partition.close();
        }
        std::fs::remove_dir_all(self.config.persist_dir.join("topics").join(name))?;

        info!(topic = %name, "Topic deleted");
        Ok(())
    }

    /// Current group-commit counters (flushes, synced bytes, inflight).
    pub fn flush_stats(&self) -> FlushStatsSnapshot {
        self.scheduler.stats()
    }

    /// Drain every partition, force a final flush, then close. Idempotent;
    /// all subsequent operations fail with `ClosedBroker`.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Broker shutting down");

        let topics: Vec<Arc<Topic>> = self.topics.read().await.values().cloned().collect();
        for topic in &topics {
            for partition in topic.partitions() {
                partition.begin_drain();
            }
        }

        self.scheduler.flush_now().await;
        self.scheduler.shutdown();
        let task = self.flush_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        for topic in &topics {
            for partition in topic.partitions() {
                partition.close();
            }
        }

        info!("Broker shut down");
        Ok(())
    }
}
