use crate::flush::FlushScheduler;
use crate::partition::Partition;
use crate::{Config, Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::info;

/// A named topic: a fixed-cardinality ordered array of partitions.
/// The partition count is set at creation and never changes.
pub struct Topic {
    name: String,
    partitions: Vec<Arc<Partition>>,
    /// Keyless produce rotation. Seeded from wall time so a freshly
    /// restarted broker does not pile cold-start traffic onto partition 0.
    round_robin: AtomicU32,
}

impl Topic {
    pub(crate) async fn open(
        config: &Config,
        scheduler: Arc<FlushScheduler>,
        name: String,
        partition_count: u32,
    ) -> Result<Self> {
        let mut partitions = Vec::with_capacity(partition_count as usize);
        for id in 0..partition_count {
            partitions.push(Partition::open(config, scheduler.clone(), &name, id).await?);
        }

        let seed = (chrono::Utc::now().timestamp_millis() as u64 % partition_count.max(1) as u64)
            as u32;

        info!(topic = %name, partitions = partition_count, "Topic open");
        Ok(Self {
            name,
            partitions,
            round_robin: AtomicU32::new(seed),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    pub fn partition(&self, id: u32) -> Result<&Arc<Partition>> {
        self.partitions
            .get(id as usize)
            .ok_or_else(|| Error::PartitionNotFound {
                topic: self.name.clone(),
                partition: id,
            })
    }

    pub fn partitions(&self) -> &[Arc<Partition>] {
        &self.partitions
    }

    /// Next partition for a keyless produce call.
    pub(crate) fn next_round_robin(&self) -> u32 {
        self.round_robin.fetch_add(1, Ordering::Relaxed) % self.partition_count()
    }
}
