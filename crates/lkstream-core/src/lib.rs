//! LKSTREAM storage core: a single-node, file-backed, append-only event
//! log with Kafka-style semantics — named topics over fixed-count
//! partitions, per-partition total ordering, group-committed durability,
//! and replayable consumption by named consumer groups.

pub mod broker;
pub mod config;
pub mod error;
pub mod flush;
pub mod hash;
mod hot_tail;
pub mod metrics;
pub mod offset_store;
pub mod partition;
pub mod record;
mod storage;
pub mod topic;

pub use broker::Broker;
pub use config::{Config, FsyncMode};
pub use error::{Error, Result};
pub use flush::FlushStatsSnapshot;
pub use offset_store::OffsetStore;
pub use partition::{Partition, PartitionInfo, PartitionState, Subscription};
pub use record::Record;
pub use topic::Topic;
