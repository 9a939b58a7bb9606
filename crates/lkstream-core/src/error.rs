use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    #[error("Partition not found: {topic}/{partition}")]
    PartitionNotFound { topic: String, partition: u32 },

    #[error("Topic '{name}' already exists with {existing} partitions (requested {requested})")]
    TopicExists {
        name: String,
        existing: u32,
        requested: u32,
    },

    #[error("Offset {offset} out of range [{earliest}, {next})")]
    OffsetOutOfRange {
        offset: u64,
        earliest: u64,
        next: u64,
    },

    #[error("Partition is not accepting appends")]
    ClosedPartition,

    #[error("Broker is shut down")]
    ClosedBroker,

    #[error("Backpressure: {inflight} unsynced bytes would exceed cap of {cap}")]
    Backpressure { inflight: u64, cap: u64 },

    #[error("Segment storage cap reached")]
    StorageFull,

    /// A frame whose declared length runs past end-of-file. Recovery signal;
    /// never returned by public APIs.
    #[error("Torn frame at position {0}")]
    Torn(u64),

    #[error("Recovery corruption: {0}")]
    RecoveryCorruption(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
