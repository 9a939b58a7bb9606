use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A single record in a partition.
///
/// Only `value` is framed to disk; `key` selects the partition and rides the
/// hot tail, `timestamp` is assigned at append time. Records read back from
/// disk therefore carry `key: None`, while hot-tail reads return the
/// original key and timestamp.
#[derive(Debug, Clone)]
pub struct Record {
    /// Offset within the partition, assigned by the broker on append
    pub offset: u64,

    /// Optional key used for partition routing
    pub key: Option<Bytes>,

    /// Opaque payload
    pub value: Bytes,

    /// When the record was appended (or read, for disk reads)
    pub timestamp: DateTime<Utc>,
}

impl Record {
    pub fn new(value: Bytes) -> Self {
        Self {
            offset: 0,
            key: None,
            value,
            timestamp: Utc::now(),
        }
    }

    pub fn with_key(key: Bytes, value: Bytes) -> Self {
        Self {
            offset: 0,
            key: Some(key),
            value,
            timestamp: Utc::now(),
        }
    }

    /// On-disk size of this record's frame: length header plus payload.
    pub fn frame_len(&self) -> u64 {
        4 + self.value.len() as u64
    }
}
