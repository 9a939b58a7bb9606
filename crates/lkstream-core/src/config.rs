use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Durability policy for appended records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsyncMode {
    /// Every append syncs segment and index before returning.
    Sync,
    /// Appends return immediately; a background scheduler coalesces fsyncs
    /// across partitions under time and size triggers.
    Group,
    /// Never fsync; durability is left to the OS.
    None,
}

/// Configuration for the LKSTREAM storage engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for all persistent state
    pub persist_dir: PathBuf,

    /// Durability policy
    pub fsync_mode: FsyncMode,

    /// Max age of dirty data before a group flush, in milliseconds
    pub fsync_interval_ms: u64,

    /// Unsynced-byte threshold that forces a group flush
    pub fsync_group_bytes: u64,

    /// Segment rotation threshold in bytes
    pub segment_max_bytes: u64,

    /// Hard per-segment cap; a frame that cannot fit even after rotation
    /// fails with `StorageFull`. 0 disables the cap.
    pub segment_hard_limit_bytes: u64,

    /// Entries held in the per-partition in-memory hot-tail ring
    pub hot_tail_entries: usize,

    /// Backpressure cap on bytes written but not yet durable
    pub inflight_max_bytes: u64,

    /// Index sparsity: one entry per N records (1 = dense)
    pub index_every_n: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            persist_dir: PathBuf::from("./data"),
            fsync_mode: FsyncMode::Group,
            fsync_interval_ms: 100,
            fsync_group_bytes: 4 * 1024 * 1024, // 4 MB
            segment_max_bytes: 1024 * 1024 * 1024, // 1 GB
            segment_hard_limit_bytes: 0,
            hot_tail_entries: 1024,
            inflight_max_bytes: 64 * 1024 * 1024, // 64 MB
            index_every_n: 64,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_persist_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persist_dir = dir.into();
        self
    }

    pub fn with_fsync_mode(mut self, mode: FsyncMode) -> Self {
        self.fsync_mode = mode;
        self
    }

    pub fn with_fsync_interval_ms(mut self, ms: u64) -> Self {
        self.fsync_interval_ms = ms;
        self
    }

    pub fn with_fsync_group_bytes(mut self, bytes: u64) -> Self {
        self.fsync_group_bytes = bytes;
        self
    }

    pub fn with_segment_max_bytes(mut self, bytes: u64) -> Self {
        self.segment_max_bytes = bytes;
        self
    }

    pub fn with_hot_tail_entries(mut self, entries: usize) -> Self {
        self.hot_tail_entries = entries;
        self
    }

    pub fn with_inflight_max_bytes(mut self, bytes: u64) -> Self {
        self.inflight_max_bytes = bytes;
        self
    }

    pub fn with_index_every_n(mut self, n: u64) -> Self {
        self.index_every_n = n;
        self
    }

    /// Check option combinations that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.index_every_n == 0 {
            return Err(Error::InvalidConfig(
                "index_every_n must be at least 1".to_string(),
            ));
        }
        if self.segment_max_bytes < 5 {
            return Err(Error::InvalidConfig(
                "segment_max_bytes must hold at least one minimal frame".to_string(),
            ));
        }
        if self.segment_hard_limit_bytes != 0
            && self.segment_hard_limit_bytes < self.segment_max_bytes
        {
            return Err(Error::InvalidConfig(
                "segment_hard_limit_bytes must be 0 or >= segment_max_bytes".to_string(),
            ));
        }
        if self.fsync_mode == FsyncMode::Group && self.fsync_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "fsync_interval_ms must be non-zero in group mode".to_string(),
            ));
        }
        Ok(())
    }
}
