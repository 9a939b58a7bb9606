//! On-disk storage: framed segments, offset indexes, and the per-partition
//! segment list with rotation and recovery.

mod index;
mod log;
mod segment;

pub(crate) use log::Log;
