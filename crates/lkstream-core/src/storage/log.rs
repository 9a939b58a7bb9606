//! Per-partition segment list: append with rotation, ranged reads by
//! offset, and crash recovery from on-disk state.

use crate::config::Config;
use crate::metrics::EngineMetrics;
use crate::storage::index::OffsetIndex;
use crate::storage::segment::{
    parse_segment_base, Segment, SegmentReader, FRAME_HEADER_LEN,
};
use crate::{Error, Record, Result};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CHECKPOINT_FILE: &str = "checkpoint.meta";

/// Advisory rotation checkpoint. Recovery never trusts it; it only logs
/// disagreement for operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Checkpoint {
    last_sealed_base: u64,
    last_offset: u64,
}

#[derive(Debug)]
struct StoredSegment {
    segment: Segment,
    index: OffsetIndex,
}

impl StoredSegment {
    fn base(&self) -> u64 {
        self.segment.base_offset()
    }
}

/// What recovery found and did for one partition directory.
#[derive(Debug, Default, Clone)]
pub(crate) struct RecoveryReport {
    pub next_offset: u64,
    pub truncated_bytes: u64,
    pub rebuilt_index: bool,
    pub segment_count: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct AppendOutcome {
    pub bytes_written: u64,
    pub rotations: u32,
}

/// Ordered segment list of one partition. The last segment is active; all
/// earlier ones are sealed. Mutation is serialized by the owning partition.
#[derive(Debug)]
pub(crate) struct Log {
    dir: PathBuf,
    segments: Vec<StoredSegment>,
    segment_max_bytes: u64,
    segment_hard_limit: u64,
    index_every_n: u64,
}

impl Log {
    /// Open a partition directory, recovering state from disk per the
    /// startup protocol: sorted base-offset coverage check, index
    /// validation/rebuild for every segment, torn-tail truncation of the
    /// active segment.
    pub(crate) fn open(dir: &Path, config: &Config) -> Result<(Self, RecoveryReport)> {
        std::fs::create_dir_all(dir)?;

        let mut bases: Vec<u64> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| parse_segment_base(&entry.path()))
            .collect();
        bases.sort_unstable();

        let mut log = Self {
            dir: dir.to_path_buf(),
            segments: Vec::with_capacity(bases.len().max(1)),
            segment_max_bytes: config.segment_max_bytes,
            segment_hard_limit: config.segment_hard_limit_bytes,
            index_every_n: config.index_every_n,
        };

        if bases.is_empty() {
            log.segments.push(StoredSegment {
                segment: Segment::open(dir, 0, log.segment_hard_limit)?,
                index: OffsetIndex::open(dir, 0)?,
            });
            return Ok((
                log,
                RecoveryReport {
                    segment_count: 1,
                    ..Default::default()
                },
            ));
        }

        if bases[0] != 0 {
            return Err(Error::RecoveryCorruption(format!(
                "first segment base is {} (expected 0) in {}",
                bases[0],
                dir.display()
            )));
        }
        for pair in bases.windows(2) {
            if pair[1] <= pair[0] {
                return Err(Error::RecoveryCorruption(format!(
                    "segment bases not strictly increasing: {} then {} in {}",
                    pair[0],
                    pair[1],
                    dir.display()
                )));
            }
        }

        let mut report = RecoveryReport::default();
        let last = bases.len() - 1;
        for (i, &base) in bases.iter().enumerate() {
            let mut stored = StoredSegment {
                segment: Segment::open(dir, base, log.segment_hard_limit)?,
                index: OffsetIndex::open(dir, base)?,
            };
            let active = i == last;
            let recovered = log.recover_segment(&mut stored, active, &mut report)?;
            if !active {
                stored.segment.seal();
            } else {
                report.next_offset = recovered;
            }
            log.segments.push(stored);
        }
        report.segment_count = log.segments.len();

        log.check_checkpoint(&report);
        info!(
            dir = %dir.display(),
            segments = report.segment_count,
            next_offset = report.next_offset,
            truncated_bytes = report.truncated_bytes,
            "Recovered partition log"
        );
        Ok((log, report))
    }

    /// Validate one segment's index and, for the active segment, scan its
    /// tail for torn writes. Returns the offset following the segment's
    /// last surviving frame.
    fn recover_segment(
        &self,
        stored: &mut StoredSegment,
        active: bool,
        report: &mut RecoveryReport,
    ) -> Result<u64> {
        let base = stored.base();
        let reader = stored.segment.reader()?;

        // An index is usable only as far as every entry points at a whole
        // frame; the first bad entry invalidates its suffix.
        let valid = valid_index_prefix(&stored.index, base, &reader)?;
        if valid < stored.index.len() {
            let first_bad = stored.index.entries()[valid].0;
            warn!(
                base_offset = base,
                dropped = stored.index.len() - valid,
                "Dropping invalid index suffix"
            );
            stored.index.truncate_below(first_bad)?;
        }

        if stored.index.is_empty() && reader.len() > 0 {
            // Missing or fully invalid index: rebuild sparsely by scanning.
            report.rebuilt_index = true;
            return self.rebuild_index(stored, active, &reader, report);
        }

        let (scan_offset, scan_pos) = stored.index.last().unwrap_or((base, 0));
        let (count, end_pos, torn) = scan_frames(&reader, scan_pos)?;
        let next_offset = scan_offset + count;

        if let Some(torn_pos) = torn {
            if active {
                let dropped = reader.len() - torn_pos;
                warn!(
                    base_offset = base,
                    torn_pos,
                    dropped_bytes = dropped,
                    "Truncating torn segment tail"
                );
                stored.segment.truncate(torn_pos)?;
                stored.index.truncate_below(next_offset)?;
                report.truncated_bytes += dropped;
            } else {
                // Sealed segments were synced before rotation; a torn tail
                // here means the rotation protocol was violated.
                return Err(Error::RecoveryCorruption(format!(
                    "torn frame at {} in sealed segment {:020}",
                    torn_pos, base
                )));
            }
        } else {
            debug_assert_eq!(end_pos, reader.len());
        }

        Ok(next_offset)
    }

    /// Rescan a segment from its start, rewriting the index sparsely.
    fn rebuild_index(
        &self,
        stored: &mut StoredSegment,
        active: bool,
        reader: &SegmentReader,
        report: &mut RecoveryReport,
    ) -> Result<u64> {
        let base = stored.base();
        stored.index.reset()?;

        let every = self.index_every_n;
        let mut entries = Vec::new();
        let (count, _, torn) = scan_frames(reader, 0)?;
        // Second pass to collect positions now that the valid frame count is
        // known; scan_frames stops cleanly before any torn tail.
        let mut pos = 0u64;
        for rel in 0..count {
            if rel % every == 0 {
                entries.push((base + rel, pos));
            }
            match reader.frame_at(pos)? {
                Some((payload, next)) => {
                    debug_assert_eq!(next, pos + FRAME_HEADER_LEN + payload.len() as u64);
                    pos = next;
                }
                None => break,
            }
        }
        for (offset, entry_pos) in entries {
            stored.index.append(offset, entry_pos)?;
        }
        stored.index.sync()?;

        if let Some(torn_pos) = torn {
            if active {
                let dropped = reader.len() - torn_pos;
                warn!(
                    base_offset = base,
                    torn_pos,
                    dropped_bytes = dropped,
                    "Truncating torn segment tail during index rebuild"
                );
                stored.segment.truncate(torn_pos)?;
                report.truncated_bytes += dropped;
            } else {
                return Err(Error::RecoveryCorruption(format!(
                    "torn frame at {} in sealed segment {:020}",
                    torn_pos, base
                )));
            }
        }

        info!(
            base_offset = base,
            frames = count,
            index_entries = stored.index.len(),
            "Rebuilt segment index"
        );
        Ok(base + count)
    }

    fn check_checkpoint(&self, report: &RecoveryReport) {
        let path = self.dir.join(CHECKPOINT_FILE);
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return;
        };
        match serde_json::from_str::<Checkpoint>(&raw) {
            Ok(meta) if meta.last_offset >= report.next_offset => {
                warn!(
                    checkpoint_last_offset = meta.last_offset,
                    recovered_next_offset = report.next_offset,
                    "Advisory checkpoint claims more data than recovery found"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Ignoring unreadable checkpoint.meta"),
        }
    }

    /// Append framed values starting at `start_offset`, rotating segments
    /// as `segment_max_bytes` requires. Index entries follow the sparse
    /// policy: the first record of each segment plus every N-th.
    ///
    /// All-or-nothing: a mid-batch failure rolls the on-disk state back so
    /// no frame exists for an offset that was never returned to a producer.
    /// With `sync`, the active segment and index are fsynced before the
    /// batch is considered written (the `sync` fsync mode).
    pub(crate) fn append_batch(
        &mut self,
        values: &[Bytes],
        start_offset: u64,
        sync: bool,
    ) -> Result<AppendOutcome> {
        let segments_before = self.segments.len();
        let active_size_before = self.active().segment.size();

        let attempt = self.append_batch_inner(values, start_offset).and_then(|outcome| {
            if sync {
                self.sync_active()?;
            }
            Ok(outcome)
        });

        match attempt {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if let Err(rollback) =
                    self.rollback(segments_before, active_size_before, start_offset)
                {
                    warn!(error = %rollback, "Rollback of failed append left residue");
                }
                Err(e)
            }
        }
    }

    fn append_batch_inner(
        &mut self,
        values: &[Bytes],
        start_offset: u64,
    ) -> Result<AppendOutcome> {
        let mut outcome = AppendOutcome::default();
        let mut offset = start_offset;
        let mut i = 0;

        while i < values.len() {
            // Greedily chunk values that fit the active segment; rotation
            // only once the segment holds at least one frame.
            let active_size = self.active().segment.size();
            let mut projected = active_size;
            let mut end = i;
            while end < values.len() {
                let frame = FRAME_HEADER_LEN + values[end].len() as u64;
                if projected + frame > self.segment_max_bytes && projected > 0 {
                    break;
                }
                projected += frame;
                end += 1;
            }

            if end == i {
                self.rotate(offset)?;
                outcome.rotations += 1;
                continue;
            }

            let chunk = &values[i..end];
            let every = self.index_every_n;
            let active = self.active_mut();
            let positions = active.segment.append_batch(chunk)?;
            let base = active.segment.base_offset();
            for (j, &pos) in positions.iter().enumerate() {
                let abs = offset + j as u64;
                if (abs - base) % every == 0 {
                    active.index.append(abs, pos)?;
                }
            }

            outcome.bytes_written += projected - active_size;
            offset += chunk.len() as u64;
            i = end;
        }

        Ok(outcome)
    }

    /// Undo everything a failed `append_batch` wrote: drop segments created
    /// by its rotations and trim the original active segment and index.
    fn rollback(
        &mut self,
        segments_before: usize,
        active_size_before: u64,
        start_offset: u64,
    ) -> Result<()> {
        while self.segments.len() > segments_before {
            let stored = self.segments.pop().expect("len checked above");
            stored.segment.delete_file()?;
            stored.index.delete_file()?;
        }
        let active = self.active_mut();
        active.segment.unseal();
        active.segment.truncate(active_size_before)?;
        active.index.truncate_below(start_offset)?;
        Ok(())
    }

    /// Seal the active segment and start a new one at `next_base`.
    fn rotate(&mut self, next_base: u64) -> Result<()> {
        {
            let active = self.active_mut();
            active.segment.sync()?;
            active.index.sync()?;
            active.segment.seal();
        }
        let sealed_base = self.active().base();

        self.write_checkpoint(Checkpoint {
            last_sealed_base: sealed_base,
            last_offset: next_base.saturating_sub(1),
        });

        debug!(
            dir = %self.dir.display(),
            sealed_base,
            next_base,
            "Rotating segment"
        );
        EngineMetrics::increment_rotations();

        self.segments.push(StoredSegment {
            segment: Segment::open(&self.dir, next_base, self.segment_hard_limit)?,
            index: OffsetIndex::open(&self.dir, next_base)?,
        });
        Ok(())
    }

    /// Best-effort advisory checkpoint; failure is logged, never fatal.
    fn write_checkpoint(&self, meta: Checkpoint) {
        let path = self.dir.join(CHECKPOINT_FILE);
        let tmp = self.dir.join(format!("{}.tmp", CHECKPOINT_FILE));
        let result = serde_json::to_string(&meta)
            .map_err(std::io::Error::other)
            .and_then(|json| std::fs::write(&tmp, json))
            .and_then(|_| std::fs::rename(&tmp, &path));
        if let Err(e) = result {
            warn!(error = %e, "Failed to write advisory checkpoint");
        }
    }

    /// Stream records from `offset` until a limit or the end of the log.
    ///
    /// A torn frame encountered mid-read ends the read with what
    /// accumulated — consistent with what a future recovery would preserve.
    pub(crate) fn read_from(
        &self,
        offset: u64,
        max_msgs: usize,
        max_bytes: u64,
        next_offset: u64,
    ) -> Result<Vec<Record>> {
        if offset >= next_offset || max_msgs == 0 {
            return Ok(Vec::new());
        }
        let earliest = self.earliest_offset();
        if offset < earliest {
            return Err(Error::OffsetOutOfRange {
                offset,
                earliest,
                next: next_offset,
            });
        }

        let start = self
            .segments
            .partition_point(|s| s.base() <= offset)
            .saturating_sub(1);

        let mut out: Vec<Record> = Vec::new();
        let mut bytes = 0u64;

        for stored in self.segments.iter().skip(start) {
            let reader = stored.segment.reader()?;
            let (mut scan_offset, mut pos) = if stored.base() <= offset {
                stored.index.lookup(offset).unwrap_or((stored.base(), 0))
            } else {
                (stored.base(), 0)
            };

            loop {
                if out.len() >= max_msgs {
                    return Ok(out);
                }
                match reader.frame_at(pos) {
                    Ok(Some((payload, next))) => {
                        if scan_offset >= offset {
                            let frame = FRAME_HEADER_LEN + payload.len() as u64;
                            if !out.is_empty() && bytes + frame > max_bytes {
                                return Ok(out);
                            }
                            bytes += frame;
                            out.push(Record {
                                offset: scan_offset,
                                key: None,
                                value: payload,
                                timestamp: Utc::now(),
                            });
                        }
                        scan_offset += 1;
                        pos = next;
                    }
                    Ok(None) => break,
                    Err(Error::Torn(at)) => {
                        warn!(
                            base_offset = stored.base(),
                            pos = at,
                            "Torn frame during live read; returning truncated result"
                        );
                        return Ok(out);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(out)
    }

    /// Sync the active segment and index inline (`sync` fsync mode).
    pub(crate) fn sync_active(&self) -> Result<()> {
        let active = self.active();
        active.segment.sync()?;
        active.index.sync()?;
        Ok(())
    }

    /// Cloned handles for the group-commit task, so fsync runs without the
    /// partition's append lock.
    pub(crate) fn flush_handles(&self) -> Result<(File, File)> {
        let active = self.active();
        Ok((
            active.segment.try_clone_file()?,
            active.index.try_clone_file()?,
        ))
    }

    pub(crate) fn earliest_offset(&self) -> u64 {
        self.segments.first().map(|s| s.base()).unwrap_or(0)
    }

    /// Base offset of the active (last) segment.
    pub(crate) fn active_base(&self) -> u64 {
        self.active().base()
    }

    pub(crate) fn segment_count(&self) -> usize {
        self.segments.len()
    }

    fn active(&self) -> &StoredSegment {
        self.segments.last().expect("log always has an active segment")
    }

    fn active_mut(&mut self) -> &mut StoredSegment {
        self.segments.last_mut().expect("log always has an active segment")
    }
}

/// Count whole frames from `start_pos` to the end of the snapshot.
/// Returns `(frame_count, end_pos, torn_pos)`.
fn scan_frames(reader: &SegmentReader, start_pos: u64) -> Result<(u64, u64, Option<u64>)> {
    let mut count = 0u64;
    let mut pos = start_pos;
    loop {
        match reader.frame_at(pos) {
            Ok(Some((_, next))) => {
                count += 1;
                pos = next;
            }
            Ok(None) => return Ok((count, pos, None)),
            Err(Error::Torn(at)) => return Ok((count, at, Some(at))),
            Err(e) => return Err(e),
        }
    }
}

/// Number of leading index entries that point at whole frames in strictly
/// increasing offset order, starting at the segment's first record.
fn valid_index_prefix(
    index: &OffsetIndex,
    base: u64,
    reader: &SegmentReader,
) -> Result<usize> {
    let mut valid = 0usize;
    let mut prev: Option<u64> = None;
    for &(offset, pos) in index.entries() {
        if valid == 0 && offset != base {
            break;
        }
        if prev.is_some_and(|p| offset <= p) {
            break;
        }
        match reader.frame_at(pos) {
            Ok(Some(_)) => {}
            Ok(None) | Err(Error::Torn(_)) => break,
            Err(e) => return Err(e),
        }
        prev = Some(offset);
        valid += 1;
    }
    Ok(valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::segment::segment_path;
    use crate::storage::index::index_path;
    use tempfile::TempDir;

    fn test_config() -> Config {
        Config::default()
            .with_segment_max_bytes(1024)
            .with_index_every_n(3)
    }

    fn values(count: usize, len: usize) -> Vec<Bytes> {
        (0..count)
            .map(|i| Bytes::from(format!("{:0width$}", i, width = len)))
            .collect()
    }

    #[test]
    fn test_append_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let (mut log, report) = Log::open(dir.path(), &test_config()).unwrap();
        assert_eq!(report.next_offset, 0);

        let vals = values(10, 8);
        log.append_batch(&vals, 0, false).unwrap();

        let records = log.read_from(0, 100, u64::MAX, 10).unwrap();
        assert_eq!(records.len(), 10);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.offset, i as u64);
            assert_eq!(record.value, vals[i]);
        }

        // Mid-log read lands between sparse index entries
        let records = log.read_from(4, 2, u64::MAX, 10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offset, 4);
        assert_eq!(records[1].offset, 5);
    }

    #[test]
    fn test_rotation_at_segment_boundary() {
        let dir = TempDir::new().unwrap();
        let config = Config::default()
            .with_segment_max_bytes(16)
            .with_index_every_n(1);
        let (mut log, _) = Log::open(dir.path(), &config).unwrap();

        // 12-byte frames against a 16-byte budget: one frame per segment
        let outcome = log.append_batch(&values(10, 8), 0, false).unwrap();
        assert!(outcome.rotations >= 5, "got {} rotations", outcome.rotations);
        assert!(log.segment_count() >= 5);

        let records = log.read_from(0, 10, u64::MAX, 10).unwrap();
        assert_eq!(records.len(), 10);
        assert_eq!(records[9].offset, 9);
    }

    #[test]
    fn test_read_respects_max_bytes_but_returns_first() {
        let dir = TempDir::new().unwrap();
        let (mut log, _) = Log::open(dir.path(), &test_config()).unwrap();
        log.append_batch(&values(4, 100), 0, false).unwrap();

        // Budget below one frame still yields that frame
        let records = log.read_from(0, 10, 10, 4).unwrap();
        assert_eq!(records.len(), 1);

        let records = log.read_from(0, 10, 250, 4).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_recovery_truncates_torn_tail() {
        let dir = TempDir::new().unwrap();
        let config = test_config();
        {
            let (mut log, _) = Log::open(dir.path(), &config).unwrap();
            log.append_batch(&values(5, 8), 0, false).unwrap();
        }

        // Chop the last frame mid-payload: 5 frames of 12 bytes
        let seg = segment_path(dir.path(), 0);
        let file = std::fs::OpenOptions::new().write(true).open(&seg).unwrap();
        file.set_len(5 * 12 - 7).unwrap();
        drop(file);

        let (log, report) = Log::open(dir.path(), &config).unwrap();
        assert_eq!(report.next_offset, 4);
        assert!(report.truncated_bytes > 0);
        assert_eq!(std::fs::metadata(&seg).unwrap().len(), 4 * 12);

        let records = log.read_from(0, 100, u64::MAX, report.next_offset).unwrap();
        assert_eq!(records.len(), 4);
        drop(log);

        // Idempotent: a second recovery over the unchanged directory agrees
        let (log2, report2) = Log::open(dir.path(), &config).unwrap();
        assert_eq!(report2.next_offset, 4);
        assert_eq!(report2.truncated_bytes, 0);
        assert_eq!(log2.segment_count(), report.segment_count);
    }

    #[test]
    fn test_recovery_rebuilds_missing_index() {
        let dir = TempDir::new().unwrap();
        let config = test_config();
        {
            let (mut log, _) = Log::open(dir.path(), &config).unwrap();
            log.append_batch(&values(7, 8), 0, false).unwrap();
        }

        std::fs::remove_file(index_path(dir.path(), 0)).unwrap();

        let (log, report) = Log::open(dir.path(), &config).unwrap();
        assert!(report.rebuilt_index);
        assert_eq!(report.next_offset, 7);
        // Sparse rebuild: entries at relative offsets 0, 3, 6
        assert_eq!(
            std::fs::metadata(index_path(dir.path(), 0)).unwrap().len(),
            3 * 16
        );

        let records = log.read_from(5, 10, u64::MAX, 7).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offset, 5);
    }

    #[test]
    fn test_recovery_rejects_gap_in_bases() {
        let dir = TempDir::new().unwrap();
        // A partition whose first segment is not base 0 is corrupt
        std::fs::write(segment_path(dir.path(), 5), b"").unwrap();
        let err = Log::open(dir.path(), &test_config()).unwrap_err();
        assert!(matches!(err, Error::RecoveryCorruption(_)));
    }

    #[test]
    fn test_read_at_or_past_next_offset_is_empty() {
        let dir = TempDir::new().unwrap();
        let (mut log, _) = Log::open(dir.path(), &test_config()).unwrap();
        log.append_batch(&values(3, 8), 0, false).unwrap();

        assert!(log.read_from(3, 10, u64::MAX, 3).unwrap().is_empty());
        assert!(log.read_from(100, 10, u64::MAX, 3).unwrap().is_empty());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            // Offsets form [0, N) and payloads survive verbatim, regardless
            // of how the values are split into batches or across segments.
            #[test]
            fn prop_round_trip_across_batches(
                payloads in proptest::collection::vec(
                    proptest::collection::vec(any::<u8>(), 0..40),
                    1..25,
                ),
                split in 1usize..10,
            ) {
                let dir = TempDir::new().unwrap();
                let config = Config::default()
                    .with_segment_max_bytes(64)
                    .with_index_every_n(2);
                let (mut log, _) = Log::open(dir.path(), &config).unwrap();

                let all: Vec<Bytes> = payloads.iter().map(|p| Bytes::from(p.clone())).collect();
                let mut next = 0u64;
                for chunk in all.chunks(split) {
                    log.append_batch(chunk, next, false).unwrap();
                    next += chunk.len() as u64;
                }

                let records = log.read_from(0, all.len(), u64::MAX, next).unwrap();
                prop_assert_eq!(records.len(), all.len());
                for (i, record) in records.iter().enumerate() {
                    prop_assert_eq!(record.offset, i as u64);
                    prop_assert_eq!(&record.value, &all[i]);
                }
            }
        }
    }

    #[test]
    fn test_recovery_after_rotation() {
        let dir = TempDir::new().unwrap();
        let config = Config::default()
            .with_segment_max_bytes(30)
            .with_index_every_n(2);
        {
            let (mut log, _) = Log::open(dir.path(), &config).unwrap();
            // 12-byte frames: two per segment
            log.append_batch(&values(9, 8), 0, false).unwrap();
            assert!(log.segment_count() > 1);
        }

        let (log, report) = Log::open(dir.path(), &config).unwrap();
        assert_eq!(report.next_offset, 9);
        let records = log.read_from(0, 100, u64::MAX, 9).unwrap();
        assert_eq!(records.len(), 9);
        let offsets: Vec<u64> = records.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, (0..9).collect::<Vec<u64>>());
        drop(log);

        // Appends continue at the recovered offset
        let (mut log, _) = Log::open(dir.path(), &config).unwrap();
        log.append_batch(&values(1, 8), 9, false).unwrap();
        let records = log.read_from(9, 10, u64::MAX, 10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].offset, 9);
    }
}
