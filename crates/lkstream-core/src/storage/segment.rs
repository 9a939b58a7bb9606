//! Framed segment files.
//!
//! A segment holds a contiguous offset range of one partition as a sequence
//! of frames, each `[u32_be len][len payload bytes]`. Offsets are implicit:
//! the first frame carries `base_offset`, every following frame the next
//! offset. Torn-write detection is length-based — a frame whose declared
//! length runs past end-of-file marks the recovery truncation point.

use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Bytes of the `u32_be` length header preceding every payload.
pub(crate) const FRAME_HEADER_LEN: u64 = 4;

const SEGMENT_SUFFIX: &str = "seg";

/// Fixed-width zero-padded decimal so lexical sort equals numeric sort.
pub(crate) fn segment_path(dir: &Path, base_offset: u64) -> PathBuf {
    dir.join(format!("{:020}.{}", base_offset, SEGMENT_SUFFIX))
}

/// Parse a `{base_offset:020}.seg` filename back to its base offset.
pub(crate) fn parse_segment_base(path: &Path) -> Option<u64> {
    if path.extension().is_some_and(|ext| ext == SEGMENT_SUFFIX) {
        path.file_stem()?.to_str()?.parse().ok()
    } else {
        None
    }
}

/// One segment file. Not thread-safe by itself; the partition serializes
/// appends and rotation.
#[derive(Debug)]
pub(crate) struct Segment {
    base_offset: u64,
    path: PathBuf,
    file: File,
    size: u64,
    sealed: bool,
    hard_limit: u64,
}

impl Segment {
    /// Open (or create) the segment for `base_offset` under `dir`.
    /// `hard_limit` of 0 disables the per-segment storage cap.
    pub(crate) fn open(dir: &Path, base_offset: u64, hard_limit: u64) -> Result<Self> {
        let path = segment_path(dir, base_offset);
        let file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            base_offset,
            path,
            file,
            size,
            sealed: false,
            hard_limit,
        })
    }

    pub(crate) fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Append one framed payload; returns the position of its length header.
    pub(crate) fn append(&mut self, payload: &[u8]) -> Result<u64> {
        let payload = Bytes::copy_from_slice(payload);
        let positions = self.append_batch(std::slice::from_ref(&payload))?;
        Ok(positions[0])
    }

    /// Append a batch of framed payloads with a single write syscall.
    /// Buffered, non-durable; `sync()` establishes durability.
    pub(crate) fn append_batch(&mut self, payloads: &[Bytes]) -> Result<Vec<u64>> {
        debug_assert!(!self.sealed, "append to sealed segment");
        if payloads.is_empty() {
            return Ok(Vec::new());
        }

        let total: u64 = payloads
            .iter()
            .map(|p| FRAME_HEADER_LEN + p.len() as u64)
            .sum();
        if self.hard_limit != 0 && self.size + total > self.hard_limit {
            return Err(Error::StorageFull);
        }

        let mut positions = Vec::with_capacity(payloads.len());
        let mut buf = BytesMut::with_capacity(total as usize);
        for payload in payloads {
            positions.push(self.size + buf.len() as u64);
            buf.put_u32(payload.len() as u32);
            buf.put_slice(payload);
        }

        self.file.write_all(&buf)?;
        self.size += total;
        Ok(positions)
    }

    /// Flush OS buffers to stable storage.
    pub(crate) fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Clone the underlying handle so the group-commit task can sync without
    /// holding the partition's append lock.
    pub(crate) fn try_clone_file(&self) -> Result<File> {
        Ok(self.file.try_clone()?)
    }

    /// Mark read-only. The active segment becomes sealed at rotation.
    pub(crate) fn seal(&mut self) {
        self.sealed = true;
    }

    /// Re-open for appends; used when a failed batch rolls a rotation back.
    pub(crate) fn unseal(&mut self) {
        self.sealed = false;
    }

    /// Remove the segment file from disk. The segment must not be used
    /// afterwards.
    pub(crate) fn delete_file(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    /// Discard everything at and after `len` (recovery of a torn tail).
    pub(crate) fn truncate(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.size = len;
        Ok(())
    }

    /// Immutable byte snapshot for reads and recovery scans. Appends after
    /// the snapshot are simply not visible through it.
    pub(crate) fn reader(&self) -> Result<SegmentReader> {
        SegmentReader::open(&self.path)
    }
}

/// Memory-mapped snapshot of a segment file.
#[derive(Debug)]
pub(crate) struct SegmentReader {
    mmap: Option<Mmap>,
    len: u64,
}

impl SegmentReader {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        // SAFETY: the file is opened read-only and outlives the map; all
        // accesses below are bounds-checked against `len`.
        let mmap = if len == 0 {
            None
        } else {
            Some(unsafe { Mmap::map(&file)? })
        };
        Ok(Self { mmap, len })
    }

    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    /// Read the frame whose length header starts at `pos`.
    ///
    /// Returns `Ok(None)` at the clean end of the snapshot, `Err(Torn)` when
    /// a partial header or a declared length past end-of-file is found.
    pub(crate) fn frame_at(&self, pos: u64) -> Result<Option<(Bytes, u64)>> {
        if pos >= self.len {
            return Ok(None);
        }
        let mmap = match &self.mmap {
            Some(m) => m,
            None => return Ok(None),
        };
        if pos + FRAME_HEADER_LEN > self.len {
            return Err(Error::Torn(pos));
        }

        let start = pos as usize;
        let header: [u8; 4] = mmap[start..start + 4].try_into().unwrap();
        let declared = u32::from_be_bytes(header) as u64;
        if pos + FRAME_HEADER_LEN + declared > self.len {
            return Err(Error::Torn(pos));
        }

        let body_start = start + 4;
        let payload = Bytes::copy_from_slice(&mmap[body_start..body_start + declared as usize]);
        Ok(Some((payload, pos + FRAME_HEADER_LEN + declared)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_read_frames() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::open(dir.path(), 0, 0).unwrap();

        let payloads = vec![Bytes::from("first"), Bytes::from("second"), Bytes::from("")];
        let positions = segment.append_batch(&payloads).unwrap();
        assert_eq!(positions, vec![0, 9, 19]);
        assert_eq!(segment.size(), 23);

        let reader = segment.reader().unwrap();
        let (payload, next) = reader.frame_at(0).unwrap().unwrap();
        assert_eq!(payload, Bytes::from("first"));
        assert_eq!(next, 9);
        let (payload, next) = reader.frame_at(next).unwrap().unwrap();
        assert_eq!(payload, Bytes::from("second"));
        let (payload, next) = reader.frame_at(next).unwrap().unwrap();
        assert!(payload.is_empty());
        assert!(reader.frame_at(next).unwrap().is_none());
    }

    #[test]
    fn test_torn_frame_detected() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::open(dir.path(), 0, 0).unwrap();
        segment.append(b"payload").unwrap();
        segment.append(b"doomed").unwrap();

        // Chop the second frame mid-payload
        segment.truncate(11 + 3).unwrap();

        let reader = segment.reader().unwrap();
        let (_, next) = reader.frame_at(0).unwrap().unwrap();
        assert!(matches!(reader.frame_at(next), Err(Error::Torn(p)) if p == next));
    }

    #[test]
    fn test_partial_header_is_torn() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::open(dir.path(), 0, 0).unwrap();
        segment.append(b"x").unwrap();
        segment.append(b"y").unwrap();
        segment.truncate(5 + 2).unwrap();

        let reader = segment.reader().unwrap();
        let (_, next) = reader.frame_at(0).unwrap().unwrap();
        assert!(matches!(reader.frame_at(next), Err(Error::Torn(_))));
    }

    #[test]
    fn test_storage_cap() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::open(dir.path(), 0, 16).unwrap();
        segment.append(b"12345678").unwrap();
        assert!(matches!(segment.append(b"overflow"), Err(Error::StorageFull)));
    }

    #[test]
    fn test_reopen_preserves_size() {
        let dir = TempDir::new().unwrap();
        {
            let mut segment = Segment::open(dir.path(), 42, 0).unwrap();
            segment.append(b"abc").unwrap();
        }
        let segment = Segment::open(dir.path(), 42, 0).unwrap();
        assert_eq!(segment.base_offset(), 42);
        assert_eq!(segment.size(), 7);
    }

    #[test]
    fn test_filename_round_trip() {
        let path = segment_path(Path::new("/tmp/p"), 1234);
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "00000000000000001234.seg"
        );
        assert_eq!(parse_segment_base(&path), Some(1234));
        assert_eq!(parse_segment_base(Path::new("junk.idx")), None);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Arbitrary file contents must never panic the frame reader —
            // every outcome is a frame, a clean end, or a torn signal.
            #[test]
            fn prop_frame_at_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
                let dir = TempDir::new().unwrap();
                let path = dir.path().join("fuzz.seg");
                std::fs::write(&path, &data).unwrap();

                let reader = SegmentReader::open(&path).unwrap();
                let mut pos = 0u64;
                loop {
                    match reader.frame_at(pos) {
                        Ok(Some((_, next))) => {
                            prop_assert!(next > pos);
                            pos = next;
                        }
                        Ok(None) => break,
                        Err(Error::Torn(at)) => {
                            prop_assert!(at <= data.len() as u64);
                            break;
                        }
                        Err(e) => return Err(TestCaseError::fail(format!("unexpected: {e}"))),
                    }
                }
            }
        }
    }
}
