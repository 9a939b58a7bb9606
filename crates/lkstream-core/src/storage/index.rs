//! Offset index files.
//!
//! Each segment has a companion `{base_offset:020}.idx` of fixed 16-byte
//! entries `(offset: u64_be, pos: u64_be)` where `pos` is the byte position
//! of the frame's length header. Entries are strictly increasing by offset;
//! the index is sparse but always covers the segment's first record.

use crate::Result;
use bytes::{BufMut, BytesMut};
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub(crate) const INDEX_ENTRY_LEN: u64 = 16;

const INDEX_SUFFIX: &str = "idx";

pub(crate) fn index_path(dir: &Path, base_offset: u64) -> PathBuf {
    dir.join(format!("{:020}.{}", base_offset, INDEX_SUFFIX))
}

/// Append-only index with an in-memory mirror of its entries.
#[derive(Debug)]
pub(crate) struct OffsetIndex {
    path: PathBuf,
    file: File,
    entries: Vec<(u64, u64)>,
}

impl OffsetIndex {
    /// Open (or create) the index for `base_offset`, loading existing
    /// entries. A trailing partial entry is trimmed off.
    pub(crate) fn open(dir: &Path, base_offset: u64) -> Result<Self> {
        let path = index_path(dir, base_offset);
        let file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let whole = len - len % INDEX_ENTRY_LEN;
        if whole != len {
            file.set_len(whole)?;
        }

        let mut entries = Vec::with_capacity((whole / INDEX_ENTRY_LEN) as usize);
        if whole > 0 {
            // SAFETY: read-only map, bounds-checked below, file outlives it.
            let mmap = unsafe { Mmap::map(&file)? };
            let mut cursor = 0usize;
            while cursor + INDEX_ENTRY_LEN as usize <= whole as usize {
                let offset = u64::from_be_bytes(mmap[cursor..cursor + 8].try_into().unwrap());
                let pos = u64::from_be_bytes(mmap[cursor + 8..cursor + 16].try_into().unwrap());
                entries.push((offset, pos));
                cursor += INDEX_ENTRY_LEN as usize;
            }
        }

        Ok(Self { path, file, entries })
    }

    pub(crate) fn append(&mut self, offset: u64, pos: u64) -> Result<()> {
        debug_assert!(
            self.entries.last().map_or(true, |&(o, _)| o < offset),
            "index offsets must be strictly increasing"
        );
        let mut buf = BytesMut::with_capacity(INDEX_ENTRY_LEN as usize);
        buf.put_u64(offset);
        buf.put_u64(pos);
        self.file.write_all(&buf)?;
        self.entries.push((offset, pos));
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub(crate) fn try_clone_file(&self) -> Result<File> {
        Ok(self.file.try_clone()?)
    }

    /// Greatest entry with `offset <= target`, if any.
    pub(crate) fn lookup(&self, target: u64) -> Option<(u64, u64)> {
        let idx = self
            .entries
            .partition_point(|&(offset, _)| offset <= target)
            .checked_sub(1)?;
        Some(self.entries[idx])
    }

    pub(crate) fn last(&self) -> Option<(u64, u64)> {
        self.entries.last().copied()
    }

    pub(crate) fn entries(&self) -> &[(u64, u64)] {
        &self.entries
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keep only entries with `offset < first_discarded`, shrinking the file
    /// to match (entries are ordered, so this is a suffix chop).
    pub(crate) fn truncate_below(&mut self, first_discarded: u64) -> Result<()> {
        let keep = self.entries.partition_point(|&(offset, _)| offset < first_discarded);
        if keep == self.entries.len() {
            return Ok(());
        }
        self.entries.truncate(keep);
        self.file.set_len(keep as u64 * INDEX_ENTRY_LEN)?;
        Ok(())
    }

    /// Drop everything — used when recovery decides to rebuild from a scan.
    pub(crate) fn reset(&mut self) -> Result<()> {
        self.entries.clear();
        self.file.set_len(0)?;
        Ok(())
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the index file from disk. The index must not be used
    /// afterwards.
    pub(crate) fn delete_file(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}
