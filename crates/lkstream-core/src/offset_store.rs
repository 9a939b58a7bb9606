//! Durable consumer-group cursors.
//!
//! One file per `(group, topic, partition)` triple under
//! `{persist_dir}/offsets/`, holding the next offset to read as 8 bytes
//! `u64_be`. Commits are atomic: write a sibling temp file, fsync it,
//! rename over the final name, fsync the directory. A reader racing a
//! commit (or a crash mid-commit) observes the old value or the new one,
//! never a torn write.

use crate::{Error, Result};
use std::io;
use std::path::{Path, PathBuf};
use tokio::task;
use tracing::debug;

pub struct OffsetStore {
    dir: PathBuf,
}

impl OffsetStore {
    pub fn open(persist_dir: &Path) -> Result<Self> {
        let dir = persist_dir.join("offsets");
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn file_name(group: &str, topic: &str, partition: u32) -> String {
        format!("{}__{}__part{}.offset", group, topic, partition)
    }

    /// Durably record `offset` as the next offset for the triple.
    /// Last-writer-wins per file; no ordering across triples.
    pub async fn commit(&self, group: &str, topic: &str, partition: u32, offset: u64) -> Result<()> {
        let dir = self.dir.clone();
        let name = Self::file_name(group, topic, partition);

        task::spawn_blocking(move || -> io::Result<()> {
            let final_path = dir.join(&name);
            let tmp_path = dir.join(format!("{}.tmp", name));

            std::fs::write(&tmp_path, offset.to_be_bytes())?;
            // fsync the temp file before rename so the rename can never
            // expose a zero-length or partially written file.
            std::fs::File::open(&tmp_path)?.sync_all()?;
            std::fs::rename(&tmp_path, &final_path)?;
            // fsync the directory so the rename itself survives a crash.
            std::fs::File::open(&dir)?.sync_all()?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))??;

        debug!(group, topic, partition, offset, "Committed offset");
        Ok(())
    }

    /// The committed offset for the triple, or `None` before first commit.
    pub async fn read_committed(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> Result<Option<u64>> {
        let path = self.dir.join(Self::file_name(group, topic, partition));

        let value = task::spawn_blocking(move || -> io::Result<Option<u64>> {
            match std::fs::read(&path) {
                Ok(raw) => {
                    let bytes: [u8; 8] = raw.as_slice().try_into().map_err(|_| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("offset file {} holds {} bytes", path.display(), raw.len()),
                        )
                    })?;
                    Ok(Some(u64::from_be_bytes(bytes)))
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))??;

        Ok(value)
    }

    /// Consumer groups with at least one committed offset.
    pub async fn groups(&self) -> Result<Vec<String>> {
        let dir = self.dir.clone();
        let groups = task::spawn_blocking(move || -> io::Result<Vec<String>> {
            let mut groups = Vec::new();
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == "offset") {
                    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                        if let Some((group, _)) = name.split_once("__") {
                            groups.push(group.to_string());
                        }
                    }
                }
            }
            groups.sort_unstable();
            groups.dedup();
            Ok(groups)
        })
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))??;

        Ok(groups)
    }
}
