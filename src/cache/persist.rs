//! On-disk persistence of the metadata index (spec §6): an append-only
//! `meta.idx` log plus a periodic compacted `meta.snap` snapshot, tolerant
//! of a crash mid-append.
//!
//! Each record is `u32 length | u32 crc32 | bincode(CacheEntry)`. A record
//! whose checksum fails on replay is discarded and replay stops there,
//! rolling back to the last consistent state — exactly the truncation
//! tolerance the wire codec's frame reader gives the RPC connection in
//! [`crate::codec::frame`], reused here for a file instead of a socket.
//! The checksum itself uses `crc32fast`, grounded on `proxmox-backup`'s use
//! of the same crate for its on-disk chunk/blob checksums
//! (`pbs-datastore/src/checksum_writer.rs`, `src/backup/data_blob.rs`) —
//! the repo this module's atomic-rename blob-write idiom is also drawn
//! from.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::cache::entry::CacheEntry;
use crate::error::{Error, Result};

fn crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

pub struct MetaLog {
    idx_path: PathBuf,
    snap_path: PathBuf,
}

impl MetaLog {
    pub fn new(cache_root: &Path) -> Self {
        MetaLog { idx_path: cache_root.join("meta.idx"), snap_path: cache_root.join("meta.snap") }
    }

    pub async fn append(&self, entry: &CacheEntry) -> Result<()> {
        let record = bincode::serialize(entry).map_err(|_| Error::CacheCorrupt)?;
        let checksum = crc32(&record);

        let mut file =
            OpenOptions::new().create(true).append(true).open(&self.idx_path).await?;
        file.write_u32_le(record.len() as u32).await?;
        file.write_u32_le(checksum).await?;
        file.write_all(&record).await?;
        file.flush().await?;
        Ok(())
    }

    /// Replays `meta.snap` (if present) followed by `meta.idx`, discarding
    /// any trailing record that fails its checksum (spec §8 scenario 6).
    pub async fn replay(&self) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        if let Ok(mut file) = File::open(&self.snap_path).await {
            Self::replay_stream(&mut file, &mut entries).await?;
        }
        if let Ok(mut file) = File::open(&self.idx_path).await {
            Self::replay_stream(&mut file, &mut entries).await?;
        }
        Ok(entries)
    }

    async fn replay_stream(file: &mut File, out: &mut Vec<CacheEntry>) -> Result<()> {
        loop {
            let len = match file.read_u32_le().await {
                Ok(v) => v,
                Err(_) => return Ok(()),
            };
            let expected_crc = match file.read_u32_le().await {
                Ok(v) => v,
                Err(_) => return Ok(()),
            };
            let mut buf = vec![0u8; len as usize];
            if file.read_exact(&mut buf).await.is_err() {
                return Ok(());
            }
            if crc32(&buf) != expected_crc {
                return Ok(());
            }
            match bincode::deserialize::<CacheEntry>(&buf) {
                Ok(entry) => out.push(entry),
                Err(_) => return Ok(()),
            }
        }
    }

    /// Compacts the current entry set into a fresh `meta.snap` and truncates
    /// `meta.idx`, so replay after a long session doesn't have to walk every
    /// historical append.
    pub async fn compact(&self, entries: &[CacheEntry]) -> Result<()> {
        let tmp_path = self.snap_path.with_extension("snap.tmp");
        {
            let mut tmp = File::create(&tmp_path).await?;
            for entry in entries {
                let record = bincode::serialize(entry).map_err(|_| Error::CacheCorrupt)?;
                let checksum = crc32(&record);
                tmp.write_u32_le(record.len() as u32).await?;
                tmp.write_u32_le(checksum).await?;
                tmp.write_all(&record).await?;
            }
            tmp.sync_all().await?;
        }
        tokio::fs::rename(&tmp_path, &self.snap_path).await?;
        File::create(&self.idx_path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::{CacheKey, NegativeError, Payload};
    use std::path::PathBuf;

    fn sample(path: &str) -> CacheEntry {
        CacheEntry {
            key: CacheKey::Attr(PathBuf::from(path)),
            payload: Payload::Negative(NegativeError::NotFound),
            validator: None,
            last_use: 1,
            bytes_on_disk: 0,
        }
    }

    #[tokio::test]
    async fn append_then_replay_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let log = MetaLog::new(dir.path());
        log.append(&sample("/a")).await.unwrap();
        log.append(&sample("/b")).await.unwrap();

        let replayed = log.replay().await.unwrap();
        assert_eq!(replayed.len(), 2);
    }

    #[tokio::test]
    async fn truncated_trailing_record_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let log = MetaLog::new(dir.path());
        log.append(&sample("/a")).await.unwrap();
        log.append(&sample("/b")).await.unwrap();

        // Simulate a crash mid-append: chop the last few bytes off the log.
        let bytes = tokio::fs::read(&log.idx_path).await.unwrap();
        let truncated = &bytes[..bytes.len() - 3];
        tokio::fs::write(&log.idx_path, truncated).await.unwrap();

        let replayed = log.replay().await.unwrap();
        assert_eq!(replayed.len(), 1);
    }

    #[tokio::test]
    async fn compact_then_replay_preserves_entries_and_empties_idx() {
        let dir = tempfile::tempdir().unwrap();
        let log = MetaLog::new(dir.path());
        log.append(&sample("/a")).await.unwrap();

        log.compact(&[sample("/a"), sample("/b")]).await.unwrap();
        let replayed = log.replay().await.unwrap();
        assert_eq!(replayed.len(), 2);

        let idx_len = tokio::fs::metadata(&log.idx_path).await.unwrap().len();
        assert_eq!(idx_len, 0);
    }
}
