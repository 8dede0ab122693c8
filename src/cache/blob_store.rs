//! Content-addressed blob storage under `<cache_root>/blobs/<hh>/<hash>`
//! (spec §6 persisted cache layout).
//!
//! Writes are temp-file-then-rename onto a unique hash-named target, so
//! concurrent writers of the same content converge without any lock: the
//! loser's temp file is simply unlinked after losing the rename race (spec
//! §4.4, §5 "Blob disk writes").

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::types::ContentHash;

pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(cache_root: &Path) -> Self {
        BlobStore { root: cache_root.join("blobs") }
    }

    pub fn path_for(&self, hash: ContentHash) -> PathBuf {
        self.root.join(hash.shard()).join(hash.to_hex())
    }

    pub async fn contains(&self, hash: ContentHash) -> bool {
        tokio::fs::metadata(self.path_for(hash)).await.is_ok()
    }

    pub async fn read(&self, hash: ContentHash) -> Result<Vec<u8>> {
        tokio::fs::read(self.path_for(hash)).await.map_err(Error::from)
    }

    /// Writes `data` (already validated against `hash` by the caller) under
    /// its content-addressed path. A concurrent writer racing the same hash
    /// converges: both produce byte-identical content, so whichever rename
    /// wins is correct and the loser's temp file is unlinked.
    pub async fn write(&self, hash: ContentHash, data: &[u8]) -> Result<u64> {
        let final_path = self.path_for(hash);
        if tokio::fs::metadata(&final_path).await.is_ok() {
            return Ok(data.len() as u64);
        }
        let shard_dir = self.root.join(hash.shard());
        tokio::fs::create_dir_all(&shard_dir).await?;

        let tmp_path = shard_dir.join(format!(".tmp-{}-{}", hash.to_hex(), std::process::id()));
        {
            let mut tmp = tokio::fs::File::create(&tmp_path).await?;
            tmp.write_all(data).await?;
            tmp.sync_all().await?;
        }
        match tokio::fs::rename(&tmp_path, &final_path).await {
            Ok(()) => Ok(data.len() as u64),
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                if final_path.exists() {
                    Ok(data.len() as u64)
                } else {
                    Err(Error::from(e))
                }
            }
        }
    }

    pub async fn remove(&self, hash: ContentHash) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(hash)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }

    /// Scans for and removes leftover `.tmp-*` files from a crash between
    /// write and rename (spec §8 scenario 6 "orphan temp file is cleaned at
    /// startup").
    pub async fn clean_orphan_temp_files(&self) -> Result<usize> {
        let mut removed = 0;
        let mut shards = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::from(e)),
        };
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut files = tokio::fs::read_dir(shard.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let name = file.file_name();
                if name.to_string_lossy().starts_with(".tmp-") {
                    tokio::fs::remove_file(file.path()).await?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let data = b"hello outrun".to_vec();
        let hash = ContentHash::of(&data);

        store.write(hash, &data).await.unwrap();
        assert!(store.contains(hash).await);
        let read_back = store.read(hash).await.unwrap();
        assert_eq!(read_back, data);
    }

    #[tokio::test]
    async fn concurrent_writers_of_same_hash_converge() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(BlobStore::new(dir.path()));
        let data = b"same content".to_vec();
        let hash = ContentHash::of(&data);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let data = data.clone();
            tasks.push(tokio::spawn(async move { store.write(hash, &data).await }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(store.read(hash).await.unwrap(), data);
    }

    #[tokio::test]
    async fn clean_orphan_temp_files_removes_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let shard_dir = dir.path().join("blobs").join("ab");
        tokio::fs::create_dir_all(&shard_dir).await.unwrap();
        tokio::fs::write(shard_dir.join(".tmp-abc-1"), b"partial").await.unwrap();

        let removed = store.clean_orphan_temp_files().await.unwrap();
        assert_eq!(removed, 1);
        assert!(tokio::fs::metadata(shard_dir.join(".tmp-abc-1")).await.is_err());
    }
}
