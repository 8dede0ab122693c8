//! The `LOCK` file held exclusively by the running session for a cache root
//! (spec §6 persisted cache layout): prevents two sessions from mutating
//! the same on-disk cache concurrently.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub struct CacheLock {
    path: PathBuf,
    _file: std::fs::File,
}

impl CacheLock {
    /// Acquires the lock, creating the cache root if it doesn't exist yet
    /// (spec §3 "Sessions create the cache root lazily").
    pub async fn acquire(cache_root: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(cache_root).await?;
        let path = cache_root.join("LOCK");
        let path_for_blocking = path.clone();

        let file = tokio::task::spawn_blocking(move || Self::acquire_blocking(&path_for_blocking))
            .await
            .map_err(|_| Error::Io)??;

        Ok(CacheLock { path, _file: file })
    }

    fn acquire_blocking(path: &Path) -> Result<std::fs::File> {
        let file =
            std::fs::OpenOptions::new().create(true).write(true).open(path).map_err(|_| Error::Io)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let fd = file.as_raw_fd();
            // SAFETY: fd is a valid, open file descriptor owned by `file`.
            let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
            if rc != 0 {
                return Err(Error::CacheCorrupt);
            }
        }

        Ok(file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_creates_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let lock = CacheLock::acquire(dir.path()).await.unwrap();
        assert!(tokio::fs::metadata(lock.path()).await.is_ok());
    }

    #[tokio::test]
    async fn second_acquire_in_same_process_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let _first = CacheLock::acquire(dir.path()).await.unwrap();
        // flock is per-open-file-description: a second independent open
        // in the same process still contends with the first, matching
        // the cross-process case the spec cares about.
        let second = CacheLock::acquire(dir.path()).await;
        assert!(second.is_err());
    }
}
