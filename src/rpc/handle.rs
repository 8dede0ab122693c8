//! Server-side table of open file handles (spec §4.2 "Handles are
//! connection-scoped").
//!
//! The teacher declares `dashmap` in an unused nested manifest and never
//! uses it in `src/`; this table's shape is grounded instead on
//! `cberner-fuser`'s `DashMap<Locale, ErrnoLocaleMapping>`
//! (`src/ll/errno.rs`) — a single concurrent map sharded internally, rather
//! than one `Mutex<HashMap>` per worker, so the bounded worker pool never
//! serializes on handle lookups.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::fs::File;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::rpc::ops::Handle;

/// `File` sits behind its own `tokio::sync::Mutex` rather than inside the
/// `DashMap`'s entry guard, so a reader can clone the `Arc` out, drop the
/// map guard, and only then hold the file lock across the actual I/O
/// `.await` — a `parking_lot`-backed map guard must never cross an await
/// point.
#[derive(Clone)]
pub struct OpenFile {
    pub path: PathBuf,
    pub file: Arc<Mutex<File>>,
    pub writable: bool,
}

/// One table per connection: handles never outlive the session that opened
/// them (spec §4.2), so a dropped connection drops its whole table and every
/// `File` in it closes along with it.
pub struct HandleTable {
    next: AtomicU64,
    open: DashMap<Handle, OpenFile>,
}

impl HandleTable {
    pub fn new() -> Self {
        HandleTable { next: AtomicU64::new(1), open: DashMap::new() }
    }

    pub fn insert(&self, path: PathBuf, file: File, writable: bool) -> Handle {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let handle = Handle(id);
        self.open.insert(handle, OpenFile { path, file: Arc::new(Mutex::new(file)), writable });
        handle
    }

    pub fn remove(&self, handle: Handle) -> Result<OpenFile> {
        self.open.remove(&handle).map(|(_, v)| v).ok_or(Error::BadHandle)
    }

    /// Clones the handle's entry out of the map. Cheap: an `Arc` clone plus
    /// a `PathBuf` clone, never a file-descriptor duplication.
    pub fn get(&self, handle: Handle) -> Result<OpenFile> {
        self.open.get(&handle).map(|entry| entry.clone()).ok_or(Error::BadHandle)
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_then_remove_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        tokio::fs::write(&path, b"hi").await.unwrap();
        let file = File::open(&path).await.unwrap();

        let table = HandleTable::new();
        let handle = table.insert(path.clone(), file, false);
        assert_eq!(table.len(), 1);

        let opened = table.remove(handle).unwrap();
        assert_eq!(opened.path, path);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn unknown_handle_is_bad_handle() {
        let table = HandleTable::new();
        assert_eq!(table.remove(Handle(999)), Err(Error::BadHandle));
    }
}
