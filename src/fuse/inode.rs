//! Inode ↔ path table (spec §3 "`ino_hint` is generated locally by R's FUSE
//! layer... per spec it is never put on the wire").
//!
//! The kernel needs small, stable `u64` inode numbers for the lifetime of a
//! mount; R's cache and RPC layers only ever know paths. This table is the
//! one place that bridges the two, entirely local to this session.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// FUSE reserves inode 1 for the mount root.
pub const ROOT_INO: u64 = 1;

/// Maps kernel inode numbers to L-absolute paths for one mounted session.
///
/// Grounded on [`crate::rpc::handle::HandleTable`]'s split of a `DashMap`
/// for lock-free lookup plus an `AtomicU64` counter for fresh ids — the
/// same shape, applied to inodes instead of open file handles.
pub struct InodeTable {
    by_ino: DashMap<u64, PathBuf>,
    by_path: DashMap<PathBuf, u64>,
    next_ino: AtomicU64,
}

impl InodeTable {
    pub fn new(root: PathBuf) -> Self {
        let table = InodeTable {
            by_ino: DashMap::new(),
            by_path: DashMap::new(),
            next_ino: AtomicU64::new(ROOT_INO + 1),
        };
        table.by_ino.insert(ROOT_INO, root.clone());
        table.by_path.insert(root, ROOT_INO);
        table
    }

    /// Returns the existing inode for `path`, or mints and remembers a new
    /// one. Inode numbers are stable for the life of the mount but carry no
    /// meaning across sessions.
    pub fn ino_for(&self, path: &Path) -> u64 {
        if let Some(existing) = self.by_path.get(path) {
            return *existing;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        self.by_path.insert(path.to_path_buf(), ino);
        self.by_ino.insert(ino, path.to_path_buf());
        ino
    }

    pub fn path_for(&self, ino: u64) -> Option<PathBuf> {
        self.by_ino.get(&ino).map(|p| p.clone())
    }

    /// Drops a path's inode binding. Safe to call speculatively: a future
    /// lookup simply mints a fresh inode, which is correct since POSIX does
    /// not guarantee inode reuse semantics across an unlink/recreate.
    pub fn forget(&self, ino: u64) {
        if let Some((_, path)) = self.by_ino.remove(&ino) {
            self.by_path.remove(&path);
        }
    }

    pub fn len(&self) -> usize {
        self.by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ino.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_path_maps_to_root_ino() {
        let table = InodeTable::new(PathBuf::from("/"));
        assert_eq!(table.ino_for(Path::new("/")), ROOT_INO);
        assert_eq!(table.path_for(ROOT_INO), Some(PathBuf::from("/")));
    }

    #[test]
    fn repeated_lookups_of_the_same_path_return_the_same_ino() {
        let table = InodeTable::new(PathBuf::from("/"));
        let a = table.ino_for(Path::new("/usr/bin/ffmpeg"));
        let b = table.ino_for(Path::new("/usr/bin/ffmpeg"));
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_paths_get_distinct_inos() {
        let table = InodeTable::new(PathBuf::from("/"));
        let a = table.ino_for(Path::new("/a"));
        let b = table.ino_for(Path::new("/b"));
        assert_ne!(a, b);
    }

    #[test]
    fn forget_allows_the_path_to_be_reassigned_a_fresh_ino() {
        let table = InodeTable::new(PathBuf::from("/"));
        let original = table.ino_for(Path::new("/tmp/x"));
        table.forget(original);
        assert!(table.path_for(original).is_none());
        let fresh = table.ino_for(Path::new("/tmp/x"));
        assert_ne!(fresh, original);
    }
}
