//! Per-open-file state machine on R (spec §4.5): `Closed → Opening →
//! Open(Cached) | Open(Streaming) → Closing → Closed`. Policy is fixed at
//! open time by the system-path predicate; `Open(Streaming) →
//! Open(Cached)` is never taken.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::rpc::ops::Handle as RpcHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileHandleState {
    Opening,
    OpenCached,
    OpenStreaming,
    Closing,
}

/// Backing state for a cached open: file contents already live in the
/// local blob store, so reads never touch the RPC client.
pub struct CachedBacking {
    pub data: Arc<Vec<u8>>,
}

/// Backing state for a streaming open: every read pipes through to the
/// upstream RPC handle on L (spec §4.5 "pass through... do not cache").
pub struct StreamingBacking {
    pub rpc_handle: RpcHandle,
    pub writable: bool,
}

pub enum Backing {
    Cached(CachedBacking),
    Streaming(StreamingBacking),
}

pub struct FuseFileHandle {
    state: Mutex<FileHandleState>,
    pub path: std::path::PathBuf,
    pub backing: Backing,
}

impl FuseFileHandle {
    fn new(path: std::path::PathBuf, backing: Backing) -> Self {
        FuseFileHandle { state: Mutex::new(FileHandleState::Opening), path, backing }
    }

    pub fn state(&self) -> FileHandleState {
        *self.state.lock()
    }

    /// Moves `Opening → Open(Cached)` or `Opening → Open(Streaming)`,
    /// whichever matches the backing this handle was constructed with.
    fn mark_open(&self) {
        let mut guard = self.state.lock();
        debug_assert_eq!(*guard, FileHandleState::Opening);
        *guard = match &self.backing {
            Backing::Cached(_) => FileHandleState::OpenCached,
            Backing::Streaming(_) => FileHandleState::OpenStreaming,
        };
    }

    /// `Open(*) → Closing`. Forbidden from `Opening` — a handle must finish
    /// opening before it can be asked to close.
    pub fn begin_close(&self) {
        let mut guard = self.state.lock();
        debug_assert_ne!(*guard, FileHandleState::Opening);
        *guard = FileHandleState::Closing;
    }
}

/// Table of open FUSE file handles for one mounted session, keyed by the
/// opaque `u64` the kernel is given back from `open`/`create`.
///
/// Grounded on [`crate::rpc::handle::HandleTable`] — same `DashMap` +
/// `AtomicU64` split, reused here one layer up the stack for the
/// kernel-visible handle instead of the RPC-visible one.
pub struct FuseHandleTable {
    handles: DashMap<u64, Arc<FuseFileHandle>>,
    next_fh: AtomicU64,
}

impl FuseHandleTable {
    pub fn new() -> Self {
        FuseHandleTable { handles: DashMap::new(), next_fh: AtomicU64::new(1) }
    }

    pub fn open_cached(&self, path: std::path::PathBuf, data: Arc<Vec<u8>>) -> u64 {
        let handle = Arc::new(FuseFileHandle::new(path, Backing::Cached(CachedBacking { data })));
        handle.mark_open();
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(fh, handle);
        fh
    }

    pub fn open_streaming(&self, path: std::path::PathBuf, rpc_handle: RpcHandle, writable: bool) -> u64 {
        let handle = Arc::new(FuseFileHandle::new(
            path,
            Backing::Streaming(StreamingBacking { rpc_handle, writable }),
        ));
        handle.mark_open();
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(fh, handle);
        fh
    }

    pub fn get(&self, fh: u64) -> Option<Arc<FuseFileHandle>> {
        self.handles.get(&fh).map(|e| e.clone())
    }

    pub fn close(&self, fh: u64) -> Option<Arc<FuseFileHandle>> {
        let (_, handle) = self.handles.remove(&fh)?;
        handle.begin_close();
        Some(handle)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for FuseHandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cached_open_lands_in_open_cached_state() {
        let table = FuseHandleTable::new();
        let fh = table.open_cached(std::path::PathBuf::from("/usr/bin/ffmpeg"), Arc::new(vec![1, 2, 3]));
        let handle = table.get(fh).unwrap();
        assert_eq!(handle.state(), FileHandleState::OpenCached);
    }

    #[test]
    fn streaming_open_lands_in_open_streaming_state() {
        let table = FuseHandleTable::new();
        let fh = table.open_streaming(std::path::PathBuf::from("/home/user/x"), RpcHandle(7), false);
        let handle = table.get(fh).unwrap();
        assert_eq!(handle.state(), FileHandleState::OpenStreaming);
    }

    #[test]
    fn close_removes_the_handle_and_moves_it_to_closing() {
        let table = FuseHandleTable::new();
        let fh = table.open_cached(std::path::PathBuf::from("/usr/bin/ffmpeg"), Arc::new(vec![]));
        let closed = table.close(fh).unwrap();
        assert_eq!(closed.state(), FileHandleState::Closing);
        assert!(table.get(fh).is_none());
    }
}
