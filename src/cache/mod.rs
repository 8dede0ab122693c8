//! Persistent cache (spec §4.4): the component that ties together the
//! metadata [`index`], the content-addressed [`blob_store`], the on-disk
//! [`persist`]ed log, the exclusive root [`lock`], the [`system_paths`]
//! predicate and the [`single_flight`] dedup gate into the one object the
//! FUSE filesystem talks to.

pub mod blob_store;
pub mod entry;
pub mod index;
pub mod lock;
pub mod persist;
pub mod single_flight;
pub mod system_paths;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::cache::blob_store::BlobStore;
use crate::cache::entry::{CacheEntry, CacheKey, NegativeError, NegativeOp, Payload};
use crate::cache::index::{Caps, Index};
use crate::cache::lock::CacheLock;
use crate::cache::persist::MetaLog;
use crate::cache::single_flight::SingleFlight;
use crate::cache::system_paths::SystemPaths;
use crate::error::{Error, Result};
use crate::types::{Attributes, ContentHash, DirEntry, Validator};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub root: PathBuf,
    pub max_entries: usize,
    pub max_size: u64,
    pub system_path_prefixes: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            root: default_cache_root(),
            max_entries: 1024,
            max_size: 20 * 1024 * 1024 * 1024,
            system_path_prefixes: system_paths::default_prefixes(),
        }
    }
}

fn default_cache_root() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".outrun/cache"),
        None => PathBuf::from("/tmp/outrun/cache"),
    }
}

/// How many times the same key may hit [`Error::CacheCorrupt`] in one
/// session before the whole cache is marked degraded (spec §7).
const CORRUPT_STRIKES_BEFORE_DEGRADED: u32 = 2;

/// The persistent cache for one R-side session (spec §3 `CacheEntry`, §4.4).
pub struct Cache {
    index: Index,
    blobs: BlobStore,
    meta_log: MetaLog,
    _lock: CacheLock,
    system_paths: SystemPaths,
    caps: Caps,
    blob_single_flight: SingleFlight<ContentHash, Vec<u8>>,
    corrupt_strikes: DashMap<CacheKey, u32>,
    degraded: AtomicBool,
    root_version: Mutex<Option<i64>>,
    dirty_since_compact: AtomicU32,
    /// Keys revalidated against L at least once in the running session
    /// (spec §4.4 "On first use in a new session a system-path entry is
    /// revalidated"). A key loaded fresh this session (inserted after
    /// `set_root_version`) is pre-marked so the revalidation round-trip
    /// only ever hits entries that survived from an earlier session.
    validated_this_session: DashMap<CacheKey, ()>,
}

impl Cache {
    /// Opens (creating if absent) the cache root, acquires its exclusive
    /// lock, cleans orphaned blob temp files left by a crash, and replays
    /// the metadata log back into memory (spec §3 "Sessions create the
    /// cache root lazily", §8 scenario 6).
    pub async fn open(config: CacheConfig) -> Result<Self> {
        let lock = CacheLock::acquire(&config.root).await?;
        let blobs = BlobStore::new(&config.root);
        let orphaned = blobs.clean_orphan_temp_files().await?;
        if orphaned > 0 {
            warn!(orphaned, "cleaned orphan blob temp files from a previous crash");
        }

        let meta_log = MetaLog::new(&config.root);
        let index = Index::new();
        let caps = Caps { max_entries: config.max_entries, max_size: config.max_size };
        let loaded = meta_log.replay().await?;
        debug!(count = loaded.len(), "replayed persisted cache index");
        index.insert_many(loaded, caps);

        Ok(Cache {
            index,
            blobs,
            meta_log,
            _lock: lock,
            system_paths: SystemPaths::new(config.system_path_prefixes),
            caps,
            blob_single_flight: SingleFlight::new(),
            corrupt_strikes: DashMap::new(),
            degraded: AtomicBool::new(false),
            root_version: Mutex::new(None),
            dirty_since_compact: AtomicU32::new(0),
            validated_this_session: DashMap::new(),
        })
    }

    pub fn is_system_path(&self, path: &Path) -> bool {
        self.system_paths.is_system_path(path)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Captures the `L_root_version` stamp a session observes at handshake,
    /// used to decide whether a persisted entry needs revalidation (spec
    /// §4.4 "Coherence model").
    pub fn set_root_version(&self, version: i64) {
        *self.root_version.lock().unwrap() = Some(version);
    }

    pub fn root_version(&self) -> Option<i64> {
        *self.root_version.lock().unwrap()
    }

    /// Records a [`Error::CacheCorrupt`] observation for `key`. Once a key
    /// has struck twice in a session the whole cache is marked degraded and
    /// every further lookup misses, falling back to a live RPC (spec §7).
    pub fn note_corrupt(&self, key: &CacheKey) -> bool {
        let mut strikes = self.corrupt_strikes.entry(key.clone()).or_insert(0);
        *strikes += 1;
        if *strikes >= CORRUPT_STRIKES_BEFORE_DEGRADED {
            self.degraded.store(true, Ordering::Relaxed);
            warn!(?key, "cache marked degraded after repeated corruption");
            true
        } else {
            false
        }
    }

    fn cacheable(&self, path: &Path) -> bool {
        !self.is_degraded() && self.system_paths.is_system_path(path)
    }

    /// Drops a single entry, used by FUSE mutation handlers (`unlink`,
    /// `rename`, a write that lands on a previously cached path) so a stale
    /// attr/dirlist/negative entry doesn't outlive the write that
    /// invalidated it.
    pub fn invalidate(&self, key: &CacheKey) {
        self.index.remove(key);
    }

    /// Returns the blob hash an `attr` entry references, if any, without
    /// touching the blob store itself — the `open` handler's fast path for
    /// deciding whether a system path's contents are already on disk.
    pub fn lookup_blob_hash_for(&self, path: &Path) -> Option<ContentHash> {
        if !self.cacheable(path) {
            return None;
        }
        match self.index.get(&CacheKey::Attr(path.to_path_buf()))?.payload {
            Payload::Attr { blob_hash, .. } => blob_hash,
            _ => None,
        }
    }

    // -- lookups -------------------------------------------------------------

    pub fn lookup_attr(&self, path: &Path) -> Option<(Attributes, Option<Validator>)> {
        if !self.cacheable(path) {
            return None;
        }
        let entry = self.index.get(&CacheKey::Attr(path.to_path_buf()))?;
        match entry.payload {
            Payload::Attr { attr, .. } => Some((attr, entry.validator)),
            _ => None,
        }
    }

    pub fn lookup_dirlist(&self, path: &Path) -> Option<(Vec<DirEntry>, Option<Validator>)> {
        if !self.cacheable(path) {
            return None;
        }
        let entry = self.index.get(&CacheKey::DirList(path.to_path_buf()))?;
        match entry.payload {
            Payload::DirList(entries) => Some((entries, entry.validator)),
            _ => None,
        }
    }

    pub fn lookup_readlink(&self, path: &Path) -> Option<(String, Option<Validator>)> {
        if !self.cacheable(path) {
            return None;
        }
        let entry = self.index.get(&CacheKey::ReadLink(path.to_path_buf()))?;
        match entry.payload {
            Payload::ReadLink(target) => Some((target, entry.validator)),
            _ => None,
        }
    }

    /// A cache hit on a `negative(path, op)` entry (spec P6).
    pub fn lookup_negative(&self, path: &Path, op: NegativeOp) -> Option<Error> {
        if !self.cacheable(path) {
            return None;
        }
        match self.index.get(&CacheKey::Negative(path.to_path_buf(), op))?.payload {
            Payload::Negative(err) => Some(err.to_error()),
            _ => None,
        }
    }

    pub async fn lookup_blob(&self, hash: ContentHash) -> Option<Vec<u8>> {
        if self.is_degraded() || !self.index.contains(&CacheKey::Blob(hash)) {
            return None;
        }
        self.blobs.read(hash).await.ok()
    }

    // -- inserts ---------------------------------------------------------------

    /// Inserts an `attr` entry. A no-op for paths outside the system-path
    /// prefixes, since user paths are never cached beyond a single request
    /// (spec §4.4) — callers don't need their own system-path branch before
    /// calling this.
    pub async fn insert_attr(
        &self,
        path: &Path,
        attr: Attributes,
        validator: Validator,
        blob_hash: Option<ContentHash>,
    ) {
        if !self.system_paths.is_system_path(path) {
            return;
        }
        self.persist_insert(CacheEntry {
            key: CacheKey::Attr(path.to_path_buf()),
            payload: Payload::Attr { attr, blob_hash },
            validator: Some(validator),
            last_use: 0,
            bytes_on_disk: 0,
        })
        .await;
    }

    pub async fn insert_dirlist(&self, path: &Path, entries: Vec<DirEntry>, validator: Validator) {
        if !self.system_paths.is_system_path(path) {
            return;
        }
        self.persist_insert(CacheEntry {
            key: CacheKey::DirList(path.to_path_buf()),
            payload: Payload::DirList(entries),
            validator: Some(validator),
            last_use: 0,
            bytes_on_disk: 0,
        })
        .await;
    }

    pub async fn insert_readlink(&self, path: &Path, target: String, validator: Validator) {
        if !self.system_paths.is_system_path(path) {
            return;
        }
        self.persist_insert(CacheEntry {
            key: CacheKey::ReadLink(path.to_path_buf()),
            payload: Payload::ReadLink(target),
            validator: Some(validator),
            last_use: 0,
            bytes_on_disk: 0,
        })
        .await;
    }

    /// Inserts a negative entry for `(path, op)` — first-class per spec §3,
    /// eligible even where the positive case wouldn't apply (e.g. a missing
    /// `.pyc` companion under a system path).
    pub async fn insert_negative(&self, path: &Path, op: NegativeOp, err: Error) {
        if !self.system_paths.is_system_path(path) {
            return;
        }
        let Some(negative) = NegativeError::from_error(err) else { return };
        self.persist_insert(CacheEntry {
            key: CacheKey::Negative(path.to_path_buf(), op),
            payload: Payload::Negative(negative),
            validator: None,
            last_use: 0,
            bytes_on_disk: 0,
        })
        .await;
    }

    /// Writes a blob and inserts its referencing `attr` entry atomically
    /// with respect to eviction, via [`Index::insert_many`]: both land in
    /// the index before `evict_to_caps` ever runs, so the blob is never
    /// visible as an orphan in the window between the two inserts (spec
    /// §4.4). A no-op attr insert (and the blob is left unreferenced) for
    /// paths outside the system-path prefixes, matching [`Self::insert_attr`].
    pub async fn insert_blob_with_attr(
        &self,
        path: &Path,
        data: &[u8],
        attr: Attributes,
        validator: Validator,
    ) -> Result<ContentHash> {
        let hash = ContentHash::of(data);
        let bytes_on_disk = self.blobs.write(hash, data).await?;
        let blob_entry = CacheEntry {
            key: CacheKey::Blob(hash),
            payload: Payload::Blob,
            validator: None,
            last_use: 0,
            bytes_on_disk,
        };
        if !self.system_paths.is_system_path(path) {
            self.persist_insert(blob_entry).await;
            return Ok(hash);
        }
        let attr_entry = CacheEntry {
            key: CacheKey::Attr(path.to_path_buf()),
            payload: Payload::Attr { attr, blob_hash: Some(hash) },
            validator: Some(validator),
            last_use: 0,
            bytes_on_disk: 0,
        };
        self.persist_insert_many(vec![blob_entry, attr_entry]).await;
        Ok(hash)
    }

    async fn persist_insert(&self, entry: CacheEntry) {
        self.persist_insert_many(vec![entry]).await;
    }

    /// Inserts several entries atomically with respect to eviction (see
    /// [`Index::insert_many`]), then reacts to whatever the single combined
    /// eviction pass evicted and appends every inserted entry to the meta
    /// log.
    async fn persist_insert_many(&self, entries: Vec<CacheEntry>) {
        // Every insert is data just observed live from L in this session, so
        // it needs no further revalidation until the *next* session.
        for entry in &entries {
            self.validated_this_session.insert(entry.key.clone(), ());
        }
        let evicted = self.index.insert_many(entries.clone(), self.caps);
        for victim in &evicted {
            if let CacheKey::Blob(hash) = victim.key {
                if let Err(err) = self.blobs.remove(hash).await {
                    warn!(?err, "failed to remove evicted blob");
                }
            }
        }
        for entry in &entries {
            if let Err(err) = self.meta_log.append(entry).await {
                warn!(?err, "failed to append cache entry to meta log");
            }
        }
        self.dirty_since_compact.fetch_add(entries.len() as u32, Ordering::Relaxed);
    }

    /// Revalidates a persisted entry's [`Validator`] against a freshly
    /// observed one. A mismatch invalidates the entry and returns `false`
    /// (spec §4.4 coherence model, P8).
    pub fn revalidate(&self, key: &CacheKey, fresh: Validator) -> bool {
        let Some(entry) = self.index.get(key) else { return true };
        match entry.validator {
            Some(stored) if stored == fresh => true,
            _ => {
                self.index.remove(key);
                false
            }
        }
    }

    /// True the first time `key` is consulted in the running session,
    /// false on every subsequent call — a system path is treated as
    /// immutable for the rest of the session once its first use has
    /// bundled a revalidation (spec §4.4 "On first use in a new session...",
    /// "Within a session, system paths are treated as immutable").
    ///
    /// A key is pre-marked validated at insert time when it is inserted
    /// *after* [`Self::set_root_version`] has run for this session, since
    /// such an entry was just fetched live from L and needs no further
    /// check against itself.
    pub fn needs_revalidation(&self, key: &CacheKey) -> bool {
        self.validated_this_session.insert(key.clone(), ()).is_none()
    }

    /// Marks `key` validated without performing the check — used once a
    /// caller has already fetched a fresh attribute record for other
    /// reasons (e.g. a miss just populated it) so a later `needs_revalidation`
    /// call doesn't redundantly re-check it.
    pub fn mark_validated(&self, key: &CacheKey) {
        self.validated_this_session.insert(key.clone(), ());
    }

    /// Runs `fetch` for a blob, coalescing concurrent misses on the same
    /// hash into one upstream call (spec §4.4, P5). Metadata fetches
    /// (`getattr`/`readdir`/`readlink`) are cheap enough on the wire that
    /// this crate only coalesces the expensive case: bulk blob transfer.
    pub async fn fetch_blob_single_flight<F, Fut>(&self, hash: ContentHash, fetch: F) -> Result<Vec<u8>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<u8>>>,
    {
        self.blob_single_flight.run(hash, fetch).await
    }

    /// Flushes the in-memory index into a fresh `meta.snap` and truncates
    /// `meta.idx`, bounding replay cost on the next session (spec §6).
    pub async fn compact(&self) -> Result<()> {
        let snapshot = self.index.iter_snapshot();
        self.meta_log.compact(&snapshot).await?;
        self.dirty_since_compact.store(0, Ordering::Relaxed);
        Ok(())
    }

    pub fn needs_compaction(&self) -> bool {
        self.dirty_since_compact.load(Ordering::Relaxed) > 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.index.total_bytes()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FileKind, Timestamp};

    fn sample_attr() -> Attributes {
        Attributes {
            mode: 0o755,
            uid: 0,
            gid: 0,
            size: 4096,
            atime: Timestamp { secs: 0, nanos: 0 },
            mtime: Timestamp { secs: 1, nanos: 0 },
            ctime: Timestamp { secs: 1, nanos: 0 },
            nlink: 1,
            rdev: 0,
            kind: FileKind::Regular,
        }
    }

    fn config(root: &Path) -> CacheConfig {
        CacheConfig {
            root: root.to_path_buf(),
            max_entries: 1024,
            max_size: 1 << 30,
            system_path_prefixes: system_paths::default_prefixes(),
        }
    }

    #[tokio::test]
    async fn system_path_attr_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(config(dir.path())).await.unwrap();
        let validator = Validator { mtime_ns: 1, size: 4096, ino_hint_server: 7 };
        cache.insert_attr(Path::new("/usr/bin/ffmpeg"), sample_attr(), validator, None).await;

        let (attr, v) = cache.lookup_attr(Path::new("/usr/bin/ffmpeg")).unwrap();
        assert_eq!(attr.size, 4096);
        assert_eq!(v, Some(validator));
    }

    #[tokio::test]
    async fn user_path_is_never_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(config(dir.path())).await.unwrap();
        let validator = Validator { mtime_ns: 1, size: 4096, ino_hint_server: 7 };
        cache.insert_attr(Path::new("/home/user/video.mp4"), sample_attr(), validator, None).await;

        assert!(cache.lookup_attr(Path::new("/home/user/video.mp4")).is_none());
    }

    #[tokio::test]
    async fn negative_entry_is_first_class_and_survives_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(config(dir.path())).await.unwrap();
        cache
            .insert_negative(
                Path::new("/usr/lib/python3/__pycache__/foo.cpython-311.pyc"),
                NegativeOp::Attr,
                Error::NotFound,
            )
            .await;

        let hit = cache.lookup_negative(
            Path::new("/usr/lib/python3/__pycache__/foo.cpython-311.pyc"),
            NegativeOp::Attr,
        );
        assert_eq!(hit, Some(Error::NotFound));
    }

    #[tokio::test]
    async fn revalidate_detects_mismatch_and_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(config(dir.path())).await.unwrap();
        let validator = Validator { mtime_ns: 1, size: 4096, ino_hint_server: 7 };
        cache.insert_attr(Path::new("/usr/bin/ffmpeg"), sample_attr(), validator, None).await;

        let fresh = Validator { mtime_ns: 2, size: 4096, ino_hint_server: 7 };
        let key = CacheKey::Attr(PathBuf::from("/usr/bin/ffmpeg"));
        assert!(!cache.revalidate(&key, fresh));
        assert!(cache.lookup_attr(Path::new("/usr/bin/ffmpeg")).is_none());
    }

    #[tokio::test]
    async fn blob_and_its_attr_referrer_persist_together() {
        let dir = tempfile::tempdir().unwrap();
        // Fill the index to exactly the cap with unrelated entries first, so
        // the blob+attr insert that follows forces eviction to run. If the
        // blob landed before its referrer, it would look orphaned at that
        // moment and be evicted ahead of the (referenced, older) filler
        // entries.
        let mut cfg = config(dir.path());
        cfg.max_entries = 3;
        let cache = Cache::open(cfg).await.unwrap();
        for i in 0..3u64 {
            let validator = Validator { mtime_ns: i as i64, size: 1, ino_hint_server: i };
            cache
                .insert_attr(Path::new(&format!("/usr/bin/filler{i}")), sample_attr(), validator, None)
                .await;
        }

        let data = b"#!/bin/sh\necho hi\n".to_vec();
        let validator = Validator { mtime_ns: 99, size: data.len() as u64, ino_hint_server: 99 };
        let hash = cache
            .insert_blob_with_attr(Path::new("/usr/bin/script.sh"), &data, sample_attr(), validator)
            .await
            .unwrap();

        let fetched = cache.lookup_blob(hash).await.unwrap();
        assert_eq!(fetched, data);
        assert!(cache.lookup_attr(Path::new("/usr/bin/script.sh")).is_some());
    }

    #[tokio::test]
    async fn concurrent_blob_misses_coalesce_into_one_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let cache = std::sync::Arc::new(Cache::open(config(dir.path())).await.unwrap());
        let hash = ContentHash::of(b"payload");
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .fetch_blob_single_flight(hash, || async {
                        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        Ok(b"payload".to_vec())
                    })
                    .await
            }));
        }
        for t in tasks {
            assert_eq!(t.await.unwrap().unwrap(), b"payload".to_vec());
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn two_corruption_strikes_degrade_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(config(dir.path())).await.unwrap();
        let key = CacheKey::Attr(PathBuf::from("/usr/bin/ffmpeg"));
        assert!(!cache.note_corrupt(&key));
        assert!(!cache.is_degraded());
        assert!(cache.note_corrupt(&key));
        assert!(cache.is_degraded());
    }

    #[tokio::test]
    async fn persisted_entries_need_one_revalidation_per_session() {
        let dir = tempfile::tempdir().unwrap();
        let key = CacheKey::Attr(PathBuf::from("/usr/bin/ffmpeg"));
        {
            let cache = Cache::open(config(dir.path())).await.unwrap();
            let validator = Validator { mtime_ns: 1, size: 4096, ino_hint_server: 7 };
            cache.insert_attr(Path::new("/usr/bin/ffmpeg"), sample_attr(), validator, None).await;
            cache.compact().await.unwrap();
            // Inserted this session: already counts as validated, so a
            // caller's first lookup in the same session needs no check.
            assert!(!cache.needs_revalidation(&key));
        }
        {
            // A fresh session (and thus a fresh `validated_this_session` set)
            // sees the same persisted entry as needing its first-use check.
            let cache = Cache::open(config(dir.path())).await.unwrap();
            assert!(cache.needs_revalidation(&key));
            assert!(!cache.needs_revalidation(&key), "second call in the same session must not re-trigger");
        }
    }

    #[tokio::test]
    async fn replay_reconstructs_index_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = Cache::open(config(dir.path())).await.unwrap();
            let validator = Validator { mtime_ns: 1, size: 4096, ino_hint_server: 1 };
            cache.insert_attr(Path::new("/usr/bin/ffmpeg"), sample_attr(), validator, None).await;
            cache.compact().await.unwrap();
        }
        {
            let cache = Cache::open(config(dir.path())).await.unwrap();
            assert!(cache.lookup_attr(Path::new("/usr/bin/ffmpeg")).is_some());
        }
    }
}
