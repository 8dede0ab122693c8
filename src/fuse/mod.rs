//! FUSE binding (spec §4.5): bridges `fuser`'s synchronous upcall trait into
//! the async RPC client and cache, the same way the server's `ReadTask`/
//! `VfsTask`/`StreamWriter` split bridges a synchronous wire protocol into
//! async tokio tasks — here the bridge is a stored `tokio::runtime::Handle`
//! and `block_on`, since a FUSE callback is a single request/response rather
//! than a stream.

pub mod handle;
pub mod inode;
pub mod prefetch;

use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyWrite, Request as FuseRequest, TimeOrNow,
};
use tracing::{instrument, warn};

use crate::cache::entry::{CacheKey, NegativeOp};
use crate::error::Error;
use crate::rpc::ops::{kind_bits, BulkItem};
use crate::session::Session;
use crate::types::{Attributes, ContentHash, DirEntry, FileKind, SetAttr, Timestamp, Validator};

use self::handle::{Backing, FuseHandleTable};
use self::inode::InodeTable;
use self::prefetch::ElfCache;

/// Attribute cache lifetime handed back to the kernel for every reply (spec
/// §4.5); short enough that a concurrent write on L is visible quickly,
/// long enough that a `find`/`ls -R` walk doesn't re-enter on every node.
const TTL: Duration = Duration::from_secs(1);

/// Fixed chunk size for a streamed (non-cached) read (spec §4.5 "`read` of
/// a non-system-path file: streamed through the RPC client in fixed-size
/// chunks").
const STREAM_CHUNK: u32 = 1024 * 1024;

const GENERATION: u64 = 0;

fn to_system_time(ts: Timestamp) -> SystemTime {
    if ts.secs >= 0 {
        UNIX_EPOCH + Duration::new(ts.secs as u64, ts.nanos)
    } else {
        UNIX_EPOCH - Duration::new((-ts.secs) as u64, ts.nanos)
    }
}

fn to_timestamp(t: SystemTime) -> Timestamp {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => Timestamp { secs: d.as_secs() as i64, nanos: d.subsec_nanos() },
        Err(e) => Timestamp { secs: -(e.duration().as_secs() as i64), nanos: 0 },
    }
}

fn to_file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::Regular => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
        FileKind::BlockDevice => FileType::BlockDevice,
        FileKind::CharDevice => FileType::CharDevice,
        FileKind::Fifo => FileType::NamedPipe,
        FileKind::Socket => FileType::Socket,
    }
}

fn to_file_attr(ino: u64, attr: &Attributes) -> FileAttr {
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: to_system_time(attr.atime),
        mtime: to_system_time(attr.mtime),
        ctime: to_system_time(attr.ctime),
        crtime: to_system_time(attr.ctime),
        kind: to_file_type(attr.kind),
        perm: (attr.mode & 0o7777) as u16,
        nlink: attr.nlink.max(1),
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: 4096,
        flags: 0,
    }
}

fn is_write_intent(flags: i32) -> bool {
    let access = flags & libc::O_ACCMODE;
    access == libc::O_WRONLY || access == libc::O_RDWR || flags & libc::O_CREAT != 0
}

/// The `fuser::Filesystem` implementation mounted on R. Holds no async
/// state of its own beyond a runtime handle: every upcall borrows the
/// session's cache and RPC pool for the duration of one `block_on`.
pub struct OutrunFs {
    rt: tokio::runtime::Handle,
    session: Arc<Session>,
    inodes: InodeTable,
    handles: FuseHandleTable,
    elf_cache: ElfCache,
}

impl OutrunFs {
    pub fn new(rt: tokio::runtime::Handle, session: Arc<Session>) -> Self {
        OutrunFs {
            rt,
            session,
            inodes: InodeTable::new(PathBuf::from("/")),
            handles: FuseHandleTable::new(),
            elf_cache: ElfCache::default(),
        }
    }

    fn resolve(&self, ino: u64) -> Result<PathBuf, Error> {
        self.inodes.path_for(ino).ok_or(Error::NotFound)
    }

    /// `lookup`/`getattr` miss path (spec §4.5): a single-path `bulk_fetch`
    /// for just this path's attributes — the richer ELF/script/pyc
    /// prefetch set is scoped to `open_read` instead, where there are
    /// actual bytes to inspect.
    async fn attr_for(&self, path: &Path) -> Result<Attributes, Error> {
        let cache = self.session.cache();
        if let Some(err) = cache.lookup_negative(path, NegativeOp::Attr) {
            return Err(err);
        }
        if let Some((attr, validator)) = cache.lookup_attr(path) {
            let key = CacheKey::Attr(path.to_path_buf());
            if !cache.needs_revalidation(&key) {
                return Ok(attr);
            }
            return self.revalidate_attr(path, &key, attr, validator).await;
        }
        let items = self.session.pool().bulk_fetch(vec![path.to_path_buf()], 0, kind_bits::ATTR).await?;
        for item in items {
            if let BulkItem::Attr { path: p, result } = item {
                if p != path {
                    continue;
                }
                return match result {
                    Ok((attr, validator)) => {
                        cache.insert_attr(&p, attr, validator, None).await;
                        Ok(attr)
                    }
                    Err(Error::NotFound) => {
                        cache.insert_negative(&p, NegativeOp::Attr, Error::NotFound).await;
                        Err(Error::NotFound)
                    }
                    Err(e) => Err(e),
                };
            }
        }
        Err(Error::ProtocolError)
    }

    /// Bundles a single-path attribute check into a `bulk_fetch` for a
    /// persisted entry's first use in this session (spec §4.4 "revalidated
    /// by bundling an attributes check into the next bulk fetch"). A
    /// mismatch invalidates the entry and its dependents — here that is
    /// just the `attr` entry itself, since a changed file's blob and
    /// dirlist entries are keyed independently and will fail their own
    /// first-use check in turn. A transport failure during revalidation
    /// falls back to the last-known-good cached value rather than failing
    /// the read outright, matching the cache's general treatment of prefetch
    /// and validation as advisory, best-effort traffic.
    async fn revalidate_attr(
        &self,
        path: &Path,
        key: &CacheKey,
        cached_attr: Attributes,
        cached_validator: Option<Validator>,
    ) -> Result<Attributes, Error> {
        let cache = self.session.cache();
        let items = match self.session.pool().bulk_fetch(vec![path.to_path_buf()], 0, kind_bits::ATTR).await {
            Ok(items) => items,
            Err(_) => return Ok(cached_attr),
        };
        for item in items {
            if let BulkItem::Attr { path: p, result } = item {
                if p != path {
                    continue;
                }
                return match result {
                    Ok((fresh_attr, fresh_validator)) => {
                        if cached_validator == Some(fresh_validator) {
                            cache.mark_validated(key);
                            Ok(cached_attr)
                        } else {
                            cache.invalidate(key);
                            cache.insert_attr(&p, fresh_attr, fresh_validator, None).await;
                            Ok(fresh_attr)
                        }
                    }
                    Err(Error::NotFound) => {
                        cache.invalidate(key);
                        cache.insert_negative(&p, NegativeOp::Attr, Error::NotFound).await;
                        Err(Error::NotFound)
                    }
                    Err(_) => Ok(cached_attr),
                };
            }
        }
        Ok(cached_attr)
    }

    /// Shared revalidation primitive for `dirlist`/`readlink` entries, which
    /// (unlike `attr`) don't carry their own size/mtime — their freshness is
    /// judged by the owning path's attributes instead. Returns `Some(true)`
    /// when the stored validator still matches, `Some(false)` when it
    /// doesn't (the entry has already been invalidated by the time this
    /// returns), and `None` on a transport failure, in which case the
    /// caller trusts the stale cached value rather than failing the read.
    async fn attr_still_matches(&self, path: &Path, key: &CacheKey, validator: Option<Validator>) -> Option<bool> {
        let cache = self.session.cache();
        let items = self.session.pool().bulk_fetch(vec![path.to_path_buf()], 0, kind_bits::ATTR).await.ok()?;
        for item in items {
            if let BulkItem::Attr { path: p, result } = item {
                if p != path {
                    continue;
                }
                return match result {
                    Ok((_, fresh)) if validator == Some(fresh) => {
                        cache.mark_validated(key);
                        Some(true)
                    }
                    _ => {
                        cache.invalidate(key);
                        Some(false)
                    }
                };
            }
        }
        None
    }

    /// `readdir` miss path: `bulk_fetch` at depth 1, which also returns the
    /// children's attributes so the very next `getattr` per entry is a
    /// cache hit (spec §4.5 "readdir ... on miss, bulk_fetch depth=1").
    async fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>, Error> {
        let cache = self.session.cache();
        if let Some((entries, validator)) = cache.lookup_dirlist(path) {
            let key = CacheKey::DirList(path.to_path_buf());
            if !cache.needs_revalidation(&key) {
                return Ok(entries);
            }
            match self.attr_still_matches(path, &key, validator).await {
                Some(true) | None => return Ok(entries),
                Some(false) => {} // fall through to a full refetch below
            }
        }
        let items = self
            .session
            .pool()
            .bulk_fetch(vec![path.to_path_buf()], 1, kind_bits::DIRLIST | kind_bits::ATTR)
            .await?;

        let mut listing = None;
        let mut dir_attr = None;
        for item in items {
            match item {
                BulkItem::DirList { path: p, result: Ok(entries) } if p == path => {
                    listing = Some(entries);
                }
                BulkItem::Attr { path: p, result: Ok((attr, validator)) } if p == path => {
                    cache.insert_attr(&p, attr, validator, None).await;
                    dir_attr = Some(attr);
                }
                BulkItem::Attr { path: p, result: Ok((attr, validator)) } => {
                    cache.insert_attr(&p, attr, validator, None).await;
                }
                _ => {}
            }
        }
        let entries = listing.ok_or(Error::Io)?;

        // Directory-wise prefetch (spec §4.5 rule 4): the listing already
        // carries each child's attributes, so cache them directly instead
        // of waiting for a per-entry `getattr` to round-trip.
        for entry in &entries {
            let child = path.join(&entry.name);
            let validator = Validator::from_attr(&entry.attr, 0);
            cache.insert_attr(&child, entry.attr, validator, None).await;
        }

        let dir_attr = dir_attr.unwrap_or(Attributes {
            mode: 0o755,
            uid: 0,
            gid: 0,
            size: 0,
            atime: Timestamp { secs: 0, nanos: 0 },
            mtime: Timestamp { secs: 0, nanos: 0 },
            ctime: Timestamp { secs: 0, nanos: 0 },
            nlink: 1,
            rdev: 0,
            kind: FileKind::Directory,
        });
        let validator = Validator::from_attr(&dir_attr, 0);
        cache.insert_dirlist(path, entries.clone(), validator).await;
        Ok(entries)
    }

    async fn readlink_for(&self, path: &Path) -> Result<String, Error> {
        let cache = self.session.cache();
        if let Some(err) = cache.lookup_negative(path, NegativeOp::ReadLink) {
            return Err(err);
        }
        if let Some((target, validator)) = cache.lookup_readlink(path) {
            let key = CacheKey::ReadLink(path.to_path_buf());
            if !cache.needs_revalidation(&key) {
                return Ok(target);
            }
            match self.attr_still_matches(path, &key, validator).await {
                Some(true) | None => return Ok(target),
                Some(false) => {} // fall through to a full refetch below
            }
        }
        let items = self
            .session
            .pool()
            .bulk_fetch(vec![path.to_path_buf()], 0, kind_bits::READLINK | kind_bits::ATTR)
            .await?;
        let mut target = None;
        for item in items {
            match item {
                BulkItem::ReadLink { path: p, result: Ok(t) } if p == path => target = Some(t),
                BulkItem::Attr { path: p, result: Ok((attr, validator)) } => {
                    cache.insert_attr(&p, attr, validator, None).await;
                }
                _ => {}
            }
        }
        match target {
            Some(t) => {
                if cache.is_system_path(path) {
                    let attr = self.attr_for(path).await;
                    let validator = attr.map(|a| Validator::from_attr(&a, 0)).unwrap_or(Validator {
                        mtime_ns: 0,
                        size: 0,
                        ino_hint_server: 0,
                    });
                    cache.insert_readlink(path, t.clone(), validator).await;
                    // Prefetch the link target's attributes too, best effort
                    // (spec §4.5 "prefetch target attr if system path").
                    let resolved = resolve_symlink_target(path, &t);
                    let _ = self.attr_for(&resolved).await;
                }
                Ok(t)
            }
            None => Err(Error::NotFound),
        }
    }

    /// `open` for read on a system path (spec §4.5): fetch the whole blob,
    /// insert it into the content-addressed cache, and kick off the
    /// deterministic transitive prefetch described in §4.5's five rules.
    async fn fetch_blob_with_prefetch(&self, path: &Path) -> Result<Vec<u8>, Error> {
        let cache = self.session.cache();
        if let Some(hash) = cache.lookup_blob_hash_for(path) {
            if let Some(data) = cache.lookup_blob(hash).await {
                return Ok(data);
            }
        }

        // `Cache::fetch_blob_single_flight` is keyed by content hash, but a
        // blob's hash isn't known until after the fetch completes — so two
        // opens of the same *path* are coalesced under a stand-in key
        // derived from the path itself rather than the (not yet known)
        // content hash.
        let hash_cell = std::cell::Cell::new(None);
        let coalesce_key = ContentHash::of(path.to_string_lossy().as_bytes());
        let data = cache
            .fetch_blob_single_flight(coalesce_key, || {
                let pool = self.session.pool().clone();
                let path = path.to_path_buf();
                async move {
                    let items = pool.bulk_fetch(vec![path.clone()], 0, kind_bits::BLOB).await?;
                    for item in items {
                        if let BulkItem::Blob { path: p, result } = item {
                            if p == path {
                                return result.map(|(attr, validator, hash, data)| {
                                    hash_cell.set(Some((attr, validator, hash)));
                                    data
                                });
                            }
                        }
                    }
                    Err(Error::ProtocolError)
                }
            })
            .await?;

        if let Some((attr, validator, hash)) = hash_cell.take() {
            let stored = cache.insert_blob_with_attr(path, &data, attr, validator).await?;
            debug_assert_eq!(stored, hash, "server-reported hash must match locally computed digest");
        }

        self.prefetch_transitive(path, &data).await;
        Ok(data)
    }

    /// Deterministic prefetch (spec §4.5, five rules): ELF dynamic
    /// interpreter + transitive `DT_NEEDED` to depth
    /// [`prefetch::MAX_TRANSITIVE_DEPTH`], a script's `#!` interpreter, the
    /// `.pyc` bytecode companion (negatively cached when absent), all
    /// capped at `prefetch.max_entries` / `prefetch.max_bytes`.
    async fn prefetch_transitive(&self, path: &Path, data: &[u8]) {
        let cache = self.session.cache();
        if !cache.is_system_path(path) {
            return;
        }

        let mut seeds: Vec<PathBuf> = Vec::new();
        let hash = ContentHash::of(data);
        let info = self.elf_cache.get_or_parse(hash, data);
        if info.is_dynamic || info.interpreter.is_some() {
            if let Some(interp) = &info.interpreter {
                seeds.push(PathBuf::from(interp));
            }
            let search_dirs = self.ld_search_dirs().await;
            for needed in &info.needed {
                seeds.extend(prefetch::candidate_paths(needed, &search_dirs));
            }
        } else if prefetch::is_script(data) {
            if let Some(interp) = prefetch::script_interpreter(data) {
                seeds.push(PathBuf::from(interp));
            }
        }

        if let Some((dir, stem)) = prefetch::pyc_companion_dir_and_stem(path) {
            match self.list_dir(&dir).await {
                Ok(entries) => {
                    let found = entries.iter().any(|e| prefetch::is_pyc_companion_name(&stem, &e.name));
                    if !found {
                        let pyc_path = dir.join(format!("{stem}.pyc"));
                        cache.insert_negative(&pyc_path, NegativeOp::Attr, Error::NotFound).await;
                    }
                }
                Err(_) => {}
            }
        }

        let (capped, dropped) = prefetch::truncate_entries(seeds, 256);
        if dropped > 0 {
            warn!(dropped, %hash, "prefetch entry cap dropped candidates");
        }

        // One bulk_fetch per BFS level rather than one per candidate: every
        // library discovered at the same DT_NEEDED depth travels in the
        // same bundle, so a binary with a hundred direct dependencies costs
        // one round-trip, not a hundred (spec §8 scenario 1).
        let mut seen: HashSet<PathBuf> = HashSet::new();
        seen.insert(path.to_path_buf());
        let mut level: Vec<PathBuf> = capped;
        let mut bytes_fetched = 0u64;
        const MAX_PREFETCH_BYTES: u64 = 128 * 1024 * 1024;
        let mut depth = 0u32;

        while !level.is_empty() && bytes_fetched < MAX_PREFETCH_BYTES {
            let batch: Vec<PathBuf> = level
                .drain(..)
                .filter(|candidate| seen.insert(candidate.clone()))
                .collect();
            if batch.is_empty() {
                break;
            }

            let items = match self.session.pool().bulk_fetch(batch, 0, kind_bits::BLOB).await {
                Ok(items) => items,
                Err(_) => break,
            };

            let mut next_level: Vec<PathBuf> = Vec::new();
            let next_depth_ok = depth + 1 < prefetch::MAX_TRANSITIVE_DEPTH;
            let mut search_dirs = None;
            for item in items {
                if let BulkItem::Blob { path: p, result: Ok((attr, validator, bhash, bdata)) } = item {
                    bytes_fetched += bdata.len() as u64;
                    if bytes_fetched > MAX_PREFETCH_BYTES {
                        break;
                    }
                    if let Err(err) = cache.insert_blob_with_attr(&p, &bdata, attr, validator).await {
                        warn!(?err, path = %p.display(), "failed to cache prefetched blob");
                    }

                    if next_depth_ok {
                        let child_info = self.elf_cache.get_or_parse(bhash, &bdata);
                        if child_info.is_dynamic {
                            if search_dirs.is_none() {
                                search_dirs = Some(self.ld_search_dirs().await);
                            }
                            let dirs = search_dirs.as_ref().unwrap();
                            for needed in &child_info.needed {
                                for next in prefetch::candidate_paths(needed, dirs) {
                                    if !seen.contains(&next) {
                                        next_level.push(next);
                                    }
                                }
                            }
                        }
                    }
                }
            }
            level = next_level;
            depth += 1;
        }
    }

    /// Standard library search dirs plus whatever `/etc/ld.so.conf` adds on
    /// L, read best-effort over the RPC client (spec §4.5 rule 2).
    async fn ld_search_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = prefetch::standard_search_dirs();
        if let Ok(conf) = self.read_small_file(Path::new("/etc/ld.so.conf")).await {
            if let Ok(text) = String::from_utf8(conf) {
                dirs.extend(prefetch::parse_ld_so_conf(&text));
            }
        }
        dirs
    }

    async fn read_small_file(&self, path: &Path) -> Result<Vec<u8>, Error> {
        let pool = self.session.pool();
        let (handle, _attr, size) = pool.open_read(path.to_path_buf()).await?;
        let data = pool.read(handle, 0, size.min(64 * 1024) as u32).await;
        let _ = pool.close(handle).await;
        data
    }

    fn invalidate_parent_dirlist(&self, child: &Path) {
        if let Some(parent) = child.parent() {
            self.session.cache().invalidate(&CacheKey::DirList(parent.to_path_buf()));
        }
    }
}

fn resolve_symlink_target(link_path: &Path, target: &str) -> PathBuf {
    let target_path = Path::new(target);
    if target_path.is_absolute() {
        target_path.to_path_buf()
    } else {
        link_path.parent().unwrap_or(Path::new("/")).join(target_path)
    }
}

fn set_attr_from_fuse(
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    size: Option<u64>,
    atime: Option<TimeOrNow>,
    mtime: Option<TimeOrNow>,
) -> SetAttr {
    SetAttr {
        mode,
        uid,
        gid,
        size,
        atime: atime.map(|t| match t {
            TimeOrNow::SpecificTime(t) => to_timestamp(t),
            TimeOrNow::Now => to_timestamp(SystemTime::now()),
        }),
        mtime: mtime.map(|t| match t {
            TimeOrNow::SpecificTime(t) => to_timestamp(t),
            TimeOrNow::Now => to_timestamp(SystemTime::now()),
        }),
    }
}

impl Filesystem for OutrunFs {
    #[instrument(skip(self, _req, reply))]
    fn lookup(&mut self, _req: &FuseRequest<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Ok(parent_path) = self.resolve(parent) else {
            reply.error(Error::NotFound.to_errno());
            return;
        };
        let child = parent_path.join(name);
        match self.rt.clone().block_on(self.attr_for(&child)) {
            Ok(attr) => {
                let ino = self.inodes.ino_for(&child);
                reply.entry(&TTL, &to_file_attr(ino, &attr), GENERATION);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn getattr(&mut self, _req: &FuseRequest<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Ok(path) = self.resolve(ino) else {
            reply.error(Error::NotFound.to_errno());
            return;
        };
        match self.rt.clone().block_on(self.attr_for(&path)) {
            Ok(attr) => reply.attr(&TTL, &to_file_attr(ino, &attr)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &FuseRequest<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Ok(path) = self.resolve(ino) else {
            reply.error(Error::NotFound.to_errno());
            return;
        };
        let set = set_attr_from_fuse(mode, uid, gid, size, atime, mtime);
        let result = self.rt.clone().block_on(async {
            let pool = self.session.pool();
            if let Some(mode) = set.mode {
                pool.unit_call(crate::rpc::Request::Chmod { path: path.clone(), mode }).await?;
            }
            if set.uid.is_some() || set.gid.is_some() {
                pool.unit_call(crate::rpc::Request::Chown {
                    path: path.clone(),
                    uid: set.uid.unwrap_or(0),
                    gid: set.gid.unwrap_or(0),
                })
                .await?;
            }
            if set.atime.is_some() || set.mtime.is_some() {
                pool.unit_call(crate::rpc::Request::Utimens { path: path.clone(), attr: set.clone() }).await?;
            }
            self.session.cache().invalidate(&CacheKey::Attr(path.clone()));
            self.attr_for(&path).await
        });
        match result {
            Ok(attr) => reply.attr(&TTL, &to_file_attr(ino, &attr)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &FuseRequest<'_>, ino: u64, reply: ReplyData) {
        let Ok(path) = self.resolve(ino) else {
            reply.error(Error::NotFound.to_errno());
            return;
        };
        match self.rt.clone().block_on(self.readlink_for(&path)) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(&mut self, _req: &FuseRequest<'_>, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        let Ok(parent_path) = self.resolve(parent) else {
            reply.error(Error::NotFound.to_errno());
            return;
        };
        let child = parent_path.join(name);
        let result = self.rt.clone().block_on(async {
            self.session
                .pool()
                .unit_call(crate::rpc::Request::Mkdir { path: child.clone(), mode })
                .await?;
            self.invalidate_parent_dirlist(&child);
            self.attr_for(&child).await
        });
        match result {
            Ok(attr) => {
                let ino = self.inodes.ino_for(&child);
                reply.entry(&TTL, &to_file_attr(ino, &attr), GENERATION);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &FuseRequest<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Ok(parent_path) = self.resolve(parent) else {
            reply.error(Error::NotFound.to_errno());
            return;
        };
        let child = parent_path.join(name);
        let result = self.rt.clone().block_on(async {
            self.session.pool().unit_call(crate::rpc::Request::Unlink { path: child.clone() }).await
        });
        match result {
            Ok(()) => {
                self.session.cache().invalidate(&CacheKey::Attr(child.clone()));
                self.invalidate_parent_dirlist(&child);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &FuseRequest<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Ok(parent_path) = self.resolve(parent) else {
            reply.error(Error::NotFound.to_errno());
            return;
        };
        let child = parent_path.join(name);
        let result = self.rt.clone().block_on(async {
            self.session.pool().unit_call(crate::rpc::Request::Rmdir { path: child.clone() }).await
        });
        match result {
            Ok(()) => {
                let cache = self.session.cache();
                cache.invalidate(&CacheKey::Attr(child.clone()));
                cache.invalidate(&CacheKey::DirList(child.clone()));
                self.invalidate_parent_dirlist(&child);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &FuseRequest<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Ok(parent_path), Ok(new_parent_path)) = (self.resolve(parent), self.resolve(newparent)) else {
            reply.error(Error::NotFound.to_errno());
            return;
        };
        let from = parent_path.join(name);
        let to = new_parent_path.join(newname);
        let result = self.rt.clone().block_on(async {
            self.session
                .pool()
                .unit_call(crate::rpc::Request::Rename { from: from.clone(), to: to.clone() })
                .await
        });
        match result {
            Ok(()) => {
                let cache = self.session.cache();
                cache.invalidate(&CacheKey::Attr(from.clone()));
                cache.invalidate(&CacheKey::DirList(from.clone()));
                cache.invalidate(&CacheKey::Attr(to.clone()));
                self.invalidate_parent_dirlist(&from);
                self.invalidate_parent_dirlist(&to);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &FuseRequest<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Ok(parent_path) = self.resolve(parent) else {
            reply.error(Error::NotFound.to_errno());
            return;
        };
        let link_path = parent_path.join(link_name);
        let result = self.rt.clone().block_on(async {
            self.session
                .pool()
                .unit_call(crate::rpc::Request::Symlink { path: link_path.clone(), target: target.to_path_buf() })
                .await?;
            self.invalidate_parent_dirlist(&link_path);
            self.attr_for(&link_path).await
        });
        match result {
            Ok(attr) => {
                let ino = self.inodes.ino_for(&link_path);
                reply.entry(&TTL, &to_file_attr(ino, &attr), GENERATION);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn link(&mut self, _req: &FuseRequest<'_>, ino: u64, newparent: u64, newname: &OsStr, reply: ReplyEntry) {
        let (Ok(path), Ok(new_parent_path)) = (self.resolve(ino), self.resolve(newparent)) else {
            reply.error(Error::NotFound.to_errno());
            return;
        };
        let link_path = new_parent_path.join(newname);
        let result = self.rt.clone().block_on(async {
            self.session
                .pool()
                .unit_call(crate::rpc::Request::Link { path: link_path.clone(), target: path.clone() })
                .await?;
            self.invalidate_parent_dirlist(&link_path);
            self.attr_for(&link_path).await
        });
        match result {
            Ok(attr) => {
                let child_ino = self.inodes.ino_for(&link_path);
                reply.entry(&TTL, &to_file_attr(child_ino, &attr), GENERATION);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &FuseRequest<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Ok(path) = self.resolve(ino) else {
            reply.error(Error::NotFound.to_errno());
            return;
        };

        if is_write_intent(flags) || !self.session.cache().is_system_path(&path) {
            let result = self.rt.clone().block_on(async {
                let pool = self.session.pool();
                if is_write_intent(flags) {
                    let handle = pool.open_write(path.clone(), flags as u32, 0o644).await?;
                    Ok((handle, true))
                } else {
                    let (handle, _attr, _size) = pool.open_read(path.clone()).await?;
                    Ok((handle, false))
                }
            });
            match result {
                Ok((handle, writable)) => {
                    let fh = self.handles.open_streaming(path, handle, writable);
                    reply.opened(fh, 0);
                }
                Err(e) => reply.error(e.to_errno()),
            }
            return;
        }

        match self.rt.clone().block_on(self.fetch_blob_with_prefetch(&path)) {
            Ok(data) => {
                let fh = self.handles.open_cached(path, Arc::new(data));
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &FuseRequest<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(handle) = self.handles.get(fh) else {
            reply.error(Error::BadHandle.to_errno());
            return;
        };
        let offset = offset.max(0) as u64;
        match &handle.backing {
            Backing::Cached(cached) => {
                let data = &cached.data;
                let start = (offset as usize).min(data.len());
                let end = (start + size as usize).min(data.len());
                reply.data(&data[start..end]);
            }
            Backing::Streaming(streaming) => {
                let length = size.min(STREAM_CHUNK);
                let result = self.rt.clone().block_on(self.session.pool().read(streaming.rpc_handle, offset, length));
                match result {
                    Ok(data) => reply.data(&data),
                    Err(e) => reply.error(e.to_errno()),
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &FuseRequest<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(handle) = self.handles.get(fh) else {
            reply.error(Error::BadHandle.to_errno());
            return;
        };
        match &handle.backing {
            Backing::Streaming(streaming) if streaming.writable => {
                let result = self.rt.clone().block_on(self.session.pool().write(
                    streaming.rpc_handle,
                    offset.max(0) as u64,
                    data.to_vec(),
                ));
                match result {
                    Ok(written) => {
                        self.session.cache().invalidate(&CacheKey::Attr(handle.path.clone()));
                        reply.written(written);
                    }
                    Err(e) => reply.error(e.to_errno()),
                }
            }
            _ => reply.error(Error::PermissionDenied.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &FuseRequest<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Some(handle) = self.handles.close(fh) {
            if let Backing::Streaming(streaming) = &handle.backing {
                let _ = self.rt.clone().block_on(self.session.pool().close(streaming.rpc_handle));
            }
        }
        reply.ok();
    }

    fn fsync(&mut self, _req: &FuseRequest<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let Some(handle) = self.handles.get(fh) else {
            reply.error(Error::BadHandle.to_errno());
            return;
        };
        match &handle.backing {
            Backing::Streaming(streaming) => {
                match self.rt.clone().block_on(self.session.pool().fsync(streaming.rpc_handle)) {
                    Ok(()) => reply.ok(),
                    Err(e) => reply.error(e.to_errno()),
                }
            }
            Backing::Cached(_) => reply.ok(),
        }
    }

    fn opendir(&mut self, _req: &FuseRequest<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let _ = ino;
        reply.opened(0, 0);
    }

    fn readdir(&mut self, _req: &FuseRequest<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Ok(path) = self.resolve(ino) else {
            reply.error(Error::NotFound.to_errno());
            return;
        };
        let entries = match self.rt.clone().block_on(self.list_dir(&path)) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        let parent_path = path.parent().unwrap_or(&path).to_path_buf();
        let parent_ino = self.inodes.ino_for(&parent_path);

        let mut rows: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for entry in &entries {
            let child_path = path.join(&entry.name);
            let child_ino = self.inodes.ino_for(&child_path);
            rows.push((child_ino, to_file_type(entry.attr.kind), entry.name.clone()));
        }

        for (i, (child_ino, kind, name)) in rows.iter().enumerate().skip(offset.max(0) as usize) {
            if reply.add(*child_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &FuseRequest<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &FuseRequest<'_>, ino: u64, reply: ReplyStatfs) {
        let path = self.resolve(ino).unwrap_or_else(|_| PathBuf::from("/"));
        match self.rt.clone().block_on(self.session.pool().statfs(path)) {
            Ok(stats) => reply.statfs(
                stats.total_bytes / 4096,
                stats.free_bytes / 4096,
                stats.free_bytes / 4096,
                stats.total_inodes,
                stats.free_inodes,
                4096,
                255,
                4096,
            ),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}
