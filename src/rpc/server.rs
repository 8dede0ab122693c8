//! The RPC server that runs on L: accepts connections from R, authenticates
//! them, and dispatches each request against the real local filesystem
//! rooted at a configured directory.
//!
//! Grounded on the teacher's `lib.rs` connection-handling loop (one spawned
//! task per accepted socket, a bounded amount of concurrent work per
//! connection) generalized from NFSv3 procedures to the operation table in
//! [`crate::rpc::ops`].

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, instrument, warn};

use crate::codec::{read_frame, write_frame, Frame};
use crate::error::{Error, Result};
use crate::rpc::handle::HandleTable;
use crate::rpc::ops::{FsStats, Handle, Opcode};
use crate::rpc::{request_from_frame, response_frame, Request, Response};
use crate::types::{Attributes, DirEntry, FileKind, Timestamp};

pub struct ServerConfig {
    pub bind_addr: std::net::SocketAddr,
    /// Directory presented to clients as their filesystem root; every
    /// request path is resolved relative to it, never to the real `/`.
    pub root: PathBuf,
    pub token: String,
    pub max_frame_len: u32,
    pub worker_permits: usize,
}

impl ServerConfig {
    pub fn new(bind_addr: std::net::SocketAddr, root: PathBuf, token: String) -> Self {
        ServerConfig {
            bind_addr,
            root,
            token,
            max_frame_len: crate::rpc::MAX_FRAME_LEN,
            worker_permits: 16,
        }
    }
}

/// Runs the accept loop until `shutdown` fires. Each accepted connection
/// gets its own task and its own [`HandleTable`]; handles never cross
/// connections (spec §4.2).
#[instrument(skip(config, shutdown))]
pub async fn serve(
    config: Arc<ServerConfig>,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr).await.map_err(|_| Error::Io)?;
    info!(addr = %config.bind_addr, "rpc server listening");
    serve_listener(listener, config, shutdown).await
}

/// Runs the accept loop over an already-bound listener. Split out from
/// [`serve`] so tests (and callers binding to `:0` for an ephemeral port)
/// can observe the real listen address before the accept loop starts.
pub async fn serve_listener(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let workers = Arc::new(Semaphore::new(config.worker_permits));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.map_err(|_| Error::Io)?;
                debug!(%peer, "accepted connection");
                let config = config.clone();
                let workers = workers.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, config, workers).await {
                        warn!(%peer, error = %e, "connection ended with an error");
                    }
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("rpc server shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Services one connection: a handshake, then a read loop that dispatches
/// each request onto the shared worker semaphore and feeds completions to a
/// dedicated writer task, so responses may complete out of order while the
/// socket itself only ever sees one writer.
async fn handle_connection(
    stream: TcpStream,
    config: Arc<ServerConfig>,
    workers: Arc<Semaphore>,
) -> Result<()> {
    let (mut rd, mut wr) = stream.into_split();

    let first = match read_frame(&mut rd, config.max_frame_len).await? {
        Some(frame) => frame,
        None => return Ok(()),
    };
    let authed = authenticate(&config.token, &first)?;
    write_frame(&mut wr, &authed).await?;

    let handles = Arc::new(HandleTable::new());
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_frame(&mut wr, &frame).await.is_err() {
                break;
            }
        }
    });

    loop {
        let frame = match read_frame(&mut rd, config.max_frame_len).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                drop(tx);
                let _ = writer.await;
                return Err(e);
            }
        };
        let request_id = frame.request_id;
        let request = match request_from_frame(&frame) {
            Ok(r) => r,
            Err(e) => {
                drop(tx);
                let _ = writer.await;
                return Err(e);
            }
        };
        let opcode = request.opcode();

        let permit = workers.clone().acquire_owned().await.map_err(|_| Error::Shutdown)?;
        let root = config.root.clone();
        let handles = handles.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let response = dispatch(&root, &handles, request).await;
            let _ = permit;
            if let Ok(frame) = response_frame(opcode, request_id, &response) {
                let _ = tx.send(frame);
            }
        });
    }

    drop(tx);
    let _ = writer.await;
    Ok(())
}

fn authenticate(expected_token: &str, frame: &Frame) -> Result<Frame> {
    let opcode = Opcode::from_u8(frame.opcode)?;
    if opcode != Opcode::Auth {
        return Err(Error::ProtocolError);
    }
    let request = Request::decode(opcode, &frame.payload)?;
    let ok = match &request {
        Request::Auth { token } => token == expected_token,
        _ => false,
    };
    let response = if ok { Response::Auth(Ok(())) } else { Response::Auth(Err(Error::AuthFailed)) };
    response_frame(Opcode::Auth, frame.request_id, &response)
}

/// Resolves an L-namespace path against the server's root, rejecting
/// anything not absolute or that escapes via `..` (spec §4.2).
fn resolve(root: &Path, path: &Path) -> Result<PathBuf> {
    if !crate::types::is_well_rooted(path) {
        return Err(Error::PermissionDenied);
    }
    let relative = path.strip_prefix("/").map_err(|_| Error::PermissionDenied)?;
    Ok(root.join(relative))
}

async fn dispatch(root: &Path, handles: &HandleTable, request: Request) -> Response {
    match request {
        Request::Auth { .. } => Response::Auth(Err(Error::ProtocolError)),
        Request::GetAttr { path } => Response::GetAttr(get_attr(root, &path).await),
        Request::ReadDir { path } => Response::ReadDir(read_dir(root, &path).await),
        Request::ReadLink { path } => Response::ReadLink(read_link(root, &path).await),
        Request::OpenRead { path } => Response::OpenRead(open_read(root, handles, &path).await),
        Request::Read { handle, offset, length } => {
            Response::Read(read_handle(handles, handle, offset, length).await)
        }
        Request::Close { handle } => Response::Close(close(handles, handle).await),
        Request::OpenWrite { path, flags, mode } => {
            Response::OpenWrite(open_write(root, handles, &path, flags, mode).await)
        }
        Request::Write { handle, offset, data } => {
            Response::Write(write_handle(handles, handle, offset, &data).await)
        }
        Request::Fsync { handle } => Response::Fsync(fsync(handles, handle).await),
        Request::Unlink { path } => Response::Unit(unlink(root, &path).await),
        Request::Mkdir { path, mode } => Response::Unit(mkdir(root, &path, mode).await),
        Request::Rmdir { path } => Response::Unit(rmdir(root, &path).await),
        Request::Rename { from, to } => Response::Unit(rename(root, &from, &to).await),
        Request::Chmod { path, mode } => Response::Unit(chmod(root, &path, mode).await),
        Request::Chown { path, uid, gid } => Response::Unit(chown(root, &path, uid, gid).await),
        Request::Utimens { path, attr } => Response::Unit(utimens(root, &path, &attr).await),
        Request::Symlink { path, target } => Response::Unit(symlink(root, &path, &target).await),
        Request::Link { path, target } => Response::Unit(link(root, &path, &target).await),
        Request::BulkFetch { paths, depth, kinds } => {
            Response::BulkFetch(Ok(bulk_fetch(root, &paths, depth, kinds).await))
        }
        Request::Statfs { path } => Response::Statfs(statfs(root, &path).await),
    }
}

fn metadata_to_attributes(meta: &std::fs::Metadata) -> Attributes {
    let kind = if meta.is_dir() {
        FileKind::Directory
    } else if meta.file_type().is_symlink() {
        FileKind::Symlink
    } else if meta.file_type().is_block_device() {
        FileKind::BlockDevice
    } else if meta.file_type().is_char_device() {
        FileKind::CharDevice
    } else if meta.file_type().is_fifo() {
        FileKind::Fifo
    } else if meta.file_type().is_socket() {
        FileKind::Socket
    } else {
        FileKind::Regular
    };
    Attributes {
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        size: meta.size(),
        atime: Timestamp { secs: meta.atime(), nanos: meta.atime_nsec() as u32 },
        mtime: Timestamp { secs: meta.mtime(), nanos: meta.mtime_nsec() as u32 },
        ctime: Timestamp { secs: meta.ctime(), nanos: meta.ctime_nsec() as u32 },
        nlink: meta.nlink() as u32,
        rdev: meta.rdev() as u32,
        kind,
    }
}

async fn get_attr(root: &Path, path: &Path) -> Result<(Attributes, crate::types::Validator)> {
    let full = resolve(root, path)?;
    let meta = tokio::fs::symlink_metadata(&full).await?;
    let attr = metadata_to_attributes(&meta);
    let validator = crate::types::Validator::from_attr(&attr, meta.ino());
    Ok((attr, validator))
}

async fn read_dir(root: &Path, path: &Path) -> Result<Vec<DirEntry>> {
    let full = resolve(root, path)?;
    let mut rd = tokio::fs::read_dir(&full).await?;
    let mut entries = Vec::new();
    while let Some(entry) = rd.next_entry().await? {
        let meta = entry.metadata().await?;
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            attr: metadata_to_attributes(&meta),
        });
    }
    Ok(entries)
}

async fn read_link(root: &Path, path: &Path) -> Result<String> {
    let full = resolve(root, path)?;
    let target = tokio::fs::read_link(&full).await?;
    Ok(target.to_string_lossy().into_owned())
}

async fn open_read(
    root: &Path,
    handles: &HandleTable,
    path: &Path,
) -> Result<(Handle, Attributes, u64)> {
    let full = resolve(root, path)?;
    let file = tokio::fs::File::open(&full).await?;
    let meta = file.metadata().await?;
    let attr = metadata_to_attributes(&meta);
    let handle = handles.insert(path.to_path_buf(), file, false);
    Ok((handle, attr, meta.size()))
}

async fn read_handle(
    handles: &HandleTable,
    handle: Handle,
    offset: u64,
    length: u32,
) -> Result<Vec<u8>> {
    let entry = handles.get(handle)?;
    let mut file = entry.file.lock().await;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; length as usize];
    let n = file.read(&mut buf).await?;
    buf.truncate(n);
    Ok(buf)
}

async fn close(handles: &HandleTable, handle: Handle) -> Result<()> {
    handles.remove(handle)?;
    Ok(())
}

async fn open_write(
    root: &Path,
    handles: &HandleTable,
    path: &Path,
    flags: u32,
    mode: u32,
) -> Result<Handle> {
    let full = resolve(root, path)?;
    let mut opts = OpenOptions::new();
    opts.write(true);
    const CREATE: u32 = 1 << 0;
    const TRUNCATE: u32 = 1 << 1;
    const APPEND: u32 = 1 << 2;
    if flags & CREATE != 0 {
        opts.create(true);
    }
    if flags & TRUNCATE != 0 {
        opts.truncate(true);
    }
    if flags & APPEND != 0 {
        opts.append(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(mode);
    }
    let file = opts.open(&full).await?;
    Ok(handles.insert(path.to_path_buf(), file, true))
}

async fn write_handle(
    handles: &HandleTable,
    handle: Handle,
    offset: u64,
    data: &[u8],
) -> Result<u32> {
    let entry = handles.get(handle)?;
    if !entry.writable {
        return Err(Error::PermissionDenied);
    }
    let mut file = entry.file.lock().await;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    Ok(data.len() as u32)
}

async fn fsync(handles: &HandleTable, handle: Handle) -> Result<()> {
    let entry = handles.get(handle)?;
    let file = entry.file.lock().await;
    file.sync_all().await?;
    Ok(())
}

async fn unlink(root: &Path, path: &Path) -> Result<()> {
    let full = resolve(root, path)?;
    tokio::fs::remove_file(&full).await?;
    Ok(())
}

async fn mkdir(root: &Path, path: &Path, mode: u32) -> Result<()> {
    let full = resolve(root, path)?;
    tokio::fs::create_dir(&full).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&full, std::fs::Permissions::from_mode(mode)).await?;
    }
    Ok(())
}

async fn rmdir(root: &Path, path: &Path) -> Result<()> {
    let full = resolve(root, path)?;
    tokio::fs::remove_dir(&full).await?;
    Ok(())
}

async fn rename(root: &Path, from: &Path, to: &Path) -> Result<()> {
    let full_from = resolve(root, from)?;
    let full_to = resolve(root, to)?;
    tokio::fs::rename(&full_from, &full_to).await?;
    Ok(())
}

async fn chmod(root: &Path, path: &Path, mode: u32) -> Result<()> {
    let full = resolve(root, path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&full, std::fs::Permissions::from_mode(mode)).await?;
    }
    Ok(())
}

async fn chown(root: &Path, path: &Path, uid: u32, gid: u32) -> Result<()> {
    let full = resolve(root, path)?;
    tokio::task::spawn_blocking(move || chown_blocking(&full, uid, gid))
        .await
        .map_err(|_| Error::Io)?
}

fn chown_blocking(path: &Path, uid: u32, gid: u32) -> Result<()> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes()).map_err(|_| Error::Io)?;
    let rc = unsafe { libc::chown(c_path.as_ptr(), uid, gid) };
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::Io)
    }
}

async fn utimens(root: &Path, path: &Path, attr: &crate::types::SetAttr) -> Result<()> {
    let full = resolve(root, path)?;
    if let Some(size) = attr.size {
        let file = OpenOptions::new().write(true).open(&full).await?;
        file.set_len(size).await?;
    }
    if let Some(mode) = attr.mode {
        chmod(root, path, mode).await?;
    }
    if let (Some(uid), Some(gid)) = (attr.uid, attr.gid) {
        chown(root, path, uid, gid).await?;
    }
    Ok(())
}

async fn symlink(root: &Path, path: &Path, target: &Path) -> Result<()> {
    let full = resolve(root, path)?;
    tokio::fs::symlink(target, &full).await?;
    Ok(())
}

async fn link(root: &Path, path: &Path, target: &Path) -> Result<()> {
    let full_path = resolve(root, path)?;
    let full_target = resolve(root, target)?;
    tokio::fs::hard_link(&full_target, &full_path).await?;
    Ok(())
}

async fn statfs(root: &Path, path: &Path) -> Result<FsStats> {
    let full = resolve(root, path)?;
    tokio::task::spawn_blocking(move || statvfs_blocking(&full))
        .await
        .map_err(|_| Error::Io)?
}

fn statvfs_blocking(path: &Path) -> Result<FsStats> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes()).map_err(|_| Error::Io)?;
    let mut buf: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut buf) };
    if rc != 0 {
        return Err(Error::Io);
    }
    Ok(FsStats {
        total_bytes: buf.f_blocks as u64 * buf.f_frsize as u64,
        free_bytes: buf.f_bavail as u64 * buf.f_frsize as u64,
        total_inodes: buf.f_files as u64,
        free_inodes: buf.f_favail as u64,
    })
}

/// Best-effort bundle fetch for prefetch traffic: every path gets its own
/// entry and its own embedded result, so one missing shared library never
/// fails the whole bundle (spec §4.5).
///
/// `depth` is part of the wire request (spec §4.2) but unused here: a
/// directory's children already carry full attributes via `DirEntry`
/// regardless of the caller's requested depth, so no server behavior
/// currently distinguishes `depth=0` from `depth=1`. Kept on the request
/// shape rather than dropped so a future depth-aware bundle is a
/// server-only change.
async fn bulk_fetch(
    root: &Path,
    paths: &[PathBuf],
    _depth: u32,
    kinds: u32,
) -> Vec<crate::rpc::ops::BulkItem> {
    use crate::rpc::ops::{kind_bits, BulkItem};
    let mut items = Vec::with_capacity(paths.len());
    for path in paths {
        if kinds & kind_bits::ATTR != 0 {
            items.push(BulkItem::Attr { path: path.clone(), result: get_attr(root, path).await });
        }
        if kinds & kind_bits::DIRLIST != 0 {
            items.push(BulkItem::DirList { path: path.clone(), result: read_dir(root, path).await });
        }
        if kinds & kind_bits::READLINK != 0 {
            items.push(BulkItem::ReadLink { path: path.clone(), result: read_link(root, path).await });
        }
        if kinds & kind_bits::BLOB != 0 {
            let result = async {
                let (attr, validator) = get_attr(root, path).await?;
                let full = resolve(root, path)?;
                let data = tokio::fs::read(&full).await?;
                let hash = crate::types::ContentHash::of(&data);
                Ok((attr, validator, hash, data))
            }
            .await;
            items.push(BulkItem::Blob { path: path.clone(), result });
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_rejects_relative_and_traversal_paths() {
        let root = PathBuf::from("/srv/outrun-root");
        assert!(resolve(&root, Path::new("relative/path")).is_err());
        assert!(resolve(&root, Path::new("/../etc/passwd")).is_err());
        assert!(resolve(&root, Path::new("/etc/passwd")).is_ok());
    }

    #[tokio::test]
    async fn get_attr_and_read_round_trip_a_real_file() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("hello"), b"hello world").await.unwrap();

        let (attr, _validator) = get_attr(dir.path(), Path::new("/hello")).await.unwrap();
        assert_eq!(attr.size, 11);
        assert_eq!(attr.kind, FileKind::Regular);

        let handles = HandleTable::new();
        let (handle, _attr, len) = open_read(dir.path(), &handles, Path::new("/hello")).await.unwrap();
        assert_eq!(len, 11);
        let data = read_handle(&handles, handle, 0, 11).await.unwrap();
        assert_eq!(&data, b"hello world");
    }

    #[tokio::test]
    async fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let handles = HandleTable::new();
        const CREATE: u32 = 1;
        let handle = open_write(dir.path(), &handles, Path::new("/out"), CREATE, 0o644)
            .await
            .unwrap();
        write_handle(&handles, handle, 0, b"payload").await.unwrap();
        fsync(&handles, handle).await.unwrap();
        close(&handles, handle).await.unwrap();

        let contents = tokio::fs::read(dir.path().join("out")).await.unwrap();
        assert_eq!(contents, b"payload");
    }

    #[tokio::test]
    async fn bulk_fetch_reports_missing_paths_individually() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("present"), b"x").await.unwrap();

        let items = bulk_fetch(
            dir.path(),
            &[PathBuf::from("/present"), PathBuf::from("/missing")],
            1,
            crate::rpc::ops::kind_bits::ATTR,
        )
        .await;
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], crate::rpc::ops::BulkItem::Attr { result: Ok(_), .. }));
        assert!(matches!(&items[1], crate::rpc::ops::BulkItem::Attr { result: Err(Error::NotFound), .. }));
    }
}
