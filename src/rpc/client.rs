//! RPC client (spec §4.3): connection pool, request multiplexer, response
//! demultiplexer used by the cache and FUSE filesystem on R.
//!
//! Grounded on the server's own connection handling
//! ([`crate::rpc::server::handle_connection`]): one dedicated writer fed by
//! a channel, one reader loop, the same split this crate uses on L. Here
//! the reader additionally demultiplexes responses by `request_id` into a
//! sharded waiter map instead of a single `HandleTable`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, instrument, warn};

use crate::codec::{read_frame, write_frame, Frame};
use crate::error::{Error, Result};
use crate::rpc::ops::Opcode;
use crate::rpc::{request_frame, response_from_frame, Request, Response};

/// Consecutive timeouts on one connection before it is recycled (spec
/// §4.3 "K consecutive timeouts").
const RECYCLE_AFTER_TIMEOUTS: usize = 5;

/// Per-op default (spec §4.3); `bulk_fetch` gets a scaled timeout instead
/// (see [`bulk_fetch_timeout`]).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Soft cap on a connection's simultaneously in-flight requests (spec §4.3
/// "Backpressure"). Exceeding it blocks the caller, or fails fast with
/// [`Error::Busy`] for callers that opt into non-blocking submission.
const WAITER_SOFT_CAP: usize = 256;

fn bulk_fetch_timeout(paths: usize) -> Duration {
    DEFAULT_TIMEOUT + Duration::from_millis(50 * paths as u64)
}

type Waiters = Arc<DashMap<u64, oneshot::Sender<Result<Response>>>>;

/// One pooled connection: a writer task fed by an unbounded channel (so
/// submit never blocks on socket backpressure) and a reader task that
/// demultiplexes replies into `waiters` by `request_id`.
struct Connection {
    write_tx: mpsc::UnboundedSender<Frame>,
    waiters: Waiters,
    inflight: AtomicUsize,
    consecutive_timeouts: AtomicUsize,
    backpressure: Semaphore,
}

impl Connection {
    async fn open(addr: SocketAddr, token: &str, max_frame_len: u32) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|_| Error::Io)?;
        stream.set_nodelay(true).map_err(|_| Error::Io)?;
        let (mut rd, mut wr) = stream.into_split();

        let auth = Request::Auth { token: token.to_string() };
        write_frame(&mut wr, &request_frame(0, &auth)?).await?;
        let reply = read_frame(&mut rd, max_frame_len).await?.ok_or(Error::ProtocolError)?;
        match response_from_frame(&reply)? {
            Response::Auth(Ok(())) => {}
            Response::Auth(Err(e)) => return Err(e),
            _ => return Err(Error::ProtocolError),
        }

        let waiters: Waiters = Arc::new(DashMap::new());
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Frame>();

        tokio::spawn(async move {
            while let Some(frame) = write_rx.recv().await {
                if write_frame(&mut wr, &frame).await.is_err() {
                    break;
                }
            }
        });

        let reader_waiters = waiters.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut rd, max_frame_len).await {
                    Ok(Some(frame)) => {
                        let request_id = frame.request_id;
                        let response = response_from_frame(&frame);
                        if let Some((_, tx)) = reader_waiters.remove(&request_id) {
                            let _ = tx.send(response);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "rpc connection reader stopped on a protocol error");
                        for entry in reader_waiters.iter() {
                            let _ = entry.value();
                        }
                        reader_waiters.clear();
                        break;
                    }
                }
            }
        });

        Ok(Connection {
            write_tx,
            waiters,
            inflight: AtomicUsize::new(0),
            consecutive_timeouts: AtomicUsize::new(0),
            backpressure: Semaphore::new(WAITER_SOFT_CAP),
        })
    }
}

/// Connection pool of size P (default 4), request multiplexer and response
/// demultiplexer (spec §4.3).
pub struct RpcClient {
    addr: SocketAddr,
    token: String,
    max_frame_len: u32,
    conns: Vec<tokio::sync::RwLock<Arc<Connection>>>,
    next_request_id: AtomicU64,
}

impl RpcClient {
    #[instrument(skip(token))]
    pub async fn connect(addr: SocketAddr, token: &str, pool_size: usize) -> Result<Self> {
        let max_frame_len = crate::rpc::MAX_FRAME_LEN;
        let mut conns = Vec::with_capacity(pool_size.max(1));
        for _ in 0..pool_size.max(1) {
            let conn = Connection::open(addr, token, max_frame_len).await?;
            conns.push(tokio::sync::RwLock::new(Arc::new(conn)));
        }
        debug!(pool_size, %addr, "rpc client connected");
        Ok(RpcClient { addr, token: token.to_string(), max_frame_len, conns, next_request_id: AtomicU64::new(1) })
    }

    /// Picks the connection with the fewest in-flight requests (spec §4.3
    /// "dispatched on the least-loaded connection"). `O(P)`, matching the
    /// free-list scan the spec's §5 concurrency model budgets for the pool.
    async fn pick(&self) -> (usize, Arc<Connection>) {
        let mut best = (0usize, usize::MAX);
        for (i, slot) in self.conns.iter().enumerate() {
            let conn = slot.read().await;
            let load = conn.inflight.load(Ordering::Relaxed);
            if load < best.1 {
                best = (i, load);
            }
        }
        let conn = self.conns[best.0].read().await.clone();
        (best.0, conn)
    }

    /// Sends `request` and awaits its response, retrying locally with
    /// capped exponential backoff on `Timeout`/`Busy` (spec §7, 3 attempts,
    /// base 100ms) before giving up.
    pub async fn call(&self, request: Request) -> Result<Response> {
        let mut delay = Duration::from_millis(100);
        for attempt in 0..3 {
            match self.call_once(&request).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() && attempt < 2 => {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) if e.is_retryable() => return Err(Error::Io),
                Err(e) => return Err(e),
            }
        }
        unreachable!("loop always returns within 3 attempts")
    }

    /// One attempt, no retry: submits on the least-loaded connection,
    /// awaits the matching reply or a timeout (spec §4.3).
    async fn call_once(&self, request: &Request) -> Result<Response> {
        let (idx, conn) = self.pick().await;

        let permit = match conn.backpressure.try_acquire() {
            Ok(p) => p,
            Err(_) => conn.backpressure.acquire().await.map_err(|_| Error::Busy)?,
        };

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        conn.waiters.insert(request_id, tx);
        conn.inflight.fetch_add(1, Ordering::Relaxed);

        let frame = request_frame(request_id, request)?;
        if conn.write_tx.send(frame).is_err() {
            conn.waiters.remove(&request_id);
            conn.inflight.fetch_sub(1, Ordering::Relaxed);
            drop(permit);
            return Err(Error::Io);
        }

        let timeout = match request {
            Request::BulkFetch { paths, .. } => bulk_fetch_timeout(paths.len()),
            _ => DEFAULT_TIMEOUT,
        };

        let result = tokio::time::timeout(timeout, rx).await;
        conn.inflight.fetch_sub(1, Ordering::Relaxed);
        drop(permit);

        match result {
            Ok(Ok(response)) => {
                conn.consecutive_timeouts.store(0, Ordering::Relaxed);
                response
            }
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => {
                // Spec §4.3: cancellation sends no wire message; the
                // waiter is simply dropped and any late reply is ignored.
                conn.waiters.remove(&request_id);
                let timeouts = conn.consecutive_timeouts.fetch_add(1, Ordering::Relaxed) + 1;
                if timeouts >= RECYCLE_AFTER_TIMEOUTS {
                    self.recycle(idx).await;
                }
                Err(Error::Timeout)
            }
        }
    }

    /// Replaces a connection that has accumulated too many consecutive
    /// timeouts (spec §4.3). In-flight waiters on the old connection are
    /// left to time out on their own; new submissions pick up the fresh
    /// connection via [`Self::pick`].
    async fn recycle(&self, idx: usize) {
        warn!(idx, "recycling rpc connection after repeated timeouts");
        match Connection::open(self.addr, &self.token, self.max_frame_len).await {
            Ok(fresh) => {
                *self.conns[idx].write().await = Arc::new(fresh);
            }
            Err(e) => warn!(idx, error = %e, "failed to recycle rpc connection"),
        }
    }

    pub async fn get_attr(&self, path: std::path::PathBuf) -> Result<(crate::types::Attributes, crate::types::Validator)> {
        match self.call(Request::GetAttr { path }).await? {
            Response::GetAttr(r) => r,
            _ => Err(Error::ProtocolError),
        }
    }

    pub async fn read_dir(&self, path: std::path::PathBuf) -> Result<Vec<crate::types::DirEntry>> {
        match self.call(Request::ReadDir { path }).await? {
            Response::ReadDir(r) => r,
            _ => Err(Error::ProtocolError),
        }
    }

    pub async fn read_link(&self, path: std::path::PathBuf) -> Result<String> {
        match self.call(Request::ReadLink { path }).await? {
            Response::ReadLink(r) => r,
            _ => Err(Error::ProtocolError),
        }
    }

    pub async fn open_read(
        &self,
        path: std::path::PathBuf,
    ) -> Result<(crate::rpc::ops::Handle, crate::types::Attributes, u64)> {
        match self.call(Request::OpenRead { path }).await? {
            Response::OpenRead(r) => r,
            _ => Err(Error::ProtocolError),
        }
    }

    pub async fn read(&self, handle: crate::rpc::ops::Handle, offset: u64, length: u32) -> Result<Vec<u8>> {
        match self.call(Request::Read { handle, offset, length }).await? {
            Response::Read(r) => r,
            _ => Err(Error::ProtocolError),
        }
    }

    pub async fn close(&self, handle: crate::rpc::ops::Handle) -> Result<()> {
        match self.call(Request::Close { handle }).await? {
            Response::Close(r) => r,
            _ => Err(Error::ProtocolError),
        }
    }

    pub async fn open_write(
        &self,
        path: std::path::PathBuf,
        flags: u32,
        mode: u32,
    ) -> Result<crate::rpc::ops::Handle> {
        match self.call(Request::OpenWrite { path, flags, mode }).await? {
            Response::OpenWrite(r) => r,
            _ => Err(Error::ProtocolError),
        }
    }

    pub async fn write(&self, handle: crate::rpc::ops::Handle, offset: u64, data: Vec<u8>) -> Result<u32> {
        match self.call(Request::Write { handle, offset, data }).await? {
            Response::Write(r) => r,
            _ => Err(Error::ProtocolError),
        }
    }

    pub async fn fsync(&self, handle: crate::rpc::ops::Handle) -> Result<()> {
        match self.call(Request::Fsync { handle }).await? {
            Response::Fsync(r) => r,
            _ => Err(Error::ProtocolError),
        }
    }

    pub async fn unit_call(&self, request: Request) -> Result<()> {
        match self.call(request).await? {
            Response::Unit(r) => r,
            _ => Err(Error::ProtocolError),
        }
    }

    pub async fn bulk_fetch(
        &self,
        paths: Vec<std::path::PathBuf>,
        depth: u32,
        kinds: u32,
    ) -> Result<Vec<crate::rpc::ops::BulkItem>> {
        match self.call(Request::BulkFetch { paths, depth, kinds }).await? {
            Response::BulkFetch(r) => r,
            _ => Err(Error::ProtocolError),
        }
    }

    pub async fn statfs(&self, path: std::path::PathBuf) -> Result<crate::rpc::ops::FsStats> {
        match self.call(Request::Statfs { path }).await? {
            Response::Statfs(r) => r,
            _ => Err(Error::ProtocolError),
        }
    }

    /// Total requests currently awaiting a reply across the whole pool, for
    /// diagnostics / tests.
    pub async fn total_inflight(&self) -> usize {
        let mut total = 0;
        for slot in &self.conns {
            total += slot.read().await.inflight.load(Ordering::Relaxed);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    async fn spawn_test_server(root: std::path::PathBuf, token: &str) -> SocketAddr {
        let config = Arc::new(crate::rpc::server::ServerConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            root,
            token.to_string(),
        ));
        let listener = tokio::net::TcpListener::bind(config.bind_addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_tx, rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            let _ = crate::rpc::server::serve_listener(listener, config, rx).await;
        });
        addr
    }

    #[tokio::test]
    async fn get_attr_round_trips_against_real_server() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("hello"), b"hi there").await.unwrap();
        let addr = spawn_test_server(dir.path().to_path_buf(), "secret").await;

        let client = RpcClient::connect(addr, "secret", 2).await.unwrap();
        let (attr, _validator) = client.get_attr(std::path::PathBuf::from("/hello")).await.unwrap();
        assert_eq!(attr.size, 8);
    }

    #[tokio::test]
    async fn wrong_token_fails_to_connect() {
        let dir = tempfile::tempdir().unwrap();
        let addr = spawn_test_server(dir.path().to_path_buf(), "secret").await;
        let result = RpcClient::connect(addr, "wrong", 1).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn concurrent_calls_spread_across_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..8 {
            tokio::fs::write(dir.path().join(format!("f{i}")), b"x").await.unwrap();
        }
        let addr = spawn_test_server(dir.path().to_path_buf(), "secret").await;
        let client = Arc::new(RpcClient::connect(addr, "secret", 4).await.unwrap());

        let mut tasks = Vec::new();
        for i in 0..8 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                client.get_attr(std::path::PathBuf::from(format!("/f{i}"))).await
            }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
    }
}
