//! The session lifecycle (spec §3 `Session`, §9 "explicit state machine"):
//! the one piece of process-wide mutable state, created at handshake and
//! torn down at unmount with guaranteed release of the cache writer, the
//! connection pool, and the FUSE mount on every exit path.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::cache::{Cache, CacheConfig};
use crate::config::Config;
use crate::error::Result;
use crate::rpc::client::RpcClient;

/// `Init → Handshake → Mounted → Running → Draining → Closed` (spec §9).
/// Transitions are one-directional; there is no going back to an earlier
/// state once the session has moved on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Handshake,
    Mounted,
    Running,
    Draining,
    Closed,
}

impl SessionState {
    fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Init, Handshake)
                | (Handshake, Mounted)
                | (Mounted, Running)
                | (Running, Draining)
                | (Draining, Closed)
        )
    }
}

/// `{id, token, L_root_version, R_mount_point, cache_root, pool}` (spec §3).
/// The sole process-wide state; created at handshake, destroyed at unmount.
pub struct Session {
    pub id: u64,
    token: String,
    l_root_version: std::sync::atomic::AtomicI64,
    r_mount_point: PathBuf,
    cache: Arc<Cache>,
    pool: Arc<RpcClient>,
    state: std::sync::Mutex<SessionState>,
}

impl Session {
    /// Runs the handshake against `server_addr` and opens the persistent
    /// cache, moving `Init → Handshake → Mounted`. Returns a session ready
    /// for `FUSE` to start dispatching requests against (`Running` is
    /// entered explicitly by the caller once the mount syscall succeeds).
    #[instrument(skip(config, token))]
    pub async fn start(
        id: u64,
        server_addr: SocketAddr,
        token: String,
        r_mount_point: PathBuf,
        config: &Config,
    ) -> Result<Self> {
        let state = std::sync::Mutex::new(SessionState::Init);
        Self::advance(&state, SessionState::Handshake);

        let pool = RpcClient::connect(server_addr, &token, config.rpc.pool_size).await?;
        info!(%server_addr, pool_size = config.rpc.pool_size, "rpc handshake complete");

        let cache_config = CacheConfig {
            root: config.cache.path.clone(),
            max_entries: config.cache.max_entries,
            max_size: config.cache.max_size,
            system_path_prefixes: config.system_paths.clone(),
        };
        let cache = Cache::open(cache_config).await?;

        // Captures the `L_root_version` stamp (spec §4.4 "Coherence model")
        // from a `getattr("/")` rather than a dedicated op: the root
        // directory's mtime changes whenever an entry is added or removed
        // directly under it, which is as good a cheap proxy for "has L's
        // filesystem moved on since we last looked" as a real epoch counter
        // would be, and needs no new wire operation.
        let root_version = match pool.get_attr(PathBuf::from("/")).await {
            Ok((_, validator)) => validator.mtime_ns,
            Err(err) => {
                warn!(?err, "failed to capture L_root_version at handshake, defaulting to 0");
                0
            }
        };

        Self::advance(&state, SessionState::Mounted);

        let session = Session {
            id,
            token,
            l_root_version: std::sync::atomic::AtomicI64::new(0),
            r_mount_point,
            cache: Arc::new(cache),
            pool: Arc::new(pool),
            state,
        };
        session.set_root_version(root_version);
        Ok(session)
    }

    fn advance(state: &std::sync::Mutex<SessionState>, next: SessionState) {
        let mut guard = state.lock().unwrap();
        debug_assert!(guard.can_advance_to(next), "illegal session transition {guard:?} -> {next:?}");
        *guard = next;
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    /// `Mounted → Running`: the FUSE mount syscall has completed and the
    /// filesystem is serving requests.
    pub fn mark_running(&self) {
        Self::advance(&self.state, SessionState::Running);
    }

    /// `Running → Draining`: unmount has been requested (explicitly or by a
    /// signal); in-flight FUSE requests are given a chance to finish but new
    /// ones observe `Shutdown`.
    pub fn begin_drain(&self) {
        Self::advance(&self.state, SessionState::Draining);
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn pool(&self) -> &Arc<RpcClient> {
        &self.pool
    }

    pub fn mount_point(&self) -> &std::path::Path {
        &self.r_mount_point
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn set_root_version(&self, version: i64) {
        self.l_root_version.store(version, std::sync::atomic::Ordering::Relaxed);
        self.cache.set_root_version(version);
    }

    pub fn root_version(&self) -> i64 {
        self.l_root_version.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// `Draining → Closed`: flushes the cache's metadata log and drops the
    /// session's owned resources. Called from the normal unmount path and
    /// from every signal-triggered teardown path, so it must never panic.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        Self::advance(&self.state, SessionState::Closed);
        if let Err(err) = self.cache.compact().await {
            warn!(?err, "failed to compact cache on session close");
        }
        info!(session_id = self.id, "session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(cache_root: PathBuf) -> Config {
        let mut config = Config::default();
        config.cache.path = cache_root;
        config
    }

    async fn spawn_test_server(root: PathBuf, token: &str) -> SocketAddr {
        let server_config = Arc::new(crate::rpc::server::ServerConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            root,
            token.to_string(),
        ));
        let listener = tokio::net::TcpListener::bind(server_config.bind_addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_tx, rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            let _ = crate::rpc::server::serve_listener(listener, server_config, rx).await;
        });
        addr
    }

    #[tokio::test]
    async fn start_moves_through_init_handshake_mounted() {
        let l_root = tempfile::tempdir().unwrap();
        let cache_root = tempfile::tempdir().unwrap();
        let addr = spawn_test_server(l_root.path().to_path_buf(), "secret").await;

        let config = test_config(cache_root.path().to_path_buf());
        let session = Session::start(1, addr, "secret".to_string(), PathBuf::from("/mnt/outrun"), &config)
            .await
            .unwrap();

        assert_eq!(session.state(), SessionState::Mounted);
        session.mark_running();
        assert_eq!(session.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn close_is_idempotent_with_respect_to_cache_compaction() {
        let l_root = tempfile::tempdir().unwrap();
        let cache_root = tempfile::tempdir().unwrap();
        let addr = spawn_test_server(l_root.path().to_path_buf(), "secret").await;

        let config = test_config(cache_root.path().to_path_buf());
        let session = Session::start(1, addr, "secret".to_string(), PathBuf::from("/mnt/outrun"), &config)
            .await
            .unwrap();
        session.mark_running();
        session.begin_drain();
        session.close().await;

        assert_eq!(session.state(), SessionState::Closed);
    }
}
