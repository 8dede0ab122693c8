//! `outrun-fs-server` — the RPC server process that runs on L (spec §4.2).
//!
//! A thin host around [`outrunfs::rpc::server`]: parses the bind address,
//! the filesystem root to expose, and the session bearer token, then runs
//! the accept loop until a signal requests shutdown. Session bring-up,
//! privilege drop and the encrypted transport that tunnels this socket are
//! external collaborators (spec §1 "out of scope"); this binary only ever
//! sees a plain TCP listener handed to it by whatever wraps it.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use outrunfs::rpc::server::{serve, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "outrun-fs-server", about = "Serves L's filesystem to a remote outrunfs mount")]
struct Args {
    /// Address to bind and listen on.
    #[arg(long, default_value = "0.0.0.0:7417")]
    bind_addr: std::net::SocketAddr,

    /// Directory presented to clients as their filesystem root. Paths in
    /// every request are resolved relative to this root, never to the
    /// process's real `/` (spec §4.2 "forbids path traversal above its
    /// advertised root").
    #[arg(long, default_value = "/")]
    root: PathBuf,

    /// Bearer token a connecting client must present before any other
    /// request is served. Falls back to `OUTRUN_TOKEN` so it need not be
    /// visible in a process listing.
    #[arg(long, env = "OUTRUN_TOKEN")]
    token: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Arc::new(ServerConfig::new(args.bind_addr, args.root, args.token));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    if let Err(err) = serve(config, shutdown_rx).await {
        tracing::error!(?err, "rpc server exited with an error");
        std::process::exit(1);
    }
}
