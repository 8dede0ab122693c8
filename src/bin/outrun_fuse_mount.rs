//! `outrun-fuse-mount` — the FUSE process that runs on R (spec §4.5, §6
//! "Mount point (R → kernel)").
//!
//! Runs the session handshake against `outrun-fs-server`, mounts
//! [`outrunfs::fuse::OutrunFs`] at the given mount point, and drains the
//! session on a shutdown signal: `Running → Draining → Closed` (spec §9),
//! unmounting before the cache's metadata log is flushed. Entering the
//! mount's chroot and forwarding the guest command's stdio are external
//! collaborators (spec §1); this binary's only output surface is the
//! mount itself (spec §6).

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use fuser::MountOption;
use tracing_subscriber::EnvFilter;

use outrunfs::config::Config;
use outrunfs::fuse::OutrunFs;
use outrunfs::session::Session;

#[derive(Parser, Debug)]
#[command(name = "outrun-fuse-mount", about = "Mounts L's filesystem on R via outrunfs")]
struct Args {
    /// Address of the `outrun-fs-server` process on L.
    #[arg(long)]
    server_addr: std::net::SocketAddr,

    /// Bearer token to present during the RPC handshake.
    #[arg(long, env = "OUTRUN_TOKEN")]
    token: String,

    /// Where to mount the filesystem on R.
    #[arg(long)]
    mount_point: PathBuf,

    /// Optional TOML config file (spec §6); any key it omits keeps its
    /// compiled-in default.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 1)]
    session_id: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match Config::load(path).await {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(?err, path = %path.display(), "failed to load config");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    let session = match Session::start(
        args.session_id,
        args.server_addr,
        args.token,
        args.mount_point.clone(),
        &config,
    )
    .await
    {
        Ok(session) => Arc::new(session),
        Err(err) => {
            tracing::error!(?err, "session handshake failed");
            std::process::exit(1);
        }
    };

    let fs = OutrunFs::new(tokio::runtime::Handle::current(), session.clone());

    let options = vec![
        MountOption::FSName("outrunfs".to_string()),
        MountOption::DefaultPermissions,
    ];

    let background = match tokio::task::spawn_blocking({
        let mount_point = args.mount_point.clone();
        move || fuser::spawn_mount2(fs, &mount_point, &options)
    })
    .await
    {
        Ok(Ok(background)) => background,
        Ok(Err(err)) => {
            tracing::error!(?err, "failed to mount");
            session.close().await;
            std::process::exit(1);
        }
        Err(err) => {
            tracing::error!(?err, "mount task panicked");
            session.close().await;
            std::process::exit(1);
        }
    };

    session.mark_running();
    tracing::info!(mount_point = %args.mount_point.display(), "mounted, serving requests");

    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received shutdown signal, draining session");

    session.begin_drain();
    drop(background);
    session.close().await;
}
