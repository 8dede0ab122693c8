//! outrunfs — the network filesystem plane of a "run a local command on a
//! remote host's CPU" system.
//!
//! This crate is the core described in the system's design: a FUSE
//! filesystem mounted on the remote host (R) that projects the local
//! host's (L) filesystem into R's process tree over a small RPC protocol,
//! backed by a persistent content-addressed cache and a deterministic
//! prefetch policy. Session bring-up over an encrypted remote shell,
//! privilege escalation, `chroot` setup, and CLI/config-file plumbing are
//! out of scope; they are external collaborators that call into
//! [`session::Session`] and [`fuse::OutrunFs`] at the boundary this crate
//! exposes.

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod fuse;
pub mod rpc;
pub mod session;
pub mod types;

pub use error::{Error, Result};
pub use session::Session;
