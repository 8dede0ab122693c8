//! Data model shared by the codec, RPC layers, cache and FUSE filesystem
//! (spec §3).
//!
//! Paths are always L-absolute byte strings; the FUSE boundary is the only
//! place that translates between L's namespace and R's mount point.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// An absolute path in L's namespace.
pub type FsPath = PathBuf;

/// POSIX file attributes (spec §3 "Attributes").
///
/// `ino_hint` is generated locally by R's FUSE layer to give the kernel
/// stable inode numbers; per spec it is never put on the wire, so it lives
/// outside this struct (see [`crate::fuse::inode::InodeTable`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub nlink: u32,
    pub rdev: u32,
    pub kind: FileKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

/// `(name, attributes)` pair; directory listings are complete snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub attr: Attributes,
}

/// The byte contents of a regular file plus its content hash and length.
///
/// The hash is always over the uncompressed bytes, even when the blob
/// travels compressed on the wire (spec §3 "Blob").
#[derive(Debug, Clone)]
pub struct Blob {
    pub hash: ContentHash,
    pub len: u64,
    pub data: Vec<u8>,
}

impl Blob {
    pub fn new(data: Vec<u8>) -> Self {
        let hash = ContentHash::of(&data);
        Blob { hash, len: data.len() as u64, data }
    }

    /// Spec invariant: a blob entry's content hash equals the digest of its
    /// bytes (P2 / cache invariant).
    pub fn is_valid(&self) -> bool {
        self.hash == ContentHash::of(&self.data)
    }
}

/// 256-bit BLAKE3 digest of a blob's uncompressed bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn of(data: &[u8]) -> Self {
        ContentHash(*blake3::hash(data).as_bytes())
    }

    pub fn to_hex(self) -> String {
        let mut s = String::with_capacity(64);
        for byte in self.0 {
            s.push_str(&format!("{byte:02x}"));
        }
        s
    }

    /// First byte of the digest, used to fan blobs out into `blobs/<hh>/…`
    /// shard directories (spec §6 persisted cache layout).
    pub fn shard(self) -> String {
        format!("{:02x}", self.0[0])
    }
}

/// `(mtime_ns, size, ino_hint_server)` — identifies a specific observed
/// version of an inode, used for cross-session cache revalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Validator {
    pub mtime_ns: i64,
    pub size: u64,
    pub ino_hint_server: u64,
}

impl Validator {
    pub fn from_attr(attr: &Attributes, ino_hint_server: u64) -> Self {
        Validator {
            mtime_ns: attr.mtime.secs * 1_000_000_000 + attr.mtime.nanos as i64,
            size: attr.size,
            ino_hint_server,
        }
    }
}

/// Attribute modification requested by a `setattr`-style FUSE call.
#[derive(Debug, Clone, Default)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<Timestamp>,
    pub mtime: Option<Timestamp>,
}

/// Normalizes a byte path the way the RPC server enforces its root: must be
/// absolute and must not escape via `..` traversal (spec §4.2).
pub fn is_well_rooted(path: &Path) -> bool {
    path.is_absolute() && !path.components().any(|c| matches!(c, std::path::Component::ParentDir))
}
