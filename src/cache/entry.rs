//! In-memory shape of a cache entry (spec §3 `CacheEntry`) and the key
//! schema of §4.4: `attr`/`dirlist`/`readlink`/`negative` keyed by
//! L-absolute path, `blob` keyed by content hash.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::{Attributes, ContentHash, DirEntry, Validator};

/// Which operation a negative entry remembers the absence of — a `negative`
/// cache is keyed by `(path, op)` per spec §4.4, not just by path, so a
/// missing `readlink` on a path doesn't shadow a present `getattr` on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NegativeOp {
    Attr,
    DirList,
    ReadLink,
    Blob,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheKey {
    Attr(PathBuf),
    DirList(PathBuf),
    ReadLink(PathBuf),
    Negative(PathBuf, NegativeOp),
    Blob(ContentHash),
}

impl CacheKey {
    /// Blobs are the only entries not keyed by path; everything else's
    /// `attr`-style entry may *reference* a blob hash but the key itself
    /// stays path-based so identical files at different paths share a blob
    /// without the metadata layer knowing it.
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            CacheKey::Attr(p) | CacheKey::DirList(p) | CacheKey::ReadLink(p) => Some(p),
            CacheKey::Negative(p, _) => Some(p),
            CacheKey::Blob(_) => None,
        }
    }
}

/// Payload carried by a cache entry, matching spec §3's `kind` closed sum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Attr { attr: Attributes, blob_hash: Option<ContentHash> },
    DirList(Vec<DirEntry>),
    ReadLink(String),
    Blob,
    Negative(NegativeError),
}

/// The subset of [`Error`] a negative entry is allowed to remember — only
/// the errors that are themselves stable facts about a path, not transient
/// faults like `Timeout` or `Busy` that must not be cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegativeError {
    NotFound,
    NotADirectory,
    NotASymlink,
    PermissionDenied,
}

impl NegativeError {
    pub fn to_error(self) -> Error {
        match self {
            NegativeError::NotFound => Error::NotFound,
            NegativeError::NotADirectory => Error::NotADirectory,
            NegativeError::NotASymlink => Error::NotASymlink,
            NegativeError::PermissionDenied => Error::PermissionDenied,
        }
    }

    pub fn from_error(err: Error) -> Option<Self> {
        match err {
            Error::NotFound => Some(NegativeError::NotFound),
            Error::NotADirectory => Some(NegativeError::NotADirectory),
            Error::NotASymlink => Some(NegativeError::NotASymlink),
            Error::PermissionDenied => Some(NegativeError::PermissionDenied),
            _ => None,
        }
    }
}

/// One record in the persistent index (spec §3 `CacheEntry`).
///
/// `last_use` is a logical counter, not a wall-clock timestamp, so LRU
/// ordering stays correct across clock adjustments (spec §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub payload: Payload,
    pub validator: Option<Validator>,
    pub last_use: u64,
    pub bytes_on_disk: u64,
}

impl CacheEntry {
    /// Blobs are only evictable once no `attr` entry references their hash
    /// (spec §4.4 "orphan blobs evicted first"); metadata entries carry no
    /// such restriction.
    pub fn is_blob(&self) -> bool {
        matches!(self.key, CacheKey::Blob(_))
    }
}
