//! Operation table exposed by the RPC server (spec §4.2) and the request /
//! response payloads the wire codec carries for each of them.

use std::path::PathBuf;

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

use crate::codec::primitive::*;
use crate::codec::record::*;
use crate::error::{Error, Result as CrateResult};
use crate::types::{Attributes, ContentHash, DirEntry, SetAttr, Validator};

/// Server-local opaque handle, scoped to one connection (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u64);

/// One bit per cache entry kind a `bulk_fetch` may be asked to include.
pub mod kind_bits {
    pub const ATTR: u32 = 1 << 0;
    pub const DIRLIST: u32 = 1 << 1;
    pub const READLINK: u32 = 1 << 2;
    pub const BLOB: u32 = 1 << 3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Auth = 0,
    GetAttr = 1,
    ReadDir = 2,
    ReadLink = 3,
    OpenRead = 4,
    Read = 5,
    Close = 6,
    OpenWrite = 7,
    Write = 8,
    Fsync = 9,
    Unlink = 10,
    Mkdir = 11,
    Rmdir = 12,
    Rename = 13,
    Chmod = 14,
    Chown = 15,
    Utimens = 16,
    Symlink = 17,
    Link = 18,
    BulkFetch = 19,
    Statfs = 20,
}

impl Opcode {
    pub fn to_u8(self) -> u8 {
        ToPrimitive::to_u8(&self).expect("Opcode always fits in u8")
    }

    pub fn from_u8(tag: u8) -> CrateResult<Self> {
        FromPrimitive::from_u8(tag).ok_or(Error::ProtocolError)
    }
}

#[derive(Debug, Clone)]
pub struct FsStats {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
}

/// Request payloads, one variant per §4.2 operation.
#[derive(Debug, Clone)]
pub enum Request {
    Auth { token: String },
    GetAttr { path: PathBuf },
    ReadDir { path: PathBuf },
    ReadLink { path: PathBuf },
    OpenRead { path: PathBuf },
    Read { handle: Handle, offset: u64, length: u32 },
    Close { handle: Handle },
    OpenWrite { path: PathBuf, flags: u32, mode: u32 },
    Write { handle: Handle, offset: u64, data: Vec<u8> },
    Fsync { handle: Handle },
    Unlink { path: PathBuf },
    Mkdir { path: PathBuf, mode: u32 },
    Rmdir { path: PathBuf },
    Rename { from: PathBuf, to: PathBuf },
    Chmod { path: PathBuf, mode: u32 },
    Chown { path: PathBuf, uid: u32, gid: u32 },
    Utimens { path: PathBuf, attr: SetAttr },
    Symlink { path: PathBuf, target: PathBuf },
    Link { path: PathBuf, target: PathBuf },
    BulkFetch { paths: Vec<PathBuf>, depth: u32, kinds: u32 },
    Statfs { path: PathBuf },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Auth { .. } => Opcode::Auth,
            Request::GetAttr { .. } => Opcode::GetAttr,
            Request::ReadDir { .. } => Opcode::ReadDir,
            Request::ReadLink { .. } => Opcode::ReadLink,
            Request::OpenRead { .. } => Opcode::OpenRead,
            Request::Read { .. } => Opcode::Read,
            Request::Close { .. } => Opcode::Close,
            Request::OpenWrite { .. } => Opcode::OpenWrite,
            Request::Write { .. } => Opcode::Write,
            Request::Fsync { .. } => Opcode::Fsync,
            Request::Unlink { .. } => Opcode::Unlink,
            Request::Mkdir { .. } => Opcode::Mkdir,
            Request::Rmdir { .. } => Opcode::Rmdir,
            Request::Rename { .. } => Opcode::Rename,
            Request::Chmod { .. } => Opcode::Chmod,
            Request::Chown { .. } => Opcode::Chown,
            Request::Utimens { .. } => Opcode::Utimens,
            Request::Symlink { .. } => Opcode::Symlink,
            Request::Link { .. } => Opcode::Link,
            Request::BulkFetch { .. } => Opcode::BulkFetch,
            Request::Statfs { .. } => Opcode::Statfs,
        }
    }

    pub fn encode(&self) -> CrateResult<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Request::Auth { token } => write_string(&mut buf, token, 256)?,
            Request::GetAttr { path }
            | Request::ReadDir { path }
            | Request::ReadLink { path }
            | Request::OpenRead { path }
            | Request::Unlink { path }
            | Request::Rmdir { path }
            | Request::Statfs { path } => write_path(&mut buf, path)?,
            Request::Read { handle, offset, length } => {
                write_u64(&mut buf, handle.0)?;
                write_u64(&mut buf, *offset)?;
                write_u32(&mut buf, *length)?;
            }
            Request::Close { handle } | Request::Fsync { handle } => write_u64(&mut buf, handle.0)?,
            Request::OpenWrite { path, flags, mode } => {
                write_path(&mut buf, path)?;
                write_u32(&mut buf, *flags)?;
                write_u32(&mut buf, *mode)?;
            }
            Request::Write { handle, offset, data } => {
                write_u64(&mut buf, handle.0)?;
                write_u64(&mut buf, *offset)?;
                write_bytes(&mut buf, data, 256 * 1024 * 1024)?;
            }
            Request::Mkdir { path, mode } => {
                write_path(&mut buf, path)?;
                write_u32(&mut buf, *mode)?;
            }
            Request::Rename { from, to } => {
                write_path(&mut buf, from)?;
                write_path(&mut buf, to)?;
            }
            Request::Chmod { path, mode } => {
                write_path(&mut buf, path)?;
                write_u32(&mut buf, *mode)?;
            }
            Request::Chown { path, uid, gid } => {
                write_path(&mut buf, path)?;
                write_u32(&mut buf, *uid)?;
                write_u32(&mut buf, *gid)?;
            }
            Request::Utimens { path, attr } => {
                write_path(&mut buf, path)?;
                write_set_attr(&mut buf, attr)?;
            }
            Request::Symlink { path, target } | Request::Link { path, target } => {
                write_path(&mut buf, path)?;
                write_path(&mut buf, target)?;
            }
            Request::BulkFetch { paths, depth, kinds } => {
                write_vec(&mut buf, paths, 4096, |w, p| write_path(w, p))?;
                write_u32(&mut buf, *depth)?;
                write_u32(&mut buf, *kinds)?;
            }
        }
        Ok(buf)
    }

    pub fn decode(opcode: Opcode, mut payload: &[u8]) -> CrateResult<Self> {
        let src = &mut payload;
        Ok(match opcode {
            Opcode::Auth => Request::Auth { token: read_string(src, 256)? },
            Opcode::GetAttr => Request::GetAttr { path: read_path(src)? },
            Opcode::ReadDir => Request::ReadDir { path: read_path(src)? },
            Opcode::ReadLink => Request::ReadLink { path: read_path(src)? },
            Opcode::OpenRead => Request::OpenRead { path: read_path(src)? },
            Opcode::Unlink => Request::Unlink { path: read_path(src)? },
            Opcode::Rmdir => Request::Rmdir { path: read_path(src)? },
            Opcode::Statfs => Request::Statfs { path: read_path(src)? },
            Opcode::Read => Request::Read {
                handle: Handle(read_u64(src)?),
                offset: read_u64(src)?,
                length: read_u32(src)?,
            },
            Opcode::Close => Request::Close { handle: Handle(read_u64(src)?) },
            Opcode::Fsync => Request::Fsync { handle: Handle(read_u64(src)?) },
            Opcode::OpenWrite => Request::OpenWrite {
                path: read_path(src)?,
                flags: read_u32(src)?,
                mode: read_u32(src)?,
            },
            Opcode::Write => Request::Write {
                handle: Handle(read_u64(src)?),
                offset: read_u64(src)?,
                data: read_bytes(src, 256 * 1024 * 1024)?,
            },
            Opcode::Mkdir => Request::Mkdir { path: read_path(src)?, mode: read_u32(src)? },
            Opcode::Rename => Request::Rename { from: read_path(src)?, to: read_path(src)? },
            Opcode::Chmod => Request::Chmod { path: read_path(src)?, mode: read_u32(src)? },
            Opcode::Chown => {
                Request::Chown { path: read_path(src)?, uid: read_u32(src)?, gid: read_u32(src)? }
            }
            Opcode::Utimens => {
                Request::Utimens { path: read_path(src)?, attr: read_set_attr(src)? }
            }
            Opcode::Symlink => {
                Request::Symlink { path: read_path(src)?, target: read_path(src)? }
            }
            Opcode::Link => Request::Link { path: read_path(src)?, target: read_path(src)? },
            Opcode::BulkFetch => Request::BulkFetch {
                paths: read_vec(src, 4096, |r| read_path(r))?,
                depth: read_u32(src)?,
                kinds: read_u32(src)?,
            },
        })
    }
}

/// One entry of a `bulk_fetch` bundle: a per-item result under its own key,
/// so a single failed speculative prefetch never fails the whole request
/// (spec §4.5 "Prefetch is advisory").
#[derive(Debug, Clone)]
pub enum BulkItem {
    Attr { path: PathBuf, result: CrateResult<(Attributes, Validator)> },
    DirList { path: PathBuf, result: CrateResult<Vec<DirEntry>> },
    ReadLink { path: PathBuf, result: CrateResult<String> },
    Blob { path: PathBuf, result: CrateResult<(Attributes, Validator, ContentHash, Vec<u8>)> },
}

fn write_bulk_item(dst: &mut Vec<u8>, item: &BulkItem) -> CrateResult<()> {
    match item {
        BulkItem::Attr { path, result } => {
            write_u8(dst, 0)?;
            write_path(dst, path)?;
            write_result(dst, result, |w, (attr, validator)| {
                write_attributes(w, attr)?;
                write_validator(w, validator)
            })
        }
        BulkItem::DirList { path, result } => {
            write_u8(dst, 1)?;
            write_path(dst, path)?;
            write_result(dst, result, |w, entries| {
                write_vec(w, entries, 256, |w, e| write_dir_entry(w, e))
            })
        }
        BulkItem::ReadLink { path, result } => {
            write_u8(dst, 2)?;
            write_path(dst, path)?;
            write_result(dst, result, |w, target| write_string(w, target, MAX_PATH_LEN))
        }
        BulkItem::Blob { path, result } => {
            write_u8(dst, 3)?;
            write_path(dst, path)?;
            write_result(dst, result, |w, (attr, validator, hash, data)| {
                write_attributes(w, attr)?;
                write_validator(w, validator)?;
                write_content_hash(w, hash)?;
                write_bytes(w, data, 128 * 1024 * 1024)
            })
        }
    }
}

fn read_bulk_item(src: &mut &[u8]) -> CrateResult<BulkItem> {
    let tag = read_u8(src)?;
    Ok(match tag {
        0 => {
            let path = read_path(src)?;
            let result = read_result(src, |r| {
                let attr = read_attributes(r)?;
                let validator = read_validator(r)?;
                Ok((attr, validator))
            })?;
            BulkItem::Attr { path, result }
        }
        1 => {
            let path = read_path(src)?;
            let result = read_result(src, |r| read_vec(r, 256, |r| read_dir_entry(r)))?;
            BulkItem::DirList { path, result }
        }
        2 => {
            let path = read_path(src)?;
            let result = read_result(src, |r| read_string(r, MAX_PATH_LEN))?;
            BulkItem::ReadLink { path, result }
        }
        3 => {
            let path = read_path(src)?;
            let result = read_result(src, |r| {
                let attr = read_attributes(r)?;
                let validator = read_validator(r)?;
                let hash = read_content_hash(r)?;
                let data = read_bytes(r, 128 * 1024 * 1024)?;
                Ok((attr, validator, hash, data))
            })?;
            BulkItem::Blob { path, result }
        }
        _ => return Err(Error::ProtocolError),
    })
}

/// Response payloads. Operation-result errors are carried *inside* each
/// variant via [`crate::codec::record::write_result`] at encode time, never
/// alongside a success value (spec §7 "never both").
#[derive(Debug, Clone)]
pub enum Response {
    Auth(CrateResult<()>),
    GetAttr(CrateResult<(Attributes, Validator)>),
    ReadDir(CrateResult<Vec<DirEntry>>),
    ReadLink(CrateResult<String>),
    OpenRead(CrateResult<(Handle, Attributes, u64)>),
    Read(CrateResult<Vec<u8>>),
    Close(CrateResult<()>),
    OpenWrite(CrateResult<Handle>),
    Write(CrateResult<u32>),
    Fsync(CrateResult<()>),
    Unit(CrateResult<()>),
    BulkFetch(CrateResult<Vec<BulkItem>>),
    Statfs(CrateResult<FsStats>),
}

impl Response {
    pub fn encode(&self) -> CrateResult<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Response::Auth(r) => write_result(&mut buf, r, |_, _| Ok(()))?,
            Response::GetAttr(r) => write_result(&mut buf, r, |w, (attr, validator)| {
                write_attributes(w, attr)?;
                write_validator(w, validator)
            })?,
            Response::ReadDir(r) => {
                write_result(&mut buf, r, |w, entries| {
                    write_vec(w, entries, 1 << 20, |w, e| write_dir_entry(w, e))
                })?
            }
            Response::ReadLink(r) => {
                write_result(&mut buf, r, |w, target| write_string(w, target, MAX_PATH_LEN))?
            }
            Response::OpenRead(r) => write_result(&mut buf, r, |w, (handle, attr, len)| {
                write_u64(w, handle.0)?;
                write_attributes(w, attr)?;
                write_u64(w, *len)
            })?,
            Response::Read(r) => {
                write_result(&mut buf, r, |w, data| write_bytes(w, data, 256 * 1024 * 1024))?
            }
            Response::Close(r) | Response::Fsync(r) | Response::Unit(r) => {
                write_result(&mut buf, r, |_, _| Ok(()))?
            }
            Response::OpenWrite(r) => write_result(&mut buf, r, |w, handle| write_u64(w, handle.0))?,
            Response::Write(r) => write_result(&mut buf, r, |w, n| write_u32(w, *n))?,
            Response::BulkFetch(r) => {
                write_result(&mut buf, r, |w, items| {
                    write_u32(w, items.len() as u32)?;
                    for item in items {
                        write_bulk_item(w, item)?;
                    }
                    Ok(())
                })?
            }
            Response::Statfs(r) => write_result(&mut buf, r, |w, stats| {
                write_u64(w, stats.total_bytes)?;
                write_u64(w, stats.free_bytes)?;
                write_u64(w, stats.total_inodes)?;
                write_u64(w, stats.free_inodes)
            })?,
        }
        Ok(buf)
    }

    pub fn decode(opcode: Opcode, mut payload: &[u8]) -> CrateResult<Self> {
        let src = &mut payload;
        Ok(match opcode {
            Opcode::Auth => Response::Auth(read_result(src, |_| Ok(()))?),
            Opcode::GetAttr => Response::GetAttr(read_result(src, |r| {
                let attr = read_attributes(r)?;
                let validator = read_validator(r)?;
                Ok((attr, validator))
            })?),
            Opcode::ReadDir => {
                Response::ReadDir(read_result(src, |r| read_vec(r, 1 << 20, |r| read_dir_entry(r)))?)
            }
            Opcode::ReadLink => {
                Response::ReadLink(read_result(src, |r| read_string(r, MAX_PATH_LEN))?)
            }
            Opcode::OpenRead => Response::OpenRead(read_result(src, |r| {
                let handle = Handle(read_u64(r)?);
                let attr = read_attributes(r)?;
                let len = read_u64(r)?;
                Ok((handle, attr, len))
            })?),
            Opcode::Read => Response::Read(read_result(src, |r| read_bytes(r, 256 * 1024 * 1024))?),
            Opcode::Close => Response::Close(read_result(src, |_| Ok(()))?),
            Opcode::Fsync => Response::Fsync(read_result(src, |_| Ok(()))?),
            Opcode::OpenWrite => {
                Response::OpenWrite(read_result(src, |r| Ok(Handle(read_u64(r)?)))?)
            }
            Opcode::Write => Response::Write(read_result(src, |r| read_u32(r))?),
            Opcode::Unlink
            | Opcode::Mkdir
            | Opcode::Rmdir
            | Opcode::Rename
            | Opcode::Chmod
            | Opcode::Chown
            | Opcode::Utimens
            | Opcode::Symlink
            | Opcode::Link => Response::Unit(read_result(src, |_| Ok(()))?),
            Opcode::BulkFetch => Response::BulkFetch(read_result(src, |r| {
                let count = read_u32(r)? as usize;
                if count > 4096 {
                    return Err(Error::ProtocolError);
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(read_bulk_item(r)?);
                }
                Ok(items)
            })?),
            Opcode::Statfs => Response::Statfs(read_result(src, |r| {
                Ok(FsStats {
                    total_bytes: read_u64(r)?,
                    free_bytes: read_u64(r)?,
                    total_inodes: read_u64(r)?,
                    free_inodes: read_u64(r)?,
                })
            })?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_attr_request_round_trips() {
        let req = Request::GetAttr { path: PathBuf::from("/usr/bin/ffmpeg") };
        let encoded = req.encode().unwrap();
        let decoded = Request::decode(Opcode::GetAttr, &encoded).unwrap();
        match decoded {
            Request::GetAttr { path } => assert_eq!(path, PathBuf::from("/usr/bin/ffmpeg")),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn bulk_fetch_response_preserves_per_item_errors() {
        let resp = Response::BulkFetch(Ok(vec![
            BulkItem::Attr { path: PathBuf::from("/lib/libc.so"), result: Err(Error::NotFound) },
            BulkItem::DirList { path: PathBuf::from("/lib"), result: Ok(vec![]) },
        ]));
        let encoded = resp.encode().unwrap();
        let decoded = Response::decode(Opcode::BulkFetch, &encoded).unwrap();
        match decoded {
            Response::BulkFetch(Ok(items)) => {
                assert_eq!(items.len(), 2);
                match &items[0] {
                    BulkItem::Attr { result: Err(Error::NotFound), .. } => {}
                    other => panic!("unexpected item: {other:?}"),
                }
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn opcode_round_trips_through_u8() {
        for op in [Opcode::Auth, Opcode::BulkFetch, Opcode::Statfs, Opcode::Write] {
            assert_eq!(Opcode::from_u8(op.to_u8()).unwrap(), op);
        }
    }
}
