//! Self-describing record encodings for the data-model types in
//! [`crate::types`], built on top of [`crate::codec::primitive`].

use std::io::{Read, Write};

use crate::codec::primitive::*;
use crate::error::Error;
use crate::types::{Attributes, ContentHash, DirEntry, FileKind, SetAttr, Timestamp, Validator};

pub type Result<T> = std::result::Result<T, Error>;

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_PATH_LEN: usize = 4096;

pub fn write_timestamp(dst: &mut impl Write, t: &Timestamp) -> Result<()> {
    write_i64(dst, t.secs)?;
    write_u32(dst, t.nanos)
}

pub fn read_timestamp(src: &mut impl Read) -> Result<Timestamp> {
    Ok(Timestamp { secs: read_i64(src)?, nanos: read_u32(src)? })
}

fn kind_tag(kind: FileKind) -> u8 {
    match kind {
        FileKind::Regular => 0,
        FileKind::Directory => 1,
        FileKind::Symlink => 2,
        FileKind::BlockDevice => 3,
        FileKind::CharDevice => 4,
        FileKind::Fifo => 5,
        FileKind::Socket => 6,
    }
}

fn kind_from_tag(tag: u8) -> Result<FileKind> {
    Ok(match tag {
        0 => FileKind::Regular,
        1 => FileKind::Directory,
        2 => FileKind::Symlink,
        3 => FileKind::BlockDevice,
        4 => FileKind::CharDevice,
        5 => FileKind::Fifo,
        6 => FileKind::Socket,
        _ => return Err(Error::ProtocolError),
    })
}

pub fn write_attributes(dst: &mut impl Write, attr: &Attributes) -> Result<()> {
    write_u32(dst, attr.mode)?;
    write_u32(dst, attr.uid)?;
    write_u32(dst, attr.gid)?;
    write_u64(dst, attr.size)?;
    write_timestamp(dst, &attr.atime)?;
    write_timestamp(dst, &attr.mtime)?;
    write_timestamp(dst, &attr.ctime)?;
    write_u32(dst, attr.nlink)?;
    write_u32(dst, attr.rdev)?;
    write_u8(dst, kind_tag(attr.kind))
}

pub fn read_attributes(src: &mut impl Read) -> Result<Attributes> {
    Ok(Attributes {
        mode: read_u32(src)?,
        uid: read_u32(src)?,
        gid: read_u32(src)?,
        size: read_u64(src)?,
        atime: read_timestamp(src)?,
        mtime: read_timestamp(src)?,
        ctime: read_timestamp(src)?,
        nlink: read_u32(src)?,
        rdev: read_u32(src)?,
        kind: kind_from_tag(read_u8(src)?)?,
    })
}

pub fn write_dir_entry(dst: &mut impl Write, entry: &DirEntry) -> Result<()> {
    write_string(dst, &entry.name, MAX_NAME_LEN)?;
    write_attributes(dst, &entry.attr)
}

pub fn read_dir_entry(src: &mut impl Read) -> Result<DirEntry> {
    Ok(DirEntry { name: read_string(src, MAX_NAME_LEN)?, attr: read_attributes(src)? })
}

pub fn write_validator(dst: &mut impl Write, v: &Validator) -> Result<()> {
    write_i64(dst, v.mtime_ns)?;
    write_u64(dst, v.size)?;
    write_u64(dst, v.ino_hint_server)
}

pub fn read_validator(src: &mut impl Read) -> Result<Validator> {
    Ok(Validator {
        mtime_ns: read_i64(src)?,
        size: read_u64(src)?,
        ino_hint_server: read_u64(src)?,
    })
}

pub fn write_content_hash(dst: &mut impl Write, h: &ContentHash) -> Result<()> {
    write_array(dst, &h.0)
}

pub fn read_content_hash(src: &mut impl Read) -> Result<ContentHash> {
    Ok(ContentHash(read_array(src)?))
}

pub fn write_set_attr(dst: &mut impl Write, s: &SetAttr) -> Result<()> {
    write_option(dst, &s.mode, |w, v| write_u32(w, *v))?;
    write_option(dst, &s.uid, |w, v| write_u32(w, *v))?;
    write_option(dst, &s.gid, |w, v| write_u32(w, *v))?;
    write_option(dst, &s.size, |w, v| write_u64(w, *v))?;
    write_option(dst, &s.atime, |w, v| write_timestamp(w, v))?;
    write_option(dst, &s.mtime, |w, v| write_timestamp(w, v))
}

pub fn read_set_attr(src: &mut impl Read) -> Result<SetAttr> {
    Ok(SetAttr {
        mode: read_option(src, |r| read_u32(r))?,
        uid: read_option(src, |r| read_u32(r))?,
        gid: read_option(src, |r| read_u32(r))?,
        size: read_option(src, |r| read_u64(r))?,
        atime: read_option(src, |r| read_timestamp(r))?,
        mtime: read_option(src, |r| read_timestamp(r))?,
    })
}

/// Writes a path, capped at [`MAX_PATH_LEN`] the way the RPC server caps
/// every path-bearing argument (spec §4.2 path traversal guard lives
/// downstream of this cap, not inside it).
pub fn write_path(dst: &mut impl Write, path: &std::path::Path) -> Result<()> {
    let s = path.to_str().ok_or(Error::ProtocolError)?;
    write_string(dst, s, MAX_PATH_LEN)
}

pub fn read_path(src: &mut impl Read) -> Result<std::path::PathBuf> {
    Ok(std::path::PathBuf::from(read_string(src, MAX_PATH_LEN)?))
}

/// Encodes `Result<T, Error>` as a tagged union: one discriminant byte, then
/// either the success payload or a one-byte error code. This is the only
/// place `Error` itself crosses the wire.
pub fn write_result<T>(
    dst: &mut impl Write,
    result: &Result<T>,
    write_ok: impl FnOnce(&mut dyn Write, &T) -> Result<()>,
) -> Result<()> {
    match result {
        Ok(value) => {
            write_bool(dst, true)?;
            write_ok(dst, value)
        }
        Err(err) => {
            write_bool(dst, false)?;
            write_u8(dst, error_tag(*err))
        }
    }
}

pub fn read_result<T>(
    src: &mut impl Read,
    read_ok: impl FnOnce(&mut dyn Read) -> Result<T>,
) -> Result<Result<T>> {
    if read_bool(src)? {
        Ok(Ok(read_ok(src)?))
    } else {
        Ok(Err(error_from_tag(read_u8(src)?)?))
    }
}

fn error_tag(err: Error) -> u8 {
    match err {
        Error::NotFound => 0,
        Error::PermissionDenied => 1,
        Error::NotADirectory => 2,
        Error::NotASymlink => 3,
        Error::NoSpace => 4,
        Error::BadHandle => 5,
        Error::Io => 6,
        Error::Timeout => 7,
        Error::Busy => 8,
        Error::Interrupted => 9,
        Error::ProtocolError => 10,
        Error::AuthFailed => 11,
        Error::Shutdown => 12,
        Error::CacheCorrupt => 13,
    }
}

fn error_from_tag(tag: u8) -> Result<Error> {
    Ok(match tag {
        0 => Error::NotFound,
        1 => Error::PermissionDenied,
        2 => Error::NotADirectory,
        3 => Error::NotASymlink,
        4 => Error::NoSpace,
        5 => Error::BadHandle,
        6 => Error::Io,
        7 => Error::Timeout,
        8 => Error::Busy,
        9 => Error::Interrupted,
        10 => Error::ProtocolError,
        11 => Error::AuthFailed,
        12 => Error::Shutdown,
        13 => Error::CacheCorrupt,
        _ => return Err(Error::ProtocolError),
    })
}
