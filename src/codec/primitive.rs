//! Primitive wire-format readers and writers.
//!
//! Mirrors the teacher's `parser::primitive` / `serializer` split: read-side
//! functions take `&mut impl Read`, write-side functions take `&mut impl
//! Write`, both returning [`Result`]. Unlike XDR this format has no 4-byte
//! alignment padding — there is no external RFC to stay bit-compatible
//! with, so the record format is free to be dense.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

fn io_err(_: std::io::Error) -> Error {
    Error::ProtocolError
}

pub fn write_u8(dst: &mut impl Write, v: u8) -> Result<()> {
    dst.write_u8(v).map_err(io_err)
}

pub fn read_u8(src: &mut impl Read) -> Result<u8> {
    src.read_u8().map_err(io_err)
}

pub fn write_u32(dst: &mut impl Write, v: u32) -> Result<()> {
    dst.write_u32::<BigEndian>(v).map_err(io_err)
}

pub fn read_u32(src: &mut impl Read) -> Result<u32> {
    src.read_u32::<BigEndian>().map_err(io_err)
}

pub fn write_u64(dst: &mut impl Write, v: u64) -> Result<()> {
    dst.write_u64::<BigEndian>(v).map_err(io_err)
}

pub fn read_u64(src: &mut impl Read) -> Result<u64> {
    src.read_u64::<BigEndian>().map_err(io_err)
}

pub fn write_i64(dst: &mut impl Write, v: i64) -> Result<()> {
    dst.write_i64::<BigEndian>(v).map_err(io_err)
}

pub fn read_i64(src: &mut impl Read) -> Result<i64> {
    src.read_i64::<BigEndian>().map_err(io_err)
}

pub fn write_bool(dst: &mut impl Write, v: bool) -> Result<()> {
    write_u8(dst, v as u8)
}

pub fn read_bool(src: &mut impl Read) -> Result<bool> {
    match read_u8(src)? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(Error::ProtocolError),
    }
}

/// Writes a length-prefixed byte string, refusing to emit anything past
/// `max_size` so a writer bug cannot itself produce an oversized frame.
pub fn write_bytes(dst: &mut impl Write, data: &[u8], max_size: usize) -> Result<()> {
    if data.len() > max_size {
        return Err(Error::ProtocolError);
    }
    write_u32(dst, data.len() as u32)?;
    dst.write_all(data).map_err(io_err)
}

/// Reads a length-prefixed byte string, rejecting any declared length past
/// `max_size` before allocating (protects against a hostile/garbled length
/// prefix turning into an unbounded allocation).
pub fn read_bytes(src: &mut impl Read, max_size: usize) -> Result<Vec<u8>> {
    let len = read_u32(src)? as usize;
    if len > max_size {
        return Err(Error::ProtocolError);
    }
    let mut buf = vec![0u8; len];
    src.read_exact(&mut buf).map_err(io_err)?;
    Ok(buf)
}

pub fn write_string(dst: &mut impl Write, s: &str, max_size: usize) -> Result<()> {
    write_bytes(dst, s.as_bytes(), max_size)
}

pub fn read_string(src: &mut impl Read, max_size: usize) -> Result<String> {
    let bytes = read_bytes(src, max_size)?;
    String::from_utf8(bytes).map_err(|_| Error::ProtocolError)
}

pub fn write_array<const N: usize>(dst: &mut impl Write, v: &[u8; N]) -> Result<()> {
    dst.write_all(v).map_err(io_err)
}

pub fn read_array<const N: usize>(src: &mut impl Read) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    src.read_exact(&mut buf).map_err(io_err)?;
    Ok(buf)
}

pub fn write_option<T>(
    dst: &mut impl Write,
    value: &Option<T>,
    write_inner: impl FnOnce(&mut dyn Write, &T) -> Result<()>,
) -> Result<()> {
    match value {
        Some(inner) => {
            write_bool(dst, true)?;
            write_inner(dst, inner)
        }
        None => write_bool(dst, false),
    }
}

pub fn read_option<T>(
    src: &mut impl Read,
    read_inner: impl FnOnce(&mut dyn Read) -> Result<T>,
) -> Result<Option<T>> {
    if read_bool(src)? {
        Ok(Some(read_inner(src)?))
    } else {
        Ok(None)
    }
}

pub fn write_vec<T>(
    dst: &mut impl Write,
    items: &[T],
    max_len: usize,
    write_item: impl Fn(&mut dyn Write, &T) -> Result<()>,
) -> Result<()> {
    if items.len() > max_len {
        return Err(Error::ProtocolError);
    }
    write_u32(dst, items.len() as u32)?;
    for item in items {
        write_item(dst, item)?;
    }
    Ok(())
}

pub fn read_vec<T>(
    src: &mut impl Read,
    max_len: usize,
    read_item: impl Fn(&mut dyn Read) -> Result<T>,
) -> Result<Vec<T>> {
    let len = read_u32(src)? as usize;
    if len > max_len {
        return Err(Error::ProtocolError);
    }
    let mut out = Vec::with_capacity(len.min(4096));
    for _ in 0..len {
        out.push(read_item(src)?);
    }
    Ok(out)
}
