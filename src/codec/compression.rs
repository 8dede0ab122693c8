//! Blob compression tag (spec §4.1): `{none, lz4}`, end-to-end over exactly
//! one blob, never across messages.

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None = 0,
    Lz4 = 1,
}

impl Compression {
    pub fn from_tag(tag: u8) -> Result<Self, Error> {
        match tag {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Lz4),
            _ => Err(Error::ProtocolError),
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// The server picks `lz4` only when the measured ratio beats
/// `compression.min_ratio` (spec §4.1, §6); the client must accept either
/// tag unconditionally.
pub fn choose(uncompressed: &[u8], min_ratio: f64) -> (Compression, Vec<u8>) {
    if uncompressed.is_empty() {
        return (Compression::None, Vec::new());
    }
    let compressed = lz4_flex::compress_prepend_size(uncompressed);
    let ratio = compressed.len() as f64 / uncompressed.len() as f64;
    if ratio <= min_ratio {
        (Compression::Lz4, compressed)
    } else {
        (Compression::None, uncompressed.to_vec())
    }
}

pub fn decode(tag: Compression, payload: &[u8]) -> Result<Vec<u8>, Error> {
    match tag {
        Compression::None => Ok(payload.to_vec()),
        Compression::Lz4 => {
            lz4_flex::decompress_size_prepended(payload).map_err(|_| Error::ProtocolError)
        }
    }
}
