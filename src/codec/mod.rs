//! Wire codec (spec §4.1): framed request/response messages with
//! length-prefixed payloads and streaming compression for bulk file data.
//!
//! Three layers, bottom to top:
//!
//! - [`primitive`] — integers, byte strings, arrays, options, vectors.
//! - [`record`] — self-describing records for the [`crate::types`] model,
//!   including the `Result<T, Error>` tagged union.
//! - [`frame`] — the one length-prefixed framing every message uses.
//!
//! [`compression`] is orthogonal: it only ever wraps a single blob payload,
//! never a whole frame.

pub mod compression;
pub mod frame;
pub mod primitive;
pub mod record;

pub use frame::{read_frame, write_frame, Frame};
