//! RPC plane (spec §4.2 / §4.3): the operation table, server-side handle
//! bookkeeping, the L-side server and the R-side client.

pub mod client;
pub mod handle;
pub mod ops;
pub mod server;

pub use ops::{Handle, Opcode, Request, Response};

use crate::codec::Frame;
use crate::error::{Error, Result};

/// Default soft cap on a single encoded frame body, independent of the
/// per-field caps inside [`ops`] (spec §4.1 "no unbounded frame").
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Wraps a decoded request into the frame that carries it.
pub fn request_frame(request_id: u64, request: &Request) -> Result<Frame> {
    let opcode = request.opcode();
    let payload = request.encode()?;
    Ok(Frame::new(opcode.to_u8(), request_id, payload))
}

/// Unwraps a frame back into the typed request it carries, using the
/// opcode embedded in the frame header to pick the decoder.
pub fn request_from_frame(frame: &Frame) -> Result<Request> {
    let opcode = Opcode::from_u8(frame.opcode)?;
    Request::decode(opcode, &frame.payload)
}

/// Wraps a response into a frame that echoes the opcode of the request it
/// answers, so the wire never needs a separate "this is a response" bit.
pub fn response_frame(opcode: Opcode, request_id: u64, response: &Response) -> Result<Frame> {
    let payload = response.encode()?;
    Ok(Frame::new(opcode.to_u8(), request_id, payload))
}

pub fn response_from_frame(frame: &Frame) -> Result<Response> {
    let opcode = Opcode::from_u8(frame.opcode)?;
    Response::decode(opcode, &frame.payload)
}

/// An unexpected opcode/response-shape mismatch is always a protocol error:
/// the two sides disagree about what was sent, so the connection cannot be
/// trusted to keep talking the same language.
pub fn mismatched_response() -> Error {
    Error::ProtocolError
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn request_round_trips_through_a_frame() {
        let req = Request::ReadDir { path: PathBuf::from("/usr/lib") };
        let frame = request_frame(7, &req).unwrap();
        assert_eq!(frame.request_id, 7);
        let decoded = request_from_frame(&frame).unwrap();
        match decoded {
            Request::ReadDir { path } => assert_eq!(path, PathBuf::from("/usr/lib")),
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn response_round_trips_through_a_frame() {
        let resp = Response::Write(Ok(4096));
        let frame = response_frame(Opcode::Write, 9, &resp).unwrap();
        let decoded = response_from_frame(&frame).unwrap();
        match decoded {
            Response::Write(Ok(n)) => assert_eq!(n, 4096),
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
