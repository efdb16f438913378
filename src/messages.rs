//! # Control Stream Wire Format
//!
//! Every connection carries one long-lived bidirectional control stream. The
//! dialer opens it and writes [`CONTROL_STREAM_PREAMBLE`] so the acceptor sees
//! the stream immediately; after that both directions carry a sequence of
//! length-prefixed [`Frame`]s:
//!
//! ```text
//! ┌──────────────┬──────────────────────────┐
//! │ len: u32 BE  │ bincode(Frame), len bytes │
//! └──────────────┴──────────────────────────┘
//! ```
//!
//! | Frame | Direction | Reply |
//! |-------|-----------|-------|
//! | `Request { id, method, body }` | either | `Response` or `Error` with the same `id` |
//! | `Command { method, body }` | either | none |
//! | `Response { id, body }` | reply | - |
//! | `Error { id, message }` | reply | - |
//!
//! Request ids are scoped to the stream that issued them, so the two
//! directions never collide.
//!
//! ## Security Limits
//!
//! Frames are decoded with a bincode size limit equal to the configured
//! maximum frame size; the length prefix is checked before any allocation.

use bincode::Options;
use serde::{Deserialize, Serialize};

/// First byte written on a freshly opened control stream.
pub const CONTROL_STREAM_PREAMBLE: u8 = 0x5C;

/// Size of the frame length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

// ----------------------------------------------------------------------------
// Reserved method names
// ----------------------------------------------------------------------------

pub const SNODE_PING: &str = "snode_ping";
pub const MONITOR: &str = "monitor";
pub const NOTIFY: &str = "notify";

/// Fixed acknowledgment body for `snode_ping`.
pub const PONG: &[u8] = b"pong";

/// Error message sent back for an unrecognized method name.
pub const NO_SUCH_ENDPOINT: &str = "no such endpoint";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Request {
        id: u64,
        method: String,
        body: Vec<u8>,
    },
    Command {
        method: String,
        body: Vec<u8>,
    },
    Response {
        id: u64,
        body: Vec<u8>,
    },
    Error {
        id: u64,
        message: String,
    },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Request { .. } => "request",
            Frame::Command { .. } => "command",
            Frame::Response { .. } => "response",
            Frame::Error { .. } => "error",
        }
    }
}

fn bincode_options(limit: u64) -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(limit)
        .with_fixint_encoding()
}

/// Serialize a frame with its big-endian length prefix.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, bincode::Error> {
    let limit = u32::MAX as u64;
    let len = bincode_options(limit).serialized_size(frame)?;
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + len as usize);
    out.extend_from_slice(&(len as u32).to_be_bytes());
    bincode_options(limit).serialize_into(&mut out, frame)?;
    Ok(out)
}

/// Decode a frame body (without its length prefix). Bodies longer than
/// `max_size` are rejected before decoding.
pub fn decode_frame(bytes: &[u8], max_size: usize) -> Result<Frame, bincode::Error> {
    if bytes.len() > max_size {
        return Err(Box::new(bincode::ErrorKind::SizeLimit));
    }
    bincode_options(max_size as u64).deserialize(bytes)
}

// ----------------------------------------------------------------------------
// Client RPC reply wrapping
// ----------------------------------------------------------------------------
//
// A control-stream reply has a single body slot, so a client-RPC reply always
// carries its status explicitly: the body is a 2-element [status, body]
// sequence, for successes as well as failures.

pub fn wrap_response(status: u16, body: &[u8]) -> Vec<u8> {
    // Serializing a (u16, &[u8]) tuple into a Vec cannot fail.
    bincode_options(u64::MAX)
        .serialize(&(status, body))
        .unwrap_or_default()
}

pub fn unwrap_response(bytes: &[u8]) -> Result<(u16, Vec<u8>), bincode::Error> {
    bincode_options(bytes.len() as u64 + 16).deserialize(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_of(encoded: &[u8]) -> &[u8] {
        let len = u32::from_be_bytes(encoded[..FRAME_HEADER_SIZE].try_into().unwrap()) as usize;
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + len, "length prefix must cover the body");
        &encoded[FRAME_HEADER_SIZE..]
    }

    #[test]
    fn request_frame_survives_encoding() {
        let frame = Frame::Request {
            id: 7,
            method: "store".to_string(),
            body: b"payload".to_vec(),
        };
        let encoded = encode_frame(&frame).unwrap();
        assert_eq!(decode_frame(body_of(&encoded), 1024).unwrap(), frame);
    }

    #[test]
    fn error_frame_carries_message() {
        let frame = Frame::Error {
            id: 3,
            message: NO_SUCH_ENDPOINT.to_string(),
        };
        let encoded = encode_frame(&frame).unwrap();
        match decode_frame(body_of(&encoded), 1024).unwrap() {
            Frame::Error { id, message } => {
                assert_eq!(id, 3);
                assert_eq!(message, NO_SUCH_ENDPOINT);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_bodies_over_the_limit() {
        let frame = Frame::Command {
            method: NOTIFY.to_string(),
            body: vec![0u8; 4096],
        };
        let encoded = encode_frame(&frame).unwrap();
        let body = body_of(&encoded);

        let err = decode_frame(body, 1024).unwrap_err();
        assert!(matches!(*err, bincode::ErrorKind::SizeLimit), "got {err:?}");
        assert!(decode_frame(body, body.len() - 1).is_err());
        assert_eq!(decode_frame(body, body.len()).unwrap(), frame);
    }

    #[test]
    fn encoded_length_prefix_matches_body() {
        let frame = Frame::Response {
            id: u64::MAX,
            body: vec![1, 2, 3],
        };
        let encoded = encode_frame(&frame).unwrap();
        assert_eq!(decode_frame(body_of(&encoded), 1024).unwrap(), frame);
    }

    #[test]
    fn malformed_frames_rejected() {
        assert!(decode_frame(&[], 1024).is_err());
        assert!(decode_frame(&[0xFF; 16], 1024).is_err());
    }

    #[test]
    fn wrapped_response_pairs_status_and_body() {
        let wrapped = wrap_response(200, b"{\"ok\":true}");
        let (status, body) = unwrap_response(&wrapped).unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, b"{\"ok\":true}");

        let (status, body) = unwrap_response(&wrap_response(404, b"")).unwrap();
        assert_eq!(status, 404);
        assert!(body.is_empty());
    }
}
