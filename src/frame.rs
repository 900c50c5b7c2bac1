//! Provides a type representing an NSQ V2 protocol frame as well as utilities
//! for checking and parsing frames out of a byte buffer.

use crate::consts::{FRAME_TYPE_ERROR, FRAME_TYPE_MESSAGE, FRAME_TYPE_RESPONSE, MSG_ID_LENGTH};
use bytes::{Buf, Bytes};
use std::fmt;
use std::io::Cursor;

/// A single decoded frame from the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// A `RESPONSE` frame: bare bytes, e.g. `"OK"` or a heartbeat literal.
    Response(Bytes),
    /// An `ERROR` frame: the broker's `E_...` error descriptor.
    Error(Bytes),
    /// A `MESSAGE` frame: a delivered, unacknowledged message.
    Message(MessageFrame),
}

/// The decoded payload of a `MESSAGE` frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageFrame {
    pub timestamp: i64,
    pub attempts: u16,
    pub id: [u8; MSG_ID_LENGTH],
    pub body: Bytes,
}

#[derive(Debug)]
pub enum Error {
    /// Not enough data is available to parse a whole frame.
    Incomplete,
    /// The buffered data does not represent a valid frame. Fatal.
    Protocol(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Incomplete => write!(f, "incomplete frame"),
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<Error> for crate::error::NsqError {
    fn from(err: Error) -> Self {
        match err {
            Error::Incomplete => {
                crate::error::NsqError::Protocol("unexpected incomplete frame".into())
            }
            Error::Protocol(msg) => crate::error::NsqError::Protocol(msg),
        }
    }
}

impl Frame {
    /// Checks whether a complete frame is buffered in `src`. On success
    /// returns the total number of bytes the frame occupies (the leading
    /// `size` field plus the `size` bytes it describes). `src`'s position
    /// is left at 0 on both success and `Incomplete`; callers reset it
    /// before calling `parse`.
    #[tracing::instrument(skip(src), level = "trace")]
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<usize, Error> {
        if src.remaining() < 4 {
            return Err(Error::Incomplete);
        }
        let size = peek_u32(src)? as usize;
        let total = size
            .checked_add(4)
            .ok_or_else(|| Error::Protocol("frame size overflow".into()))?;

        if size < 4 {
            return Err(Error::Protocol(format!(
                "frame size {size} smaller than the frame_type field"
            )));
        }

        if total > src.remaining() {
            return Err(Error::Incomplete);
        }

        Ok(total)
    }

    /// Parses a frame out of `src`. The caller must have already validated
    /// with [`Frame::check`] that a complete frame is present.
    ///
    /// `size` bounds every byte this frame owns (`frame_type` plus
    /// payload): `gets()` runs `parse` against a cursor over the *whole*
    /// buffered byte range, which may already hold bytes belonging to
    /// frames after this one, so the payload must be sliced to exactly
    /// `size - 4` bytes rather than "everything left in the cursor".
    #[tracing::instrument(skip(src), level = "trace")]
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Frame, Error> {
        let size = get_u32(src)? as usize;
        let frame_type = get_u32(src)?;
        let payload_len = size
            .checked_sub(4)
            .ok_or_else(|| Error::Protocol(format!("frame size {size} smaller than the frame_type field")))?;

        match frame_type {
            FRAME_TYPE_RESPONSE => Ok(Frame::Response(take_bytes(src, payload_len)?)),
            FRAME_TYPE_ERROR => Ok(Frame::Error(take_bytes(src, payload_len)?)),
            FRAME_TYPE_MESSAGE => {
                let header_len = 8 + 2 + MSG_ID_LENGTH;
                if payload_len < header_len {
                    return Err(Error::Protocol("truncated message frame".into()));
                }
                let timestamp = get_i64(src)?;
                let attempts = get_u16(src)?;
                let mut id = [0u8; MSG_ID_LENGTH];
                for slot in id.iter_mut() {
                    *slot = get_u8(src)?;
                }
                let body = take_bytes(src, payload_len - header_len)?;
                Ok(Frame::Message(MessageFrame {
                    timestamp,
                    attempts,
                    id,
                    body,
                }))
            }
            other => Err(Error::Protocol(format!("unknown frame type {other}"))),
        }
    }
}

fn peek_u32(src: &Cursor<&[u8]>) -> Result<u32, Error> {
    let buf = src.get_ref();
    let pos = src.position() as usize;
    if buf.len() < pos + 4 {
        return Err(Error::Incomplete);
    }
    Ok(u32::from_be_bytes([
        buf[pos],
        buf[pos + 1],
        buf[pos + 2],
        buf[pos + 3],
    ]))
}

fn get_u8(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }
    Ok(src.get_u8())
}

fn get_u16(src: &mut Cursor<&[u8]>) -> Result<u16, Error> {
    if src.remaining() < 2 {
        return Err(Error::Incomplete);
    }
    Ok(src.get_u16())
}

fn get_u32(src: &mut Cursor<&[u8]>) -> Result<u32, Error> {
    if src.remaining() < 4 {
        return Err(Error::Incomplete);
    }
    Ok(src.get_u32())
}

fn get_i64(src: &mut Cursor<&[u8]>) -> Result<i64, Error> {
    if src.remaining() < 8 {
        return Err(Error::Incomplete);
    }
    Ok(src.get_i64())
}

/// Takes exactly `n` bytes from `src`, advancing its position past them.
/// Unlike consuming "everything remaining", this is safe to call on a
/// cursor that spans more than one buffered frame.
fn take_bytes(src: &mut Cursor<&[u8]>, n: usize) -> Result<Bytes, Error> {
    if src.remaining() < n {
        return Err(Error::Incomplete);
    }
    let bytes = Bytes::copy_from_slice(&src.chunk()[..n]);
    src.advance(n);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_bytes(payload: &[u8]) -> Vec<u8> {
        let size = (4 + payload.len()) as u32;
        let mut out = Vec::new();
        out.extend_from_slice(&size.to_be_bytes());
        out.extend_from_slice(&FRAME_TYPE_RESPONSE.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn check_reports_incomplete_on_partial_header() {
        let data = [0x00, 0x00];
        let mut cursor = Cursor::new(&data[..]);
        assert!(matches!(Frame::check(&mut cursor), Err(Error::Incomplete)));
    }

    #[test]
    fn check_reports_incomplete_when_payload_not_buffered_yet() {
        let data = response_bytes(b"OK");
        let mut cursor = Cursor::new(&data[..data.len() - 1]);
        assert!(matches!(Frame::check(&mut cursor), Err(Error::Incomplete)));
    }

    #[test]
    fn round_trips_a_response_frame() {
        let data = response_bytes(b"OK");
        let mut cursor = Cursor::new(&data[..]);
        let total = Frame::check(&mut cursor).unwrap();
        assert_eq!(total, data.len());

        cursor.set_position(0);
        let frame = Frame::parse(&mut cursor).unwrap();
        assert_eq!(frame, Frame::Response(Bytes::from_static(b"OK")));
    }

    #[test]
    fn parses_a_message_frame() {
        let mut out = Vec::new();
        let id = [b'a'; MSG_ID_LENGTH];
        let body = b"hello".to_vec();
        let payload_len = 4 + 8 + 2 + MSG_ID_LENGTH + body.len();
        out.extend_from_slice(&(payload_len as u32).to_be_bytes());
        out.extend_from_slice(&FRAME_TYPE_MESSAGE.to_be_bytes());
        out.extend_from_slice(&42i64.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&id);
        out.extend_from_slice(&body);

        let mut cursor = Cursor::new(&out[..]);
        Frame::check(&mut cursor).unwrap();
        cursor.set_position(0);
        let frame = Frame::parse(&mut cursor).unwrap();
        match frame {
            Frame::Message(msg) => {
                assert_eq!(msg.timestamp, 42);
                assert_eq!(msg.attempts, 1);
                assert_eq!(msg.id, id);
                assert_eq!(&msg.body[..], &body[..]);
            }
            other => panic!("expected Message frame, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_frame_type() {
        let mut out = Vec::new();
        out.extend_from_slice(&8u32.to_be_bytes());
        out.extend_from_slice(&9u32.to_be_bytes());
        let mut cursor = Cursor::new(&out[..]);
        Frame::check(&mut cursor).unwrap();
        cursor.set_position(0);
        assert!(matches!(Frame::parse(&mut cursor), Err(Error::Protocol(_))));
    }
}
