// ABOUTME: Wire codec for the NSQ V2 protocol - frame buffering/draining and command encoding
// ABOUTME: Separates the byte-level framing contract from Connection's I/O and dispatch logic

use crate::frame::{Error as FrameError, Frame};
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::io::Cursor;

/// Append-only, non-destructive frame source.
///
/// `feed` buffers raw bytes off the wire; repeated calls to `gets` drain
/// every complete frame currently buffered, returning `None` once only a
/// partial frame (or nothing) remains. This is the seam compression
/// upgrades wrap: a [`crate::compression::DeflateReader`] or
/// [`crate::compression::SnappyReader`] pushes incoming bytes through a
/// decompressor before delegating to an inner `FrameParser`.
pub trait FrameSource: fmt::Debug + Send {
    /// Buffer more raw bytes read off the socket.
    fn feed(&mut self, bytes: &[u8]);

    /// Pop the next complete frame, if any is buffered.
    fn gets(&mut self) -> Result<Option<Frame>, FrameError>;

    /// Drain and return any bytes buffered but not yet parsed into a frame,
    /// so an upgrade can carry them into the wrapping codec rather than
    /// discard them.
    fn take_unparsed(&mut self) -> Vec<u8>;
}

/// The plaintext `FrameSource`: buffers raw bytes and parses frames directly.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: BytesMut,
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Construct a parser pre-seeded with bytes carried over from an
    /// upgrade, so nothing buffered before the upgrade is lost.
    pub fn with_buffered(bytes: Vec<u8>) -> Self {
        let mut buffer = BytesMut::with_capacity(bytes.len().max(4 * 1024));
        buffer.extend_from_slice(&bytes);
        Self { buffer }
    }
}

impl FrameSource for FrameParser {
    fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn gets(&mut self) -> Result<Option<Frame>, FrameError> {
        let mut cursor = Cursor::new(&self.buffer[..]);
        match Frame::check(&mut cursor) {
            Ok(total) => {
                cursor.set_position(0);
                let frame = Frame::parse(&mut cursor)?;
                self.buffer.advance(total);
                Ok(Some(frame))
            }
            Err(FrameError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn take_unparsed(&mut self) -> Vec<u8> {
        let bytes = self.buffer.to_vec();
        self.buffer.clear();
        bytes
    }
}

/// An outbound command, encoded as `CMD[ arg]*\n` optionally followed by a
/// length-prefixed body (`IDENTIFY` is the only command this crate sends
/// with a body).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Nop,
    Fin(Vec<u8>),
    Rdy(u32),
    Req(Vec<u8>, u32),
    Touch(Vec<u8>),
    Sub(String, String),
    Cls,
    Identify(Vec<u8>),
}

impl Command {
    /// Commands for which the broker never sends a reply: the future for
    /// these resolves locally once the bytes are written, per §4.2.
    pub fn is_fire_and_forget(&self) -> bool {
        matches!(
            self,
            Command::Nop | Command::Fin(_) | Command::Rdy(_) | Command::Req(_, _) | Command::Touch(_)
        )
    }

    /// Whether this command decrements the in-flight counter once sent.
    pub fn decrements_in_flight(&self) -> bool {
        matches!(self, Command::Fin(_) | Command::Req(_, _))
    }

    /// Encode this command to its wire representation.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        match self {
            Command::Nop => buf.extend_from_slice(b"NOP\n"),
            Command::Fin(id) => {
                buf.extend_from_slice(b"FIN ");
                buf.extend_from_slice(id);
                buf.put_u8(b'\n');
            }
            Command::Rdy(n) => {
                buf.extend_from_slice(b"RDY ");
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.put_u8(b'\n');
            }
            Command::Req(id, timeout_ms) => {
                buf.extend_from_slice(b"REQ ");
                buf.extend_from_slice(id);
                buf.put_u8(b' ');
                buf.extend_from_slice(timeout_ms.to_string().as_bytes());
                buf.put_u8(b'\n');
            }
            Command::Touch(id) => {
                buf.extend_from_slice(b"TOUCH ");
                buf.extend_from_slice(id);
                buf.put_u8(b'\n');
            }
            Command::Sub(topic, channel) => {
                buf.extend_from_slice(b"SUB ");
                buf.extend_from_slice(topic.as_bytes());
                buf.put_u8(b' ');
                buf.extend_from_slice(channel.as_bytes());
                buf.put_u8(b'\n');
            }
            Command::Cls => buf.extend_from_slice(b"CLS\n"),
            Command::Identify(body) => {
                buf.extend_from_slice(b"IDENTIFY\n");
                buf.put_u32(body.len() as u32);
                buf.extend_from_slice(body);
            }
        }
        buf
    }
}
