// ABOUTME: Wire-level constants for the NSQ V2 protocol
// ABOUTME: Magic bytes, frame type tags, and the heartbeat sentinel literal

/// The 4-byte stream prefix every connection writes immediately after connect.
pub const MAGIC_V2: &[u8; 4] = b"  V2";

/// The framed `"OK"` response the broker sends right after a successful
/// TLS upgrade: `size=6, type=RESPONSE, payload="OK"`.
pub const BIN_OK: &[u8] = &[0x00, 0x00, 0x00, 0x06, 0x00, 0x00, 0x00, 0x00, b'O', b'K'];

/// Payload of the heartbeat RESPONSE frame the broker sends periodically.
pub const HEARTBEAT: &[u8] = b"_heartbeat_";

/// Payload of a bare `"OK"` RESPONSE.
pub const OK: &[u8] = b"OK";

pub const FRAME_TYPE_RESPONSE: u32 = 0;
pub const FRAME_TYPE_ERROR: u32 = 1;
pub const FRAME_TYPE_MESSAGE: u32 = 2;

/// Size in bytes of an NSQ message id.
pub const MSG_ID_LENGTH: usize = 16;

/// Size of the frame header (`size` + `frame_type`), not counting payload.
pub const FRAME_HEADER_LEN: usize = 8;
