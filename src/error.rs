// ABOUTME: Crate-wide error type covering transport, protocol, upgrade, and ack failures
// ABOUTME: A closed, structured enum rather than a boxed dyn Error

use std::io;
use thiserror::Error;

/// Comprehensive error type for NSQ consumer operations.
///
/// Every failure surfaced by this crate - from a dropped socket to a
/// double-acked message - resolves to one variant here rather than a boxed
/// `dyn Error`, so callers can match on a documented, closed set.
#[derive(Debug, Error)]
pub enum NsqError {
    /// I/O error during network operations (connect, read, write).
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    /// Malformed frame on the wire: bad length, unknown frame type, or a
    /// header that did not parse. Fatal for the Connection that hit it.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A TLS or compression upgrade failed mid-handshake.
    #[error("upgrade failed: {0}")]
    Upgrade(String),

    /// `fin`/`req`/`touch` called on a Message that was already acked.
    #[error("message already processed (double ack)")]
    DoubleAck,

    /// `fin`/`req`/`touch` called after the owning Connection has closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// A command was submitted to a Connection that is closing or closed.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// JSON (de)serialization failure for IDENTIFY bodies or lookup responses.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Waiting on `wait_for_closed` exceeded its deadline.
    #[error("operation timed out")]
    Timeout,
}

/// Result type alias for NSQ consumer operations.
pub type NsqResult<T> = Result<T, NsqError>;
