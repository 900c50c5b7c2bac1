// ABOUTME: The message handle returned to application code - single-shot FIN/REQ/TOUCH acks
// ABOUTME: Holds a cloneable, non-owning handle back to its Connection rather than an owning ref

use crate::codec::Command;
use crate::connection::Connection;
use crate::error::{NsqError, NsqResult};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A delivered, not-yet-acknowledged message.
///
/// `connection` is a cheap `Connection` clone (all of `Connection`'s fields
/// are `Arc`-backed), so a `Message` outliving its Connection's closure is
/// safe: `fin`/`req`/`touch` simply fail with [`NsqError::ConnectionClosed`]
/// rather than panicking, and no reference cycle is created because
/// `Connection` never holds onto the `Message`s it hands out.
#[derive(Clone, Debug)]
pub struct Message {
    pub timestamp: i64,
    pub attempts: u16,
    pub id: [u8; crate::consts::MSG_ID_LENGTH],
    pub body: Bytes,
    connection: Connection,
    processed: Arc<AtomicBool>,
}

impl Message {
    pub(crate) fn new(
        timestamp: i64,
        attempts: u16,
        id: [u8; crate::consts::MSG_ID_LENGTH],
        body: Bytes,
        connection: Connection,
    ) -> Self {
        Self {
            timestamp,
            attempts,
            id,
            body,
            connection,
            processed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The message id as the broker's MESSAGE frame carries it: 16 ASCII
    /// bytes, already in the broker's opaque id format (not re-encoded).
    pub fn id_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.id)
    }

    pub fn processed(&self) -> bool {
        self.processed.load(Ordering::SeqCst)
    }

    /// Checks and sets `processed` synchronously, before any network
    /// dispatch, so a concurrent second call cannot race past the check
    /// (§9 resolved open question).
    fn mark_processed(&self) -> NsqResult<()> {
        if self.processed.swap(true, Ordering::SeqCst) {
            return Err(NsqError::DoubleAck);
        }
        Ok(())
    }

    /// Acknowledge successful processing.
    pub async fn fin(&self) -> NsqResult<()> {
        self.mark_processed()?;
        self.connection
            .execute(Command::Fin(self.id.to_vec()))
            .await?;
        Ok(())
    }

    /// Requeue for redelivery after `timeout_ms` (0 = immediately).
    pub async fn req(&self, timeout_ms: u32) -> NsqResult<()> {
        self.mark_processed()?;
        self.connection
            .execute(Command::Req(self.id.to_vec(), timeout_ms))
            .await?;
        Ok(())
    }

    /// Extend the broker's processing deadline without acknowledging.
    /// Does not set `processed`.
    pub async fn touch(&self) -> NsqResult<()> {
        if self.processed() {
            return Err(NsqError::DoubleAck);
        }
        self.connection
            .execute(Command::Touch(self.id.to_vec()))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_str_reads_the_ascii_id_as_is() {
        let mut id = [b'0'; crate::consts::MSG_ID_LENGTH];
        id[0] = b'x';
        let msg = Message {
            timestamp: 0,
            attempts: 0,
            id,
            body: Bytes::new(),
            connection: Connection::detached(),
            processed: Arc::new(AtomicBool::new(false)),
        };
        assert_eq!(&msg.id_str()[..1], "x");
    }
}
