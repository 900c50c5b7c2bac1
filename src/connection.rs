// ABOUTME: One TCP session to a broker - handshake, IDENTIFY/upgrade orchestration, ingress loop
// ABOUTME: Command replies correlate through a FIFO of oneshots guarded by a narrow sync Mutex

use crate::codec::{Command, FrameParser, FrameSource};
use crate::compression::{self, CompressionKind};
use crate::config::IdentifyConfig;
use crate::consts::{BIN_OK, HEARTBEAT, MAGIC_V2, OK};
use crate::error::{NsqError, NsqResult};
use crate::frame::Frame;
use crate::message::Message;
use crate::tls::{self, MaybeTlsStream};
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, instrument, trace, warn};

type OnMessageHook = Arc<dyn Fn(Message) -> Message + Send + Sync>;
type BoxedFrameSource = Box<dyn FrameSource>;
type TlsWriteHalf = WriteHalf<MaybeTlsStream>;
type TlsReadHalf = ReadHalf<MaybeTlsStream>;

/// Control messages sent into the running ingress task.
enum IngressCommand {
    /// Recover the read half for a transport upgrade. The task exits after
    /// replying; the caller is responsible for restarting it.
    Stop(oneshot::Sender<TlsReadHalf>),
    /// Swap the active `FrameSource` for a compressed variant, carrying
    /// forward whatever plaintext bytes were buffered but not yet parsed.
    SwapParser(Box<dyn FnOnce(Vec<u8>) -> BoxedFrameSource + Send>),
    /// Drain whatever frames are already buffered right now, without
    /// waiting for another socket read. Used to flush frames that arrived
    /// while `upgrading` was suppressing the read loop's normal drain.
    Drain(oneshot::Sender<()>),
}

#[derive(Default)]
struct Shared {
    waiters: VecDeque<oneshot::Sender<Bytes>>,
    in_flight: u64,
}

/// One TCP session to a broker.
///
/// All fields are `Arc`-backed, so `Connection` is cheap to clone; a clone
/// is exactly the "non-owning, cloneable command-submission handle" a
/// [`Message`] holds back to the Connection that delivered it (§9).
#[derive(Clone)]
pub struct Connection {
    host: Arc<str>,
    port: u16,
    shared: Arc<Mutex<Shared>>,
    write_half: Arc<tokio::sync::Mutex<Option<TlsWriteHalf>>>,
    ingress_control: Arc<Mutex<Option<mpsc::UnboundedSender<IngressCommand>>>>,
    upgrading: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    closed_notify: Arc<Notify>,
    on_message: Arc<Mutex<Option<OnMessageHook>>>,
    inbox: mpsc::UnboundedSender<Option<Message>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Open a TCP session, send the magic handshake, and start the ingress
    /// loop. `inbox` is the Reader's shared message queue; every Connection
    /// the Reader owns clones the same sender (§5, single-producer-per-
    /// connection, multi-consumer).
    #[instrument(skip(inbox), fields(%host, port))]
    pub async fn connect(
        host: impl Into<Arc<str>>,
        port: u16,
        inbox: mpsc::UnboundedSender<Option<Message>>,
    ) -> NsqResult<Connection> {
        let host = host.into();
        let stream = TcpStream::connect((&*host, port)).await?;
        stream.set_nodelay(true).ok();

        let (read_half, write_half) = tokio::io::split(MaybeTlsStream::Plain(stream));

        let conn = Connection {
            host,
            port,
            shared: Arc::new(Mutex::new(Shared::default())),
            write_half: Arc::new(tokio::sync::Mutex::new(Some(write_half))),
            ingress_control: Arc::new(Mutex::new(None)),
            upgrading: Arc::new(AtomicBool::new(false)),
            closing: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
            closed_notify: Arc::new(Notify::new()),
            on_message: Arc::new(Mutex::new(None)),
            inbox,
        };

        conn.write_raw(MAGIC_V2).await?;
        conn.restart_ingress(read_half, Box::new(FrameParser::new()));
        debug!("connection established, magic sent");
        Ok(conn)
    }

    /// A Connection with no backing socket, for constructing `Message`
    /// values and exercising RdyControl's distribution policy in isolation
    /// (tests only).
    #[cfg(test)]
    pub(crate) fn detached() -> Connection {
        Self::detached_at("detached", 0)
    }

    #[cfg(test)]
    pub(crate) fn detached_at(host: &str, port: u16) -> Connection {
        let (tx, _rx) = mpsc::unbounded_channel();
        Connection {
            host: Arc::from(host),
            port,
            shared: Arc::new(Mutex::new(Shared::default())),
            write_half: Arc::new(tokio::sync::Mutex::new(None)),
            ingress_control: Arc::new(Mutex::new(None)),
            upgrading: Arc::new(AtomicBool::new(false)),
            closing: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(true)),
            closed_notify: Arc::new(Notify::new()),
            on_message: Arc::new(Mutex::new(None)),
            inbox: tx,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn in_flight(&self) -> u64 {
        self.shared.lock().unwrap().in_flight
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Install (or replace) the hook invoked for every delivered MESSAGE
    /// frame, before it is pushed onto the inbox. The hook may return a
    /// transformed Message (§4.2.2).
    pub fn set_on_message<F>(&self, hook: F)
    where
        F: Fn(Message) -> Message + Send + Sync + 'static,
    {
        *self.on_message.lock().unwrap() = Some(Arc::new(hook));
    }

    /// Perform the IDENTIFY capability handshake (§4.2.3). The IDENTIFY
    /// reply itself drains normally through the waiter queue like any other
    /// replied command; only once a transport upgrade is negotiated does the
    /// `upgrading` flag go up, and it comes back down again before we wait
    /// on the compression confirmation reply, since that reply only arrives
    /// once the ingress loop resumes draining through the new parser.
    #[instrument(skip(self, config))]
    pub async fn identify(&self, config: &IdentifyConfig) -> NsqResult<Bytes> {
        let body = serde_json::to_vec(config)?;
        let reply = self.execute(Command::Identify(body)).await?;

        if &reply[..] == OK {
            return Ok(reply);
        }

        let negotiated: serde_json::Value = serde_json::from_slice(&reply)?;
        let wants_tls = negotiated
            .get("tls_v1")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let wants_snappy = negotiated
            .get("snappy")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let wants_deflate = negotiated
            .get("deflate")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if !(wants_tls || wants_snappy || wants_deflate) {
            return Ok(reply);
        }

        self.upgrading.store(true, Ordering::SeqCst);
        let upgrade = self
            .run_negotiated_upgrades(wants_tls, wants_snappy, wants_deflate)
            .await;
        let upgrade = match upgrade {
            Ok(pending) => pending,
            Err(e) => {
                self.upgrading.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        // Flush whatever frames arrived while upgrading suppressed the
        // ingress loop's drain before clearing the flag, so nothing is
        // left stranded waiting for a socket read that may never come.
        if let Err(e) = self.drain_buffered_frames().await {
            self.upgrading.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.upgrading.store(false, Ordering::SeqCst);

        if let Some(rx) = upgrade {
            rx.await.map_err(|_| NsqError::ConnectionClosed)?;
        }

        Ok(reply)
    }

    async fn drain_buffered_frames(&self) -> NsqResult<()> {
        let control = self.ingress_control.lock().unwrap().clone();
        let Some(control) = control else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        control
            .send(IngressCommand::Drain(tx))
            .map_err(|_| NsqError::ConnectionClosed)?;
        rx.await.map_err(|_| NsqError::ConnectionClosed)
    }

    async fn run_negotiated_upgrades(
        &self,
        wants_tls: bool,
        wants_snappy: bool,
        wants_deflate: bool,
    ) -> NsqResult<Option<oneshot::Receiver<Bytes>>> {
        if wants_tls {
            self.upgrade_tls().await?;
        }

        if wants_snappy {
            Ok(Some(self.begin_compression_upgrade(CompressionKind::Snappy)?))
        } else if wants_deflate {
            Ok(Some(self.begin_compression_upgrade(CompressionKind::Deflate)?))
        } else {
            Ok(None)
        }
    }

    /// §4.2.4: cancel the ingress task, recover its read half, recombine it
    /// with the write half into the plain `TcpStream`, wrap it in TLS, and
    /// restart the ingress loop on the re-split halves.
    #[instrument(skip(self))]
    async fn upgrade_tls(&self) -> NsqResult<()> {
        let read_half = self.stop_ingress().await?;
        let write_half = {
            let mut guard = self.write_half.lock().await;
            guard.take().ok_or(NsqError::ConnectionClosed)?
        };

        let (mut new_read, new_write) = tls::upgrade_duplex(read_half, write_half, &self.host)
            .await
            .inspect_err(|e| error!(error = %e, "tls upgrade failed"))?;

        let mut confirmation = [0u8; 10];
        new_read
            .read_exact(&mut confirmation)
            .await
            .map_err(NsqError::Connection)?;
        if confirmation != *BIN_OK {
            return Err(NsqError::Upgrade(
                "broker did not confirm TLS upgrade with the expected OK frame".into(),
            ));
        }

        {
            let mut guard = self.write_half.lock().await;
            *guard = Some(new_write);
        }
        self.restart_ingress(new_read, Box::new(FrameParser::new()));
        debug!("tls upgrade complete");
        Ok(())
    }

    /// §4.2.5: swap the parser for a compressed variant in place and
    /// register a synthetic waiter for the server's post-upgrade `"OK"`
    /// response, which will arrive through the new parser. Enqueuing the
    /// swap is synchronous; the caller awaits the returned receiver only
    /// after `upgrading` drops, so the ingress loop is free to drain again.
    #[instrument(skip(self))]
    fn begin_compression_upgrade(&self, kind: CompressionKind) -> NsqResult<oneshot::Receiver<Bytes>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut shared = self.shared.lock().unwrap();
            shared.waiters.push_back(tx);
        }

        let control = self
            .ingress_control
            .lock()
            .unwrap()
            .clone()
            .ok_or(NsqError::ConnectionClosed)?;
        control
            .send(IngressCommand::SwapParser(Box::new(move |carried| {
                compression::build_reader(kind, carried)
            })))
            .map_err(|_| NsqError::ConnectionClosed)?;

        debug!(?kind, "compression upgrade enqueued");
        Ok(rx)
    }

    /// Enqueue a command. Fire-and-forget commands resolve locally once
    /// written; replied commands push a waiter before writing (§4.2).
    #[instrument(skip(self, cmd), fields(cmd = ?cmd))]
    pub async fn execute(&self, cmd: Command) -> NsqResult<Bytes> {
        if self.closing.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return Err(NsqError::InvalidState(
                "connection is closing or closed".into(),
            ));
        }

        let wire = cmd.encode();

        if cmd.is_fire_and_forget() {
            self.write_raw(&wire).await?;
            if cmd.decrements_in_flight() {
                let mut shared = self.shared.lock().unwrap();
                shared.in_flight = shared.in_flight.saturating_sub(1);
            }
            return Ok(Bytes::from_static(OK));
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut shared = self.shared.lock().unwrap();
            shared.waiters.push_back(tx);
        }
        self.write_raw(&wire).await?;
        rx.await.map_err(|_| NsqError::ConnectionClosed)
    }

    async fn write_raw(&self, bytes: &[u8]) -> NsqResult<()> {
        let mut guard = self.write_half.lock().await;
        let writer = guard.as_mut().ok_or(NsqError::ConnectionClosed)?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Idempotent. Stops the ingress task, shuts down the transport, and
    /// signals the closed event.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Ok(mut read_half) = self.stop_ingress().await {
            let _ = read_half.shutdown().await;
        }

        {
            let mut guard = self.write_half.lock().await;
            if let Some(mut writer) = guard.take() {
                let _ = writer.shutdown().await;
            }
        }

        self.closed.store(true, Ordering::SeqCst);
        self.closed_notify.notify_waiters();
        debug!("connection closed");
    }

    pub async fn wait_for_closed(&self, timeout: Duration) -> NsqResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let notified = self.closed_notify.notified();
        tokio::time::timeout(timeout, notified)
            .await
            .map_err(|_| NsqError::Timeout)?;
        Ok(())
    }

    async fn stop_ingress(&self) -> NsqResult<TlsReadHalf> {
        let control = self
            .ingress_control
            .lock()
            .unwrap()
            .take()
            .ok_or(NsqError::ConnectionClosed)?;
        let (tx, rx) = oneshot::channel();
        control
            .send(IngressCommand::Stop(tx))
            .map_err(|_| NsqError::ConnectionClosed)?;
        rx.await.map_err(|_| NsqError::ConnectionClosed)
    }

    fn restart_ingress(&self, read_half: TlsReadHalf, parser: BoxedFrameSource) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        *self.ingress_control.lock().unwrap() = Some(control_tx);

        let conn = self.clone();
        tokio::spawn(async move {
            run_ingress(conn, read_half, parser, control_rx).await;
        });
    }
}

async fn run_ingress(
    conn: Connection,
    mut read_half: TlsReadHalf,
    mut parser: BoxedFrameSource,
    mut control_rx: mpsc::UnboundedReceiver<IngressCommand>,
) {
    let mut buf = [0u8; 8 * 1024];

    loop {
        tokio::select! {
            biased;

            cmd = control_rx.recv() => {
                match cmd {
                    Some(IngressCommand::Stop(reply)) => {
                        let _ = reply.send(read_half);
                        return;
                    }
                    Some(IngressCommand::SwapParser(build)) => {
                        let carried = parser.take_unparsed();
                        parser = build(carried);
                        trace!("parser swapped for compressed variant");
                    }
                    Some(IngressCommand::Drain(reply)) => {
                        if !drain_frames(&conn, parser.as_mut()).await {
                            return;
                        }
                        let _ = reply.send(());
                    }
                    None => return,
                }
            }

            read_result = read_half.read(&mut buf) => {
                match read_result {
                    Ok(0) => {
                        debug!("peer closed connection (eof)");
                        break;
                    }
                    Ok(n) => {
                        parser.feed(&buf[..n]);
                        if conn.upgrading.load(Ordering::SeqCst) {
                            continue;
                        }
                        if !drain_frames(&conn, parser.as_mut()).await {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "ingress read error");
                        break;
                    }
                }
            }
        }
    }

    conn.closing.store(true, Ordering::SeqCst);
    conn.closed.store(true, Ordering::SeqCst);
    conn.closed_notify.notify_waiters();
}

/// Drains every complete frame currently buffered. Returns `false` if a
/// protocol error was hit (fatal; the ingress task should exit without the
/// normal eof-path close bookkeeping since this path closes itself).
async fn drain_frames(conn: &Connection, parser: &mut dyn FrameSource) -> bool {
    loop {
        match parser.gets() {
            Ok(Some(frame)) => dispatch_frame(conn, frame).await,
            Ok(None) => return true,
            Err(e) => {
                error!(error = %e, "protocol error, closing connection");
                conn.closing.store(true, Ordering::SeqCst);
                conn.closed.store(true, Ordering::SeqCst);
                conn.closed_notify.notify_waiters();
                return false;
            }
        }
    }
}

async fn dispatch_frame(conn: &Connection, frame: Frame) {
    match frame {
        Frame::Response(payload) if &payload[..] == HEARTBEAT => {
            trace!("heartbeat received, replying NOP");
            if let Err(e) = conn.write_raw(&Command::Nop.encode()).await {
                warn!(error = %e, "failed to reply to heartbeat");
            }
        }
        Frame::Response(payload) => resolve_next_waiter(conn, payload),
        Frame::Error(payload) => {
            warn!(descriptor = %String::from_utf8_lossy(&payload), "broker error frame");
            resolve_next_waiter(conn, payload);
        }
        Frame::Message(frame) => {
            {
                let mut shared = conn.shared.lock().unwrap();
                shared.in_flight += 1;
            }
            let message = Message::new(frame.timestamp, frame.attempts, frame.id, frame.body, conn.clone());
            let message = match conn.on_message.lock().unwrap().as_ref() {
                Some(hook) => hook(message),
                None => message,
            };
            let _ = conn.inbox.send(Some(message));
        }
    }
}

fn resolve_next_waiter(conn: &Connection, payload: Bytes) {
    let waiter = {
        let mut shared = conn.shared.lock().unwrap();
        shared.waiters.pop_front()
    };
    if let Some(tx) = waiter {
        let _ = tx.send(payload);
    } else {
        trace!("response frame with no waiting caller");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{FRAME_TYPE_MESSAGE, FRAME_TYPE_RESPONSE};
    use tokio::net::TcpListener;

    fn framed(frame_type: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((4 + payload.len()) as u32).to_be_bytes());
        out.extend_from_slice(&frame_type.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    async fn loopback_pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let connect_fut = Connection::connect(addr.ip().to_string(), addr.port(), tx);
        let (conn_result, accept_result) = tokio::join!(connect_fut, listener.accept());
        let conn = conn_result.unwrap();
        let (server, _) = accept_result.unwrap();

        let mut server = server;
        let mut magic = [0u8; 4];
        server.read_exact(&mut magic).await.unwrap();
        assert_eq!(&magic, MAGIC_V2);

        (conn, server)
    }

    #[tokio::test]
    async fn heartbeat_triggers_nop_reply_without_consuming_a_waiter() {
        let (conn, mut server) = loopback_pair().await;

        server
            .write_all(&framed(FRAME_TYPE_RESPONSE, HEARTBEAT))
            .await
            .unwrap();

        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"NOP\n");
        assert_eq!(conn.in_flight(), 0);
    }

    #[tokio::test]
    async fn command_reply_correlation_resolves_fifo() {
        let (conn, mut server) = loopback_pair().await;

        let sub = tokio::spawn({
            let conn = conn.clone();
            async move { conn.execute(Command::Sub("t".into(), "c".into())).await }
        });

        let mut sub_wire = [0u8; 64];
        let n = server.read(&mut sub_wire).await.unwrap();
        assert_eq!(&sub_wire[..n], b"SUB t c\n");

        server
            .write_all(&framed(FRAME_TYPE_RESPONSE, OK))
            .await
            .unwrap();

        let reply = sub.await.unwrap().unwrap();
        assert_eq!(&reply[..], OK);
    }

    #[tokio::test]
    async fn fire_and_forget_rdy_does_not_wait_on_broker() {
        let (conn, mut server) = loopback_pair().await;

        let result = conn.execute(Command::Rdy(5)).await.unwrap();
        assert_eq!(&result[..], OK);

        let mut wire = [0u8; 16];
        let n = server.read(&mut wire).await.unwrap();
        assert_eq!(&wire[..n], b"RDY 5\n");
    }

    #[tokio::test]
    async fn identify_without_negotiated_upgrade_returns_reply_immediately() {
        let (conn, mut server) = loopback_pair().await;

        let identify = tokio::spawn({
            let conn = conn.clone();
            async move { conn.identify(&IdentifyConfig::new()).await }
        });

        let mut wire = [0u8; 4096];
        let n = server.read(&mut wire).await.unwrap();
        assert!(wire[..n].starts_with(b"IDENTIFY\n"));

        server
            .write_all(&framed(FRAME_TYPE_RESPONSE, OK))
            .await
            .unwrap();

        let reply = identify.await.unwrap().unwrap();
        assert_eq!(&reply[..], OK);
    }

    #[tokio::test]
    async fn identify_drains_the_negotiated_deflate_confirmation() {
        use flate2::write::DeflateEncoder;
        use std::io::Write;

        let (conn, mut server) = loopback_pair().await;

        let identify = tokio::spawn({
            let conn = conn.clone();
            async move { conn.identify(&IdentifyConfig::new()).await }
        });

        let mut wire = [0u8; 4096];
        let n = server.read(&mut wire).await.unwrap();
        assert!(wire[..n].starts_with(b"IDENTIFY\n"));

        let negotiated = serde_json::json!({ "deflate": true }).to_string();
        server
            .write_all(&framed(FRAME_TYPE_RESPONSE, negotiated.as_bytes()))
            .await
            .unwrap();

        // Give the ingress task a moment to set `upgrading` and swap the
        // parser before the compressed confirmation frame arrives; without
        // the fix, this reply would never be drained and `identify` would
        // hang forever.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let ok_frame = framed(FRAME_TYPE_RESPONSE, OK);
        let mut encoder = DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&ok_frame).unwrap();
        let compressed = encoder.finish().unwrap();
        server.write_all(&compressed).await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(2), identify)
            .await
            .expect("identify() deadlocked waiting on the compression confirmation")
            .unwrap()
            .unwrap();
        assert_eq!(&reply[..], negotiated.as_bytes());
    }

    #[tokio::test]
    async fn message_frame_increments_in_flight() {
        let (conn, mut server) = loopback_pair().await;

        let mut payload = Vec::new();
        payload.extend_from_slice(&42i64.to_be_bytes());
        payload.extend_from_slice(&1u16.to_be_bytes());
        payload.extend_from_slice(&[b'a'; crate::consts::MSG_ID_LENGTH]);
        payload.extend_from_slice(b"hello");

        server
            .write_all(&framed(FRAME_TYPE_MESSAGE, &payload))
            .await
            .unwrap();

        // give the ingress task a chance to process the frame
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(conn.in_flight(), 1);
    }
}
