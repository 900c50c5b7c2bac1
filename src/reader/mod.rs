// ABOUTME: Owns the Connection set, the unified message inbox, and subscription lifecycle
// ABOUTME: Coordinates RdyControl and Lookup; the only entry point application code talks to

pub mod lookup;
pub mod rdy;

use crate::codec::Command;
use crate::config::{IdentifyConfig, ReaderConfig};
use crate::connection::Connection;
use crate::error::NsqResult;
use crate::message::Message;
use lookup::{BrokerAddress, HttpLookupClient, LookupClient};
use rdy::RdyControl;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

type ConnKey = (String, u16);
type ConnectionMap = Arc<std::sync::Mutex<HashMap<ConnKey, Connection>>>;

/// Coordinates a set of Connections into a single subscribed message
/// stream (§4.6). Generic over `LookupClient` so tests and alternate
/// transports can substitute their own discovery client; `HttpLookupClient`
/// is the default production implementation.
pub struct Reader<L: LookupClient = HttpLookupClient> {
    config: ReaderConfig,
    lookup_client: Arc<L>,
    connections: ConnectionMap,
    rdy: Arc<RdyControl>,
    topic: Arc<std::sync::Mutex<Option<String>>>,
    channel: Arc<std::sync::Mutex<Option<String>>>,
    subscribed: Arc<AtomicBool>,
    active_consumers: Arc<AtomicUsize>,
    inbox_tx: mpsc::UnboundedSender<Option<Message>>,
    inbox_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<Option<Message>>>>,
    background_tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Reader<HttpLookupClient> {
    pub fn new(config: ReaderConfig) -> Self {
        Self::with_lookup_client(config, HttpLookupClient::new())
    }
}

impl<L: LookupClient + Send + Sync + 'static> Reader<L> {
    pub fn with_lookup_client(config: ReaderConfig, lookup_client: L) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let rdy = Arc::new(RdyControl::new(config.max_in_flight, config.idle_timeout));
        Self {
            config,
            lookup_client: Arc::new(lookup_client),
            connections: Arc::new(std::sync::Mutex::new(HashMap::new())),
            rdy,
            topic: Arc::new(std::sync::Mutex::new(None)),
            channel: Arc::new(std::sync::Mutex::new(None)),
            subscribed: Arc::new(AtomicBool::new(false)),
            active_consumers: Arc::new(AtomicUsize::new(0)),
            inbox_tx,
            inbox_rx: Arc::new(AsyncMutex::new(inbox_rx)),
            background_tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Open a Connection to every seed broker address, IDENTIFY each, and
    /// register them with RdyControl.
    #[instrument(skip(self))]
    pub async fn connect(&self) -> NsqResult<()> {
        for (host, port) in self.config.nsqd_addresses.clone() {
            self.connect_one(host, port).await?;
        }
        self.rdy.redistribute().await;
        Ok(())
    }

    async fn connect_one(&self, host: String, port: u16) -> NsqResult<Connection> {
        let conn = Connection::connect(host.clone(), port, self.inbox_tx.clone()).await?;
        conn.identify(&self.config.identify).await?;
        install_rdy_hook(&conn, self.rdy.clone());
        self.rdy.add_connection(conn.clone());
        self.connections
            .lock()
            .unwrap()
            .insert((host, port), conn.clone());
        info!(host = conn.host(), port = conn.port(), "connected to broker");
        Ok(conn)
    }

    /// Subscribe to `topic`/`channel`: run an initial lookup poll (if
    /// configured), SUB on every Connection, and start the periodic
    /// redistribute/lookup-poll background tasks.
    #[instrument(skip(self))]
    pub async fn subscribe(&self, topic: impl Into<String>, channel: impl Into<String>) -> NsqResult<()> {
        let topic = topic.into();
        let channel = channel.into();

        *self.topic.lock().unwrap() = Some(topic.clone());
        *self.channel.lock().unwrap() = Some(channel.clone());
        self.subscribed.store(true, Ordering::SeqCst);

        if !self.config.lookupd_addresses.is_empty() {
            self.discover_and_connect(&topic, &channel).await;
        }

        for conn in self.snapshot_connections() {
            conn.execute(Command::Sub(topic.clone(), channel.clone()))
                .await?;
        }
        self.rdy.redistribute().await;

        self.spawn_redistribute_task();
        self.spawn_lookup_poll_task(topic, channel);

        Ok(())
    }

    fn snapshot_connections(&self) -> Vec<Connection> {
        self.connections.lock().unwrap().values().cloned().collect()
    }

    async fn discover_and_connect(&self, topic: &str, channel: &str) {
        let discovered = lookup::poll(
            self.lookup_client.as_ref(),
            &self.config.lookupd_addresses,
            topic,
        )
        .await;

        for BrokerAddress { host, port } in discovered {
            let already_known = self.connections.lock().unwrap().contains_key(&(host.clone(), port));
            if already_known {
                continue;
            }
            match self.connect_one(host.clone(), port).await {
                Ok(conn) => {
                    if let Err(e) = conn.execute(Command::Sub(topic.to_string(), channel.to_string())).await {
                        warn!(host = %host, port, error = %e, "failed to SUB newly discovered broker");
                    }
                }
                Err(e) => warn!(host = %host, port, error = %e, "failed to connect to newly discovered broker"),
            }
        }
    }

    fn spawn_redistribute_task(&self) {
        let Some(interval) = self.config.redistribute_interval else {
            return;
        };
        let rdy = self.rdy.clone();
        let subscribed = self.subscribed.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !subscribed.load(Ordering::SeqCst) {
                    break;
                }
                rdy.redistribute().await;
            }
        });
        self.background_tasks.lock().unwrap().push(handle);
    }

    fn spawn_lookup_poll_task(&self, topic: String, channel: String) {
        if self.config.lookupd_addresses.is_empty() || self.config.lookupd_poll_time.is_zero() {
            return;
        }

        let lookup_client = self.lookup_client.clone();
        let lookupd_addresses = self.config.lookupd_addresses.clone();
        let connections = self.connections.clone();
        let rdy = self.rdy.clone();
        let subscribed = self.subscribed.clone();
        let inbox_tx = self.inbox_tx.clone();
        let identify_config = self.config.identify.clone();
        let poll_time = self.config.lookupd_poll_time;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_time);
            loop {
                ticker.tick().await;
                if !subscribed.load(Ordering::SeqCst) {
                    break;
                }
                let discovered = lookup::poll(lookup_client.as_ref(), &lookupd_addresses, &topic).await;
                for BrokerAddress { host, port } in discovered {
                    let known = connections.lock().unwrap().contains_key(&(host.clone(), port));
                    if known {
                        continue;
                    }
                    match Connection::connect(host.clone(), port, inbox_tx.clone()).await {
                        Ok(conn) => {
                            if conn.identify(&identify_config).await.is_err() {
                                continue;
                            }
                            if conn
                                .execute(Command::Sub(topic.clone(), channel.clone()))
                                .await
                                .is_err()
                            {
                                continue;
                            }
                            install_rdy_hook(&conn, rdy.clone());
                            rdy.add_connection(conn.clone());
                            connections.lock().unwrap().insert((host, port), conn);
                        }
                        Err(e) => {
                            debug!(host = %host, port, error = %e, "periodic lookup connect failed");
                        }
                    }
                }
                rdy.redistribute().await;
            }
        });
        self.background_tasks.lock().unwrap().push(handle);
    }

    /// Borrow a consumer handle over the unified message inbox. Multiple
    /// concurrent consumers may exist; each pulls from the same underlying
    /// channel (tracked by `active_consumers` for `unsubscribe`'s drain
    /// protocol).
    pub fn messages(&self) -> MessageConsumer<'_, L> {
        self.active_consumers.fetch_add(1, Ordering::SeqCst);
        MessageConsumer { reader: self }
    }

    /// Broadcast `RDY n` to every live Connection, bypassing RdyControl's
    /// fair-share computation. Used directly for the shutdown quiesce
    /// (`n = 0`).
    pub async fn set_max_in_flight(&self, n: u32) {
        for conn in self.snapshot_connections() {
            let _ = conn.execute(Command::Rdy(n)).await;
        }
    }

    /// §4.6: quiesce, stop yielding messages, wake every consumer, and
    /// requeue anything left buffered.
    #[instrument(skip(self))]
    pub async fn unsubscribe(&self) {
        self.set_max_in_flight(0).await;
        self.subscribed.store(false, Ordering::SeqCst);

        loop {
            let outstanding = self.active_consumers.load(Ordering::SeqCst);
            if outstanding == 0 {
                break;
            }
            for _ in 0..outstanding {
                let _ = self.inbox_tx.send(None);
            }
            tokio::task::yield_now().await;
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let mut rx = self.inbox_rx.lock().await;
        while let Ok(item) = rx.try_recv() {
            if let Some(msg) = item {
                let _ = msg.req(0).await;
            }
        }
        debug!("unsubscribe drained inbox");
    }

    /// Idempotent. Unsubscribes first if needed, stops RdyControl, and
    /// closes every Connection.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        if self.subscribed.load(Ordering::SeqCst) {
            self.unsubscribe().await;
        }
        self.rdy.stop_working();

        for handle in self.background_tasks.lock().unwrap().drain(..) {
            handle.abort();
        }

        for conn in self.snapshot_connections() {
            conn.close().await;
        }
        self.connections.lock().unwrap().clear();
        debug!("reader closed");
    }
}

/// Wire a Connection's `on_message` hook to RdyControl's per-message signal
/// (§4.4/§4.6): record the message as arriving (for the longest-idle-first
/// remainder policy) and let RdyControl refresh this connection's RDY if its
/// issued budget has drifted from its fair-share target.
fn install_rdy_hook(conn: &Connection, rdy: Arc<RdyControl>) {
    let host = conn.host().to_string();
    let port = conn.port();
    conn.set_on_message(move |msg| {
        rdy.note_message(&host, port);
        let rdy = rdy.clone();
        let host = host.clone();
        tokio::spawn(async move {
            rdy.on_rdy_changed(&host, port).await;
        });
        msg
    });
}

/// A handle over the Reader's unified inbox. Dropping it releases the
/// consumer slot `unsubscribe`'s drain protocol waits on.
pub struct MessageConsumer<'a, L: LookupClient> {
    reader: &'a Reader<L>,
}

impl<L: LookupClient + Send + Sync + 'static> MessageConsumer<'_, L> {
    /// Pulls the next Message, or `None` once the Reader is unsubscribed.
    /// A `None` sentinel pushed by `unsubscribe` is consumed internally to
    /// re-check subscription state, never yielded to the caller (§4.6).
    pub async fn next(&self) -> Option<Message> {
        loop {
            if !self.reader.subscribed.load(Ordering::SeqCst) {
                return None;
            }
            let mut rx = self.reader.inbox_rx.lock().await;
            match rx.recv().await {
                Some(Some(msg)) => return Some(msg),
                Some(None) => continue,
                None => return None,
            }
        }
    }
}

impl<L: LookupClient> Drop for MessageConsumer<'_, L> {
    fn drop(&mut self) {
        self.reader.active_consumers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EmptyLookup;
    impl LookupClient for EmptyLookup {
        async fn lookup(&self, _endpoint: &str, _topic: &str) -> Vec<BrokerAddress> {
            Vec::new()
        }
    }

    fn reader() -> Reader<EmptyLookup> {
        Reader::with_lookup_client(ReaderConfig::default(), EmptyLookup)
    }

    #[tokio::test]
    async fn messages_consumer_registers_and_releases_active_slot() {
        let reader = reader();
        {
            let _consumer = reader.messages();
            assert_eq!(reader.active_consumers.load(Ordering::SeqCst), 1);
        }
        assert_eq!(reader.active_consumers.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn next_returns_none_once_unsubscribed() {
        let reader = reader();
        reader.subscribed.store(true, Ordering::SeqCst);
        let consumer = reader.messages();

        // A sentinel arriving after unsubscribe is the signal to recheck
        // subscription state, not a value to yield.
        reader.subscribed.store(false, Ordering::SeqCst);
        let _ = reader.inbox_tx.send(None);

        assert!(consumer.next().await.is_none());
    }
}
