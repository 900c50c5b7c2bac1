// ABOUTME: RDY budget distribution across a Reader's live connections
// ABOUTME: Tracks per-connection issued budget and last-message time, recomputed on a timer

use crate::codec::Command;
use crate::connection::Connection;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

type ConnectionKey = (String, u16);

struct Entry {
    connection: Connection,
    rdy: u32,
    last_message_at: Instant,
}

/// Distributes a Reader's `max_in_flight` budget across its live
/// connections, matching §4.4.
pub struct RdyControl {
    entries: Mutex<HashMap<ConnectionKey, Entry>>,
    max_in_flight: u32,
    idle_timeout: Duration,
    stopped: AtomicBool,
    /// Rotates which single connection gets the budget-of-1 when there are
    /// more connections than `max_in_flight` allows each at least 1.
    rotation_cursor: Mutex<usize>,
}

impl RdyControl {
    pub fn new(max_in_flight: u32, idle_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_in_flight,
            idle_timeout,
            stopped: AtomicBool::new(false),
            rotation_cursor: Mutex::new(0),
        }
    }

    pub fn add_connection(&self, connection: Connection) {
        let key = (connection.host().to_string(), connection.port());
        self.entries.lock().unwrap().insert(
            key,
            Entry {
                connection,
                rdy: 0,
                last_message_at: Instant::now(),
            },
        );
    }

    pub fn add_connections(&self, connections: impl IntoIterator<Item = Connection>) {
        for connection in connections {
            self.add_connection(connection);
        }
    }

    pub fn remove_connection(&self, host: &str, port: u16) {
        self.entries
            .lock()
            .unwrap()
            .remove(&(host.to_string(), port));
    }

    /// Record that a message just arrived on `host:port`, for the
    /// longest-idle-first remainder policy.
    pub fn note_message(&self, host: &str, port: u16) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&(host.to_string(), port)) {
            entry.last_message_at = Instant::now();
        }
    }

    /// Recompute and issue RDY for every live connection.
    #[instrument(skip(self))]
    pub async fn redistribute(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        let targets = self.compute_targets();
        for (connection, rdy) in targets {
            debug!(host = connection.host(), port = connection.port(), rdy, "redistributing RDY");
            let _ = connection.execute(Command::Rdy(rdy)).await;
        }
    }

    /// Refresh a single connection's RDY if its issued budget has drifted
    /// from its fair-share target by more than 25%.
    pub async fn on_rdy_changed(&self, host: &str, port: u16) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        let key = (host.to_string(), port);
        let num_conns = self.entries.lock().unwrap().len();
        if num_conns == 0 {
            return;
        }
        let fair_share = self.max_in_flight / num_conns.max(1) as u32;

        let (connection, current_rdy) = {
            let entries = self.entries.lock().unwrap();
            match entries.get(&key) {
                Some(entry) => (entry.connection.clone(), entry.rdy),
                None => return,
            }
        };

        let drift = current_rdy.abs_diff(fair_share);
        let threshold = (fair_share as f64 * 0.25).ceil() as u32;
        if drift <= threshold {
            return;
        }

        let _ = connection.execute(Command::Rdy(fair_share)).await;
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&key) {
            entry.rdy = fair_share;
        }
    }

    pub fn stop_working(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Pure computation split out from `redistribute` so the distribution
    /// policy is directly unit-testable without a real Connection/socket.
    fn compute_targets(&self) -> Vec<(Connection, u32)> {
        let mut entries = self.entries.lock().unwrap();
        let num_conns = entries.len();
        if num_conns == 0 {
            return Vec::new();
        }

        let mut keys: Vec<ConnectionKey> = entries.keys().cloned().collect();
        keys.sort_by_key(|k| entries[k].last_message_at);

        let mut targets = Vec::with_capacity(num_conns);

        if self.max_in_flight < num_conns as u32 {
            // Low-in-flight mode: rotate a budget of 1 among connections.
            let mut cursor = self.rotation_cursor.lock().unwrap();
            for (i, key) in keys.iter().enumerate() {
                let rdy = if i == *cursor % num_conns { 1 } else { 0 };
                let entry = entries.get_mut(key).unwrap();
                entry.rdy = rdy;
                targets.push((entry.connection.clone(), rdy));
            }
            *cursor = (*cursor + 1) % num_conns;
            return targets;
        }

        // Connections idle longer than `idle_timeout` sit out the fair-share
        // split entirely (RDY 0) except for one elected per cycle, which
        // gets a probe RDY of 1 so a redistribute can discover it woke back
        // up. The probe is funded out of `max_in_flight` rather than handed
        // out on top of the active split, so the sum issued never exceeds
        // `max_in_flight` (invariant #6). Everyone else splits what's left,
        // with the remainder going to the longest-idle of the *active* set.
        let (idle_keys, active_keys): (Vec<ConnectionKey>, Vec<ConnectionKey>) = keys
            .iter()
            .cloned()
            .partition(|k| entries[k].last_message_at.elapsed() > self.idle_timeout);

        let elected_idle = if idle_keys.is_empty() {
            None
        } else {
            let mut cursor = self.rotation_cursor.lock().unwrap();
            let idx = *cursor % idle_keys.len();
            *cursor = (*cursor + 1) % idle_keys.len();
            Some(idle_keys[idx].clone())
        };

        let reserved_for_probe: u32 = if elected_idle.is_some() { 1 } else { 0 };
        let available = self.max_in_flight.saturating_sub(reserved_for_probe);
        let active_count = active_keys.len().max(1) as u32;
        let base = available / active_count;
        let remainder = available % active_count;

        for (i, key) in active_keys.iter().enumerate() {
            let mut rdy = base;
            if (i as u32) < remainder {
                rdy += 1;
            }
            let entry = entries.get_mut(key).unwrap();
            entry.rdy = rdy;
            targets.push((entry.connection.clone(), rdy));
        }

        for key in &idle_keys {
            let rdy = if elected_idle.as_ref() == Some(key) { 1 } else { 0 };
            let entry = entries.get_mut(key).unwrap();
            entry.rdy = rdy;
            targets.push((entry.connection.clone(), rdy));
        }

        targets
    }
}
