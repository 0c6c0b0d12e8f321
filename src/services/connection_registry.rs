use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::settings::normalize_shard_count;
use crate::models::{ConnectionStatus, TerminalIdentity};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection mailbox is full")]
    MailboxFull,
    #[error("connection is closed")]
    Closed,
}

/// Why the registry asked a transport to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Superseded,
    HeartbeatTimeout,
    WriteFailure,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Superseded => "superseded",
            CloseReason::HeartbeatTimeout => "heartbeat_timeout",
            CloseReason::WriteFailure => "write_failure",
        }
    }
}

/// Non-owning reference to a duplex channel. The transport layer owns the socket.
///
/// `send_text` must not block on the peer: implementations enqueue into a bounded
/// mailbox and report back-pressure as an error.
pub trait ConnectionHandle: Send + Sync {
    fn send_text(&self, message: &str) -> Result<(), TransportError>;
    fn close(&self, reason: CloseReason);
}

/// Monitoring counters. Updated without taking the shard write lock.
#[derive(Debug, Default)]
pub struct ConnectionCounters {
    pub sent: AtomicU64,
    pub received: AtomicU64,
    pub errors: AtomicU64,
}

/// One live terminal session.
#[derive(Clone)]
pub struct TerminalConnection {
    pub connection_id: Uuid,
    pub terminal_id: String,
    pub organization_id: String,
    pub handle: Arc<dyn ConnectionHandle>,
    pub connected_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub status: ConnectionStatus,
    pub counters: Arc<ConnectionCounters>,
}

impl fmt::Debug for TerminalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalConnection")
            .field("connection_id", &self.connection_id)
            .field("terminal_id", &self.terminal_id)
            .field("organization_id", &self.organization_id)
            .field("connected_at", &self.connected_at)
            .field("last_heartbeat_at", &self.last_heartbeat_at)
            .field("status", &self.status)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_connections: usize,
    pub per_shard_counts: Vec<usize>,
    /// Largest shard divided by the mean shard size; 1.0 is a perfect spread.
    pub load_balance_factor: f64,
    /// Mean time spent handing a frame to a transport, in milliseconds.
    pub average_response_time: f64,
}

type Shard = RwLock<HashMap<String, TerminalConnection>>;

/// Terminal id -> live connection, split over a fixed power-of-two number of
/// independently locked shards.
///
/// Locks are held only for map mutations and snapshots; transport writes and
/// closes always happen after the guard is dropped.
pub struct ConnectionRegistry {
    shards: Box<[Shard]>,
    mask: usize,
    send_micros_total: AtomicU64,
    send_samples: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(shard_count: usize) -> Self {
        let shard_count = normalize_shard_count(shard_count);
        let shards = (0..shard_count)
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shards,
            mask: shard_count - 1,
            send_micros_total: AtomicU64::new(0),
            send_samples: AtomicU64::new(0),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_index(&self, terminal_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        terminal_id.hash(&mut hasher);
        (hasher.finish() as usize) & self.mask
    }

    fn shard(&self, terminal_id: &str) -> &Shard {
        &self.shards[self.shard_index(terminal_id)]
    }

    /// Register a connection, superseding any existing one for the same terminal.
    ///
    /// The superseded handle is closed before this returns. Returns `false` when a
    /// replace occurred.
    pub fn add_connection(
        &self,
        identity: &TerminalIdentity,
        connection_id: Uuid,
        handle: Arc<dyn ConnectionHandle>,
    ) -> bool {
        let now = Utc::now();
        let connection = TerminalConnection {
            connection_id,
            terminal_id: identity.terminal_id.clone(),
            organization_id: identity.organization_id.clone(),
            handle,
            connected_at: now,
            last_active_at: now,
            last_heartbeat_at: now,
            status: ConnectionStatus::Connected,
            counters: Arc::new(ConnectionCounters::default()),
        };

        let previous = self
            .shard(&identity.terminal_id)
            .write()
            .insert(identity.terminal_id.clone(), connection);

        match previous {
            Some(old) => {
                old.handle.close(CloseReason::Superseded);
                info!(
                    terminal_id = %identity.terminal_id,
                    old_connection_id = %old.connection_id,
                    new_connection_id = %connection_id,
                    "connection_superseded"
                );
                false
            }
            None => {
                info!(
                    terminal_id = %identity.terminal_id,
                    organization_id = %identity.organization_id,
                    connection_id = %connection_id,
                    shard = self.shard_index(&identity.terminal_id),
                    "connection_registered"
                );
                true
            }
        }
    }

    /// Unregister a terminal. Idempotent.
    pub fn remove_connection(&self, terminal_id: &str) -> Option<Arc<dyn ConnectionHandle>> {
        let removed = self.shard(terminal_id).write().remove(terminal_id);
        removed.map(|connection| {
            info!(
                terminal_id = %terminal_id,
                connection_id = %connection.connection_id,
                "connection_removed"
            );
            connection.handle
        })
    }

    /// Unregister only if the registered session is still `connection_id`.
    ///
    /// Used by transports on shutdown so a closing socket cannot evict the
    /// connection that superseded it.
    pub fn remove_connection_if(&self, terminal_id: &str, connection_id: Uuid) -> bool {
        let mut shard = self.shard(terminal_id).write();
        let matches = shard
            .get(terminal_id)
            .is_some_and(|c| c.connection_id == connection_id);
        if matches {
            shard.remove(terminal_id);
        }
        drop(shard);

        if matches {
            info!(
                terminal_id = %terminal_id,
                connection_id = %connection_id,
                "connection_removed"
            );
        }
        matches
    }

    pub fn is_online(&self, terminal_id: &str) -> bool {
        self.shard(terminal_id).read().contains_key(terminal_id)
    }

    pub fn get_connection(&self, terminal_id: &str) -> Option<TerminalConnection> {
        self.shard(terminal_id).read().get(terminal_id).cloned()
    }

    /// Best-effort write to the live handle.
    ///
    /// A failed write evicts the connection and returns `false`.
    pub fn send(&self, terminal_id: &str, message: &str) -> bool {
        let Some(connection) = self.get_connection(terminal_id) else {
            debug!(terminal_id = %terminal_id, "send skipped, terminal not registered");
            return false;
        };
        self.write_to(&connection, message, false).is_ok()
    }

    /// Like [`send`](Self::send), except a full mailbox leaves the session
    /// registered and is returned as [`TransportError::MailboxFull`] so the
    /// caller can wait and retry. An unregistered terminal is `Closed`.
    pub fn try_send(&self, terminal_id: &str, message: &str) -> Result<(), TransportError> {
        let Some(connection) = self.get_connection(terminal_id) else {
            return Err(TransportError::Closed);
        };
        self.write_to(&connection, message, true)
    }

    fn write_to(
        &self,
        connection: &TerminalConnection,
        message: &str,
        tolerate_full: bool,
    ) -> Result<(), TransportError> {
        let started = Instant::now();
        let result = connection.handle.send_text(message);
        self.record_send_latency(started);

        match result {
            Ok(()) => {
                connection.counters.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TransportError::MailboxFull) if tolerate_full => {
                debug!(
                    terminal_id = %connection.terminal_id,
                    connection_id = %connection.connection_id,
                    "transport_backpressure"
                );
                Err(TransportError::MailboxFull)
            }
            Err(e) => {
                connection.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    terminal_id = %connection.terminal_id,
                    connection_id = %connection.connection_id,
                    error = %e,
                    "transport_write_failure"
                );
                if self.remove_connection_if(&connection.terminal_id, connection.connection_id) {
                    connection.handle.close(CloseReason::WriteFailure);
                }
                Err(e)
            }
        }
    }

    fn record_send_latency(&self, started: Instant) {
        let micros = started.elapsed().as_micros().min(u64::MAX as u128) as u64;
        self.send_micros_total.fetch_add(micros, Ordering::Relaxed);
        self.send_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the connections of each shard in turn, releasing every lock before
    /// the next shard is read.
    fn snapshot<F>(&self, mut keep: F) -> Vec<TerminalConnection>
    where
        F: FnMut(&TerminalConnection) -> bool,
    {
        let mut out = Vec::new();
        for shard in self.shards.iter() {
            let guard = shard.read();
            out.extend(guard.values().filter(|c| keep(*c)).cloned());
        }
        out
    }

    pub fn broadcast(&self, message: &str) -> usize {
        let targets = self.snapshot(|_| true);
        let delivered = targets
            .iter()
            .filter(|c| self.write_to(c, message, false).is_ok())
            .count();
        info!(
            delivered = delivered,
            total = targets.len(),
            "broadcast_completed"
        );
        delivered
    }

    pub fn broadcast_to_organization(&self, organization_id: &str, message: &str) -> usize {
        let targets = self.snapshot(|c| c.organization_id == organization_id);
        let delivered = targets
            .iter()
            .filter(|c| self.write_to(c, message, false).is_ok())
            .count();
        info!(
            organization_id = %organization_id,
            delivered = delivered,
            total = targets.len(),
            "broadcast_completed"
        );
        delivered
    }

    pub fn update_last_active(&self, terminal_id: &str, time: DateTime<Utc>) {
        if let Some(connection) = self.shard(terminal_id).write().get_mut(terminal_id) {
            connection.last_active_at = time;
        }
    }

    /// Heartbeats refresh both liveness timestamps.
    pub fn record_heartbeat(&self, terminal_id: &str, time: DateTime<Utc>) {
        if let Some(connection) = self.shard(terminal_id).write().get_mut(terminal_id) {
            connection.last_heartbeat_at = time;
            connection.last_active_at = time;
        }
    }

    pub fn record_received(&self, terminal_id: &str) {
        if let Some(connection) = self.shard(terminal_id).read().get(terminal_id) {
            connection.counters.received.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Remove every connection whose last heartbeat is older than `threshold`.
    ///
    /// Shards are locked one at a time. Returned copies carry
    /// `ConnectionStatus::HeartbeatTimeout` and their handles are already closed.
    pub fn evict_expired(&self, threshold: DateTime<Utc>) -> Vec<TerminalConnection> {
        let mut evicted = Vec::new();
        for shard in self.shards.iter() {
            let mut guard = shard.write();
            let stale: Vec<String> = guard
                .iter()
                .filter(|(_, c)| c.last_heartbeat_at < threshold)
                .map(|(id, _)| id.clone())
                .collect();
            for terminal_id in stale {
                if let Some(mut connection) = guard.remove(&terminal_id) {
                    connection.status = ConnectionStatus::HeartbeatTimeout;
                    evicted.push(connection);
                }
            }
        }

        for connection in &evicted {
            connection.handle.close(CloseReason::HeartbeatTimeout);
        }
        evicted
    }

    pub fn cleanup_expired(&self, threshold: DateTime<Utc>) -> usize {
        self.evict_expired(threshold).len()
    }

    pub fn stats(&self) -> RegistryStats {
        let per_shard_counts: Vec<usize> = self.shards.iter().map(|s| s.read().len()).collect();
        let total_connections: usize = per_shard_counts.iter().sum();

        let load_balance_factor = if total_connections == 0 {
            1.0
        } else {
            let mean = total_connections as f64 / per_shard_counts.len() as f64;
            let max = per_shard_counts.iter().copied().max().unwrap_or(0) as f64;
            max / mean
        };

        let samples = self.send_samples.load(Ordering::Relaxed);
        let average_response_time = if samples == 0 {
            0.0
        } else {
            self.send_micros_total.load(Ordering::Relaxed) as f64 / samples as f64 / 1000.0
        };

        RegistryStats {
            total_connections,
            per_shard_counts,
            load_balance_factor,
            average_response_time,
        }
    }
}
