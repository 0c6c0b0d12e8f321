use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppSettings;
use crate::error::{AppError, AppResult};
use crate::models::{
    CommandEnvelope, CommandIntent, DispatchOutcome, OfflineMessage, SendCommandResult,
    TerminalIdentity,
};
use crate::services::command_queue::{CommandQueueEntry, CommandQueueStore};
use crate::services::connection_registry::{ConnectionHandle, ConnectionRegistry, TransportError};
use crate::services::id_generator::IdentityGenerator;
use crate::services::offline_message_store::OfflineMessageStore;

const EXHAUSTED_REASON: &str = "redelivery exhausted";

/// How long a backlog replay waits for a full mailbox before each retry.
const BACKPRESSURE_PAUSE: std::time::Duration = std::time::Duration::from_millis(5);

/// Waits on a full mailbox before the replay gives up on the session.
const BACKPRESSURE_RETRIES: u32 = 200;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long a delivered command may go unacknowledged before it is retried.
    pub in_flight_ttl: Duration,
    pub max_retry_count: u32,
    pub offline_ttl: Duration,
}

impl DispatcherConfig {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            in_flight_ttl: Duration::seconds(settings.dispatch.in_flight_ttl_secs as i64),
            max_retry_count: settings.dispatch.max_retry_count,
            offline_ttl: Duration::seconds(settings.offline.message_ttl_secs as i64),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            in_flight_ttl: Duration::seconds(120),
            max_retry_count: 3,
            offline_ttl: Duration::hours(24),
        }
    }
}

/// Result of replaying a terminal's offline backlog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub delivered: usize,
    pub expired: usize,
    pub failed: usize,
    /// Still pending when the drain stopped.
    pub remaining: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReclaimReport {
    pub resent: usize,
    pub queued_offline: usize,
    pub expired: usize,
    pub exhausted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reclaimed {
    Resent,
    QueuedOffline,
    Expired,
    Exhausted,
}

/// Routes command intents to live connections or the offline store.
///
/// Submissions and reconnect drains for one terminal are serialized on a
/// per-terminal async lock, so a fresh command never overtakes the backlog of
/// a terminal that just came back. Different terminals never contend.
pub struct CommandDispatcher {
    registry: Arc<ConnectionRegistry>,
    queue: Arc<dyn CommandQueueStore>,
    offline: Arc<dyn OfflineMessageStore>,
    ids: IdentityGenerator,
    config: DispatcherConfig,
    terminal_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CommandDispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        queue: Arc<dyn CommandQueueStore>,
        offline: Arc<dyn OfflineMessageStore>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            queue,
            offline,
            ids: IdentityGenerator::new(),
            config,
            terminal_locks: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn offline_store(&self) -> &Arc<dyn OfflineMessageStore> {
        &self.offline
    }

    pub fn queue_store(&self) -> &Arc<dyn CommandQueueStore> {
        &self.queue
    }

    fn terminal_lock(&self, terminal_id: &str) -> Arc<Mutex<()>> {
        self.terminal_locks
            .entry(terminal_id.to_string())
            .or_default()
            .clone()
    }

    /// Assign an id, dedup by kind, then deliver or park the command.
    ///
    /// Never fails because the terminal is offline; only store failures and
    /// invalid intents are errors.
    pub async fn send_command(&self, intent: CommandIntent) -> AppResult<SendCommandResult> {
        if intent.terminal_id.trim().is_empty() {
            return Err(AppError::Validation("terminalId must not be empty".to_string()));
        }
        if intent.kind.trim().is_empty() {
            return Err(AppError::Validation("kind must not be empty".to_string()));
        }

        let now = Utc::now();
        let envelope = CommandEnvelope::from_intent(self.ids.next_id(), intent, now);

        if envelope.is_expired(now) {
            info!(
                terminal_id = %envelope.terminal_id,
                command_id = envelope.command_id,
                kind = %envelope.kind,
                stage = "dispatch",
                "command_expired"
            );
            return Ok(SendCommandResult::new(
                envelope.command_id,
                DispatchOutcome::Expired,
                None,
            ));
        }

        let terminal_id = envelope.terminal_id.clone();
        let lock = self.terminal_lock(&terminal_id);
        let result = {
            let _guard = lock.lock().await;
            self.send_locked(envelope, now).await
        };
        self.release_terminal_lock(&terminal_id, lock);
        result
    }

    /// Drop a per-terminal lock once no other task holds or awaits it.
    fn release_terminal_lock(&self, terminal_id: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.terminal_locks
            .remove_if(terminal_id, |_, held| Arc::strong_count(held) == 1);
    }

    async fn send_locked(
        &self,
        envelope: CommandEnvelope,
        now: DateTime<Utc>,
    ) -> AppResult<SendCommandResult> {
        let superseded = match self.queue.enqueue(&envelope).await? {
            Some(old) => {
                self.offline
                    .mark_superseded(&old.terminal_id, old.command_id)
                    .await?;
                info!(
                    terminal_id = %envelope.terminal_id,
                    kind = %envelope.kind,
                    superseded_command_id = old.command_id,
                    command_id = envelope.command_id,
                    was_in_flight = old.is_in_flight(),
                    "command_superseded"
                );
                Some(old.command_id)
            }
            None => None,
        };

        let outcome = if self.deliver(&envelope, now).await? {
            info!(
                terminal_id = %envelope.terminal_id,
                command_id = envelope.command_id,
                kind = %envelope.kind,
                "command_delivered"
            );
            DispatchOutcome::Delivered
        } else {
            let message = OfflineMessage::from_envelope(
                &envelope,
                self.config.max_retry_count,
                self.config.offline_ttl,
                now,
            );
            self.offline.save(&message).await?;
            info!(
                terminal_id = %envelope.terminal_id,
                command_id = envelope.command_id,
                kind = %envelope.kind,
                "command_queued_offline"
            );
            DispatchOutcome::QueuedOffline
        };

        Ok(SendCommandResult::new(envelope.command_id, outcome, superseded))
    }

    /// Write to the live connection and arm the ack deadline.
    async fn deliver(&self, envelope: &CommandEnvelope, now: DateTime<Utc>) -> AppResult<bool> {
        if !self.registry.send(&envelope.terminal_id, &envelope.to_wire()) {
            return Ok(false);
        }
        self.queue
            .mark_in_flight(
                &envelope.terminal_id,
                envelope.command_id,
                now + self.config.in_flight_ttl,
            )
            .await?;
        Ok(true)
    }

    /// Write one backlog frame, waiting out back-pressure from the transport.
    ///
    /// Replays can outrun the transport's mailbox, so a full mailbox is retried
    /// instead of counting as a failed delivery. The task yields after each
    /// frame so a transport sharing this thread can flush.
    async fn send_backlog_frame(&self, terminal_id: &str, frame: &str) -> bool {
        for _ in 0..BACKPRESSURE_RETRIES {
            match self.registry.try_send(terminal_id, frame) {
                Ok(()) => {
                    tokio::task::yield_now().await;
                    return true;
                }
                Err(TransportError::MailboxFull) => tokio::time::sleep(BACKPRESSURE_PAUSE).await,
                Err(TransportError::Closed) => return false,
            }
        }
        warn!(terminal_id = %terminal_id, "backlog_replay_stalled");
        self.registry.send(terminal_id, frame)
    }

    /// Register a freshly authenticated session and replay its backlog.
    ///
    /// The terminal lock is taken before the session becomes visible, so any
    /// submission racing the handshake lands behind the drain.
    pub async fn connect_terminal(
        &self,
        identity: &TerminalIdentity,
        connection_id: Uuid,
        handle: Arc<dyn ConnectionHandle>,
    ) -> AppResult<DrainReport> {
        let lock = self.terminal_lock(&identity.terminal_id);
        let _guard = lock.lock().await;

        self.registry.add_connection(identity, connection_id, handle);
        self.drain_locked(&identity.terminal_id, Utc::now()).await
    }

    /// Replay the backlog of an already registered terminal.
    pub async fn drain_terminal(&self, terminal_id: &str) -> AppResult<DrainReport> {
        let lock = self.terminal_lock(terminal_id);
        let _guard = lock.lock().await;
        self.drain_locked(terminal_id, Utc::now()).await
    }

    async fn drain_locked(&self, terminal_id: &str, now: DateTime<Utc>) -> AppResult<DrainReport> {
        // Unacked deliveries to a previous session rejoin the backlog first.
        for entry in self.queue.pending(terminal_id).await? {
            if entry.in_flight_expired(now) {
                self.park(entry, now).await?;
            }
        }

        let pending = self.offline.find_pending(terminal_id).await?;
        let mut report = DrainReport::default();

        for (index, message) in pending.iter().enumerate() {
            if message.is_expired(now) {
                self.offline
                    .mark_expired(terminal_id, message.message_id)
                    .await?;
                self.queue.remove(terminal_id, message.message_id).await?;
                info!(
                    terminal_id = %terminal_id,
                    command_id = message.message_id,
                    kind = %message.kind,
                    stage = "redelivery",
                    "command_expired"
                );
                report.expired += 1;
                continue;
            }

            let envelope = message.to_envelope();
            if self.send_backlog_frame(terminal_id, &envelope.to_wire()).await {
                self.offline
                    .mark_delivered(terminal_id, message.message_id)
                    .await?;
                let tracked = self
                    .queue
                    .mark_in_flight(terminal_id, message.message_id, now + self.config.in_flight_ttl)
                    .await?;
                if !tracked {
                    debug!(
                        terminal_id = %terminal_id,
                        command_id = message.message_id,
                        "redelivered command has no queue entry, ack will not be tracked"
                    );
                }
                info!(
                    terminal_id = %terminal_id,
                    command_id = message.message_id,
                    kind = %message.kind,
                    retry_count = message.retry_count,
                    "command_delivered"
                );
                report.delivered += 1;
                continue;
            }

            // The write failure evicted the session; everything after this stays pending.
            let retry_count = self
                .offline
                .record_retry(terminal_id, message.message_id)
                .await?
                .unwrap_or(message.retry_count + 1);
            let exhausted = retry_count >= message.max_retry_count;
            if exhausted {
                self.exhaust(terminal_id, message.message_id, retry_count).await?;
                report.failed += 1;
            }
            report.remaining = pending.len() - index - usize::from(exhausted);
            break;
        }

        if report.delivered + report.expired + report.failed > 0 {
            info!(
                terminal_id = %terminal_id,
                delivered = report.delivered,
                expired = report.expired,
                failed = report.failed,
                remaining = report.remaining,
                "offline_drain_completed"
            );
        }
        Ok(report)
    }

    async fn exhaust(&self, terminal_id: &str, command_id: i32, attempts: i32) -> AppResult<()> {
        self.offline
            .mark_failed(terminal_id, command_id, EXHAUSTED_REASON)
            .await?;
        self.queue.remove(terminal_id, command_id).await?;
        warn!(
            terminal_id = %terminal_id,
            command_id,
            attempts,
            "redelivery_exhausted"
        );
        Ok(())
    }

    /// Settle an unacked entry without writing to a connection.
    async fn park(&self, entry: CommandQueueEntry, now: DateTime<Utc>) -> AppResult<Reclaimed> {
        let terminal_id = entry.terminal_id.as_str();

        // The offline TTL runs from the original enqueue, not from this reclaim.
        let mut message = OfflineMessage::from_envelope(
            &entry.envelope,
            self.config.max_retry_count,
            self.config.offline_ttl,
            entry.enqueued_at,
        );
        message.retry_count = entry.attempts as i32;

        if message.is_expired(now) {
            self.queue.remove(terminal_id, entry.command_id).await?;
            self.offline.mark_expired(terminal_id, entry.command_id).await?;
            info!(
                terminal_id = %terminal_id,
                command_id = entry.command_id,
                kind = %entry.kind,
                stage = "in_flight",
                "command_expired"
            );
            return Ok(Reclaimed::Expired);
        }

        if entry.attempts >= self.config.max_retry_count {
            self.exhaust(terminal_id, entry.command_id, entry.attempts as i32)
                .await?;
            return Ok(Reclaimed::Exhausted);
        }

        self.queue.mark_queued(terminal_id, entry.command_id).await?;
        self.offline.save(&message).await?;
        info!(
            terminal_id = %terminal_id,
            command_id = entry.command_id,
            kind = %entry.kind,
            attempts = entry.attempts,
            "command_queued_offline"
        );
        Ok(Reclaimed::QueuedOffline)
    }

    /// Resend or park every delivery whose ack deadline has passed.
    pub async fn reclaim_in_flight(&self, now: DateTime<Utc>) -> AppResult<ReclaimReport> {
        let mut report = ReclaimReport::default();

        for candidate in self.queue.expired_in_flight(now).await? {
            let lock = self.terminal_lock(&candidate.terminal_id);
            let outcome = {
                let _guard = lock.lock().await;
                self.reclaim_one(&candidate, now).await
            };
            self.release_terminal_lock(&candidate.terminal_id, lock);

            match outcome? {
                None => {}
                Some(Reclaimed::Resent) => report.resent += 1,
                Some(Reclaimed::QueuedOffline) => report.queued_offline += 1,
                Some(Reclaimed::Expired) => report.expired += 1,
                Some(Reclaimed::Exhausted) => report.exhausted += 1,
            }
        }

        if report != ReclaimReport::default() {
            info!(
                resent = report.resent,
                queued_offline = report.queued_offline,
                expired = report.expired,
                exhausted = report.exhausted,
                "in_flight_sweep_completed"
            );
        }
        Ok(report)
    }

    async fn reclaim_one(
        &self,
        candidate: &CommandQueueEntry,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Reclaimed>> {
        // Re-read under the lock; an ack or supersede may have landed meanwhile.
        let Some(entry) = self
            .queue
            .get(&candidate.terminal_id, candidate.command_id)
            .await?
            .filter(|e| e.in_flight_expired(now))
        else {
            return Ok(None);
        };

        let resendable = !entry.envelope.is_expired(now)
            && entry.attempts < self.config.max_retry_count
            && self.registry.is_online(&entry.terminal_id);

        if resendable && self.deliver(&entry.envelope, now).await? {
            debug!(
                terminal_id = %entry.terminal_id,
                command_id = entry.command_id,
                attempts = entry.attempts + 1,
                "command_resent"
            );
            return Ok(Some(Reclaimed::Resent));
        }
        self.park(entry, now).await.map(Some)
    }

    /// Clear the in-flight entry for an acknowledged command.
    pub async fn acknowledge(&self, terminal_id: &str, command_id: i32) -> AppResult<bool> {
        let removed = self.queue.remove(terminal_id, command_id).await?;
        match &removed {
            Some(entry) => debug!(
                terminal_id = %terminal_id,
                command_id,
                kind = %entry.kind,
                attempts = entry.attempts,
                "command_acknowledged"
            ),
            None => debug!(terminal_id = %terminal_id, command_id, "ack for unknown command"),
        }
        Ok(removed.is_some())
    }

    /// Drop expired offline records and queue entries older than the offline TTL.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let purged = self.offline.purge_expired(now).await?;
        let stale = self.queue.purge_stale(now - self.config.offline_ttl).await?;
        info!(purged, stale_queue_entries = stale, "offline_purge_completed");
        Ok(purged)
    }

    /// Unregister a closing session and forget its lock once nobody holds it.
    pub fn disconnect_terminal(&self, terminal_id: &str, connection_id: Uuid) -> bool {
        let removed = self.registry.remove_connection_if(terminal_id, connection_id);
        self.terminal_locks
            .remove_if(terminal_id, |_, lock| Arc::strong_count(lock) == 1);
        removed
    }

    /// Pending offline records for one terminal, for operator inspection.
    pub async fn pending_for(&self, terminal_id: &str) -> AppResult<Vec<OfflineMessage>> {
        self.offline.find_pending(terminal_id).await
    }
}
