//! Per-terminal pending command queue with a supersede-by-kind index.
//!
//! Entries are ordered by [`CommandSequence`]. At most one entry per
//! `(terminal, kind)` exists at a time; enqueueing another command of the same
//! kind removes the older entry and hands it back to the caller.

pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::models::{CommandEnvelope, CommandSequence};

pub use memory::MemoryCommandQueueStore;
pub use redis_store::RedisCommandQueueStore;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum QueueEntryState {
    /// Waiting for the terminal; also recorded in the offline store.
    Queued,
    /// Written to a live connection, awaiting an ack until `deadline`.
    InFlight { deadline: DateTime<Utc> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandQueueEntry {
    pub terminal_id: String,
    pub command_id: i32,
    pub kind: String,
    pub enqueued_at: DateTime<Utc>,
    pub envelope: CommandEnvelope,
    #[serde(flatten)]
    pub state: QueueEntryState,
    /// Delivery attempts so far.
    pub attempts: u32,
}

impl CommandQueueEntry {
    pub fn queued(envelope: &CommandEnvelope, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            terminal_id: envelope.terminal_id.clone(),
            command_id: envelope.command_id,
            kind: envelope.kind.clone(),
            enqueued_at,
            envelope: envelope.clone(),
            state: QueueEntryState::Queued,
            attempts: 0,
        }
    }

    pub fn sequence(&self) -> CommandSequence {
        self.envelope.sequence()
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self.state, QueueEntryState::InFlight { .. })
    }

    pub fn in_flight_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, QueueEntryState::InFlight { deadline } if deadline <= now)
    }
}

#[async_trait]
pub trait CommandQueueStore: Send + Sync {
    /// Append a command, superseding the unexecuted entry of the same kind.
    ///
    /// Returns the superseded entry, already removed from the queue.
    async fn enqueue(&self, envelope: &CommandEnvelope) -> AppResult<Option<CommandQueueEntry>>;

    async fn get(&self, terminal_id: &str, command_id: i32) -> AppResult<Option<CommandQueueEntry>>;

    /// Record a delivery attempt. Increments `attempts` and arms the ack deadline.
    async fn mark_in_flight(
        &self,
        terminal_id: &str,
        command_id: i32,
        deadline: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// Return an in-flight entry to the queued state.
    async fn mark_queued(&self, terminal_id: &str, command_id: i32) -> AppResult<bool>;

    /// Remove an entry (ack, expiry, exhaustion). Releases its kind slot if it
    /// still holds it.
    async fn remove(&self, terminal_id: &str, command_id: i32) -> AppResult<Option<CommandQueueEntry>>;

    /// All entries of one terminal in delivery order.
    async fn pending(&self, terminal_id: &str) -> AppResult<Vec<CommandQueueEntry>>;

    /// Whether `command_id` is still the live entry for `kind`.
    async fn is_current(&self, terminal_id: &str, kind: &str, command_id: i32) -> AppResult<bool>;

    /// In-flight entries across all terminals whose ack deadline has passed.
    async fn expired_in_flight(&self, now: DateTime<Utc>) -> AppResult<Vec<CommandQueueEntry>>;

    /// Drop entries enqueued before `cutoff`. Returns how many were removed.
    async fn purge_stale(&self, cutoff: DateTime<Utc>) -> AppResult<usize>;
}
