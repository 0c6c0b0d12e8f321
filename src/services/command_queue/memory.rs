use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{CommandQueueEntry, CommandQueueStore, QueueEntryState};
use crate::error::AppResult;
use crate::models::{CommandEnvelope, CommandSequence};

#[derive(Default)]
struct TerminalQueue {
    entries: BTreeMap<CommandSequence, CommandQueueEntry>,
    by_id: HashMap<i32, CommandSequence>,
    kinds: HashMap<String, i32>,
}

impl TerminalQueue {
    fn remove(&mut self, command_id: i32) -> Option<CommandQueueEntry> {
        let sequence = self.by_id.remove(&command_id)?;
        let entry = self.entries.remove(&sequence)?;
        if self.kinds.get(&entry.kind) == Some(&command_id) {
            self.kinds.remove(&entry.kind);
        }
        Some(entry)
    }

    fn get_mut(&mut self, command_id: i32) -> Option<&mut CommandQueueEntry> {
        let sequence = self.by_id.get(&command_id)?;
        self.entries.get_mut(sequence)
    }
}

/// Single-process queue store for tests and single-instance deployments.
#[derive(Default)]
pub struct MemoryCommandQueueStore {
    queues: DashMap<String, TerminalQueue>,
}

impl MemoryCommandQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommandQueueStore for MemoryCommandQueueStore {
    async fn enqueue(&self, envelope: &CommandEnvelope) -> AppResult<Option<CommandQueueEntry>> {
        let mut queue = self.queues.entry(envelope.terminal_id.clone()).or_default();

        let superseded = match queue.kinds.get(&envelope.kind).copied() {
            Some(old_id) => queue.remove(old_id),
            None => None,
        };

        let entry = CommandQueueEntry::queued(envelope, Utc::now());
        let sequence = entry.sequence();
        queue.by_id.insert(entry.command_id, sequence);
        queue.kinds.insert(entry.kind.clone(), entry.command_id);
        queue.entries.insert(sequence, entry);

        Ok(superseded)
    }

    async fn get(&self, terminal_id: &str, command_id: i32) -> AppResult<Option<CommandQueueEntry>> {
        Ok(self.queues.get(terminal_id).and_then(|q| {
            q.by_id
                .get(&command_id)
                .and_then(|sequence| q.entries.get(sequence))
                .cloned()
        }))
    }

    async fn mark_in_flight(
        &self,
        terminal_id: &str,
        command_id: i32,
        deadline: DateTime<Utc>,
    ) -> AppResult<bool> {
        let Some(mut queue) = self.queues.get_mut(terminal_id) else {
            return Ok(false);
        };
        Ok(match queue.get_mut(command_id) {
            Some(entry) => {
                entry.state = QueueEntryState::InFlight { deadline };
                entry.attempts += 1;
                true
            }
            None => false,
        })
    }

    async fn mark_queued(&self, terminal_id: &str, command_id: i32) -> AppResult<bool> {
        let Some(mut queue) = self.queues.get_mut(terminal_id) else {
            return Ok(false);
        };
        Ok(match queue.get_mut(command_id) {
            Some(entry) => {
                entry.state = QueueEntryState::Queued;
                true
            }
            None => false,
        })
    }

    async fn remove(&self, terminal_id: &str, command_id: i32) -> AppResult<Option<CommandQueueEntry>> {
        let removed = self
            .queues
            .get_mut(terminal_id)
            .and_then(|mut queue| queue.remove(command_id));
        self.queues.remove_if(terminal_id, |_, q| q.entries.is_empty());
        Ok(removed)
    }

    async fn pending(&self, terminal_id: &str) -> AppResult<Vec<CommandQueueEntry>> {
        Ok(self
            .queues
            .get(terminal_id)
            .map(|q| q.entries.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn is_current(&self, terminal_id: &str, kind: &str, command_id: i32) -> AppResult<bool> {
        Ok(self
            .queues
            .get(terminal_id)
            .is_some_and(|q| q.kinds.get(kind) == Some(&command_id)))
    }

    async fn expired_in_flight(&self, now: DateTime<Utc>) -> AppResult<Vec<CommandQueueEntry>> {
        let mut expired: Vec<CommandQueueEntry> = self
            .queues
            .iter()
            .flat_map(|q| {
                q.entries
                    .values()
                    .filter(|e| e.in_flight_expired(now))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        expired.sort_by(|a, b| {
            a.terminal_id
                .cmp(&b.terminal_id)
                .then(a.sequence().cmp(&b.sequence()))
        });
        Ok(expired)
    }

    async fn purge_stale(&self, cutoff: DateTime<Utc>) -> AppResult<usize> {
        let mut removed = 0;
        for mut queue in self.queues.iter_mut() {
            let stale: Vec<i32> = queue
                .entries
                .values()
                .filter(|e| e.enqueued_at < cutoff)
                .map(|e| e.command_id)
                .collect();
            for command_id in stale {
                if queue.remove(command_id).is_some() {
                    removed += 1;
                }
            }
        }
        self.queues.retain(|_, q| !q.entries.is_empty());
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CommandIntent, ExecutionMode};
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn envelope(command_id: i32, kind: &str, offset_ms: i64) -> CommandEnvelope {
        CommandEnvelope::from_intent(
            command_id,
            CommandIntent {
                terminal_id: "T1".into(),
                organization_id: "org".into(),
                kind: kind.into(),
                execution_mode: ExecutionMode::Put,
                payload: serde_json::json!({"id": command_id}),
                expires_at: None,
            },
            Utc::now() + Duration::milliseconds(offset_ms),
        )
    }

    #[tokio::test]
    async fn test_supersede_by_kind_keeps_new_position() {
        let store = MemoryCommandQueueStore::new();
        assert!(store.enqueue(&envelope(1, "brightness", 0)).await.unwrap().is_none());
        assert!(store.enqueue(&envelope(2, "volume", 1)).await.unwrap().is_none());

        let superseded = store.enqueue(&envelope(3, "brightness", 2)).await.unwrap();
        assert_eq!(superseded.map(|e| e.command_id), Some(1));

        let order: Vec<i32> = store
            .pending("T1")
            .await
            .unwrap()
            .iter()
            .map(|e| e.command_id)
            .collect();
        assert_eq!(order, vec![2, 3]);
        assert!(store.is_current("T1", "brightness", 3).await.unwrap());
        assert!(!store.is_current("T1", "brightness", 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_in_flight_lifecycle() {
        let store = MemoryCommandQueueStore::new();
        store.enqueue(&envelope(10, "volume", 0)).await.unwrap();

        let now = Utc::now();
        assert!(store.mark_in_flight("T1", 10, now - Duration::seconds(1)).await.unwrap());
        let expired = store.expired_in_flight(now).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].attempts, 1);

        assert!(store.mark_queued("T1", 10).await.unwrap());
        assert!(store.expired_in_flight(now).await.unwrap().is_empty());

        let removed = store.remove("T1", 10).await.unwrap();
        assert_eq!(removed.map(|e| e.command_id), Some(10));
        assert!(!store.is_current("T1", "volume", 10).await.unwrap());
        assert!(store.remove("T1", 10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_stale_entries() {
        let store = MemoryCommandQueueStore::new();
        store.enqueue(&envelope(1, "a", 0)).await.unwrap();
        store.enqueue(&envelope(2, "b", 1)).await.unwrap();

        assert_eq!(store.purge_stale(Utc::now() - Duration::hours(1)).await.unwrap(), 0);
        assert_eq!(store.purge_stale(Utc::now() + Duration::seconds(1)).await.unwrap(), 2);
        assert!(store.pending("T1").await.unwrap().is_empty());
    }
}
