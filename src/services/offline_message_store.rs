use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::AppResult;
use crate::models::{OfflineMessage, OfflineStatus};

/// Durable holding area for commands addressed to offline terminals.
///
/// Records are keyed by `(terminal_id, message_id)`. Status transitions only
/// apply to `PENDING` records; settled records stay until `purge_expired`
/// removes them.
#[async_trait]
pub trait OfflineMessageStore: Send + Sync {
    /// Insert a record, or reset an existing one to `PENDING` with the given
    /// retry count.
    async fn save(&self, message: &OfflineMessage) -> AppResult<()>;

    /// `PENDING` records for one terminal in delivery order.
    async fn find_pending(&self, terminal_id: &str) -> AppResult<Vec<OfflineMessage>>;

    async fn mark_delivered(&self, terminal_id: &str, message_id: i32) -> AppResult<bool>;

    async fn mark_failed(&self, terminal_id: &str, message_id: i32, reason: &str)
        -> AppResult<bool>;

    async fn mark_expired(&self, terminal_id: &str, message_id: i32) -> AppResult<bool>;

    async fn mark_superseded(&self, terminal_id: &str, message_id: i32) -> AppResult<bool>;

    /// Increment the retry count of a pending record. Returns the new count.
    async fn record_retry(&self, terminal_id: &str, message_id: i32) -> AppResult<Option<i32>>;

    /// Delete every record whose `expires_at` has passed, in any status.
    async fn purge_expired(&self, now: DateTime<Utc>) -> AppResult<u64>;
}

#[derive(Default)]
pub struct MemoryOfflineMessageStore {
    messages: DashMap<String, HashMap<i32, OfflineMessage>>,
}

impl MemoryOfflineMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record for a terminal regardless of status.
    pub fn all(&self, terminal_id: &str) -> Vec<OfflineMessage> {
        let mut all: Vec<OfflineMessage> = self
            .messages
            .get(terminal_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        all.sort_by_key(|m| m.sequence());
        all
    }

    fn settle(
        &self,
        terminal_id: &str,
        message_id: i32,
        status: OfflineStatus,
        reason: Option<&str>,
    ) -> bool {
        let Some(mut messages) = self.messages.get_mut(terminal_id) else {
            return false;
        };
        match messages.get_mut(&message_id) {
            Some(message) if message.status == OfflineStatus::Pending => {
                message.status = status;
                message.failure_reason = reason.map(str::to_string);
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl OfflineMessageStore for MemoryOfflineMessageStore {
    async fn save(&self, message: &OfflineMessage) -> AppResult<()> {
        self.messages
            .entry(message.terminal_id.clone())
            .or_default()
            .insert(message.message_id, message.clone());
        Ok(())
    }

    async fn find_pending(&self, terminal_id: &str) -> AppResult<Vec<OfflineMessage>> {
        let mut pending: Vec<OfflineMessage> = self
            .messages
            .get(terminal_id)
            .map(|m| {
                m.values()
                    .filter(|msg| msg.status == OfflineStatus::Pending)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        pending.sort_by_key(|m| m.sequence());
        Ok(pending)
    }

    async fn mark_delivered(&self, terminal_id: &str, message_id: i32) -> AppResult<bool> {
        Ok(self.settle(terminal_id, message_id, OfflineStatus::Delivered, None))
    }

    async fn mark_failed(
        &self,
        terminal_id: &str,
        message_id: i32,
        reason: &str,
    ) -> AppResult<bool> {
        Ok(self.settle(terminal_id, message_id, OfflineStatus::Failed, Some(reason)))
    }

    async fn mark_expired(&self, terminal_id: &str, message_id: i32) -> AppResult<bool> {
        Ok(self.settle(terminal_id, message_id, OfflineStatus::Expired, None))
    }

    async fn mark_superseded(&self, terminal_id: &str, message_id: i32) -> AppResult<bool> {
        Ok(self.settle(terminal_id, message_id, OfflineStatus::Superseded, None))
    }

    async fn record_retry(&self, terminal_id: &str, message_id: i32) -> AppResult<Option<i32>> {
        let Some(mut messages) = self.messages.get_mut(terminal_id) else {
            return Ok(None);
        };
        Ok(match messages.get_mut(&message_id) {
            Some(message) if message.status == OfflineStatus::Pending => {
                message.retry_count += 1;
                Some(message.retry_count)
            }
            _ => None,
        })
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let mut purged = 0u64;
        for mut messages in self.messages.iter_mut() {
            let before = messages.len();
            messages.retain(|_, m| !m.is_expired(now));
            purged += (before - messages.len()) as u64;
        }
        self.messages.retain(|_, m| !m.is_empty());
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CommandEnvelope, CommandIntent, ExecutionMode};
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn message(id: i32, issued_offset_ms: i64, ttl: Duration) -> OfflineMessage {
        let now = Utc::now();
        let envelope = CommandEnvelope::from_intent(
            id,
            CommandIntent {
                terminal_id: "T1".into(),
                organization_id: "org".into(),
                kind: format!("kind-{}", id),
                execution_mode: ExecutionMode::Post,
                payload: serde_json::json!({}),
                expires_at: None,
            },
            now + Duration::milliseconds(issued_offset_ms),
        );
        OfflineMessage::from_envelope(&envelope, 3, ttl, now)
    }

    #[tokio::test]
    async fn test_find_pending_orders_by_sequence() {
        let store = MemoryOfflineMessageStore::new();
        store.save(&message(300, 2, Duration::hours(1))).await.unwrap();
        store.save(&message(200, 0, Duration::hours(1))).await.unwrap();
        store.save(&message(100, 1, Duration::hours(1))).await.unwrap();

        let ids: Vec<i32> = store
            .find_pending("T1")
            .await
            .unwrap()
            .iter()
            .map(|m| m.message_id)
            .collect();
        assert_eq!(ids, vec![200, 100, 300]);
    }

    #[tokio::test]
    async fn test_status_transitions_only_from_pending() {
        let store = MemoryOfflineMessageStore::new();
        store.save(&message(1, 0, Duration::hours(1))).await.unwrap();

        assert_eq!(store.record_retry("T1", 1).await.unwrap(), Some(1));
        assert!(store.mark_delivered("T1", 1).await.unwrap());
        assert!(!store.mark_failed("T1", 1, "late").await.unwrap());
        assert_eq!(store.record_retry("T1", 1).await.unwrap(), None);
        assert!(store.find_pending("T1").await.unwrap().is_empty());

        let all = store.all("T1");
        assert_eq!(all[0].status, OfflineStatus::Delivered);
        assert_eq!(all[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_save_resets_existing_record() {
        let store = MemoryOfflineMessageStore::new();
        store.save(&message(1, 0, Duration::hours(1))).await.unwrap();
        store.mark_delivered("T1", 1).await.unwrap();

        let mut again = message(1, 0, Duration::hours(1));
        again.retry_count = 2;
        store.save(&again).await.unwrap();

        let pending = store.find_pending("T1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 2);
    }

    #[tokio::test]
    async fn test_purge_removes_expired_regardless_of_status() {
        let store = MemoryOfflineMessageStore::new();
        store.save(&message(1, 0, Duration::seconds(-1))).await.unwrap();
        store.save(&message(2, 1, Duration::seconds(-1))).await.unwrap();
        store.save(&message(3, 2, Duration::hours(1))).await.unwrap();
        store.mark_failed("T1", 2, "exhausted").await.unwrap();

        assert_eq!(store.purge_expired(Utc::now()).await.unwrap(), 2);
        assert_eq!(store.purge_expired(Utc::now()).await.unwrap(), 0);
        assert_eq!(store.all("T1").len(), 1);
    }
}
