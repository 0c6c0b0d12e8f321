use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::services::command_dispatcher::CommandDispatcher;

/// Periodically resend or park deliveries that were never acknowledged.
pub fn start_in_flight_sweep(dispatcher: Arc<CommandDispatcher>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = every.as_secs(), "in_flight_sweep_started");

        loop {
            interval.tick().await;
            if let Err(e) = dispatcher.reclaim_in_flight(Utc::now()).await {
                error!(error = %e, "in_flight_sweep_failed");
            }
        }
    })
}

/// Periodically delete expired offline records and stale queue entries.
pub fn start_offline_purge(dispatcher: Arc<CommandDispatcher>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = every.as_secs(), "offline_purge_started");

        loop {
            interval.tick().await;
            if let Err(e) = dispatcher.purge_expired(Utc::now()).await {
                error!(error = %e, "offline_purge_failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CommandEnvelope, CommandIntent, ExecutionMode, OfflineMessage};
    use crate::services::command_dispatcher::DispatcherConfig;
    use crate::services::command_queue::MemoryCommandQueueStore;
    use crate::services::connection_registry::ConnectionRegistry;
    use crate::services::offline_message_store::{MemoryOfflineMessageStore, OfflineMessageStore};

    #[tokio::test]
    async fn test_purge_task_runs_on_first_tick() {
        let offline = Arc::new(MemoryOfflineMessageStore::new());
        let envelope = CommandEnvelope::from_intent(
            100_001,
            CommandIntent {
                terminal_id: "T1".into(),
                organization_id: "org".into(),
                kind: "brightness".into(),
                execution_mode: ExecutionMode::Put,
                payload: serde_json::Value::Null,
                expires_at: None,
            },
            Utc::now(),
        );
        let stale =
            OfflineMessage::from_envelope(&envelope, 3, chrono::Duration::seconds(-1), Utc::now());
        offline.save(&stale).await.unwrap();

        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::new(ConnectionRegistry::new(2)),
            Arc::new(MemoryCommandQueueStore::new()),
            offline.clone(),
            DispatcherConfig::default(),
        ));
        let handle = start_offline_purge(dispatcher, Duration::from_secs(300));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(offline.all("T1").is_empty());
        handle.abort();
    }
}
