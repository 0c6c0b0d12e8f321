use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::services::connection_registry::ConnectionRegistry;

/// Periodically evicts connections that stopped sending heartbeats.
///
/// Absence from the registry is the offline signal, so eviction needs no
/// coordination with the offline store.
#[derive(Clone)]
pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    scan_interval: std::time::Duration,
    timeout: Duration,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        scan_interval: std::time::Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            scan_interval,
            timeout,
        }
    }

    /// Run one scan as of `now`. Returns the number of evicted connections.
    pub fn scan(&self, now: DateTime<Utc>) -> usize {
        let evicted = self.registry.evict_expired(now - self.timeout);

        for connection in &evicted {
            warn!(
                terminal_id = %connection.terminal_id,
                organization_id = %connection.organization_id,
                connection_id = %connection.connection_id,
                last_heartbeat_at = %connection.last_heartbeat_at,
                idle_secs = (now - connection.last_heartbeat_at).num_seconds(),
                "connection_evicted_heartbeat_timeout"
            );
        }

        if !evicted.is_empty() {
            info!(
                evicted_count = evicted.len(),
                remaining = self.registry.stats().total_connections,
                "heartbeat_scan_completed"
            );
        }

        evicted.len()
    }

    /// Start the recurring scan. Returns a JoinHandle that can be used to cancel the task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.scan_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                scan_interval_secs = self.scan_interval.as_secs(),
                timeout_secs = self.timeout.num_seconds(),
                "heartbeat_monitor_started"
            );

            loop {
                interval.tick().await;
                self.scan(Utc::now());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TerminalIdentity;
    use crate::test_support::RecordingHandle;
    use uuid::Uuid;

    fn register(registry: &ConnectionRegistry, terminal_id: &str) {
        registry.add_connection(
            &TerminalIdentity {
                terminal_id: terminal_id.to_string(),
                organization_id: "org".to_string(),
            },
            Uuid::new_v4(),
            RecordingHandle::new(),
        );
    }

    #[test]
    fn test_evicts_only_past_timeout() {
        let registry = Arc::new(ConnectionRegistry::new(4));
        register(&registry, "stale");
        register(&registry, "fresh");

        let now = Utc::now();
        registry.record_heartbeat("stale", now - Duration::seconds(61));
        registry.record_heartbeat("fresh", now - Duration::seconds(59));

        let monitor = HeartbeatMonitor::new(
            registry.clone(),
            std::time::Duration::from_secs(30),
            Duration::seconds(60),
        );

        assert_eq!(monitor.scan(now), 1);
        assert!(!registry.is_online("stale"));
        assert!(registry.is_online("fresh"));
        assert_eq!(monitor.scan(now), 0);
    }

    #[tokio::test]
    async fn test_background_task_scans_on_interval() {
        let registry = Arc::new(ConnectionRegistry::new(4));
        register(&registry, "stale");
        registry.record_heartbeat("stale", Utc::now() - Duration::seconds(600));

        let handle = HeartbeatMonitor::new(
            registry.clone(),
            std::time::Duration::from_secs(30),
            Duration::seconds(60),
        )
        .start();

        // The first tick fires immediately.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!registry.is_online("stale"));
        handle.abort();
    }
}
