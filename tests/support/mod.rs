//! Connection and store doubles for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use ledlink_server::error::AppResult;
use ledlink_server::models::OfflineMessage;
use ledlink_server::services::connection_registry::{
    CloseReason, ConnectionHandle, TransportError,
};
use ledlink_server::services::offline_message_store::{
    MemoryOfflineMessageStore, OfflineMessageStore,
};

/// Records every frame and close request.
#[derive(Default)]
pub struct RecordingHandle {
    sent: Mutex<Vec<String>>,
    closed: Mutex<Option<CloseReason>>,
    fail: AtomicBool,
}

impl RecordingHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| serde_json::from_str(s).ok())
            .collect()
    }

    pub fn closed_with(&self) -> Option<CloseReason> {
        *self.closed.lock()
    }
}

impl ConnectionHandle for RecordingHandle {
    fn send_text(&self, message: &str) -> Result<(), TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.sent.lock().push(message.to_string());
        Ok(())
    }

    fn close(&self, reason: CloseReason) {
        self.closed.lock().get_or_insert(reason);
    }
}

/// A handle with a fixed-size mailbox drained by a separate task, the way a
/// websocket actor drains its address.
pub struct BoundedHandle {
    tx: mpsc::Sender<String>,
    closed: Mutex<Option<CloseReason>>,
}

impl BoundedHandle {
    /// Spawns the consumer. The returned counter tracks frames it received.
    pub fn spawn(capacity: usize) -> (Arc<Self>, Arc<AtomicUsize>) {
        let (tx, mut rx) = mpsc::channel::<String>(capacity);
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let handle = Arc::new(Self {
            tx,
            closed: Mutex::new(None),
        });
        (handle, received)
    }

    pub fn closed_with(&self) -> Option<CloseReason> {
        *self.closed.lock()
    }
}

impl ConnectionHandle for BoundedHandle {
    fn send_text(&self, message: &str) -> Result<(), TransportError> {
        self.tx.try_send(message.to_string()).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => TransportError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    fn close(&self, reason: CloseReason) {
        self.closed.lock().get_or_insert(reason);
    }
}

/// Memory store whose backlog reads take a while, widening the window in
/// which a reconnect drain is in progress.
pub struct SlowOfflineStore {
    inner: Arc<MemoryOfflineMessageStore>,
    delay: Duration,
}

impl SlowOfflineStore {
    pub fn new(inner: Arc<MemoryOfflineMessageStore>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl OfflineMessageStore for SlowOfflineStore {
    async fn save(&self, message: &OfflineMessage) -> AppResult<()> {
        self.inner.save(message).await
    }

    async fn find_pending(&self, terminal_id: &str) -> AppResult<Vec<OfflineMessage>> {
        tokio::time::sleep(self.delay).await;
        self.inner.find_pending(terminal_id).await
    }

    async fn mark_delivered(&self, terminal_id: &str, message_id: i32) -> AppResult<bool> {
        self.inner.mark_delivered(terminal_id, message_id).await
    }

    async fn mark_failed(
        &self,
        terminal_id: &str,
        message_id: i32,
        reason: &str,
    ) -> AppResult<bool> {
        self.inner.mark_failed(terminal_id, message_id, reason).await
    }

    async fn mark_expired(&self, terminal_id: &str, message_id: i32) -> AppResult<bool> {
        self.inner.mark_expired(terminal_id, message_id).await
    }

    async fn mark_superseded(&self, terminal_id: &str, message_id: i32) -> AppResult<bool> {
        self.inner.mark_superseded(terminal_id, message_id).await
    }

    async fn record_retry(&self, terminal_id: &str, message_id: i32) -> AppResult<Option<i32>> {
        self.inner.record_retry(terminal_id, message_id).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        self.inner.purge_expired(now).await
    }
}
