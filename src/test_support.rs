//! In-process doubles for the unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::services::connection_registry::{CloseReason, ConnectionHandle, TransportError};

/// A connection handle that records every frame and close request.
#[derive(Default)]
pub struct RecordingHandle {
    sent: Mutex<Vec<String>>,
    closed: Mutex<Option<CloseReason>>,
    fail: AtomicBool,
    full: AtomicBool,
}

impl RecordingHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Report back-pressure instead of accepting frames.
    pub fn mailbox_full(&self, full: bool) {
        self.full.store(full, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Sent frames parsed as JSON.
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
        if self.full.load(Ordering::SeqCst) {
            return Err(TransportError::MailboxFull);
        }
        self.sent.lock().push(message.to_string());
        Ok(())
    }

    fn close(&self, reason: CloseReason) {
        self.closed.lock().get_or_insert(reason);
    }
}
