use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::models::command::{CommandEnvelope, CommandSequence, ExecutionMode};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfflineStatus {
    Pending,
    Delivered,
    Expired,
    Failed,
    /// Replaced by a newer command of the same kind before delivery. Kept for audit.
    Superseded,
}

impl OfflineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfflineStatus::Pending => "PENDING",
            OfflineStatus::Delivered => "DELIVERED",
            OfflineStatus::Expired => "EXPIRED",
            OfflineStatus::Failed => "FAILED",
            OfflineStatus::Superseded => "SUPERSEDED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(OfflineStatus::Pending),
            "DELIVERED" => Some(OfflineStatus::Delivered),
            "EXPIRED" => Some(OfflineStatus::Expired),
            "FAILED" => Some(OfflineStatus::Failed),
            "SUPERSEDED" => Some(OfflineStatus::Superseded),
            _ => None,
        }
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self, OfflineStatus::Pending)
    }
}

/// A command that could not be delivered because its terminal was offline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineMessage {
    /// Same value as the command id of the envelope it carries.
    pub message_id: i32,
    pub terminal_id: String,
    pub organization_id: String,
    pub kind: String,
    pub payload: JsonValue,
    pub execution_mode: ExecutionMode,
    pub status: OfflineStatus,
    pub retry_count: i32,
    pub max_retry_count: i32,
    pub issued_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub failure_reason: Option<String>,
}

impl OfflineMessage {
    /// Wraps an envelope for the offline store.
    ///
    /// `expires_at` is the earlier of the command's own expiry and `now + ttl`.
    pub fn from_envelope(
        envelope: &CommandEnvelope,
        max_retry_count: u32,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let store_expiry = now + ttl;
        let expires_at = match envelope.expires_at {
            Some(at) if at < store_expiry => at,
            _ => store_expiry,
        };

        Self {
            message_id: envelope.command_id,
            terminal_id: envelope.terminal_id.clone(),
            organization_id: envelope.organization_id.clone(),
            kind: envelope.kind.clone(),
            payload: envelope.payload.clone(),
            execution_mode: envelope.execution_mode,
            status: OfflineStatus::Pending,
            retry_count: 0,
            max_retry_count: max_retry_count as i32,
            issued_at: envelope.issued_at,
            created_at: now,
            expires_at,
            failure_reason: None,
        }
    }

    pub fn to_envelope(&self) -> CommandEnvelope {
        CommandEnvelope {
            command_id: self.message_id,
            terminal_id: self.terminal_id.clone(),
            organization_id: self.organization_id.clone(),
            kind: self.kind.clone(),
            payload: self.payload.clone(),
            execution_mode: self.execution_mode,
            issued_at: self.issued_at,
            expires_at: Some(self.expires_at),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn sequence(&self) -> CommandSequence {
        CommandSequence::new(self.issued_at, self.message_id)
    }
}
