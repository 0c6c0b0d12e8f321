use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// How the terminal should apply a command payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionMode {
    Get,
    Post,
    Put,
    Delete,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Get => "GET",
            ExecutionMode::Post => "POST",
            ExecutionMode::Put => "PUT",
            ExecutionMode::Delete => "DELETE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "GET" => Some(ExecutionMode::Get),
            "POST" => Some(ExecutionMode::Post),
            "PUT" => Some(ExecutionMode::Put),
            "DELETE" => Some(ExecutionMode::Delete),
            _ => None,
        }
    }
}

/// A command submission from a business service, before an id is assigned.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandIntent {
    pub terminal_id: String,
    pub organization_id: String,
    pub kind: String,
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub payload: JsonValue,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// One dispatch unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub command_id: i32,
    pub terminal_id: String,
    pub organization_id: String,
    pub kind: String,
    pub payload: JsonValue,
    pub execution_mode: ExecutionMode,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CommandEnvelope {
    pub fn from_intent(command_id: i32, intent: CommandIntent, issued_at: DateTime<Utc>) -> Self {
        Self {
            command_id,
            terminal_id: intent.terminal_id,
            organization_id: intent.organization_id,
            kind: intent.kind,
            payload: intent.payload,
            execution_mode: intent.execution_mode,
            issued_at,
            expires_at: intent.expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Delivery order key within one terminal's queue.
    ///
    /// Identifiers are 32-bit and wrap, so issue time leads and the id breaks ties.
    pub fn sequence(&self) -> CommandSequence {
        CommandSequence::new(self.issued_at, self.command_id)
    }

    /// The text frame delivered to the terminal.
    pub fn to_wire(&self) -> String {
        serde_json::json!({
            "type": "command",
            "commandId": self.command_id,
            "kind": self.kind,
            "executionMode": self.execution_mode,
            "payload": self.payload,
            "issuedAt": self.issued_at,
            "expiresAt": self.expires_at,
        })
        .to_string()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandSequence {
    pub issued_at_ms: i64,
    pub command_id: i32,
}

impl CommandSequence {
    pub fn new(issued_at: DateTime<Utc>, command_id: i32) -> Self {
        Self {
            issued_at_ms: issued_at.timestamp_millis(),
            command_id,
        }
    }
}

/// Where a command ended up after `send_command`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchOutcome {
    Delivered,
    QueuedOffline,
    Expired,
}

/// Response of the command send RPC.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendCommandResult {
    pub delivered: bool,
    pub command_id: i32,
    pub queued_offline: bool,
    pub expired: bool,
    /// Id of the unexecuted command of the same kind this one replaced.
    pub superseded: Option<i32>,
}

impl SendCommandResult {
    pub fn new(command_id: i32, outcome: DispatchOutcome, superseded: Option<i32>) -> Self {
        Self {
            delivered: outcome == DispatchOutcome::Delivered,
            command_id,
            queued_offline: outcome == DispatchOutcome::QueuedOffline,
            expired: outcome == DispatchOutcome::Expired,
            superseded,
        }
    }

    pub fn outcome(&self) -> DispatchOutcome {
        if self.delivered {
            DispatchOutcome::Delivered
        } else if self.queued_offline {
            DispatchOutcome::QueuedOffline
        } else {
            DispatchOutcome::Expired
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn intent() -> CommandIntent {
        CommandIntent {
            terminal_id: "T1".into(),
            organization_id: "org-1".into(),
            kind: "brightness".into(),
            execution_mode: ExecutionMode::Put,
            payload: serde_json::json!({"brightness": 50}),
            expires_at: None,
        }
    }

    #[test]
    fn test_intent_accepts_camel_case_wire_shape() {
        let raw = r#"{
            "terminalId": "T9",
            "organizationId": "org-2",
            "kind": "volume",
            "executionMode": "POST",
            "payload": {"volume": 3}
        }"#;
        let parsed: CommandIntent = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.terminal_id, "T9");
        assert_eq!(parsed.execution_mode, ExecutionMode::Post);
        assert!(parsed.expires_at.is_none());
    }

    #[test]
    fn test_expiry_is_inclusive() {
        let now = Utc::now();
        let mut envelope = CommandEnvelope::from_intent(7, intent(), now);
        assert!(!envelope.is_expired(now));

        envelope.expires_at = Some(now);
        assert!(envelope.is_expired(now));

        envelope.expires_at = Some(now + Duration::seconds(5));
        assert!(!envelope.is_expired(now));
    }

    #[test]
    fn test_sequence_orders_by_issue_time_then_id() {
        let now = Utc::now();
        let a = CommandSequence::new(now, 900);
        let b = CommandSequence::new(now, 901);
        let c = CommandSequence::new(now + Duration::milliseconds(1), 5);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_wire_frame_shape() {
        let envelope = CommandEnvelope::from_intent(42, intent(), Utc::now());
        let frame: JsonValue = serde_json::from_str(&envelope.to_wire()).unwrap();
        assert_eq!(frame["type"], "command");
        assert_eq!(frame["commandId"], 42);
        assert_eq!(frame["executionMode"], "PUT");
        assert_eq!(frame["payload"]["brightness"], 50);
    }

    #[test]
    fn test_result_flags_follow_outcome() {
        let result = SendCommandResult::new(1, DispatchOutcome::QueuedOffline, None);
        assert!(!result.delivered);
        assert!(result.queued_offline);
        assert_eq!(result.outcome(), DispatchOutcome::QueuedOffline);
    }
}
