use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Periodic device status pushed by the controller firmware.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    #[serde(default)]
    pub brightness: Option<i64>,
    #[serde(default)]
    pub volume: Option<i64>,
    #[serde(default)]
    pub screen_on: Option<bool>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub firmware_version: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayStateReport {
    pub program_id: String,
    pub state: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultReport {
    pub code: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// The report shapes this core recognizes on the terminal channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reportType", content = "report", rename_all = "snake_case")]
pub enum InboundReport {
    Status(StatusReport),
    PlayState(PlayStateReport),
    Fault(FaultReport),
}

impl InboundReport {
    pub fn name(&self) -> &'static str {
        match self {
            InboundReport::Status(_) => "status",
            InboundReport::PlayState(_) => "play_state",
            InboundReport::Fault(_) => "fault",
        }
    }
}

/// Result of trying to read a terminal frame as a known report.
#[derive(Clone, Debug, PartialEq)]
pub enum ParsedInbound {
    Report(InboundReport),
    /// Legacy or unrelated frames multiplexed onto the same endpoint.
    Unrecognized,
}

/// A recognized report plus the identity of the terminal that sent it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalReport {
    pub terminal_id: String,
    pub organization_id: String,
    pub received_at: DateTime<Utc>,
    #[serde(flatten)]
    pub report: InboundReport,
}
