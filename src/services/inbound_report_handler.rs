use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::AppResult;
use crate::models::inbound_report::{FaultReport, PlayStateReport, StatusReport};
use crate::models::{InboundReport, ParsedInbound, TerminalIdentity, TerminalReport};

/// Downstream recipient of recognized terminal reports.
#[async_trait]
pub trait ReportConsumer: Send + Sync {
    fn name(&self) -> &'static str;
    async fn consume(&self, report: &TerminalReport) -> AppResult<()>;
}

type ReportParser = fn(&Value) -> Option<InboundReport>;

/// Recognized shapes, tried in order.
const PARSERS: &[ReportParser] = &[parse_status, parse_play_state, parse_fault];

fn typed<T: DeserializeOwned>(frame: &Value, expected: &str) -> Option<T> {
    if frame.get("type").and_then(Value::as_str) != Some(expected) {
        return None;
    }
    serde_json::from_value(frame.clone()).ok()
}

fn parse_status(frame: &Value) -> Option<InboundReport> {
    typed::<StatusReport>(frame, "status").map(InboundReport::Status)
}

fn parse_play_state(frame: &Value) -> Option<InboundReport> {
    typed::<PlayStateReport>(frame, "play_state").map(InboundReport::PlayState)
}

fn parse_fault(frame: &Value) -> Option<InboundReport> {
    typed::<FaultReport>(frame, "fault").map(InboundReport::Fault)
}

/// Read a raw terminal frame as one of the known report shapes.
pub fn parse_report(raw: &str) -> ParsedInbound {
    let Ok(frame) = serde_json::from_str::<Value>(raw) else {
        return ParsedInbound::Unrecognized;
    };
    PARSERS
        .iter()
        .find_map(|parse| parse(&frame))
        .map_or(ParsedInbound::Unrecognized, ParsedInbound::Report)
}

/// Hands recognized reports to every registered consumer.
///
/// The terminal channel also carries legacy frames this core does not model;
/// those are dropped with a debug log. Consumer failures never reach the
/// connection.
#[derive(Clone, Default)]
pub struct InboundReportHandler {
    consumers: Vec<Arc<dyn ReportConsumer>>,
}

impl InboundReportHandler {
    pub fn new(consumers: Vec<Arc<dyn ReportConsumer>>) -> Self {
        Self { consumers }
    }

    /// Returns the parsed report, if the frame was recognized.
    pub async fn handle(&self, identity: &TerminalIdentity, raw: &str) -> Option<TerminalReport> {
        let report = match parse_report(raw) {
            ParsedInbound::Report(report) => report,
            ParsedInbound::Unrecognized => {
                debug!(
                    terminal_id = %identity.terminal_id,
                    frame_len = raw.len(),
                    "inbound_report_unrecognized"
                );
                return None;
            }
        };

        let report = TerminalReport {
            terminal_id: identity.terminal_id.clone(),
            organization_id: identity.organization_id.clone(),
            received_at: Utc::now(),
            report,
        };

        for consumer in &self.consumers {
            if let Err(e) = consumer.consume(&report).await {
                warn!(
                    terminal_id = %report.terminal_id,
                    consumer = consumer.name(),
                    report_type = report.report.name(),
                    error = %e,
                    "report_consumer_failed"
                );
            }
        }

        Some(report)
    }
}

/// Publishes reports on a Redis pub/sub channel for business services.
pub struct RedisReportPublisher {
    connection_manager: Arc<redis::aio::ConnectionManager>,
    channel: String,
}

impl RedisReportPublisher {
    pub fn new(connection_manager: Arc<redis::aio::ConnectionManager>, channel: String) -> Self {
        Self {
            connection_manager,
            channel,
        }
    }
}

#[async_trait]
impl ReportConsumer for RedisReportPublisher {
    fn name(&self) -> &'static str {
        "redis_publisher"
    }

    async fn consume(&self, report: &TerminalReport) -> AppResult<()> {
        let mut conn = self.connection_manager.as_ref().clone();
        let payload = serde_json::to_string(report)?;
        let receivers: i64 = conn.publish(&self.channel, payload).await?;
        debug!(
            terminal_id = %report.terminal_id,
            report_type = report.report.name(),
            receivers,
            "report_published"
        );
        Ok(())
    }
}
