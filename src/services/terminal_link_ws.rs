use std::sync::Arc;
use std::time::{Duration, Instant};

use actix::prelude::*;
use actix_web_actors::ws::{self, CloseCode, Message};
use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::TerminalIdentity;
use crate::services::command_dispatcher::CommandDispatcher;
use crate::services::connection_registry::{CloseReason, ConnectionHandle, TransportError};
use crate::services::inbound_report_handler::InboundReportHandler;

/// How often protocol pings are sent; pongs count as heartbeats.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Outbound frames buffered per connection before writes report back-pressure.
const MAILBOX_CAPACITY: usize = 256;

/// Token bucket rate limiter for per-connection rate limiting
struct TokenBucket {
    tokens: u32,
    capacity: u32,
    refill_per_sec: u32,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn allow(&mut self) -> bool {
        let elapsed = self.last_refill.elapsed().as_secs();
        if elapsed > 0 {
            let add = (elapsed as u32).saturating_mul(self.refill_per_sec);
            self.tokens = self.tokens.saturating_add(add).min(self.capacity);
            self.last_refill = Instant::now();
        }
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}

/// Control frames a terminal may send. Everything else is a report candidate.
#[derive(Debug, Clone, PartialEq)]
enum TerminalFrame {
    Heartbeat,
    Ping,
    Ack { command_id: i32, success: bool },
    Other,
}

fn classify_frame(text: &str) -> TerminalFrame {
    let Ok(value) = serde_json::from_str::<JsonValue>(text) else {
        return TerminalFrame::Other;
    };
    match value.get("type").and_then(JsonValue::as_str) {
        Some("heartbeat") => TerminalFrame::Heartbeat,
        Some("ping") => TerminalFrame::Ping,
        Some("ack") => value
            .get("commandId")
            .and_then(JsonValue::as_i64)
            .and_then(|id| i32::try_from(id).ok())
            .map_or(TerminalFrame::Other, |command_id| TerminalFrame::Ack {
                command_id,
                success: value
                    .get("success")
                    .and_then(JsonValue::as_bool)
                    .unwrap_or(true),
            }),
        _ => TerminalFrame::Other,
    }
}

/// WebSocket actor for one authenticated terminal.
pub struct TerminalLinkWs {
    pub connection_id: Uuid,
    pub identity: TerminalIdentity,
    dispatcher: Arc<CommandDispatcher>,
    reports: Arc<InboundReportHandler>,
    rate: TokenBucket,
}

impl TerminalLinkWs {
    pub fn new(
        identity: TerminalIdentity,
        dispatcher: Arc<CommandDispatcher>,
        reports: Arc<InboundReportHandler>,
    ) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            identity,
            dispatcher,
            reports,
            rate: TokenBucket::new(50, 25),
        }
    }

    fn start_ping(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(PING_INTERVAL, |_act, ctx| {
            ctx.ping(b"heartbeat");
        });
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let now = Utc::now();
        let registry = self.dispatcher.registry();
        registry.record_received(&self.identity.terminal_id);

        match classify_frame(text) {
            TerminalFrame::Heartbeat => {
                registry.record_heartbeat(&self.identity.terminal_id, now);
                let ack = serde_json::json!({ "type": "heartbeat_ack", "timestamp": now });
                ctx.text(ack.to_string());
            }
            TerminalFrame::Ping => {
                registry.update_last_active(&self.identity.terminal_id, now);
                ctx.text(serde_json::json!({ "type": "pong" }).to_string());
            }
            TerminalFrame::Ack {
                command_id,
                success,
            } => {
                registry.update_last_active(&self.identity.terminal_id, now);
                if !success {
                    warn!(
                        terminal_id = %self.identity.terminal_id,
                        command_id,
                        "command_rejected_by_terminal"
                    );
                }
                let dispatcher = self.dispatcher.clone();
                let terminal_id = self.identity.terminal_id.clone();
                actix::spawn(async move {
                    if let Err(e) = dispatcher.acknowledge(&terminal_id, command_id).await {
                        error!(terminal_id = %terminal_id, command_id, error = %e, "ack_failed");
                    }
                });
            }
            TerminalFrame::Other => {
                registry.update_last_active(&self.identity.terminal_id, now);
                let reports = self.reports.clone();
                let identity = self.identity.clone();
                let text = text.to_string();
                actix::spawn(async move {
                    reports.handle(&identity, &text).await;
                });
            }
        }
    }
}

impl Actor for TerminalLinkWs {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.set_mailbox_capacity(MAILBOX_CAPACITY);

        let registered = serde_json::json!({
            "type": "registered",
            "terminalId": self.identity.terminal_id,
            "connectedAt": Utc::now(),
        });
        ctx.text(registered.to_string());
        self.start_ping(ctx);

        let handle: Arc<dyn ConnectionHandle> = Arc::new(WsConnectionHandle {
            addr: ctx.address(),
        });
        let dispatcher = self.dispatcher.clone();
        let identity = self.identity.clone();
        let connection_id = self.connection_id;

        actix::spawn(async move {
            if let Err(e) = dispatcher
                .connect_terminal(&identity, connection_id, handle)
                .await
            {
                error!(
                    terminal_id = %identity.terminal_id,
                    connection_id = %connection_id,
                    error = %e,
                    "offline_drain_failed"
                );
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(
            terminal_id = %self.identity.terminal_id,
            connection_id = %self.connection_id,
            "terminal socket stopped"
        );
        self.dispatcher
            .disconnect_terminal(&self.identity.terminal_id, self.connection_id);
    }
}

/// Frame written to the terminal.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Deliver {
    pub text: String,
}

/// Message to close the WebSocket connection on behalf of the registry
#[derive(Message)]
#[rtype(result = "()")]
pub struct CloseConnection {
    pub reason: CloseReason,
}

impl Handler<Deliver> for TerminalLinkWs {
    type Result = ();

    fn handle(&mut self, msg: Deliver, ctx: &mut Self::Context) {
        ctx.text(msg.text);
    }
}

impl Handler<CloseConnection> for TerminalLinkWs {
    type Result = ();

    fn handle(&mut self, msg: CloseConnection, ctx: &mut Self::Context) {
        info!(
            terminal_id = %self.identity.terminal_id,
            connection_id = %self.connection_id,
            reason = msg.reason.as_str(),
            "closing terminal socket"
        );
        let code = match msg.reason {
            CloseReason::Superseded => CloseCode::Normal,
            CloseReason::HeartbeatTimeout => CloseCode::Away,
            CloseReason::WriteFailure => CloseCode::Error,
        };
        ctx.close(Some(ws::CloseReason {
            code,
            description: Some(msg.reason.as_str().to_string()),
        }));
        ctx.stop();
    }
}

impl StreamHandler<Result<Message, ws::ProtocolError>> for TerminalLinkWs {
    fn handle(&mut self, msg: Result<Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let registry = self.dispatcher.registry();
        match msg {
            Ok(Message::Ping(msg)) => {
                registry.record_heartbeat(&self.identity.terminal_id, Utc::now());
                ctx.pong(&msg);
            }
            Ok(Message::Pong(_)) => {
                registry.record_heartbeat(&self.identity.terminal_id, Utc::now());
            }
            Ok(Message::Text(text)) => {
                // Check rate limit before processing
                if !self.rate.allow() {
                    warn!(
                        terminal_id = %self.identity.terminal_id,
                        connection_id = %self.connection_id,
                        "Rate limit exceeded; closing WebSocket"
                    );
                    ctx.close(Some(ws::CloseReason {
                        code: CloseCode::Policy,
                        description: Some("rate limit exceeded".into()),
                    }));
                    ctx.stop();
                    return;
                }
                self.handle_text(&text, ctx);
            }
            Ok(Message::Binary(bin)) => {
                debug!(
                    terminal_id = %self.identity.terminal_id,
                    len = bin.len(),
                    "ignoring binary frame"
                );
            }
            Ok(Message::Close(reason)) => {
                info!(
                    terminal_id = %self.identity.terminal_id,
                    connection_id = %self.connection_id,
                    reason = ?reason,
                    "WebSocket close message received"
                );
                ctx.stop();
            }
            Err(e) => {
                error!(
                    terminal_id = %self.identity.terminal_id,
                    connection_id = %self.connection_id,
                    error = %e,
                    "WebSocket protocol error"
                );
                ctx.stop();
            }
            _ => {}
        }
    }
}

/// Registry-facing handle for a live actor. Never blocks on the peer.
pub struct WsConnectionHandle {
    addr: Addr<TerminalLinkWs>,
}

impl ConnectionHandle for WsConnectionHandle {
    fn send_text(&self, message: &str) -> Result<(), TransportError> {
        self.addr
            .try_send(Deliver {
                text: message.to_string(),
            })
            .map_err(|e| match e {
                SendError::Full(_) => TransportError::MailboxFull,
                SendError::Closed(_) => TransportError::Closed,
            })
    }

    fn close(&self, reason: CloseReason) {
        self.addr.do_send(CloseConnection { reason });
    }
}
