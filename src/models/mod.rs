pub mod command;
pub mod inbound_report;
pub mod offline_message;
pub mod terminal;

pub use command::{
    CommandEnvelope, CommandIntent, CommandSequence, DispatchOutcome, ExecutionMode,
    SendCommandResult,
};
pub use inbound_report::{InboundReport, ParsedInbound, TerminalReport};
pub use offline_message::{OfflineMessage, OfflineStatus};
pub use terminal::{ConnectionStatus, TerminalIdentity};
