pub mod background_sweeps;
pub mod command_dispatcher;
pub mod command_intake;
pub mod command_queue;
pub mod connection_registry;
pub mod heartbeat_monitor;
pub mod id_generator;
pub mod inbound_report_handler;
pub mod offline_message_store;
pub mod terminal_link_ws;

// Re-export commonly used types
pub use command_dispatcher::{CommandDispatcher, DispatcherConfig};
pub use connection_registry::ConnectionRegistry;
pub use heartbeat_monitor::HeartbeatMonitor;
