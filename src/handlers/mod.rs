pub mod command_handlers;
pub mod connection_handlers;
pub mod health;
pub mod terminal_ws_handler;
