//! LED terminal link server library
//!
//! Connection registry, command dispatch and offline redelivery for LED
//! terminals, shared by the server binary and the integration tests.

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod security;
pub mod services;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types for convenience
pub use config::AppSettings;
pub use error::AppError;
