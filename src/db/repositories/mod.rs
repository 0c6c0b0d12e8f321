pub mod offline_message_repository;

pub use offline_message_repository::PgOfflineMessageStore;
