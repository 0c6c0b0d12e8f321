pub mod service_api_key;

pub use service_api_key::{require_service_api_key, ServiceApiKey};
