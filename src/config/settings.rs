use std::env;
use std::str::FromStr;
use crate::error::AppError;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppSettings {
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub heartbeat: HeartbeatConfig,
    pub dispatch: DispatchConfig,
    pub offline: OfflineConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    /// Shared key business services present on `/api`. `None` leaves the scope open.
    pub service_api_key: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub shard_count: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub scan_interval_secs: u64,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub in_flight_ttl_secs: u64,
    pub max_retry_count: u32,
    pub in_flight_sweep_interval_secs: u64,
    pub intake_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OfflineConfig {
    pub message_ttl_secs: u64,
    pub purge_interval_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Memory,
    Redis,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OfflineBackend {
    Memory,
    Postgres,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_url: Option<String>,
    pub redis_url: String,
    pub queue_backend: QueueBackend,
    pub offline_backend: OfflineBackend,
    pub report_channel: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    pub terminal_token_secret: String,
}

pub const MAX_SHARD_COUNT: usize = 1024;

/// Rounds a requested shard count to the next power of two within `1..=MAX_SHARD_COUNT`.
pub fn normalize_shard_count(requested: usize) -> usize {
    requested.clamp(1, MAX_SHARD_COUNT).next_power_of_two()
}

fn parse_var<T: FromStr>(name: &str, default: &str) -> Result<T, AppError> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse::<T>()
        .map_err(|_| AppError::Configuration(format!("{} must be a valid number", name)))
}

impl AppSettings {
    pub fn from_env() -> Result<Self, AppError> {
        // Server config
        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let server_port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()
            .map_err(|_| AppError::Configuration("SERVER_PORT must be a valid port number".to_string()))?;

        // CORS origins
        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .collect();

        let service_api_key = env::var("SERVICE_API_KEY").ok().filter(|k| !k.is_empty());

        let shard_count = normalize_shard_count(parse_var("REGISTRY_SHARD_COUNT", "16")?);

        let heartbeat = HeartbeatConfig {
            scan_interval_secs: parse_var("HEARTBEAT_SCAN_INTERVAL_SECS", "30")?,
            timeout_secs: parse_var("HEARTBEAT_TIMEOUT_SECS", "60")?,
        };
        if heartbeat.scan_interval_secs == 0 {
            return Err(AppError::Configuration(
                "HEARTBEAT_SCAN_INTERVAL_SECS must be greater than zero".to_string(),
            ));
        }

        let dispatch = DispatchConfig {
            in_flight_ttl_secs: parse_var("COMMAND_IN_FLIGHT_TTL_SECS", "120")?,
            max_retry_count: parse_var("COMMAND_MAX_RETRY_COUNT", "3")?,
            in_flight_sweep_interval_secs: parse_var("IN_FLIGHT_SWEEP_INTERVAL_SECS", "30")?,
            intake_key: env::var("COMMAND_INTAKE_KEY")
                .unwrap_or_else(|_| "ledlink:command-intake".to_string()),
        };

        let offline = OfflineConfig {
            message_ttl_secs: parse_var("OFFLINE_MESSAGE_TTL_SECS", "86400")?,
            purge_interval_secs: parse_var("OFFLINE_PURGE_INTERVAL_SECS", "300")?,
        };

        let queue_backend = match env::var("COMMAND_QUEUE_BACKEND")
            .unwrap_or_else(|_| "redis".to_string())
            .to_lowercase()
            .as_str()
        {
            "redis" => QueueBackend::Redis,
            "memory" => QueueBackend::Memory,
            other => {
                return Err(AppError::Configuration(format!(
                    "COMMAND_QUEUE_BACKEND must be 'redis' or 'memory', got '{}'",
                    other
                )))
            }
        };

        let offline_backend = match env::var("OFFLINE_STORE_BACKEND")
            .unwrap_or_else(|_| "postgres".to_string())
            .to_lowercase()
            .as_str()
        {
            "postgres" => OfflineBackend::Postgres,
            "memory" => OfflineBackend::Memory,
            other => {
                return Err(AppError::Configuration(format!(
                    "OFFLINE_STORE_BACKEND must be 'postgres' or 'memory', got '{}'",
                    other
                )))
            }
        };

        let database_url = env::var("DATABASE_URL").ok();
        if offline_backend == OfflineBackend::Postgres && database_url.is_none() {
            return Err(AppError::Configuration(
                "DATABASE_URL must be set when OFFLINE_STORE_BACKEND=postgres".to_string(),
            ));
        }

        let storage = StorageConfig {
            database_url,
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            queue_backend,
            offline_backend,
            report_channel: env::var("REPORT_CHANNEL")
                .unwrap_or_else(|_| "ledlink:terminal-reports".to_string()),
        };

        // Auth config
        let terminal_token_secret = env::var("TERMINAL_TOKEN_SECRET")
            .map_err(|_| AppError::Configuration("TERMINAL_TOKEN_SECRET must be set".to_string()))?;

        Ok(Self {
            server: ServerConfig {
                host: server_host,
                port: server_port,
                cors_origins,
                service_api_key,
            },
            registry: RegistryConfig { shard_count },
            heartbeat,
            dispatch,
            offline,
            storage,
            auth: AuthConfig {
                terminal_token_secret,
            },
        })
    }
}
