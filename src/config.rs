use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub fcm: FcmConfig,
    pub dispatch: DispatchConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FcmConfig {
    /// Firebase project id. When `None`, the `project_id` of the service
    /// account file is used.
    pub project_id: Option<String>,
    /// Path to the Google service-account JSON (`GOOGLE_APPLICATION_CREDENTIALS`).
    pub credentials_path: String,
    /// Base URL of the FCM HTTP v1 API. Overridable for local emulators.
    pub api_base_url: String,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Whether the change-feed consumer runs at all.
    pub enabled: bool,
    /// How often (seconds) the consumer polls for due events.
    pub poll_interval_seconds: u64,
    /// Maximum events claimed per poll.
    pub batch_size: u32,
    /// Backoff before the first redelivery of a failed event.
    pub initial_backoff_seconds: u64,
    /// Cap for exponential backoff (seconds).
    pub max_backoff_seconds: u64,
    /// Deliveries after which an event is dead-lettered.
    pub max_deliveries: u32,
    /// Events stuck in `processing` longer than this are released again.
    pub claim_timeout_seconds: u64,
    /// Skip records already marked sent instead of delivering them again.
    pub skip_already_sent: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Emit JSON log lines instead of the human-readable format.
    pub json: bool,
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn positive(value: u32, key: &str) -> Result<u32, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue(key.to_string()));
    }
    Ok(value)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/app.db".to_string()),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 5),
            },
            fcm: FcmConfig {
                project_id: env::var("FCM_PROJECT_ID").ok().filter(|v| !v.is_empty()),
                credentials_path: env::var("GOOGLE_APPLICATION_CREDENTIALS").map_err(|_| {
                    ConfigError::MissingEnv("GOOGLE_APPLICATION_CREDENTIALS".to_string())
                })?,
                api_base_url: env::var("FCM_API_BASE_URL")
                    .unwrap_or_else(|_| "https://fcm.googleapis.com".to_string()),
                request_timeout_seconds: env_or("FCM_REQUEST_TIMEOUT_SECONDS", 30u64),
            },
            dispatch: DispatchConfig {
                enabled: env_bool("DISPATCH_ENABLED", true),
                poll_interval_seconds: env_or("DISPATCH_POLL_INTERVAL_SECONDS", 2u64),
                batch_size: positive(env_or("DISPATCH_BATCH_SIZE", 10u32), "DISPATCH_BATCH_SIZE")?,
                initial_backoff_seconds: env_or("DISPATCH_INITIAL_BACKOFF_SECONDS", 10u64),
                max_backoff_seconds: env_or("DISPATCH_MAX_BACKOFF_SECONDS", 600u64),
                max_deliveries: env_or("DISPATCH_MAX_DELIVERIES", 8u32),
                claim_timeout_seconds: env_or("DISPATCH_CLAIM_TIMEOUT_SECONDS", 300u64),
                skip_already_sent: env_bool("DISPATCH_SKIP_SENT", false),
            },
            log: LogConfig {
                json: env::var("LOG_FORMAT")
                    .map(|v| v.eq_ignore_ascii_case("json"))
                    .unwrap_or(false),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: "sqlite://data/app.db".to_string(),
                max_connections: 5,
            },
            fcm: FcmConfig {
                project_id: None,
                credentials_path: String::new(),
                api_base_url: "https://fcm.googleapis.com".to_string(),
                request_timeout_seconds: 30,
            },
            dispatch: DispatchConfig {
                enabled: true,
                poll_interval_seconds: 2,
                batch_size: 10,
                initial_backoff_seconds: 10,
                max_backoff_seconds: 600,
                max_deliveries: 8,
                claim_timeout_seconds: 300,
                skip_already_sent: false,
            },
            log: LogConfig { json: false },
        }
    }
}
