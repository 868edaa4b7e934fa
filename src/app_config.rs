// Centralized configuration management for the hit collector
// Load ALL env vars ONCE at startup

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Global application configuration loaded once at startup
pub static CONFIG: Lazy<AppConfig> = Lazy::new(|| {
    // For tests, load .env file first
    #[cfg(test)]
    dotenv::dotenv().ok();

    AppConfig::from_env().expect("Failed to load configuration")
});

/// Complete application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    // Server
    pub bind_address: String,
    pub environment: Environment,
    pub rust_log: String,
    pub trust_proxy_headers: bool, // Read client IP from X-Forwarded-For / X-Real-IP

    // Nested configs
    pub clickhouse: ClickHouseConfig,
    pub collector: CollectorConfig,
}

/// Environment type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Environment {
    Development,
    Test,
    Staging,
    Production,
}

impl From<String> for Environment {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Environment::Development,
            "test" => Environment::Test,
            "staging" | "stage" => Environment::Staging,
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Test => write!(f, "test"),
            Environment::Staging => write!(f, "staging"),
            Environment::Production => write!(f, "production"),
        }
    }
}

/// ClickHouse configuration; an empty URL selects in-memory storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickHouseConfig {
    pub url: String,
    pub database: String,
    pub user: String,
    pub password: String,
}

/// Hit collection, session and scheduling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub persist_interval: Duration,
    pub persist_watermark: usize, // Buffered hits that trigger an early persist
    pub salt_rotation: Duration,
    pub session_window: Duration,
    pub cycle_sessions_interval: Duration,
    pub task_timeout: Duration,
    pub data_retention_days: u32, // 0 disables retention
    pub retention_interval: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            persist_interval: Duration::from_secs(10),
            persist_watermark: 5000,
            salt_rotation: Duration::from_secs(4 * 3600),
            session_window: Duration::from_secs(4 * 3600),
            cycle_sessions_interval: Duration::from_secs(60),
            task_timeout: Duration::from_secs(10),
            data_retention_days: 0,
            retention_interval: Duration::from_secs(3600),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Helper function to get optional env var with default
        let get_or_default = |key: &str, default: &str| -> String {
            env::var(key).unwrap_or_else(|_| default.to_string())
        };

        let parse_u64_or_default = |key: &str, default: &str| -> Result<u64, ConfigError> {
            get_or_default(key, default).parse().map_err(|_| {
                ConfigError::InvalidValue(key.to_string(), "not a valid u64".to_string())
            })
        };

        // Durations are whole seconds and must be non-zero
        let parse_secs_or_default = |key: &str, default: &str| -> Result<Duration, ConfigError> {
            match parse_u64_or_default(key, default)? {
                0 => Err(ConfigError::InvalidValue(
                    key.to_string(),
                    "duration must be greater than zero".to_string(),
                )),
                secs => Ok(Duration::from_secs(secs)),
            }
        };

        let bind_address = get_or_default("BIND_ADDRESS", "0.0.0.0:8080");
        let environment = Environment::from(get_or_default("ENVIRONMENT", "development"));
        let rust_log = get_or_default("RUST_LOG", "info");
        let trust_proxy_headers = matches!(
            get_or_default("TRUST_PROXY_HEADERS", "false")
                .to_lowercase()
                .as_str(),
            "true" | "1" | "yes"
        );

        let clickhouse = ClickHouseConfig {
            url: get_or_default("CLICKHOUSE_URL", ""),
            database: get_or_default("CLICKHOUSE_DB", "hitcount"),
            user: get_or_default("CLICKHOUSE_USER", "default"),
            password: get_or_default("CLICKHOUSE_PASSWORD", ""),
        };

        let persist_watermark = parse_u64_or_default("PERSIST_WATERMARK", "5000")?;
        if persist_watermark == 0 {
            return Err(ConfigError::InvalidValue(
                "PERSIST_WATERMARK".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let data_retention_days: u32 = get_or_default("DATA_RETENTION_DAYS", "0")
            .parse()
            .map_err(|_| {
                ConfigError::InvalidValue(
                    "DATA_RETENTION_DAYS".to_string(),
                    "not a valid u32".to_string(),
                )
            })?;

        let collector = CollectorConfig {
            persist_interval: parse_secs_or_default("PERSIST_INTERVAL_SECS", "10")?,
            persist_watermark: persist_watermark as usize,
            salt_rotation: parse_secs_or_default("SALT_ROTATION_SECS", "14400")?,
            session_window: parse_secs_or_default("SESSION_WINDOW_SECS", "14400")?,
            cycle_sessions_interval: parse_secs_or_default("CYCLE_SESSIONS_SECS", "60")?,
            task_timeout: parse_secs_or_default("TASK_TIMEOUT_SECS", "10")?,
            data_retention_days,
            retention_interval: parse_secs_or_default("RETENTION_INTERVAL_SECS", "3600")?,
        };

        if environment == Environment::Production && clickhouse.url.is_empty() {
            return Err(ConfigError::MissingVar("CLICKHOUSE_URL".to_string()));
        }

        Ok(Self {
            bind_address,
            environment,
            rust_log,
            trust_proxy_headers,
            clickhouse,
            collector,
        })
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// Whether hits go to ClickHouse rather than process memory
    pub fn uses_clickhouse(&self) -> bool {
        !self.clickhouse.url.is_empty()
    }
}

/// Get the global configuration instance
pub fn config() -> &'static AppConfig {
    &CONFIG
}
