use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub whatsapp: WhatsAppConfig,
    pub websocket: WebSocketConfig,
    pub ratelimit: RateLimitConfig,
    pub apikey: ApiKeyConfig,
    pub events: EventsConfig,
    pub circuitbreaker: CircuitBreakerConfig,
    pub dispatch: DispatchSettings,
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://wagate.db?mode=rwc".into(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct WhatsAppConfig {
    pub db_path: String,
    pub qr_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    pub max_reconnects: u32,
    /// Outbound sends per minute; converted to per-second with a floor of 1.
    pub message_rate_limit: u32,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            db_path: "whatsapp.db".into(),
            qr_timeout_secs: 120,
            reconnect_delay_secs: 5,
            max_reconnects: 5,
            message_rate_limit: 600,
        }
    }
}

impl WhatsAppConfig {
    pub fn rate_limit_per_second(&self) -> u32 {
        (self.message_rate_limit / 60).max(1)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Shared key WS clients authenticate with. Empty disables the hub auth
    /// gate only if explicitly left unset; clients then never authenticate.
    pub api_key: String,
    pub auth_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub pong_timeout_secs: u64,
    pub queue_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            auth_timeout_secs: 10,
            ping_interval_secs: 30,
            pong_timeout_secs: 10,
            queue_size: 256,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_second: f64,
    pub burst_size: u32,
    pub by_ip: bool,
    pub by_api_key: bool,
    pub cleanup_interval_secs: u64,
    pub max_age_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 10.0,
            burst_size: 20,
            by_ip: true,
            by_api_key: true,
            cleanup_interval_secs: 300,
            max_age_secs: 3600,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ApiKeyConfig {
    pub enabled: bool,
    pub header: String,
}

impl Default for ApiKeyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            header: "X-API-Key".into(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct EventsConfig {
    /// 0 disables retention deletion entirely.
    pub retention_days: u32,
    pub cleanup_interval_secs: u64,
    /// Local wall-clock "HH:MM" at which the daily cleanup fires.
    pub cleanup_time: String,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            cleanup_interval_secs: 60,
            cleanup_time: "03:00".into(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub max_requests: u32,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub failure_threshold: u32,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 3,
            interval_secs: 60,
            timeout_secs: 30,
            failure_threshold: 5,
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DispatchSettings {
    pub max_retries: u32,
    pub queue_size: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            queue_size: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl AppConfig {
    /// Load from an explicit path, or from `~/.wagate/config.json` when it
    /// exists, with `WAGATE_*` environment overrides on top.
    pub fn load(custom_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        match custom_path {
            Some(path) => {
                builder = builder.add_source(File::from(path).required(true));
            }
            None => {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                let default_path = PathBuf::from(home).join(".wagate/config.json");
                builder = builder.add_source(File::from(default_path).required(false));
            }
        }
        let s = builder
            .add_source(Environment::with_prefix("WAGATE").separator("__"))
            .build()?;
        s.try_deserialize()
    }
}
