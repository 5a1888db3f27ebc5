//! Configuration management for Floodgate.
//!
//! Configuration is layered with the `config` crate. From lowest to highest
//! precedence: built-in defaults, an optional YAML file, `FLOODGATE_*`
//! environment variables (`__` separates sections, e.g.
//! `FLOODGATE_RATE_LIMITING__MAX_REQUESTS=20`), and finally the unprefixed
//! variables older deployments use (`PORT`, `REDIS_URL`, `RATE_LIMIT_WINDOW`,
//! `RATE_LIMIT_MAX`, `NODE_ENV`).

use config::{Config, Environment, File, FileFormat, Map};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{FloodgateError, Result};
use crate::ratelimit::WindowPolicy;

/// Longest accepted window: one year.
pub const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

/// Unprefixed environment variables and the config keys they set.
const LEGACY_ENV_KEYS: &[(&str, &str)] = &[
    ("PORT", "server.port"),
    ("REDIS_URL", "store.redis_url"),
    ("RATE_LIMIT_WINDOW", "rate_limiting.window_secs"),
    ("RATE_LIMIT_MAX", "rate_limiting.max_requests"),
    ("NODE_ENV", "environment"),
];

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Deployment environment name, reported by the health endpoint
    #[serde(default = "default_environment")]
    pub environment: String,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for FloodgateConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            rate_limiting: RateLimitingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_environment() -> String {
    "development".to_string()
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// IP address to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Honor `X-Forwarded-For` / `X-Real-IP` when resolving the client address
    #[serde(default = "default_trust_proxy")]
    pub trust_proxy: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            trust_proxy: default_trust_proxy(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_trust_proxy() -> bool {
    true
}

impl ServerConfig {
    /// The socket address the HTTP server binds to.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| {
                FloodgateError::Config(format!(
                    "invalid listen address {}:{}: {}",
                    self.host, self.port, e
                ))
            })
    }
}

/// Which counter store implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis instance
    Redis,
    /// Process-local map, for single-instance development
    Memory,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store implementation
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Upper bound on establishing the Redis connection, in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Upper bound on a single Redis command, in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            redis_url: default_redis_url(),
            connect_timeout_ms: default_connect_timeout(),
            command_timeout_ms: default_command_timeout(),
        }
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Redis
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_command_timeout() -> u64 {
    500
}

impl StoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Length of a client's window in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Requests admitted per client per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    /// Namespace prepended to every counter key in the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_requests: default_max_requests(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_window_secs() -> u64 {
    60
}

fn default_max_requests() -> u64 {
    10
}

fn default_key_prefix() -> String {
    "rate_limit:".to_string()
}

impl RateLimitingConfig {
    /// The window policy the limiter enforces.
    pub fn policy(&self) -> WindowPolicy {
        WindowPolicy::new(self.window_secs, self.max_requests)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

impl FloodgateConfig {
    /// Load configuration from the optional YAML file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, std::env::vars().collect())
    }

    /// Load configuration from the optional YAML file and the given environment.
    pub fn load_with_env(path: Option<&Path>, env: Map<String, String>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }

        builder = builder.add_source(
            Environment::with_prefix("FLOODGATE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(Some(env.clone())),
        );

        for (var, key) in LEGACY_ENV_KEYS {
            builder = builder.set_override_option(*key, env.get(*var).cloned())?;
        }

        let config: FloodgateConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the service relies on.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limiting.window_secs == 0 {
            return Err(FloodgateError::Config(
                "rate_limiting.window_secs must be greater than 0".to_string(),
            ));
        }
        if self.rate_limiting.window_secs > MAX_WINDOW_SECS {
            return Err(FloodgateError::Config(format!(
                "rate_limiting.window_secs must be at most {}",
                MAX_WINDOW_SECS
            )));
        }
        if self.rate_limiting.max_requests == 0 {
            return Err(FloodgateError::Config(
                "rate_limiting.max_requests must be at least 1".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.trim().is_empty() {
            return Err(FloodgateError::Config(
                "store.redis_url is required for the redis backend".to_string(),
            ));
        }
        if self.store.command_timeout_ms == 0 || self.store.connect_timeout_ms == 0 {
            return Err(FloodgateError::Config(
                "store timeouts must be greater than 0".to_string(),
            ));
        }
        self.server.listen_addr()?;
        Ok(())
    }
}
