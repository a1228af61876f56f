//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::events::{EngineConfig, QueueLimits};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub queues: QueueConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Event queue lifecycle configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Idle timeout for queues that did not ask for a lifespan
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Upper bound on any queue's lifespan
    #[serde(default = "default_max_lifespan")]
    pub max_lifespan_secs: u64,

    /// How often idle queues are garbage collected
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,

    #[serde(default = "default_heartbeat_min")]
    pub heartbeat_min_secs: u64,

    #[serde(default = "default_heartbeat_jitter")]
    pub heartbeat_jitter_secs: u64,
}

fn default_idle_timeout() -> u64 {
    600 // 10 minutes
}

fn default_max_lifespan() -> u64 {
    7 * 24 * 60 * 60 // 1 week
}

fn default_gc_interval() -> u64 {
    300 // 5 minutes
}

fn default_heartbeat_min() -> u64 {
    45
}

fn default_heartbeat_jitter() -> u64 {
    10
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            max_lifespan_secs: default_max_lifespan(),
            gc_interval_secs: default_gc_interval(),
            heartbeat_min_secs: default_heartbeat_min(),
            heartbeat_jitter_secs: default_heartbeat_jitter(),
        }
    }
}

/// Snapshot persistence configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,

    #[serde(default = "default_persistence_enabled")]
    pub enabled: bool,
}

fn default_snapshot_path() -> String {
    dirs::data_local_dir()
        .map(|p| {
            p.join("courier")
                .join("event_queues.json")
                .to_string_lossy()
                .to_string()
        })
        .unwrap_or_else(|| "./event_queues.json".to_string())
}

fn default_persistence_enabled() -> bool {
    true
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            enabled: default_persistence_enabled(),
        }
    }
}

/// API server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub cors_origins: Vec<String>,

    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9993
}

fn default_max_body_size() -> usize {
    4 * 1024 * 1024 // 4 MB
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
            max_body_size: default_max_body_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("courier").join("config.toml")),
            Some(PathBuf::from("/etc/courier/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        // Fall back to environment-only config
        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        // Queue overrides
        override_parsed("COURIER_IDLE_TIMEOUT_SECS", &mut self.queues.idle_timeout_secs);
        override_parsed("COURIER_MAX_LIFESPAN_SECS", &mut self.queues.max_lifespan_secs);
        override_parsed("COURIER_GC_INTERVAL_SECS", &mut self.queues.gc_interval_secs);

        // Persistence overrides
        if let Ok(path) = std::env::var("COURIER_SNAPSHOT_PATH") {
            self.persistence.snapshot_path = path;
        }
        override_parsed("COURIER_PERSISTENCE_ENABLED", &mut self.persistence.enabled);

        // API overrides
        if let Ok(host) = std::env::var("COURIER_API_HOST") {
            self.api.host = host;
        }
        override_parsed("COURIER_API_PORT", &mut self.api.port);

        // Logging overrides
        if let Ok(level) = std::env::var("COURIER_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("COURIER_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Engine settings derived from this configuration
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            limits: QueueLimits {
                idle_timeout_secs: self.queues.idle_timeout_secs,
                max_lifespan_secs: self.queues.max_lifespan_secs,
            },
            gc_interval: Duration::from_secs(self.queues.gc_interval_secs),
            heartbeat_min_secs: self.queues.heartbeat_min_secs,
            heartbeat_jitter_secs: self.queues.heartbeat_jitter_secs,
            snapshot_path: self
                .persistence
                .enabled
                .then(|| expand_home(&self.persistence.snapshot_path)),
        }
    }
}

/// Expand a leading `~/` to the home directory
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

fn override_parsed<T: std::str::FromStr>(var: &str, target: &mut T) {
    if let Ok(value) = std::env::var(var) {
        match value.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!("Ignoring invalid value for {}: {:?}", var, value),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Courier Configuration
#
# Environment variables override these settings:
# - COURIER_IDLE_TIMEOUT_SECS
# - COURIER_MAX_LIFESPAN_SECS
# - COURIER_GC_INTERVAL_SECS
# - COURIER_SNAPSHOT_PATH
# - COURIER_PERSISTENCE_ENABLED
# - COURIER_API_HOST
# - COURIER_API_PORT
# - COURIER_LOG_LEVEL
# - COURIER_LOG_FORMAT

[queues]
# Idle timeout for queues that did not request a lifespan (seconds)
idle_timeout_secs = 600

# Maximum lifespan any queue may request (seconds)
max_lifespan_secs = 604800

# How often idle queues are garbage collected (seconds)
gc_interval_secs = 300

# Parked long-polls get a heartbeat after min + random(0..=jitter) seconds
heartbeat_min_secs = 45
heartbeat_jitter_secs = 10

[persistence]
# Event queues are dumped here on shutdown and restored on start
snapshot_path = "~/.local/share/courier/event_queues.json"

# Disable to start with empty queues every time
enabled = true

[api]
# API server host
host = "127.0.0.1"

# API server port
port = 9993

# Allowed CORS origins (empty = no CORS headers)
cors_origins = []

# Maximum request body size (bytes)
max_body_size = 4194304

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
