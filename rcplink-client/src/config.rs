//! Session configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RCPLINK_CONFIG)
//! 3. Environment variables

use rcplink_protocol::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Default heartbeat interval in milliseconds.
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 10_000;

/// Default minimum delay between two transmitted commands in milliseconds.
pub const DEFAULT_SEND_INTERVAL_MS: u64 = 5;

/// Default number of times a deferred set may be recycled before it is
/// dropped.
pub const DEFAULT_MAX_DEFERRALS: u32 = 400;

/// Configuration for a device session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Device host name or IP address.
    pub host: String,
    /// Device port.
    pub port: u16,
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Heartbeat interval in milliseconds. The device is told to drop the
    /// connection after twice this long without traffic.
    pub keepalive_interval_ms: u64,
    /// Minimum delay between transmitted commands in milliseconds.
    pub send_interval_ms: u64,
    /// Recycle bound for sets waiting on a cached dependency.
    pub max_deferrals: u32,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Capacity of the change and inbound broadcast channels.
    pub event_capacity: usize,
    /// Parameter catalog file (YAML or JSON).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            connect_timeout_ms: 5_000,
            keepalive_interval_ms: DEFAULT_KEEPALIVE_INTERVAL_MS,
            send_interval_ms: DEFAULT_SEND_INTERVAL_MS,
            max_deferrals: DEFAULT_MAX_DEFERRALS,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            event_capacity: 1024,
            catalog: None,
        }
    }
}

impl SessionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("RCPLINK_CONFIG").ok().map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Like [`SessionConfig::load`] with an explicit config file.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: SessionConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("RCPLINK_HOST") {
            if !host.is_empty() {
                self.host = host;
            }
        }

        if let Ok(port) = std::env::var("RCPLINK_PORT") {
            if let Ok(p) = port.parse() {
                self.port = p;
            }
        }

        if let Ok(timeout) = std::env::var("RCPLINK_CONNECT_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.connect_timeout_ms = ms;
            }
        }

        if let Ok(interval) = std::env::var("RCPLINK_KEEPALIVE_MS") {
            if let Ok(ms) = interval.parse() {
                self.keepalive_interval_ms = ms;
            }
        }

        if let Ok(interval) = std::env::var("RCPLINK_SEND_INTERVAL_MS") {
            if let Ok(ms) = interval.parse() {
                self.send_interval_ms = ms;
            }
        }

        if let Ok(max) = std::env::var("RCPLINK_MAX_DEFERRALS") {
            if let Ok(n) = max.parse() {
                self.max_deferrals = n;
            }
        }

        if let Ok(path) = std::env::var("RCPLINK_CATALOG") {
            self.catalog = Some(PathBuf::from(path));
        }
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Checks values that would make a session unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::ValidationError("host is empty".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::ValidationError("port must be non-zero".to_string()));
        }
        if self.keepalive_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "keepalive_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.send_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "send_interval_ms must be non-zero".to_string(),
            ));
        }
        if !(MIN_READ_BUFFER_SIZE..=MAX_READ_BUFFER_SIZE).contains(&self.read_buffer_size) {
            return Err(ConfigError::ValidationError(format!(
                "read_buffer_size must be between {} and {}",
                MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE
            )));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "event_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = whole_millis(timeout);
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval_ms = whole_millis(interval);
        self
    }

    pub fn with_send_interval(mut self, interval: Duration) -> Self {
        self.send_interval_ms = whole_millis(interval);
        self
    }

    pub fn with_max_deferrals(mut self, max: u32) -> Self {
        self.max_deferrals = max;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_catalog(mut self, path: impl Into<PathBuf>) -> Self {
        self.catalog = Some(path.into());
        self
    }

    /// Returns `host:port`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    /// Idle threshold requested from the device: twice the heartbeat.
    pub fn idle_timeout(&self) -> Duration {
        self.keepalive_interval() * 2
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }
}

/// Rounds a duration up to whole milliseconds, never below one.
fn whole_millis(duration: Duration) -> u64 {
    let millis = duration.as_nanos().div_ceil(1_000_000);
    u64::try_from(millis).unwrap_or(u64::MAX).max(1)
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
