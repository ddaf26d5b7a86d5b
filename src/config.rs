//! # Configuration Management
//!
//! Centralized configuration for the connection pipeline and the dispatcher.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Environment variables via `from_env()` (`NETCORE_*`)
//! - Direct instantiation with defaults
//!
//! Durations are serialized as milliseconds.

use crate::error::{ProtocolError, Result};
use crate::registry::Registry;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

/// Max allowed payload size for the binary packet format (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Size of each transport read
pub const READ_CHUNK_SIZE: usize = 1024;

/// Size of each transport write
pub const SEND_CHUNK_SIZE: usize = 4096;

/// Depth of the reader → processor notification channel
pub const NOTIFY_CAPACITY: usize = 10_240;

/// Capacity of the process-wide ingress queue
pub const QUEUE_CAPACITY: usize = 102_400;

/// Capacity of the sync-message handoff
pub const SYNC_CAPACITY: usize = 102_400;

/// Maximum number of async handler tasks in flight
pub const ASYNC_BUDGET: usize = 1024;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct CoreConfig {
    /// Per-connection pipeline settings
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Dispatcher and ingress queue settings
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CoreConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(val) = env_parse::<usize>("NETCORE_READ_CHUNK_SIZE") {
            config.connection.read_chunk_size = val;
        }

        if let Some(val) = env_parse::<usize>("NETCORE_SEND_CHUNK_SIZE") {
            config.connection.send_chunk_size = val;
        }

        if let Some(val) = env_parse::<u64>("NETCORE_WRITE_TIMEOUT_MS") {
            config.connection.write_timeout = Duration::from_millis(val);
        }

        if let Some(val) = env_parse::<u64>("NETCORE_FLUSH_INTERVAL_MS") {
            config.connection.flush_interval = Duration::from_millis(val);
        }

        if let Some(val) = env_parse::<usize>("NETCORE_QUEUE_CAPACITY") {
            config.dispatch.queue_capacity = val;
        }

        if let Some(val) = env_parse::<usize>("NETCORE_ASYNC_BUDGET") {
            config.dispatch.async_budget = val;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.connection.validate());
        errors.extend(self.dispatch.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

/// Per-connection pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Bytes requested from the transport per read
    pub read_chunk_size: usize,

    /// Bytes handed to the transport per write
    pub send_chunk_size: usize,

    /// Depth of the "data available" channel between reader and processor
    pub notify_capacity: usize,

    /// Deadline for each write chunk
    #[serde(with = "duration_serde")]
    pub write_timeout: Duration,

    /// Scheduler wake-up interval for the writer
    #[serde(with = "duration_serde")]
    pub flush_interval: Duration,

    /// Largest payload accepted by the binary packet format. Formats carry
    /// their own limit, so this applies to connections whose registry comes
    /// from [`ConnectionConfig::standard_registry`].
    pub max_payload_size: usize,
}

impl ConnectionConfig {
    /// The standard formats and codecs, with formats bounded by `max_payload_size`.
    pub fn standard_registry(&self) -> Arc<Registry> {
        Registry::standard_with_payload_limit(self.max_payload_size)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: READ_CHUNK_SIZE,
            send_chunk_size: SEND_CHUNK_SIZE,
            notify_capacity: NOTIFY_CAPACITY,
            write_timeout: timeout::WRITE_DEADLINE,
            flush_interval: timeout::FLUSH_INTERVAL,
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

impl ConnectionConfig {
    /// Validate pipeline configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.read_chunk_size == 0 {
            errors.push("Read chunk size must be greater than 0".to_string());
        } else if self.read_chunk_size > 1024 * 1024 {
            errors.push(format!(
                "Read chunk size too large: {} (maximum: 1 MB)",
                self.read_chunk_size
            ));
        }

        if self.send_chunk_size == 0 {
            errors.push("Send chunk size must be greater than 0".to_string());
        } else if self.send_chunk_size > 1024 * 1024 {
            errors.push(format!(
                "Send chunk size too large: {} (maximum: 1 MB)",
                self.send_chunk_size
            ));
        }

        if self.notify_capacity == 0 {
            errors.push("Notify capacity must be greater than 0".to_string());
        }

        if self.write_timeout.as_millis() < 10 {
            errors.push("Write timeout too short (minimum: 10ms)".to_string());
        } else if self.write_timeout.as_secs() > 300 {
            errors.push("Write timeout too long (maximum: 300s)".to_string());
        }

        if self.flush_interval.as_millis() < 10 {
            errors.push("Flush interval too short (minimum: 10ms)".to_string());
        } else if self.flush_interval.as_secs() > 3600 {
            errors.push("Flush interval too long (maximum: 1 hour)".to_string());
        }

        if self.max_payload_size < 1024 {
            errors.push("Max payload size too small (minimum: 1 KB)".to_string());
        } else if self.max_payload_size > u32::MAX as usize {
            errors.push(format!(
                "Max payload size too large: {} bytes (must fit in a u32 length field)",
                self.max_payload_size
            ));
        }

        errors
    }
}

/// Dispatcher and ingress queue configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// Capacity of the ingress queue
    pub queue_capacity: usize,

    /// Capacity of the sync handoff
    pub sync_capacity: usize,

    /// Maximum concurrently executing async messages
    pub async_budget: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: QUEUE_CAPACITY,
            sync_capacity: SYNC_CAPACITY,
            async_budget: ASYNC_BUDGET,
        }
    }
}

impl DispatchConfig {
    /// Validate dispatcher configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.queue_capacity == 0 {
            errors.push("Queue capacity must be greater than 0".to_string());
        } else if self.queue_capacity > 10_000_000 {
            errors.push(format!(
                "Queue capacity too large: {} (max recommended: 10,000,000)",
                self.queue_capacity
            ));
        }

        if self.sync_capacity == 0 {
            errors.push("Sync capacity must be greater than 0".to_string());
        }

        if self.async_budget == 0 {
            errors.push("Async budget must be greater than 0".to_string());
        } else if self.async_budget > tokio::sync::Semaphore::MAX_PERMITS {
            errors.push(format!("Async budget too large: {}", self.async_budget));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("netcore"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
