#![deny(unsafe_code)]

//! Configuration loading and validation for the Merino worker.
//!
//! Loads TOML configuration files and validates them against expected schemas.
//! Provides the [`AppConfig`] type as the central configuration structure
//! consumed by every component of the worker: the dispatch queue, the worker
//! pool, the shepherd control channel, and the sandbox provider.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon configuration (control socket).
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Worker pool and dispatch queue configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Shepherd session configuration.
    #[serde(default)]
    pub shepherd: ShepherdConfig,

    /// Sandbox provider configuration.
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for the daemon process itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Unix socket path for the local control surface (CLI `stop`/`status`).
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
        }
    }
}

fn default_socket_path() -> String {
    "/tmp/merino.sock".to_string()
}

/// Worker pool and dispatch queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent executors pulling from the dispatch queue.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Dispatch queue capacity. The control channel blocks on `put` when
    /// this many requests are pending.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_pool_size() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    8
}

/// Shepherd session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShepherdConfig {
    /// Address of the shepherd dispatcher (`host:port`).
    #[serde(default = "default_shepherd_endpoint")]
    pub endpoint: String,

    /// Interval between heartbeats while connected, in milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Number of consecutive heartbeat failures before the session is
    /// declared lost.
    #[serde(default = "default_heartbeat_failure_threshold")]
    pub heartbeat_failure_threshold: u32,

    /// Initial reconnect backoff in milliseconds. Doubles per failed
    /// attempt up to `reconnect_backoff_max_ms`.
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    /// Ceiling for the reconnect backoff in milliseconds.
    #[serde(default = "default_reconnect_backoff_max_ms")]
    pub reconnect_backoff_max_ms: u64,
}

impl Default for ShepherdConfig {
    fn default() -> Self {
        Self {
            endpoint: default_shepherd_endpoint(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_failure_threshold: default_heartbeat_failure_threshold(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            reconnect_backoff_max_ms: default_reconnect_backoff_max_ms(),
        }
    }
}

fn default_shepherd_endpoint() -> String {
    "127.0.0.1:9200".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    5000
}

fn default_heartbeat_failure_threshold() -> u32 {
    3
}

fn default_reconnect_backoff_ms() -> u64 {
    500
}

fn default_reconnect_backoff_max_ms() -> u64 {
    30_000
}

/// Sandbox provider configuration.
///
/// The reserved handle range fences this worker off from sandboxes managed
/// by other actors on the same host: the provider never creates, claims, or
/// destroys a handle outside `[range_start, range_end]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider backend: "docker" or "local".
    #[serde(default = "default_provider_backend")]
    pub backend: String,

    /// First handle in this worker's reserved range (inclusive).
    #[serde(default = "default_range_start")]
    pub range_start: u32,

    /// Last handle in this worker's reserved range (inclusive).
    #[serde(default = "default_range_end")]
    pub range_end: u32,

    /// Sandbox allocation timeout in seconds.
    #[serde(default = "default_create_timeout_secs")]
    pub create_timeout_secs: u64,

    /// Harness execution timeout in seconds (per run).
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    /// Docker CLI binary path (docker backend only).
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,

    /// Container image used for sandboxes (docker backend only).
    #[serde(default = "default_docker_image")]
    pub docker_image: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            backend: default_provider_backend(),
            range_start: default_range_start(),
            range_end: default_range_end(),
            create_timeout_secs: default_create_timeout_secs(),
            run_timeout_secs: default_run_timeout_secs(),
            docker_bin: default_docker_bin(),
            docker_image: default_docker_image(),
        }
    }
}

fn default_provider_backend() -> String {
    "local".to_string()
}

fn default_range_start() -> u32 {
    42_000
}

fn default_range_end() -> u32 {
    42_999
}

fn default_create_timeout_secs() -> u64 {
    30
}

fn default_run_timeout_secs() -> u64 {
    300
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

fn default_docker_image() -> String {
    "alpine:latest".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.socket_path.is_empty() {
            return Err(ConfigError::Validation(
                "daemon.socket_path must not be empty".to_string(),
            ));
        }
        if self.worker.pool_size == 0 {
            return Err(ConfigError::Validation(
                "worker.pool_size must be at least 1".to_string(),
            ));
        }
        if self.worker.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "worker.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.shepherd.endpoint.is_empty() {
            return Err(ConfigError::Validation(
                "shepherd.endpoint must not be empty".to_string(),
            ));
        }
        if self.shepherd.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "shepherd.heartbeat_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.shepherd.heartbeat_failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "shepherd.heartbeat_failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.shepherd.reconnect_backoff_ms == 0 {
            return Err(ConfigError::Validation(
                "shepherd.reconnect_backoff_ms must be non-zero".to_string(),
            ));
        }
        if self.shepherd.reconnect_backoff_max_ms < self.shepherd.reconnect_backoff_ms {
            return Err(ConfigError::Validation(format!(
                "shepherd.reconnect_backoff_max_ms ({}) must not be below \
                 shepherd.reconnect_backoff_ms ({})",
                self.shepherd.reconnect_backoff_max_ms, self.shepherd.reconnect_backoff_ms
            )));
        }

        let valid_backends = ["docker", "local"];
        if !valid_backends.contains(&self.provider.backend.as_str()) {
            return Err(ConfigError::Validation(format!(
                "provider.backend must be one of {:?}, got {:?}",
                valid_backends, self.provider.backend
            )));
        }
        if self.provider.range_start > self.provider.range_end {
            return Err(ConfigError::Validation(format!(
                "provider reserved range is empty: range_start ({}) > range_end ({})",
                self.provider.range_start, self.provider.range_end
            )));
        }
        if self.provider.create_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "provider.create_timeout_secs must be non-zero".to_string(),
            ));
        }
        if self.provider.run_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "provider.run_timeout_secs must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.worker.pool_size, 2);
        assert_eq!(config.worker.queue_capacity, 8);
        assert_eq!(config.shepherd.endpoint, "127.0.0.1:9200");
        assert_eq!(config.shepherd.heartbeat_failure_threshold, 3);
        assert_eq!(config.provider.backend, "local");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml = "";
        let config = AppConfig::parse(toml).unwrap();
        assert_eq!(config.worker.pool_size, 2);
        assert_eq!(config.provider.range_start, 42_000);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
            [daemon]
            socket_path = "/run/merino/control.sock"

            [worker]
            pool_size = 4
            queue_capacity = 16

            [shepherd]
            endpoint = "shepherd.internal:9200"
            heartbeat_interval_ms = 2000
            heartbeat_failure_threshold = 5

            [provider]
            backend = "docker"
            range_start = 50000
            range_end = 50063
            docker_image = "merino-harness:latest"

            [logging]
            level = "debug"
        "#;
        let config = AppConfig::parse(toml).unwrap();
        assert_eq!(config.daemon.socket_path, "/run/merino/control.sock");
        assert_eq!(config.worker.pool_size, 4);
        assert_eq!(config.worker.queue_capacity, 16);
        assert_eq!(config.shepherd.endpoint, "shepherd.internal:9200");
        assert_eq!(config.shepherd.heartbeat_interval_ms, 2000);
        assert_eq!(config.shepherd.heartbeat_failure_threshold, 5);
        assert_eq!(config.provider.backend, "docker");
        assert_eq!(config.provider.range_start, 50_000);
        assert_eq!(config.provider.range_end, 50_063);
        assert_eq!(config.provider.docker_image, "merino-harness:latest");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validation_rejects_zero_pool() {
        let toml = r#"
            [worker]
            pool_size = 0
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_zero_queue_capacity() {
        let toml = r#"
            [worker]
            queue_capacity = 0
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_empty_endpoint() {
        let toml = r#"
            [shepherd]
            endpoint = ""
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_zero_heartbeat_threshold() {
        let toml = r#"
            [shepherd]
            heartbeat_failure_threshold = 0
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_backoff_ceiling_below_base() {
        let toml = r#"
            [shepherd]
            reconnect_backoff_ms = 1000
            reconnect_backoff_max_ms = 100
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_unknown_backend() {
        let toml = r#"
            [provider]
            backend = "openvz"
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_inverted_range() {
        let toml = r#"
            [provider]
            range_start = 100
            range_end = 50
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_zero_run_timeout() {
        let toml = r#"
            [provider]
            run_timeout_secs = 0
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    // ── Async file-based loading ──────────────────────────────────────

    #[tokio::test]
    async fn test_load_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("merino.toml");
        tokio::fs::write(&path, b"[worker]\npool_size = 7\n")
            .await
            .unwrap();

        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.worker.pool_size, 7);
    }

    #[tokio::test]
    async fn test_load_nonexistent_file() {
        let result = AppConfig::load(Path::new("/nonexistent/merino.toml")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_load_invalid_toml_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.toml");
        tokio::fs::write(&path, b"not valid toml [[[").await.unwrap();

        let result = AppConfig::load(&path).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Validation("bad value".to_string());
        assert_eq!(err.to_string(), "validation error: bad value");
    }
}
