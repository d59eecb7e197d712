//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries.

use merino_config::AppConfig;

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .pool_size(1)
///     .queue_capacity(2)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.worker.pool_size = size;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.worker.queue_capacity = capacity;
        self
    }

    pub fn endpoint(mut self, endpoint: &str) -> Self {
        self.config.shepherd.endpoint = endpoint.to_string();
        self
    }

    pub fn heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.config.shepherd.heartbeat_interval_ms = ms;
        self
    }

    pub fn heartbeat_failure_threshold(mut self, threshold: u32) -> Self {
        self.config.shepherd.heartbeat_failure_threshold = threshold;
        self
    }

    pub fn reconnect_backoff_ms(mut self, ms: u64) -> Self {
        self.config.shepherd.reconnect_backoff_ms = ms;
        self
    }

    pub fn provider_backend(mut self, backend: &str) -> Self {
        self.config.provider.backend = backend.to_string();
        self
    }

    pub fn handle_range(mut self, start: u32, end: u32) -> Self {
        self.config.provider.range_start = start;
        self.config.provider.range_end = end;
        self
    }

    pub fn socket_path(mut self, path: &str) -> Self {
        self.config.daemon.socket_path = path.to_string();
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
