//! Sandbox provider abstraction.
//!
//! A provider creates, enumerates, runs commands in, and destroys ephemeral
//! isolated execution environments. The trait is the portable contract; the
//! isolation technology behind it is an implementation detail chosen per
//! deployment ([`DockerProvider`] wraps the `docker` CLI,
//! [`LocalProvider`] runs directly on the host for development and tests).
//!
//! Two provider-wide rules:
//!
//! - **Reserved range.** Each worker is configured with a numeric handle
//!   range it owns. A provider never creates, claims as its own, or destroys
//!   a handle outside that range, which fences it off from sandboxes managed
//!   by other actors on the same backend.
//! - **Re-verify at call time.** Enumeration and mutation race against
//!   concurrent external actors, so every state-changing call checks the
//!   target handle's existence when it runs instead of trusting an earlier
//!   `list()` snapshot. Destroying an already-vanished sandbox is success,
//!   not an error.

pub mod docker;
pub mod local;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use merino_config::ProviderConfig;

use crate::BoxFuture;
use crate::job::ResourceLimits;

pub use docker::DockerProvider;
pub use local::LocalProvider;

/// Opaque numeric id of a sandbox, drawn from the provider's reserved range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SandboxHandle(pub u32);

impl fmt::Display for SandboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The half-open slice of handle space this worker is authorized to manage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleRange {
    start: u32,
    end: u32,
}

impl HandleRange {
    /// Inclusive on both ends. `start` must not exceed `end`; config
    /// validation rejects inverted ranges before a provider sees them.
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, handle: SandboxHandle) -> bool {
        (self.start..=self.end).contains(&handle.0)
    }

    /// All handles in the range, ascending.
    pub fn iter(&self) -> impl Iterator<Item = SandboxHandle> + use<> {
        (self.start..=self.end).map(SandboxHandle)
    }

    /// Number of handles. Computed in `u64`: the full `u32` handle space
    /// is a valid (if absurd) configuration and must not overflow.
    pub fn len(&self) -> u64 {
        u64::from(self.end) - u64::from(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

impl fmt::Display for HandleRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Sandbox create/list/destroy malfunction. Surfaced to the shepherd as a
/// failed test result for the affected request; never stops a worker loop.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("reserved handle range exhausted ({0} handles all in use)")]
    Exhausted(u64),

    #[error("sandbox backend failure: {0}")]
    Backend(String),

    #[error("sandbox allocation timed out after {0:?}")]
    Timeout(Duration),
}

/// Captured outcome of one command run inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl Execution {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Errors from running a harness inside a sandbox.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The harness ran and exited abnormally. An expected outcome carrying
    /// the captured output, not a system fault.
    #[error("harness exited with status {}", .0.exit_code)]
    Harness(Execution),

    #[error("harness execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("sandbox {0} does not exist")]
    NoSuchSandbox(SandboxHandle),

    #[error("sandbox backend failure: {0}")]
    Backend(String),
}

/// Pluggable sandbox backend.
///
/// Object-safe (consumed as `Arc<dyn SandboxProvider>` by the worker pool),
/// hence the [`BoxFuture`] return types.
pub trait SandboxProvider: Send + Sync {
    /// Human-readable backend name (e.g. "docker", "local").
    fn name(&self) -> &str;

    /// The reserved range this provider allocates from.
    fn range(&self) -> HandleRange;

    /// Enumerate live sandboxes. With `include_foreign` false, only handles
    /// inside the reserved range are reported.
    fn list(&self, include_foreign: bool) -> BoxFuture<'_, Result<Vec<SandboxHandle>, ProvisionError>>;

    /// Allocate a new sandbox. The returned handle is always inside the
    /// reserved range and never collides with a live foreign instance.
    fn create(&self) -> BoxFuture<'_, Result<SandboxHandle, ProvisionError>>;

    /// Tear down a sandbox. Idempotent: destroying a handle that no longer
    /// exists succeeds. Errors only on genuine backend malfunction.
    fn destroy(&self, handle: SandboxHandle) -> BoxFuture<'_, Result<(), ProvisionError>>;

    /// Execute a command inside the sandbox, bounded by `limits.timeout_secs`.
    fn run(
        &self,
        handle: SandboxHandle,
        command: &[String],
        limits: &ResourceLimits,
    ) -> BoxFuture<'_, Result<Execution, ExecError>>;
}

/// Build the provider selected by configuration.
pub fn select_provider(config: &ProviderConfig) -> Arc<dyn SandboxProvider> {
    let range = HandleRange::new(config.range_start, config.range_end);
    let run_timeout = Duration::from_secs(config.run_timeout_secs);
    match config.backend.as_str() {
        "docker" => Arc::new(DockerProvider::new(
            &config.docker_bin,
            &config.docker_image,
            range,
            run_timeout,
        )),
        // Config validation only admits "docker" and "local".
        _ => Arc::new(LocalProvider::new(
            std::env::temp_dir().join("merino-sandboxes"),
            range,
            run_timeout,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_contains() {
        let range = HandleRange::new(100, 103);
        assert!(range.contains(SandboxHandle(100)));
        assert!(range.contains(SandboxHandle(103)));
        assert!(!range.contains(SandboxHandle(99)));
        assert!(!range.contains(SandboxHandle(104)));
    }

    #[test]
    fn test_range_iter_ascending() {
        let range = HandleRange::new(5, 7);
        let handles: Vec<u32> = range.iter().map(|h| h.0).collect();
        assert_eq!(handles, vec![5, 6, 7]);
        assert_eq!(range.len(), 3);
    }

    #[test]
    fn test_single_handle_range() {
        let range = HandleRange::new(42, 42);
        assert_eq!(range.len(), 1);
        assert!(!range.is_empty());
        assert!(range.contains(SandboxHandle(42)));
    }

    #[test]
    fn test_full_handle_space_range_len() {
        let range = HandleRange::new(0, u32::MAX);
        assert_eq!(range.len(), 1 << 32);
        assert!(!range.is_empty());
    }

    #[test]
    fn test_select_provider_local() {
        let config = merino_config::ProviderConfig::default();
        let provider = select_provider(&config);
        assert_eq!(provider.name(), "local");
        assert_eq!(provider.range(), HandleRange::new(42_000, 42_999));
    }

    #[test]
    fn test_select_provider_docker() {
        let config = merino_config::ProviderConfig {
            backend: "docker".to_string(),
            ..Default::default()
        };
        let provider = select_provider(&config);
        assert_eq!(provider.name(), "docker");
    }

    #[test]
    fn test_harness_error_display_carries_status() {
        let err = ExecError::Harness(Execution {
            exit_code: 2,
            stdout: String::new(),
            stderr: String::new(),
            elapsed: Duration::from_millis(5),
        });
        assert_eq!(err.to_string(), "harness exited with status 2");
    }
}
