//! Static host capability snapshot.
//!
//! Built once at process start and sent to the shepherd during the handshake
//! so capability-tagged test requests can be matched to this worker. Never
//! mutated after construction, and has no error paths after construction.

use serde::{Deserialize, Serialize};

/// A tool available to harnesses on this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolVersion {
    pub name: String,
    pub version: String,
}

/// Read-only snapshot of the host this worker runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentDescriptor {
    /// Operating system family (e.g. "linux", "macos").
    pub system: String,
    /// Kernel release string, "unknown" when not readable.
    pub release: String,
    /// Machine architecture (e.g. "x86_64", "aarch64").
    pub machine: String,
    /// Tools installed on this host, in a stable order.
    pub tools: Vec<ToolVersion>,
}

impl EnvironmentDescriptor {
    /// Take the snapshot from host introspection.
    pub fn detect() -> Self {
        Self {
            system: std::env::consts::OS.to_string(),
            release: kernel_release(),
            machine: std::env::consts::ARCH.to_string(),
            tools: vec![ToolVersion {
                name: "merino".to_string(),
                version: crate::build_info::VERSION.to_string(),
            }],
        }
    }
}

fn kernel_release() -> String {
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
