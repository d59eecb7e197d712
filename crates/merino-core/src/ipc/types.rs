//! Shared request/response types for daemon IPC.
//!
//! These types are serialized as JSON over the Unix domain socket
//! transport. Both the IPC server (daemon) and client (CLI) use these
//! types.

use serde::{Deserialize, Serialize};

/// Daemon health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub git_hash: String,
    pub build_profile: String,
}

/// Daemon runtime status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub running: bool,
    pub version: String,
    pub git_hash: String,
    pub uptime_secs: u64,
    pub pid: u32,
    /// Shepherd session state ("disconnected", "handshaking",
    /// "connected (epoch N)").
    pub session: String,
    pub shepherd_endpoint: String,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub pool_size: usize,
    /// Results waiting for redelivery after the next handshake.
    pub orphans_pending: usize,
    pub provider_backend: String,
    pub log_level: String,
}

/// Daemon shutdown response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResponse {
    pub acknowledged: bool,
    pub message: String,
}

/// Configuration response (serialized TOML).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub toml: String,
}

/// Generic error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
