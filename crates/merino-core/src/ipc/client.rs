//! IPC client — connects to the daemon over a Unix domain socket.
//!
//! Provides a typed client for the CLI to query daemon status, inspect
//! the running config, and request shutdown. Uses `hyper` for proper
//! HTTP/1.1 over the Unix socket.

use std::path::PathBuf;

use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tracing::debug;

use super::types::*;

/// Errors from the IPC client.
#[derive(Debug, thiserror::Error)]
pub enum IpcClientError {
    #[error("failed to connect to daemon socket at {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("daemon is not running (socket not found at {0})")]
    NotRunning(PathBuf),

    #[error("request failed: {0}")]
    Request(String),

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("daemon returned error: {0}")]
    DaemonError(String),
}

/// Client for communicating with the Merino daemon via Unix socket.
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    /// Create a new IPC client targeting the given socket path.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Check if the daemon socket exists (daemon is likely running).
    pub fn daemon_available(&self) -> bool {
        self.socket_path.exists()
    }

    /// Send an HTTP request over the Unix socket using hyper and return the response body.
    async fn request(&self, method: &str, path: &str) -> Result<Bytes, IpcClientError> {
        if !self.daemon_available() {
            return Err(IpcClientError::NotRunning(self.socket_path.clone()));
        }

        let stream =
            UnixStream::connect(&self.socket_path)
                .await
                .map_err(|e| IpcClientError::Connect {
                    path: self.socket_path.clone(),
                    source: e,
                })?;

        let io = TokioIo::new(stream);

        let (mut sender, conn) =
            hyper::client::conn::http1::handshake::<_, http_body_util::Full<Bytes>>(io)
                .await
                .map_err(|e| IpcClientError::Request(format!("HTTP handshake failed: {e}")))?;

        // Drive the connection in the background
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::warn!(error = %e, "IPC connection error");
            }
        });

        debug!(method, path, "IPC request");

        let http_method = method
            .parse::<hyper::Method>()
            .map_err(|e| IpcClientError::Request(format!("invalid method: {e}")))?;

        let req = hyper::Request::builder()
            .method(http_method)
            .uri(path)
            .header("host", "localhost")
            .body(http_body_util::Full::new(Bytes::new()))
            .map_err(|e| IpcClientError::Request(format!("failed to build request: {e}")))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| IpcClientError::Request(format!("request failed: {e}")))?;

        let status = resp.status();

        let resp_body = http_body_util::BodyExt::collect(resp.into_body())
            .await
            .map_err(|e| IpcClientError::Request(format!("failed to read response body: {e}")))?
            .to_bytes();

        if !status.is_success() {
            if let Ok(err) = serde_json::from_slice::<ErrorResponse>(&resp_body) {
                return Err(IpcClientError::DaemonError(err.error));
            }
            return Err(IpcClientError::Request(format!(
                "unexpected status: {status}"
            )));
        }

        Ok(resp_body)
    }

    // ── Typed API methods ──────────────────────────────────────────────

    /// Health check — is the daemon running and responsive?
    pub async fn health(&self) -> Result<HealthResponse, IpcClientError> {
        let body = self.request("GET", "/health").await?;
        serde_json::from_slice(&body).map_err(|e| IpcClientError::Parse(format!("health: {e}")))
    }

    /// Get daemon status.
    pub async fn status(&self) -> Result<StatusResponse, IpcClientError> {
        let body = self.request("GET", "/status").await?;
        serde_json::from_slice(&body).map_err(|e| IpcClientError::Parse(format!("status: {e}")))
    }

    /// Request daemon shutdown.
    pub async fn stop(&self) -> Result<StopResponse, IpcClientError> {
        let body = self.request("POST", "/stop").await?;
        serde_json::from_slice(&body).map_err(|e| IpcClientError::Parse(format!("stop: {e}")))
    }

    /// Get the daemon's current config as TOML.
    pub async fn config(&self) -> Result<ConfigResponse, IpcClientError> {
        let body = self.request("GET", "/config").await?;
        serde_json::from_slice(&body).map_err(|e| IpcClientError::Parse(format!("config: {e}")))
    }
}
