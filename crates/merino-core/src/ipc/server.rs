//! IPC server — axum HTTP router over a Unix domain socket.
//!
//! The daemon binds a Unix socket and exposes a JSON API for the CLI to
//! query status, inspect the running config, and request shutdown.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::info;

use merino_config::AppConfig;

use super::types::*;
use crate::orphanage::OrphanSink;
use crate::queue::DispatchQueue;
use crate::shepherd::SessionState;
use crate::shutdown::Shutdown;

/// Shared state accessible to all IPC route handlers.
pub struct IpcState {
    pub config: AppConfig,
    pub shutdown: Shutdown,
    pub session: watch::Receiver<SessionState>,
    pub queue: Arc<DispatchQueue>,
    pub orphans: Arc<OrphanSink>,
    pub pool_size: usize,
    pub provider_backend: String,
    pub started_at: Instant,
}

/// Build the axum router with all IPC routes.
pub fn router(state: Arc<IpcState>) -> axum::Router {
    axum::Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/stop", post(handle_stop))
        .route("/config", get(handle_config))
        .with_state(state)
}

/// Start the IPC server on the given Unix socket path.
///
/// Removes any stale socket file before binding. Runs until shutdown is
/// triggered.
pub async fn serve(
    socket_path: &Path,
    state: Arc<IpcState>,
    shutdown: Shutdown,
) -> Result<(), std::io::Error> {
    // Remove stale socket file if it exists
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }

    // Ensure parent directory exists
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let listener = UnixListener::bind(socket_path)?;
    info!(path = %socket_path.display(), "IPC server listening");

    let app = router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.triggered().await;
            info!("IPC server shutting down");
        })
        .await?;

    // Clean up socket file
    std::fs::remove_file(socket_path).ok();
    Ok(())
}

// ── Route handlers ──────────────────────────────────────────────────────

async fn handle_health(State(state): State<Arc<IpcState>>) -> Json<HealthResponse> {
    let _ = state; // health doesn't need state
    Json(HealthResponse {
        status: "ok".to_string(),
        version: crate::build_info::VERSION.to_string(),
        git_hash: crate::build_info::GIT_HASH.to_string(),
        build_profile: crate::build_info::BUILD_PROFILE.to_string(),
    })
}

async fn handle_status(State(state): State<Arc<IpcState>>) -> Json<StatusResponse> {
    let session = *state.session.borrow();

    Json(StatusResponse {
        running: true,
        version: crate::build_info::VERSION.to_string(),
        git_hash: crate::build_info::GIT_HASH.to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        pid: std::process::id(),
        session: session.to_string(),
        shepherd_endpoint: state.config.shepherd.endpoint.clone(),
        queue_depth: state.queue.len().await,
        queue_capacity: state.queue.capacity(),
        pool_size: state.pool_size,
        orphans_pending: state.orphans.len().await,
        provider_backend: state.provider_backend.clone(),
        log_level: state.config.logging.level.clone(),
    })
}

async fn handle_stop(State(state): State<Arc<IpcState>>) -> (StatusCode, Json<StopResponse>) {
    info!("Stop requested via IPC");
    state.shutdown.trigger();
    (
        StatusCode::OK,
        Json(StopResponse {
            acknowledged: true,
            message: "Shutdown initiated".to_string(),
        }),
    )
}

async fn handle_config(
    State(state): State<Arc<IpcState>>,
) -> Result<Json<ConfigResponse>, (StatusCode, Json<ErrorResponse>)> {
    match toml::to_string_pretty(&state.config) {
        Ok(toml_str) => Ok(Json(ConfigResponse { toml: toml_str })),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: format!("Failed to serialize config: {e}"),
            }),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> Arc<IpcState> {
        let shutdown = Shutdown::new();
        let (_, session_rx) = watch::channel(SessionState::Disconnected);

        Arc::new(IpcState {
            config: AppConfig::default(),
            shutdown: shutdown.clone(),
            session: session_rx,
            queue: Arc::new(DispatchQueue::new(8, shutdown.clone())),
            orphans: Arc::new(OrphanSink::new()),
            pool_size: 2,
            provider_backend: "local".to_string(),
            started_at: Instant::now(),
        })
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = router(test_state());
        let req = Request::get("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "ok");
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let app = router(test_state());
        let req = Request::get("/status").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let status: StatusResponse = serde_json::from_slice(&body).unwrap();
        assert!(status.running);
        assert_eq!(status.session, "disconnected");
        assert_eq!(status.queue_depth, 0);
        assert_eq!(status.queue_capacity, 8);
        assert_eq!(status.pool_size, 2);
    }

    #[tokio::test]
    async fn test_stop_endpoint_triggers_shutdown() {
        let state = test_state();
        let shutdown = state.shutdown.clone();
        let app = router(state);

        let req = Request::post("/stop").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let stop: StopResponse = serde_json::from_slice(&body).unwrap();
        assert!(stop.acknowledged);
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_config_endpoint() {
        let app = router(test_state());
        let req = Request::get("/config").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let config_resp: ConfigResponse = serde_json::from_slice(&body).unwrap();
        assert!(config_resp.toml.contains("pool_size"));
        assert!(config_resp.toml.contains("endpoint"));
    }
}
