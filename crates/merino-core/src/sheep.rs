//! The sheep daemon — startup, wiring, and graceful shutdown.
//!
//! One [`Sheep`] owns every moving part of the worker: the shutdown token,
//! dispatch queue, orphan sink, sandbox provider, shepherd control channel,
//! worker pool, and the local IPC control surface. `run()` blocks until
//! ctrl-c or an IPC stop request, then tears everything down in order:
//! workers finish their current sandboxes, the control channel parks
//! undelivered results, the IPC socket is unlinked.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use merino_config::AppConfig;

use crate::environment::EnvironmentDescriptor;
use crate::ipc::server::{self, IpcState};
use crate::orphanage::OrphanSink;
use crate::provider::select_provider;
use crate::queue::DispatchQueue;
use crate::shepherd::{ControlChannel, TcpTransport};
use crate::shutdown::Shutdown;
use crate::worker::{WorkerContext, WorkerPool};

/// Errors from daemon startup and teardown.
#[derive(Debug, thiserror::Error)]
pub enum SheepError {
    #[error("IPC server failed: {0}")]
    Ipc(#[source] std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The main Merino daemon.
pub struct Sheep {
    config: AppConfig,
    shutdown: Shutdown,
}

impl Sheep {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            shutdown: Shutdown::new(),
        }
    }

    /// Handle for external stop requests (tests, embedding).
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Run the daemon until a shutdown is requested.
    pub async fn run(&self) -> Result<(), SheepError> {
        let environment = EnvironmentDescriptor::detect();
        info!(
            version = %crate::build_info::version_string(),
            system = %environment.system,
            machine = %environment.machine,
            endpoint = %self.config.shepherd.endpoint,
            "merino sheep starting"
        );

        let shutdown = self.shutdown.clone();
        let queue = Arc::new(DispatchQueue::new(
            self.config.worker.queue_capacity,
            shutdown.clone(),
        ));
        let orphans = Arc::new(OrphanSink::new());
        let provider = select_provider(&self.config.provider);
        info!(backend = provider.name(), range = %provider.range(), "sandbox provider selected");

        let transport = TcpTransport::new(self.config.shepherd.endpoint.clone());
        let (channel, router, session_rx) = ControlChannel::new(
            Box::new(transport),
            &self.config.shepherd,
            environment,
            self.config.worker.pool_size,
            Arc::clone(&queue),
            Arc::clone(&orphans),
            shutdown.clone(),
        );
        let channel_task = tokio::spawn(channel.run());

        let pool = WorkerPool::spawn(
            self.config.worker.pool_size,
            WorkerContext {
                queue: Arc::clone(&queue),
                provider: Arc::clone(&provider),
                router,
                shutdown: shutdown.clone(),
                create_timeout: Duration::from_secs(self.config.provider.create_timeout_secs),
            },
        );

        let ipc_state = Arc::new(IpcState {
            config: self.config.clone(),
            shutdown: shutdown.clone(),
            session: session_rx,
            queue: Arc::clone(&queue),
            orphans: Arc::clone(&orphans),
            pool_size: self.config.worker.pool_size,
            provider_backend: provider.name().to_string(),
            started_at: Instant::now(),
        });
        let socket_path = PathBuf::from(&self.config.daemon.socket_path);
        let ipc_shutdown = shutdown.clone();
        let ipc_task =
            tokio::spawn(
                async move { server::serve(&socket_path, ipc_state, ipc_shutdown).await },
            );

        tokio::select! {
            _ = shutdown.triggered() => {
                info!("shutdown requested, stopping daemon");
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("ctrl-c received, initiating graceful shutdown");
                shutdown.trigger();
            }
        }

        pool.join().await;
        let _ = channel_task.await;
        match ipc_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(SheepError::Ipc(e)),
            Err(e) => error!(error = %e, "IPC server task failed"),
        }

        let stranded = orphans.len().await;
        if stranded > 0 {
            warn!(stranded, "exiting with undelivered results");
        }
        info!("sheep stopped");
        Ok(())
    }
}
