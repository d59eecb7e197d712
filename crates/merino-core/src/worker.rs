//! Worker pool.
//!
//! A fixed number of executors pull requests from the dispatch queue, walk
//! each one through the sandbox lifecycle, and hand the graded result to
//! the [`ResultRouter`]. Each executor runs under a supervisor task that
//! replaces it if it panics, so pool capacity holds for the life of the
//! process.
//!
//! Teardown is unconditional: whatever happens after `create` succeeds
//! (harness failure, timeout, shutdown mid-run), `destroy` is called before
//! the executor moves on.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::job::{TestRequest, TestResult};
use crate::provider::{ExecError, SandboxProvider};
use crate::queue::DispatchQueue;
use crate::shepherd::ResultRouter;
use crate::shutdown::Shutdown;

/// Everything an executor needs, cloned per worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<DispatchQueue>,
    pub provider: Arc<dyn SandboxProvider>,
    pub router: ResultRouter,
    pub shutdown: Shutdown,
    /// Deadline for sandbox allocation; a slow backend fails the request
    /// rather than wedging the executor.
    pub create_timeout: Duration,
}

/// Handle to the spawned pool. `join` after triggering shutdown.
pub struct WorkerPool {
    supervisors: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(size: usize, ctx: WorkerContext) -> Self {
        info!(pool_size = size, "starting worker pool");
        let supervisors = (0..size)
            .map(|worker_id| tokio::spawn(supervise(worker_id, ctx.clone())))
            .collect();
        Self { supervisors }
    }

    /// Wait for every executor to finish its current request and exit.
    pub async fn join(self) {
        for supervisor in self.supervisors {
            // Supervisors never panic themselves; a join error here means
            // the runtime is being torn down.
            let _ = supervisor.await;
        }
        debug!("worker pool stopped");
    }
}

/// Keep one executor slot occupied, respawning on panic. An untrusted
/// harness must not be able to shrink the pool.
async fn supervise(worker_id: usize, ctx: WorkerContext) {
    loop {
        let executor = tokio::spawn(executor_loop(worker_id, ctx.clone()));
        match executor.await {
            Ok(()) => break,
            Err(e) if e.is_panic() => {
                error!(worker_id, "executor panicked, respawning");
                if ctx.shutdown.is_triggered() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

async fn executor_loop(worker_id: usize, ctx: WorkerContext) {
    debug!(worker_id, "executor started");
    loop {
        let request = match ctx.queue.get().await {
            Ok(request) => request,
            Err(_) => break,
        };
        let result = execute_one(worker_id, &ctx, &request).await;
        ctx.router.deliver(result, request).await;
    }
    debug!(worker_id, "executor stopped");
}

/// One request through the sandbox lifecycle: create, run, destroy,
/// grade. Never returns an error; every failure mode becomes a result the
/// shepherd can record.
async fn execute_one(worker_id: usize, ctx: &WorkerContext, request: &TestRequest) -> TestResult {
    let request_id = request.request_id;
    info!(worker_id, request_id, harness = %request.harness, "executing request");

    let handle = match tokio::time::timeout(ctx.create_timeout, ctx.provider.create()).await {
        Ok(Ok(handle)) => handle,
        Ok(Err(e)) => {
            warn!(worker_id, request_id, error = %e, "sandbox allocation failed");
            return TestResult::infrastructure_failure(request_id, e);
        }
        Err(_) => {
            warn!(worker_id, request_id, "sandbox allocation timed out");
            return TestResult::infrastructure_failure(
                request_id,
                format!("sandbox allocation timed out after {:?}", ctx.create_timeout),
            );
        }
    };

    let outcome = tokio::select! {
        outcome = ctx.provider.run(handle, &request.argv(), &request.limits) => Some(outcome),
        _ = ctx.shutdown.triggered() => {
            debug!(worker_id, request_id, "run abandoned at shutdown");
            None
        }
    };

    // Unconditional teardown before the result is formed. A failed destroy
    // is logged and the handle left to the backend's foreign-instance
    // tolerance; the request still gets its result.
    if let Err(e) = ctx.provider.destroy(handle).await {
        warn!(worker_id, request_id, %handle, error = %e, "sandbox teardown failed");
    }

    match outcome {
        Some(Ok(exec)) => {
            debug!(worker_id, request_id, elapsed = ?exec.elapsed, "harness passed");
            TestResult::passed(request_id, &exec)
        }
        Some(Err(ExecError::Harness(exec))) => {
            debug!(worker_id, request_id, exit_code = exec.exit_code, "harness failed");
            TestResult::harness_failure(request_id, &exec)
        }
        Some(Err(e)) => {
            warn!(worker_id, request_id, error = %e, "harness execution error");
            TestResult::infrastructure_failure(request_id, e)
        }
        None => TestResult::infrastructure_failure(request_id, "cancelled by shutdown"),
    }
}
