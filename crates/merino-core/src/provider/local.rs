//! Local process sandbox backend.
//!
//! Development and test backend: each sandbox is a scratch directory under a
//! configured root, and `run` spawns the command directly on the host with
//! that directory as its working directory. Resource limits are logged but
//! not enforced (the timeout is). **Never use in production.**
//!
//! The filesystem is the source of truth for which handles exist, so the
//! backend inherits the same external-race behavior as a real one: another
//! process adding or removing directories under the root is observed at call
//! time, not from a cached snapshot.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, warn};

use crate::BoxFuture;
use crate::job::ResourceLimits;

use super::{
    ExecError, Execution, HandleRange, ProvisionError, SandboxHandle, SandboxProvider,
};

/// Directory-name prefix for sandboxes managed by any merino worker.
const DIR_PREFIX: &str = "merino-";

/// Scratch-directory sandbox provider.
pub struct LocalProvider {
    root: PathBuf,
    range: HandleRange,
    run_timeout: Duration,
}

impl LocalProvider {
    pub fn new(root: impl Into<PathBuf>, range: HandleRange, run_timeout: Duration) -> Self {
        Self {
            root: root.into(),
            range,
            run_timeout,
        }
    }

    fn dir_for(&self, handle: SandboxHandle) -> PathBuf {
        self.root.join(format!("{DIR_PREFIX}{handle}"))
    }

    fn parse_handle(name: &str) -> Option<SandboxHandle> {
        name.strip_prefix(DIR_PREFIX)?
            .parse::<u32>()
            .ok()
            .map(SandboxHandle)
    }

    /// Scan the root for sandbox directories. Missing root means no
    /// sandboxes, not an error.
    async fn scan(&self) -> Result<Vec<SandboxHandle>, ProvisionError> {
        let mut handles = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(handles),
            Err(e) => return Err(ProvisionError::Backend(format!("read_dir failed: {e}"))),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ProvisionError::Backend(format!("read_dir failed: {e}")))?
        {
            if let Some(handle) = Self::parse_handle(&entry.file_name().to_string_lossy()) {
                handles.push(handle);
            }
        }
        handles.sort_unstable();
        Ok(handles)
    }
}

impl SandboxProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn range(&self) -> HandleRange {
        self.range
    }

    fn list(
        &self,
        include_foreign: bool,
    ) -> BoxFuture<'_, Result<Vec<SandboxHandle>, ProvisionError>> {
        Box::pin(async move {
            let mut handles = self.scan().await?;
            if !include_foreign {
                handles.retain(|h| self.range.contains(*h));
            }
            Ok(handles)
        })
    }

    fn create(&self) -> BoxFuture<'_, Result<SandboxHandle, ProvisionError>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&self.root)
                .await
                .map_err(|e| ProvisionError::Backend(format!("create root failed: {e}")))?;

            // Fresh scan on every attempt: another actor may be allocating
            // in the same directory concurrently.
            let in_use = self.scan().await?;
            for handle in self.range.iter() {
                if in_use.contains(&handle) {
                    continue;
                }
                // create_dir (not create_dir_all) fails if a racer claimed
                // the handle between the scan and now; move on to the next.
                match tokio::fs::create_dir(self.dir_for(handle)).await {
                    Ok(()) => {
                        debug!(%handle, "sandbox directory created");
                        return Ok(handle);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                    Err(e) => {
                        return Err(ProvisionError::Backend(format!(
                            "create sandbox dir failed: {e}"
                        )));
                    }
                }
            }
            Err(ProvisionError::Exhausted(self.range.len()))
        })
    }

    fn destroy(&self, handle: SandboxHandle) -> BoxFuture<'_, Result<(), ProvisionError>> {
        Box::pin(async move {
            match tokio::fs::remove_dir_all(self.dir_for(handle)).await {
                Ok(()) => {
                    debug!(%handle, "sandbox directory removed");
                    Ok(())
                }
                // Already gone: idempotent success.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(ProvisionError::Backend(format!(
                    "remove sandbox dir failed: {e}"
                ))),
            }
        })
    }

    fn run(
        &self,
        handle: SandboxHandle,
        command: &[String],
        limits: &ResourceLimits,
    ) -> BoxFuture<'_, Result<Execution, ExecError>> {
        let command = command.to_vec();
        let timeout = if limits.timeout_secs > 0 {
            Duration::from_secs(limits.timeout_secs)
        } else {
            self.run_timeout
        };
        Box::pin(async move {
            let workdir = self.dir_for(handle);
            // Existence re-checked at call time rather than trusting an
            // earlier list().
            if !tokio::fs::try_exists(&workdir).await.unwrap_or(false) {
                return Err(ExecError::NoSuchSandbox(handle));
            }
            let Some((program, args)) = command.split_first() else {
                return Err(ExecError::Backend("command must not be empty".to_string()));
            };

            warn!(%handle, "running harness WITHOUT isolation (local backend)");

            let start = std::time::Instant::now();
            let child = tokio::process::Command::new(program)
                .args(args)
                .current_dir(&workdir)
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| ExecError::Backend(format!("spawn failed: {e}")))?;

            let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return Err(ExecError::Backend(format!("wait failed: {e}"))),
                Err(_) => return Err(ExecError::Timeout(timeout)),
            };

            let exec = Execution {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                elapsed: start.elapsed(),
            };
            if exec.success() {
                Ok(exec)
            } else {
                Err(ExecError::Harness(exec))
            }
        })
    }
}
