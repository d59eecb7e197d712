//! Docker container sandbox backend.
//!
//! Each sandbox is a long-lived container named `merino-<handle>` started
//! with `docker run --detach`, with harness commands injected through
//! `docker exec`. The Docker daemon owns the container list, so foreign
//! containers (other workers sharing the daemon, operators poking around)
//! are visible to `list` and can appear or vanish between calls.
//!
//! ## Isolation guarantees
//!
//! | Feature | Implementation |
//! |---------|---------------|
//! | Memory limits | `--memory`, `--memory-swap` |
//! | CPU limits | `--cpus` |
//! | PID limits | `--pids-limit` |
//! | Network | `--network none` |
//! | Timeout | exec killed after wall-clock deadline |
//! | Cleanup | `docker rm -f`, tolerant of already-gone containers |

use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;

use crate::BoxFuture;
use crate::job::ResourceLimits;

use super::{
    ExecError, Execution, HandleRange, ProvisionError, SandboxHandle, SandboxProvider,
};

/// Container-name prefix shared by every merino worker on the daemon.
const NAME_PREFIX: &str = "merino-";

/// Docker CLI sandbox provider.
pub struct DockerProvider {
    /// Docker CLI binary path.
    docker_bin: PathBuf,
    /// Container image harnesses run inside.
    image: String,
    range: HandleRange,
    create_limits: ResourceLimits,
    run_timeout: Duration,
}

impl DockerProvider {
    pub fn new(
        docker_bin: impl Into<PathBuf>,
        image: impl Into<String>,
        range: HandleRange,
        run_timeout: Duration,
    ) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            image: image.into(),
            range,
            // Container-level limits are fixed at creation time; the
            // per-request deadline is enforced at exec time instead.
            create_limits: ResourceLimits::default(),
            run_timeout,
        }
    }

    fn container_name(handle: SandboxHandle) -> String {
        format!("{NAME_PREFIX}{handle}")
    }

    fn parse_handle(name: &str) -> Option<SandboxHandle> {
        name.strip_prefix(NAME_PREFIX)?
            .parse::<u32>()
            .ok()
            .map(SandboxHandle)
    }

    /// Parse `docker ps --format {{.Names}}` output into handles, ignoring
    /// containers that are not ours.
    fn parse_names(stdout: &str) -> Vec<SandboxHandle> {
        let mut handles: Vec<_> = stdout.lines().filter_map(Self::parse_handle).collect();
        handles.sort_unstable();
        handles
    }

    /// Build the `docker run` argument list for a fresh sandbox container.
    fn create_args(&self, handle: SandboxHandle) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--init".to_string(),
            "--name".to_string(),
            Self::container_name(handle),
            "--network".to_string(),
            "none".to_string(),
        ];

        let cpu = format!("{:.2}", self.create_limits.cpu_fraction);
        args.extend(["--cpus".to_string(), cpu]);

        let mem = format!("{}m", self.create_limits.memory_bytes / (1024 * 1024));
        args.extend(["--memory".to_string(), mem.clone()]);
        args.extend(["--memory-swap".to_string(), mem]);

        if let Some(max_pids) = self.create_limits.max_pids {
            args.extend(["--pids-limit".to_string(), max_pids.to_string()]);
        }

        args.push(self.image.clone());

        // Keep the container alive until `destroy` so exec has a target.
        args.extend(["sleep".to_string(), "infinity".to_string()]);

        args
    }

    fn exec_args(handle: SandboxHandle, command: &[String]) -> Vec<String> {
        let mut args = vec!["exec".to_string(), Self::container_name(handle)];
        args.extend(command.iter().cloned());
        args
    }

    fn remove_args(handle: SandboxHandle) -> Vec<String> {
        vec![
            "rm".to_string(),
            "--force".to_string(),
            Self::container_name(handle),
        ]
    }

    fn list_args() -> Vec<String> {
        vec![
            "ps".to_string(),
            "--all".to_string(),
            "--format".to_string(),
            "{{.Names}}".to_string(),
        ]
    }

    async fn invoke(
        &self,
        args: &[String],
        timeout: Option<Duration>,
    ) -> Result<std::process::Output, String> {
        let child = tokio::process::Command::new(&self.docker_bin)
            .args(args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to spawn docker: {e}"))?;

        match timeout {
            Some(dur) => match tokio::time::timeout(dur, child.wait_with_output()).await {
                Ok(result) => result.map_err(|e| format!("docker wait failed: {e}")),
                Err(_) => Err(format!("docker invocation exceeded {dur:?}")),
            },
            None => child
                .wait_with_output()
                .await
                .map_err(|e| format!("docker wait failed: {e}")),
        }
    }
}

impl SandboxProvider for DockerProvider {
    fn name(&self) -> &str {
        "docker"
    }

    fn range(&self) -> HandleRange {
        self.range
    }

    fn list(
        &self,
        include_foreign: bool,
    ) -> BoxFuture<'_, Result<Vec<SandboxHandle>, ProvisionError>> {
        Box::pin(async move {
            let output = self
                .invoke(&Self::list_args(), None)
                .await
                .map_err(ProvisionError::Backend)?;
            if !output.status.success() {
                return Err(ProvisionError::Backend(format!(
                    "docker ps failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            let mut handles = Self::parse_names(&String::from_utf8_lossy(&output.stdout));
            if !include_foreign {
                handles.retain(|h| self.range.contains(*h));
            }
            Ok(handles)
        })
    }

    fn create(&self) -> BoxFuture<'_, Result<SandboxHandle, ProvisionError>> {
        Box::pin(async move {
            // Fresh daemon snapshot on every allocation; other workers may
            // be claiming names concurrently.
            let in_use = self.list(true).await?;
            for handle in self.range.iter() {
                if in_use.contains(&handle) {
                    continue;
                }
                let output = self
                    .invoke(&self.create_args(handle), None)
                    .await
                    .map_err(ProvisionError::Backend)?;
                if output.status.success() {
                    debug!(%handle, "sandbox container created");
                    return Ok(handle);
                }
                let stderr = String::from_utf8_lossy(&output.stderr);
                // A racer claimed the name between the snapshot and our
                // `docker run`; try the next handle.
                if stderr.contains("is already in use") {
                    continue;
                }
                return Err(ProvisionError::Backend(format!(
                    "docker run failed: {}",
                    stderr.trim()
                )));
            }
            Err(ProvisionError::Exhausted(self.range.len()))
        })
    }

    fn destroy(&self, handle: SandboxHandle) -> BoxFuture<'_, Result<(), ProvisionError>> {
        Box::pin(async move {
            let output = self
                .invoke(&Self::remove_args(handle), None)
                .await
                .map_err(ProvisionError::Backend)?;
            if output.status.success() {
                debug!(%handle, "sandbox container removed");
                return Ok(());
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Already gone (crashed, or an operator beat us to it):
            // idempotent success.
            if stderr.contains("No such container") {
                debug!(%handle, "sandbox container already gone");
                return Ok(());
            }
            Err(ProvisionError::Backend(format!(
                "docker rm failed: {}",
                stderr.trim()
            )))
        })
    }

    fn run(
        &self,
        handle: SandboxHandle,
        command: &[String],
        limits: &ResourceLimits,
    ) -> BoxFuture<'_, Result<Execution, ExecError>> {
        let args = Self::exec_args(handle, command);
        let timeout = if limits.timeout_secs > 0 {
            Duration::from_secs(limits.timeout_secs)
        } else {
            self.run_timeout
        };
        Box::pin(async move {
            let start = std::time::Instant::now();
            let output = self.invoke(&args, Some(timeout)).await.map_err(|e| {
                if e.contains("exceeded") {
                    ExecError::Timeout(timeout)
                } else {
                    ExecError::Backend(e)
                }
            })?;

            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            // The container may have been removed out from under us between
            // create and exec.
            if !output.status.success() && stderr.contains("No such container") {
                return Err(ExecError::NoSuchSandbox(handle));
            }

            let exec = Execution {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr,
                elapsed: start.elapsed(),
            };
            if exec.success() {
                Ok(exec)
            } else {
                // `docker exec` propagates the command's exit status.
                Err(ExecError::Harness(exec))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> DockerProvider {
        DockerProvider::new(
            "docker",
            "alpine:latest",
            HandleRange::new(42000, 42999),
            Duration::from_secs(300),
        )
    }

    #[test]
    fn test_docker_provider_name() {
        let p = provider();
        assert_eq!(p.name(), "docker");
        assert_eq!(p.image, "alpine:latest");
    }

    #[test]
    fn test_create_args_shape() {
        let p = provider();
        let args = p.create_args(SandboxHandle(42007));

        assert_eq!(args[0], "run");
        assert!(args.contains(&"--detach".to_string()));
        assert!(args.contains(&"merino-42007".to_string()));
        let net_idx = args.iter().position(|a| a == "--network").unwrap();
        assert_eq!(args[net_idx + 1], "none");
        assert!(args.contains(&"--memory".to_string()));
        assert!(args.contains(&"--pids-limit".to_string()));
        // Image precedes the keep-alive command.
        let image_idx = args.iter().position(|a| a == "alpine:latest").unwrap();
        assert_eq!(args[image_idx + 1], "sleep");
        assert_eq!(args[image_idx + 2], "infinity");
    }

    #[test]
    fn test_exec_args_shape() {
        let args = DockerProvider::exec_args(
            SandboxHandle(42000),
            &["sh".to_string(), "grade.sh".to_string()],
        );
        assert_eq!(args, vec!["exec", "merino-42000", "sh", "grade.sh"]);
    }

    #[test]
    fn test_remove_args_shape() {
        let args = DockerProvider::remove_args(SandboxHandle(42001));
        assert_eq!(args, vec!["rm", "--force", "merino-42001"]);
    }

    #[test]
    fn test_parse_names_ignores_foreign_containers() {
        let stdout = "merino-42003\npostgres\nmerino-42001\nmerino-notanumber\nweb-1\n";
        let handles = DockerProvider::parse_names(stdout);
        assert_eq!(handles, vec![SandboxHandle(42001), SandboxHandle(42003)]);
    }

    #[test]
    fn test_parse_names_empty_output() {
        assert!(DockerProvider::parse_names("").is_empty());
    }
}
