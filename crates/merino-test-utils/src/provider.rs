//! Scripted in-memory sandbox provider with fault injection.
//!
//! [`ScriptedProvider`] never touches the host: sandboxes are entries in a
//! set, and run outcomes are scripted per harness name. Tests use it to
//! exercise teardown guarantees (create/destroy ledgers), reserved-range
//! behavior with foreign instances, and mid-run cancellation (hanging
//! harnesses).

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use merino_core::BoxFuture;
use merino_core::job::ResourceLimits;
use merino_core::provider::{
    ExecError, Execution, HandleRange, ProvisionError, SandboxHandle, SandboxProvider,
};

/// Scripted outcome for a `run` call, keyed by harness name.
#[derive(Debug, Clone)]
pub enum RunScript {
    /// Exit 0 with the given stdout.
    Pass(String),
    /// Non-zero exit with the given status and stderr.
    Fail(i32, String),
    /// Never completes; only a cancelled or timed-out caller returns.
    Hang,
}

#[derive(Default)]
struct Ledger {
    live: BTreeSet<u32>,
    foreign: BTreeSet<u32>,
    created: Vec<SandboxHandle>,
    destroyed: Vec<SandboxHandle>,
    fail_next_create: Option<String>,
    scripts: HashMap<String, RunScript>,
}

/// In-memory [`SandboxProvider`] for tests.
///
/// Unscripted harnesses pass with empty output.
pub struct ScriptedProvider {
    range: HandleRange,
    ledger: Mutex<Ledger>,
}

impl ScriptedProvider {
    pub fn new(range: HandleRange) -> Self {
        Self {
            range,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Make the next `create` call fail with a backend error.
    pub fn fail_next_create(&self, reason: &str) {
        self.lock().fail_next_create = Some(reason.to_string());
    }

    /// Script the outcome of `run` for a given harness name.
    pub fn script_run(&self, harness: &str, script: RunScript) {
        self.lock().scripts.insert(harness.to_string(), script);
    }

    /// Register a sandbox owned by some other actor on the same backend.
    pub fn add_foreign(&self, handle: u32) {
        self.lock().foreign.insert(handle);
    }

    /// Simulate an external actor removing a live sandbox.
    pub fn remove_externally(&self, handle: SandboxHandle) {
        self.lock().live.remove(&handle.0);
    }

    /// Every handle `create` has returned, in order.
    pub fn created(&self) -> Vec<SandboxHandle> {
        self.lock().created.clone()
    }

    /// Every handle `destroy` has been called with, in order.
    pub fn destroyed(&self) -> Vec<SandboxHandle> {
        self.lock().destroyed.clone()
    }

    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SandboxProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn range(&self) -> HandleRange {
        self.range
    }

    fn list(
        &self,
        include_foreign: bool,
    ) -> BoxFuture<'_, Result<Vec<SandboxHandle>, ProvisionError>> {
        Box::pin(async move {
            let ledger = self.lock();
            let mut handles: Vec<SandboxHandle> = ledger
                .live
                .iter()
                .chain(ledger.foreign.iter())
                .copied()
                .map(SandboxHandle)
                .collect();
            if !include_foreign {
                handles.retain(|h| self.range.contains(*h));
            }
            handles.sort_unstable();
            handles.dedup();
            Ok(handles)
        })
    }

    fn create(&self) -> BoxFuture<'_, Result<SandboxHandle, ProvisionError>> {
        Box::pin(async move {
            let mut ledger = self.lock();
            if let Some(reason) = ledger.fail_next_create.take() {
                return Err(ProvisionError::Backend(reason));
            }
            for handle in self.range.iter() {
                if ledger.live.contains(&handle.0) || ledger.foreign.contains(&handle.0) {
                    continue;
                }
                ledger.live.insert(handle.0);
                ledger.created.push(handle);
                return Ok(handle);
            }
            Err(ProvisionError::Exhausted(self.range.len()))
        })
    }

    fn destroy(&self, handle: SandboxHandle) -> BoxFuture<'_, Result<(), ProvisionError>> {
        Box::pin(async move {
            let mut ledger = self.lock();
            // Idempotent like the real backends, but every call is recorded
            // so tests can assert exactly-once teardown.
            ledger.live.remove(&handle.0);
            ledger.destroyed.push(handle);
            Ok(())
        })
    }

    fn run(
        &self,
        handle: SandboxHandle,
        command: &[String],
        _limits: &ResourceLimits,
    ) -> BoxFuture<'_, Result<Execution, ExecError>> {
        let harness = command.first().cloned().unwrap_or_default();
        Box::pin(async move {
            let script = {
                let ledger = self.lock();
                if !ledger.live.contains(&handle.0) {
                    return Err(ExecError::NoSuchSandbox(handle));
                }
                ledger.scripts.get(&harness).cloned()
            };
            match script {
                None => Ok(Execution {
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                    elapsed: Duration::from_millis(1),
                }),
                Some(RunScript::Pass(stdout)) => Ok(Execution {
                    exit_code: 0,
                    stdout,
                    stderr: String::new(),
                    elapsed: Duration::from_millis(1),
                }),
                Some(RunScript::Fail(exit_code, stderr)) => Err(ExecError::Harness(Execution {
                    exit_code,
                    stdout: String::new(),
                    stderr,
                    elapsed: Duration::from_millis(1),
                })),
                Some(RunScript::Hang) => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        })
    }
}
