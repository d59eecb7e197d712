//! Test request and result types.
//!
//! A [`TestRequest`] is created by the control channel when the shepherd
//! assigns work, consumed exactly once by exactly one worker, and answered
//! with a [`TestResult`]. Results that cannot be delivered because the
//! shepherd session is down travel as [`OrphanedResult`] pairs so the
//! original request stays attached for idempotent resubmission.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::provider::Execution;

/// Per-request resource caps applied by the sandbox provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum resident memory in bytes.
    pub memory_bytes: u64,
    /// CPU ceiling as a fraction of one core (e.g. 0.5 = 50%).
    pub cpu_fraction: f64,
    /// Wall-clock deadline for the harness run, in seconds.
    pub timeout_secs: u64,
    /// Maximum number of spawned processes/threads.
    pub max_pids: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 256 * 1024 * 1024, // 256 MiB
            cpu_fraction: 1.0,
            timeout_secs: 300,
            max_pids: Some(64),
        }
    }
}

/// A unit of work assigned by the shepherd.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRequest {
    /// Unique id assigned by the shepherd; the resubmission idempotency key.
    pub request_id: u64,
    /// Reference to the test harness to execute.
    pub harness: String,
    /// Reference to the submission payload under test.
    pub submission: String,
    /// Resource caps for the sandbox run.
    #[serde(default)]
    pub limits: ResourceLimits,
    /// When this worker received the assignment. Stamped by the control
    /// channel, not the shepherd.
    #[serde(default = "SystemTime::now")]
    pub received_at: SystemTime,
}

impl TestRequest {
    /// Create a request with default limits, stamped now.
    pub fn new(request_id: u64, harness: impl Into<String>, submission: impl Into<String>) -> Self {
        Self {
            request_id,
            harness: harness.into(),
            submission: submission.into(),
            limits: ResourceLimits::default(),
            received_at: SystemTime::now(),
        }
    }

    /// The argv run inside the sandbox: the harness invoked on the submission.
    pub fn argv(&self) -> Vec<String> {
        vec![self.harness.clone(), self.submission.clone()]
    }
}

/// The graded outcome of one test request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub request_id: u64,
    pub score: f64,
    pub max_score: f64,
    pub stdout: String,
    pub stderr: String,
    /// Harness exit status; `None` when the harness never ran.
    pub exit_status: Option<i32>,
    pub completed_at: SystemTime,
    /// True when the request failed for any reason (harness non-zero exit,
    /// provisioning failure, timeout, or cancellation).
    pub failed: bool,
}

impl TestResult {
    /// Result for a harness that ran to completion with exit status 0.
    pub fn passed(request_id: u64, exec: &Execution) -> Self {
        Self {
            request_id,
            score: 1.0,
            max_score: 1.0,
            stdout: exec.stdout.clone(),
            stderr: exec.stderr.clone(),
            exit_status: Some(exec.exit_code),
            completed_at: SystemTime::now(),
            failed: false,
        }
    }

    /// Result for a harness that ran but exited abnormally. This is graded
    /// data, not a system fault.
    pub fn harness_failure(request_id: u64, exec: &Execution) -> Self {
        Self {
            request_id,
            score: 0.0,
            max_score: 1.0,
            stdout: exec.stdout.clone(),
            stderr: exec.stderr.clone(),
            exit_status: Some(exec.exit_code),
            completed_at: SystemTime::now(),
            failed: true,
        }
    }

    /// Result for a request whose harness never produced an exit status
    /// (provisioning failure, run timeout, or cancellation).
    pub fn infrastructure_failure(request_id: u64, reason: impl std::fmt::Display) -> Self {
        Self {
            request_id,
            score: 0.0,
            max_score: 1.0,
            stdout: String::new(),
            stderr: reason.to_string(),
            exit_status: None,
            completed_at: SystemTime::now(),
            failed: true,
        }
    }
}

/// A result produced while no shepherd session was live, held together with
/// its originating request until redelivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanedResult {
    pub result: TestResult,
    pub request: TestRequest,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(exit_code: i32) -> Execution {
        Execution {
            exit_code,
            stdout: "out".to_string(),
            stderr: "err".to_string(),
            elapsed: std::time::Duration::from_millis(10),
        }
    }

    #[test]
    fn test_request_argv() {
        let req = TestRequest::new(7, "/opt/harness/run.sh", "/srv/submissions/42.tar");
        assert_eq!(
            req.argv(),
            vec![
                "/opt/harness/run.sh".to_string(),
                "/srv/submissions/42.tar".to_string()
            ]
        );
    }

    #[test]
    fn test_passed_result() {
        let result = TestResult::passed(1, &exec(0));
        assert!(!result.failed);
        assert_eq!(result.exit_status, Some(0));
        assert_eq!(result.score, result.max_score);
    }

    #[test]
    fn test_harness_failure_is_data() {
        let result = TestResult::harness_failure(2, &exec(3));
        assert!(result.failed);
        assert_eq!(result.exit_status, Some(3));
        assert_eq!(result.score, 0.0);
        assert_eq!(result.stdout, "out");
    }

    #[test]
    fn test_infrastructure_failure_has_no_exit_status() {
        let result = TestResult::infrastructure_failure(3, "sandbox allocation timed out");
        assert!(result.failed);
        assert_eq!(result.exit_status, None);
        assert!(result.stderr.contains("timed out"));
    }

    #[test]
    fn test_request_deserializes_without_received_at() {
        // The shepherd does not send received_at; the worker stamps it.
        let json = r#"{"request_id":9,"harness":"h","submission":"s"}"#;
        let req: TestRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.request_id, 9);
        assert_eq!(req.limits, ResourceLimits::default());
    }
}
