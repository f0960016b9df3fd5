//! Core data model: tasks, test cases, submissions and per-test results.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Default per-test wall-clock timeout when a task does not set one.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Default entry function name looked up in submitted code.
pub const DEFAULT_ENTRY_POINT: &str = "solve";

/// A judging task: an entry-point convention plus an ordered list of test cases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    /// Name of the function the submission must define.
    #[serde(default = "default_entry_point")]
    pub entry_point: String,
    /// Default wall-clock timeout per test case, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub test_cases: Vec<TestCase>,
}

fn default_entry_point() -> String {
    DEFAULT_ENTRY_POINT.to_string()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// A single input/expected-output pair with a point value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub id: Uuid,
    /// Positional arguments passed to the entry function.
    pub args: Vec<serde_json::Value>,
    /// Value the entry function must return for the case to pass.
    pub expected: serde_json::Value,
    pub max_points: u32,
    /// Hidden cases must not leak input/expected to non-owners; the judge
    /// carries the flag through so collaborators can filter.
    #[serde(default = "default_visible")]
    pub is_visible: bool,
    /// Per-case timeout override; falls back to the task default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_visible() -> bool {
    true
}

impl TestCase {
    /// Effective wall-clock timeout for this case under the given task default.
    pub fn effective_timeout_ms(&self, task_default_ms: u64) -> u64 {
        self.timeout_ms.unwrap_or(task_default_ms)
    }
}

/// Terminal and non-terminal submission states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubmissionStatus {
    /// Queued or evaluating.
    Pending,
    /// Every test case passed.
    Accepted,
    /// At least one case failed, with no crash signal anywhere in the batch.
    Rejected,
    /// Setup failure, or a runtime fault/exception signal in some result.
    Error,
}

impl SubmissionStatus {
    /// Returns `true` once the submission can no longer transition.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SubmissionStatus::Pending)
    }

    /// Wire spelling shared by the JSON and gRPC surfaces.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Accepted => "accepted",
            SubmissionStatus::Rejected => "rejected",
            SubmissionStatus::Error => "error",
        }
    }
}

/// One user's attempt at a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub task_id: Uuid,
    pub code: String,
    pub status: SubmissionStatus,
    /// Aggregate score in [0, 100]; `None` until evaluation finishes.
    pub score: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub execute_started_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub execute_finished_at: Option<OffsetDateTime>,
}

impl Submission {
    pub fn new(task_id: Uuid, user_id: Option<String>, code: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            task_id,
            code,
            status: SubmissionStatus::Pending,
            score: None,
            submitted_at: OffsetDateTime::now_utc(),
            execute_started_at: None,
            execute_finished_at: None,
        }
    }

    /// Derived flag: the submission solved the task outright.
    pub fn is_solved(&self, results: &[TestResult]) -> bool {
        self.status == SubmissionStatus::Accepted
            && !results.is_empty()
            && results.iter().all(|r| r.passed)
    }
}

/// Where an execution error originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    CompileTime,
    Runtime,
}

/// Source location of a diagnostic; 1-based lines and columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpan {
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
    pub file_path: String,
}

/// A compile-time or runtime error attached to a test result or a setup
/// failure. Compile-time errors carry a span; runtime errors may not.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<SourceSpan>,
    pub message: String,
}

impl ExecutionError {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Runtime,
            span: None,
            message: message.into(),
        }
    }
}

/// Outcome of running one test case against a submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub test_case_id: Uuid,
    pub passed: bool,
    /// Capped so that `points <= max_points` of the test case.
    pub points: u32,
    pub execution_time_ms: u64,
    pub stdout: String,
    pub stderr: String,
    pub errors: Vec<ExecutionError>,
    pub exit_code: Option<i32>,
    pub returned: serde_json::Value,
    /// Carried over from the test case for collaborator-side filtering.
    pub is_visible: bool,
}

impl TestResult {
    /// Synthesized zero-point failure for a case that produced no result
    /// (partial batch failure) or could not be dispatched.
    pub fn failed(case: &TestCase, message: impl Into<String>) -> Self {
        Self {
            test_case_id: case.id,
            passed: false,
            points: 0,
            execution_time_ms: 0,
            stdout: String::new(),
            stderr: String::new(),
            errors: vec![ExecutionError::runtime(message)],
            exit_code: None,
            returned: serde_json::Value::Null,
            is_visible: case.is_visible,
        }
    }

    /// True when this result carries a crash signal (stderr output or any
    /// recorded execution error).
    pub fn has_fault_signal(&self) -> bool {
        !self.stderr.trim().is_empty() || !self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!SubmissionStatus::Pending.is_terminal());
        assert!(SubmissionStatus::Accepted.is_terminal());
        assert!(SubmissionStatus::Rejected.is_terminal());
        assert!(SubmissionStatus::Error.is_terminal());
    }

    #[test]
    fn status_serde_roundtrip() {
        let json = serde_json::to_string(&SubmissionStatus::Rejected).unwrap();
        assert_eq!(json, r#""rejected""#);
        let back: SubmissionStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SubmissionStatus::Rejected);
    }

    #[test]
    fn effective_timeout_falls_back_to_task_default() {
        let mut case = TestCase {
            id: Uuid::new_v4(),
            args: vec![],
            expected: serde_json::Value::Null,
            max_points: 5,
            is_visible: true,
            timeout_ms: None,
        };
        assert_eq!(case.effective_timeout_ms(3000), 3000);
        case.timeout_ms = Some(250);
        assert_eq!(case.effective_timeout_ms(3000), 250);
    }

    #[test]
    fn task_deserializes_with_defaults() {
        let task: Task = serde_json::from_str(
            r#"{"id":"6f4e2c3a-11d2-4b1a-9f60-1f2d3c4b5a69","testCases":[]}"#,
        )
        .unwrap();
        assert_eq!(task.entry_point, "solve");
        assert_eq!(task.timeout_ms, DEFAULT_TIMEOUT_MS);
    }

    #[test]
    fn fault_signal_detection() {
        let case = TestCase {
            id: Uuid::new_v4(),
            args: vec![],
            expected: serde_json::Value::Null,
            max_points: 5,
            is_visible: false,
            timeout_ms: None,
        };
        let clean = TestResult {
            stderr: String::new(),
            errors: vec![],
            ..TestResult::failed(&case, "x")
        };
        assert!(!clean.has_fault_signal());
        let failed = TestResult::failed(&case, "timed out");
        assert!(failed.has_fault_signal());
        assert!(!failed.is_visible);
    }
}
