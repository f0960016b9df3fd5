//! Invoker: runs a compiled artifact inside a leased container and turns
//! the raw captured output into a typed execution outcome.
//!
//! The artifact is placed at the fixed entry path, invoked once with the
//! opaque argument payload, and its stdout is split at the sentinel marker
//! into the user's output and the encoded return value. Timeouts, signals
//! and non-zero exits become failed invocations with diagnostic text,
//! never host-level crashes.

use serde_json::Value;
use tracing::debug;

use crate::codec::{self, EntrySignature};
use crate::compiler::CompiledArtifact;
use crate::error::PoolError;
use crate::formatter::RESULT_MARKER;
use crate::model::ExecutionError;
use crate::pool::{ContainerPool, Lease, RawExec};

/// Relative path the artifact is installed at inside a container; the
/// pool's exec transport invokes it as `/home/solution`.
const ARTIFACT_PATH: &str = "home/solution";

/// Exit code the generated harness uses for a caught panic.
const PANIC_EXIT_CODE: i32 = 101;

/// One execution request against a leased environment.
#[derive(Debug, Clone)]
pub struct InvokeRequest<'a> {
    pub artifact: &'a CompiledArtifact,
    pub signature: &'a EntrySignature,
    pub args: &'a [Value],
    pub expected: &'a Value,
    pub max_points: u32,
    pub timeout_ms: u64,
}

/// Typed outcome of one invocation: the internal execution response handed
/// back to the orchestrator.
#[derive(Debug, Clone)]
pub struct InvokeOutcome {
    pub passed: bool,
    /// Reported points; the orchestrator still caps them per test case.
    pub points: u32,
    pub returned: Value,
    pub stdout: String,
    pub stderr: String,
    pub errors: Vec<ExecutionError>,
    pub exit_code: Option<i32>,
    pub execution_time_ms: u64,
}

impl InvokeOutcome {
    /// The invocation completed without a fault; `returned` is meaningful.
    pub fn completed(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Compares the decoded return value with the expectation and reports full
/// or zero points. Faulted invocations never pass.
pub fn grade(outcome: &mut InvokeOutcome, expected: &Value, max_points: u32) {
    outcome.passed = outcome.completed() && outcome.returned == *expected;
    outcome.points = if outcome.passed { max_points } else { 0 };
}

/// Executes one request inside the leased environment.
pub async fn invoke(
    pool: &ContainerPool,
    lease: &Lease,
    request: InvokeRequest<'_>,
) -> Result<InvokeOutcome, PoolError> {
    let payload = codec::encode_payload(request.signature.params.as_slice(), request.args)
        .map_err(PoolError::Backend)?;

    pool.place_file(lease, ARTIFACT_PATH, request.artifact.bytes.clone(), 0o755)
        .await?;
    let raw = pool
        .exec_in_container(lease, payload, request.timeout_ms)
        .await?;

    debug!(
        container = %lease.container().id,
        exit_code = ?raw.exit_code,
        timed_out = raw.timed_out,
        "invocation finished"
    );
    let mut outcome = interpret(raw, request.signature.ret, request.timeout_ms);
    grade(&mut outcome, request.expected, request.max_points);
    Ok(outcome)
}

/// Maps a raw capture to the typed outcome. Pure so the marker splitting
/// and fault classification are testable without a container.
pub fn interpret(raw: RawExec, ret: Option<codec::ParamKind>, timeout_ms: u64) -> InvokeOutcome {
    let mut outcome = InvokeOutcome {
        passed: false,
        points: 0,
        returned: Value::Null,
        stdout: raw.stdout.clone(),
        stderr: raw.stderr,
        errors: Vec::new(),
        exit_code: raw.exit_code,
        execution_time_ms: raw.duration_ms,
    };

    if raw.timed_out {
        outcome.errors.push(ExecutionError::runtime(format!(
            "execution timed out after {timeout_ms}ms"
        )));
        return outcome;
    }
    if let Some(signal) = raw.signal {
        outcome
            .errors
            .push(ExecutionError::runtime(format!("terminated by signal {signal}")));
        return outcome;
    }
    match raw.exit_code {
        Some(0) => {}
        Some(PANIC_EXIT_CODE) => {
            let detail = last_panic_line(&outcome.stderr);
            outcome.errors.push(ExecutionError::runtime(detail));
            return outcome;
        }
        Some(code) => {
            outcome
                .errors
                .push(ExecutionError::runtime(format!("process exited with code {code}")));
            return outcome;
        }
        None => {
            outcome
                .errors
                .push(ExecutionError::runtime("process ended without exit status"));
            return outcome;
        }
    }

    let Some((user_stdout, result_text)) = split_at_marker(&raw.stdout) else {
        outcome
            .errors
            .push(ExecutionError::runtime("no result produced by entry point"));
        return outcome;
    };
    outcome.stdout = user_stdout;

    match codec::decode_returned(ret, &result_text) {
        Ok(value) => outcome.returned = value,
        Err(e) => outcome
            .errors
            .push(ExecutionError::runtime(format!("malformed result: {e}"))),
    }
    outcome
}

/// Extracts the panic message the default hook printed, falling back to a
/// generic description.
fn last_panic_line(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty() && !l.starts_with("note:"))
        .map(|l| l.trim().to_string())
        .unwrap_or_else(|| "entry point panicked".to_string())
}

/// Splits captured stdout at the last sentinel marker line. The harness
/// always emits a fresh newline before the marker; that one newline is
/// stripped back off the user's output.
fn split_at_marker(stdout: &str) -> Option<(String, String)> {
    let needle = format!("{RESULT_MARKER}\n");
    let mut search_end = stdout.len();
    loop {
        let idx = stdout[..search_end].rfind(&needle)?;
        let at_line_start = idx == 0 || stdout.as_bytes()[idx - 1] == b'\n';
        if at_line_start {
            let mut user = &stdout[..idx];
            user = user.strip_suffix('\n').unwrap_or(user);
            let result = &stdout[idx + needle.len()..];
            return Some((user.to_string(), result.to_string()));
        }
        search_end = idx;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ParamKind;
    use serde_json::json;

    fn raw(stdout: &str, stderr: &str, exit_code: Option<i32>) -> RawExec {
        RawExec {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code,
            signal: None,
            timed_out: false,
            duration_ms: 7,
        }
    }

    fn with_marker(user: &str, result: &str) -> String {
        format!("{user}\n{RESULT_MARKER}\n{result}")
    }

    #[test]
    fn splits_user_output_from_result() {
        let stdout = with_marker("hello\n", "42\n");
        let outcome = interpret(raw(&stdout, "", Some(0)), Some(ParamKind::Int), 1000);
        assert!(outcome.completed());
        assert_eq!(outcome.returned, json!(42));
        assert_eq!(outcome.stdout, "hello\n");
        assert_eq!(outcome.execution_time_ms, 7);
    }

    #[test]
    fn user_printed_marker_does_not_confuse_the_split() {
        let stdout = format!("{RESULT_MARKER}\nfake\n\n{RESULT_MARKER}\ntrue\n");
        let outcome = interpret(raw(&stdout, "", Some(0)), Some(ParamKind::Bool), 1000);
        assert!(outcome.completed());
        assert_eq!(outcome.returned, json!(true));
        assert_eq!(outcome.stdout, format!("{RESULT_MARKER}\nfake\n"));
    }

    #[test]
    fn timeout_is_a_failed_invocation() {
        let mut r = raw("", "", None);
        r.timed_out = true;
        let outcome = interpret(r, Some(ParamKind::Int), 250);
        assert!(!outcome.completed());
        assert!(outcome.errors[0].message.contains("timed out after 250ms"));
    }

    #[test]
    fn signal_is_a_failed_invocation() {
        let mut r = raw("", "", None);
        r.signal = Some(9);
        let outcome = interpret(r, None, 1000);
        assert!(!outcome.completed());
        assert!(outcome.errors[0].message.contains("signal 9"));
    }

    #[test]
    fn panic_exit_reports_the_panic_message() {
        let stderr = "thread 'main' panicked at solution.rs:12:5:\nstack guard: call stack budget exhausted\nnote: run with `RUST_BACKTRACE=1`";
        let outcome = interpret(raw("", stderr, Some(101)), Some(ParamKind::Int), 1000);
        assert!(!outcome.completed());
        assert!(outcome.errors[0].message.contains("stack guard"));
    }

    #[test]
    fn missing_marker_on_clean_exit_is_an_error() {
        let outcome = interpret(raw("just prints\n", "", Some(0)), Some(ParamKind::Int), 1000);
        assert!(!outcome.completed());
        assert!(outcome.errors[0].message.contains("no result produced"));
    }

    #[test]
    fn malformed_result_is_an_error() {
        let stdout = with_marker("", "not-a-number\n");
        let outcome = interpret(raw(&stdout, "", Some(0)), Some(ParamKind::Int), 1000);
        assert!(!outcome.completed());
        assert!(outcome.errors[0].message.contains("malformed result"));
    }

    #[test]
    fn unit_return_decodes_to_null() {
        let stdout = with_marker("done\n", "");
        let outcome = interpret(raw(&stdout, "", Some(0)), None, 1000);
        assert!(outcome.completed());
        assert_eq!(outcome.returned, Value::Null);
    }

    #[test]
    fn grading_reports_full_or_zero_points() {
        let stdout = with_marker("", "42\n");
        let mut outcome = interpret(raw(&stdout, "", Some(0)), Some(ParamKind::Int), 1000);
        grade(&mut outcome, &json!(42), 7);
        assert!(outcome.passed);
        assert_eq!(outcome.points, 7);
        grade(&mut outcome, &json!(41), 7);
        assert!(!outcome.passed);
        assert_eq!(outcome.points, 0);
    }

    #[test]
    fn faulted_invocations_never_pass_grading() {
        let mut r = raw("", "", None);
        r.timed_out = true;
        let mut outcome = interpret(r, Some(ParamKind::Int), 100);
        grade(&mut outcome, &Value::Null, 5);
        assert!(!outcome.passed);
        assert_eq!(outcome.points, 0);
    }
}
