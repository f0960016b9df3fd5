//! Judge orchestrator: prepares a submission, dispatches one execution per
//! test case against the container pool, aligns and aggregates the results,
//! and drives the submission state machine.
//!
//! Setup failures (parse, signature validation, compilation) short-circuit
//! to a terminal `Error` without touching the pool. Per-test faults and
//! timeouts are contained to their own result; the evaluation task boundary
//! converts any unexpected error or panic into `Error` so no submission is
//! ever left `Pending` by a live process.

use std::sync::Arc;

use futures_util::future::join_all;
use futures_util::FutureExt;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::codec::EntrySignature;
use crate::compiler::{CompiledArtifact, Compiler};
use crate::error::SetupError;
use crate::formatter;
use crate::invoker::{self, InvokeOutcome, InvokeRequest};
use crate::model::{
    ErrorKind, ExecutionError, SourceSpan, Submission, SubmissionStatus, Task, TestCase, TestResult,
};
use crate::pool::ContainerPool;
use crate::rewriter;
use crate::store::AppState;

/// A submission that survived setup: compiled artifact plus the resolved
/// entry signature.
#[derive(Debug, Clone)]
pub struct PreparedSubmission {
    pub artifact: CompiledArtifact,
    pub signature: EntrySignature,
}

pub struct Judge {
    pool: Arc<ContainerPool>,
    compiler: Compiler,
}

impl Judge {
    pub fn new(pool: Arc<ContainerPool>, compiler: Compiler) -> Self {
        Self { pool, compiler }
    }

    /// Setup stage: parse, resolve the entry signature, validate every test
    /// case's arguments (arity fails fast), format, instrument, compile.
    /// No execution environment is touched here.
    pub async fn prepare(&self, task: &Task, code: &str) -> Result<PreparedSubmission, SetupError> {
        let signature = {
            let file = syn::parse_file(code)
                .map_err(|e| SetupError::Compile(vec![parse_error_to_diagnostic(&e)]))?;

            EntrySignature::extract(&file, &task.entry_point)
                .map_err(SetupError::Validation)?
        };
        for case in &task.test_cases {
            signature
                .validate_args(&case.args)
                .map_err(SetupError::Validation)?;
        }

        let unit = formatter::format_unit(code, &signature);
        let instrumented = rewriter::rewrite_unit(&unit)
            .map_err(|e| SetupError::Internal(format!("instrumentation failed: {e}")))?;
        let artifact = self.compiler.compile(instrumented).await?;

        Ok(PreparedSubmission { artifact, signature })
    }

    /// Dispatches one execution request per test case. Futures are joined
    /// in task order, so results align back to test cases by position
    /// regardless of completion order; a short batch is padded with
    /// zero-point failures.
    pub async fn run_tests(&self, task: &Task, prepared: &PreparedSubmission) -> Vec<TestResult> {
        let runs = task
            .test_cases
            .iter()
            .map(|case| self.run_case(task, prepared, case));
        let results = join_all(runs).await;
        align_results(&task.test_cases, results)
    }

    async fn run_case(
        &self,
        task: &Task,
        prepared: &PreparedSubmission,
        case: &TestCase,
    ) -> TestResult {
        let timeout_ms = case.effective_timeout_ms(task.timeout_ms);

        let lease = match self.pool.acquire().await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(test_case = %case.id, error = %e, "no execution environment");
                return TestResult::failed(case, format!("no execution environment: {e}"));
            }
        };

        let outcome = invoker::invoke(
            &self.pool,
            &lease,
            InvokeRequest {
                artifact: &prepared.artifact,
                signature: &prepared.signature,
                args: &case.args,
                expected: &case.expected,
                max_points: case.max_points,
                timeout_ms,
            },
        )
        .await;
        self.pool.release(lease).await;

        match outcome {
            Ok(outcome) => build_result(case, outcome),
            Err(e) => {
                warn!(test_case = %case.id, error = %e, "invocation transport failed");
                TestResult::failed(case, format!("infrastructure failure: {e}"))
            }
        }
    }
}

fn parse_error_to_diagnostic(e: &syn::Error) -> ExecutionError {
    let start = e.span().start();
    let end = e.span().end();
    ExecutionError {
        kind: ErrorKind::CompileTime,
        span: Some(SourceSpan {
            start_line: start.line as u32,
            // proc-macro2 columns are 0-based; diagnostics are 1-based.
            start_col: start.column as u32 + 1,
            end_line: end.line as u32,
            end_col: end.column as u32 + 1,
            file_path: formatter::UNIT_FILE_NAME.to_string(),
        }),
        message: e.to_string(),
    }
}

/// Folds one execution response into the per-test result. Reported points
/// are capped at the case maximum no matter what the invoker claimed.
pub fn build_result(case: &TestCase, outcome: InvokeOutcome) -> TestResult {
    TestResult {
        test_case_id: case.id,
        passed: outcome.passed,
        points: outcome.points.min(case.max_points),
        execution_time_ms: outcome.execution_time_ms,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        errors: outcome.errors,
        exit_code: outcome.exit_code,
        returned: outcome.returned,
        is_visible: case.is_visible,
    }
}

/// Positional alignment: exactly one result per test case, in task order.
/// A missing tail (partial batch failure) is synthesized as zero-point
/// failures; surplus results are dropped.
pub fn align_results(cases: &[TestCase], mut results: Vec<TestResult>) -> Vec<TestResult> {
    results.truncate(cases.len());
    for case in cases.iter().skip(results.len()) {
        results.push(TestResult::failed(case, "no result returned for this test case"));
    }
    results
}

/// `100 × Σpoints / Σmax`, 0 when the task carries no points at all.
pub fn aggregate_score(cases: &[TestCase], results: &[TestResult]) -> f64 {
    let max: u64 = cases.iter().map(|c| c.max_points as u64).sum();
    if max == 0 {
        return 0.0;
    }
    let points: u64 = results.iter().map(|r| r.points as u64).sum();
    100.0 * points as f64 / max as f64
}

/// Terminal verdict for a completed batch: Accepted when everything
/// passed; Rejected only when no result in the whole batch carries a crash
/// signal (stderr or recorded errors); otherwise Error.
pub fn classify(results: &[TestResult]) -> SubmissionStatus {
    if results.iter().all(|r| r.passed) {
        SubmissionStatus::Accepted
    } else if results.iter().all(|r| !r.has_fault_signal()) {
        SubmissionStatus::Rejected
    } else {
        SubmissionStatus::Error
    }
}

/// Detaches evaluation from the creating request: the submission is left
/// `Pending` and graded on an independently scheduled task that is the sole
/// writer of its state. The task is registered for cancellation, and errors
/// and panics at the boundary mark the submission `Error`.
pub async fn spawn_evaluation(
    state: AppState,
    submission_id: Uuid,
    task: Task,
    prepared: PreparedSubmission,
) {
    let eval_state = state.clone();
    let handle = tokio::spawn(async move {
        let run = evaluate(eval_state.clone(), submission_id, task, prepared);
        if let Err(panic) = std::panic::AssertUnwindSafe(run).catch_unwind().await {
            error!(submission = %submission_id, ?panic, "evaluation task panicked");
            eval_state
                .finalize_submission(
                    submission_id,
                    SubmissionStatus::Error,
                    0.0,
                    Vec::new(),
                    vec![ExecutionError::runtime("internal evaluation failure")],
                )
                .await;
        }
        eval_state.clear_evaluation(submission_id).await;
    });
    state
        .register_evaluation(submission_id, handle.abort_handle())
        .await;
}

async fn evaluate(
    state: AppState,
    submission_id: Uuid,
    task: Task,
    prepared: PreparedSubmission,
) {
    state
        .update_submission(submission_id, |s| {
            s.execute_started_at = Some(OffsetDateTime::now_utc());
        })
        .await;

    let results = state.judge.run_tests(&task, &prepared).await;
    let score = aggregate_score(&task.test_cases, &results);
    let status = classify(&results);

    info!(submission = %submission_id, ?status, score, "evaluation finished");
    state
        .finalize_submission(submission_id, status, score, results, Vec::new())
        .await;
}

/// Marks a submission that failed setup: terminal `Error`, score 0,
/// nothing ever dispatched to the pool.
pub fn setup_failure_submission(submission: &mut Submission) {
    submission.status = SubmissionStatus::Error;
    submission.score = Some(0.0);
    submission.execute_finished_at = Some(OffsetDateTime::now_utc());
}

/// Result of taking in a new submission, shared by the HTTP and gRPC
/// surfaces.
#[derive(Debug)]
pub enum IntakeOutcome {
    /// Setup succeeded; the submission is `Pending` and evaluating in the
    /// background.
    Accepted { submission_id: Uuid },
    /// Setup-time failure; the submission is recorded terminal `Error` and
    /// the message is embedded in the rejection.
    SetupFailed { submission_id: Uuid, message: String },
    TaskNotFound,
}

/// Intake for one submission: record it, run setup synchronously, and
/// either detach the evaluation or short-circuit to `Error` without ever
/// touching the pool.
pub async fn intake(
    state: &AppState,
    task_id: Uuid,
    user_id: Option<String>,
    code: String,
) -> IntakeOutcome {
    use crate::store::SubmissionRecord;

    let Some(task) = state.get_task(task_id).await else {
        return IntakeOutcome::TaskNotFound;
    };

    let mut submission = Submission::new(task.id, user_id, code.clone());
    let submission_id = submission.id;

    match state.judge.prepare(&task, &code).await {
        Ok(prepared) => {
            state
                .insert_submission(SubmissionRecord::new(submission))
                .await;
            spawn_evaluation(state.clone(), submission_id, task, prepared).await;
            info!(submission = %submission_id, "submission accepted for evaluation");
            IntakeOutcome::Accepted { submission_id }
        }
        Err(setup) => {
            let message = setup.to_string();
            setup_failure_submission(&mut submission);
            let mut record = SubmissionRecord::new(submission);
            record.setup_errors = setup.into_errors();
            state.insert_submission(record).await;
            info!(submission = %submission_id, %message, "submission failed setup");
            IntakeOutcome::SetupFailed {
                submission_id,
                message,
            }
        }
    }
}
