//! End-to-end pipeline tests: orchestration, scoring and lifecycle over a
//! scripted execution backend, plus setup-stage tests against the real
//! host toolchain.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde_json::json;
use uuid::Uuid;

use crucible::codec::{EntrySignature, ParamKind};
use crucible::compiler::{CompiledArtifact, Compiler};
use crucible::error::{PoolError, SetupError};
use crucible::formatter::RESULT_MARKER;
use crucible::judge::{aggregate_score, classify, intake, Judge, PreparedSubmission};
use crucible::model::{SubmissionStatus, Task, TestCase};
use crucible::pool::{Container, ContainerPool, ExecBackend, RawExec};
use crucible::store::AppState;

/// Fake backend that echoes the first (i64) argument of the payload back
/// as the returned value; a negative argument simulates a panicking
/// worker. Tracks how many executions overlap.
#[derive(Default)]
struct ScriptedBackend {
    execs: AtomicUsize,
    current: AtomicUsize,
    max_overlap: AtomicUsize,
    delay_ms: u64,
}

impl ScriptedBackend {
    fn with_delay(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            ..Self::default()
        }
    }
}

impl ExecBackend for ScriptedBackend {
    fn create(&self, id: &str) -> Result<Container, PoolError> {
        Ok(Container {
            id: id.to_string(),
            root: PathBuf::from(format!("/scripted/{id}")),
        })
    }

    fn wipe(&self, _container: &Container) -> Result<(), PoolError> {
        Ok(())
    }

    fn destroy(&self, _container: &Container) {}

    fn place_file(
        &self,
        _container: &Container,
        _rel_path: &str,
        _content: &[u8],
        _mode: u32,
    ) -> Result<(), PoolError> {
        Ok(())
    }

    fn exec(
        &self,
        _container: &Container,
        payload: &str,
        _timeout_ms: u64,
    ) -> Result<RawExec, PoolError> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        let overlap = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_overlap.fetch_max(overlap, Ordering::SeqCst);
        if self.delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.delay_ms));
        }
        self.current.fetch_sub(1, Ordering::SeqCst);

        let bundle = String::from_utf8(B64.decode(payload).unwrap_or_default()).unwrap_or_default();
        let arg: i64 = bundle
            .lines()
            .next()
            .and_then(|l| l.trim().parse().ok())
            .unwrap_or(0);

        if arg < 0 {
            return Ok(RawExec {
                stdout: String::new(),
                stderr: "thread 'main' panicked at solution.rs:4:9:\nboom".to_string(),
                exit_code: Some(101),
                signal: None,
                timed_out: false,
                duration_ms: 3,
            });
        }
        Ok(RawExec {
            stdout: format!("echo {arg}\n\n{RESULT_MARKER}\n{arg}\n"),
            stderr: String::new(),
            exit_code: Some(0),
            signal: None,
            timed_out: false,
            duration_ms: 3,
        })
    }
}

fn task_of(cases: Vec<(i64, i64, u32)>) -> Task {
    Task {
        id: Uuid::new_v4(),
        entry_point: "solve".to_string(),
        timeout_ms: 1000,
        test_cases: cases
            .into_iter()
            .map(|(arg, expected, max_points)| TestCase {
                id: Uuid::new_v4(),
                args: vec![json!(arg)],
                expected: json!(expected),
                max_points,
                is_visible: true,
                timeout_ms: None,
            })
            .collect(),
    }
}

fn echo_prepared() -> PreparedSubmission {
    PreparedSubmission {
        artifact: CompiledArtifact {
            bytes: b"\x7fELF-fake".to_vec(),
        },
        signature: EntrySignature {
            name: "solve".to_string(),
            params: vec![ParamKind::Int],
            ret: Some(ParamKind::Int),
        },
    }
}

async fn judge_over(backend: Arc<ScriptedBackend>, pool_size: usize) -> Judge {
    let pool = ContainerPool::new(backend, pool_size).await.unwrap();
    Judge::new(Arc::new(pool), Compiler::new("rustc"))
}

#[tokio::test]
async fn all_passing_cases_are_accepted_with_full_score() {
    let backend = Arc::new(ScriptedBackend::default());
    let judge = judge_over(backend.clone(), 2).await;
    let task = task_of(vec![(1, 1, 5), (2, 2, 5)]);

    let results = judge.run_tests(&task, &echo_prepared()).await;

    assert_eq!(results.len(), 2);
    for (result, case) in results.iter().zip(&task.test_cases) {
        assert_eq!(result.test_case_id, case.id);
        assert!(result.passed);
        assert_eq!(result.points, case.max_points);
    }
    assert_eq!(aggregate_score(&task.test_cases, &results), 100.0);
    assert_eq!(classify(&results), SubmissionStatus::Accepted);
    assert_eq!(backend.execs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn wrong_answer_without_stderr_scores_half_and_rejects() {
    let backend = Arc::new(ScriptedBackend::default());
    let judge = judge_over(backend, 2).await;
    // Case 2 echoes 3 but expects 4: pure wrong answer, no crash signal.
    let task = task_of(vec![(1, 1, 5), (3, 4, 5)]);

    let results = judge.run_tests(&task, &echo_prepared()).await;

    assert!(results[0].passed);
    assert!(!results[1].passed);
    assert!(results[1].stderr.is_empty());
    assert_eq!(aggregate_score(&task.test_cases, &results), 50.0);
    assert_eq!(classify(&results), SubmissionStatus::Rejected);
}

#[tokio::test]
async fn crashing_case_escalates_the_verdict_to_error() {
    let backend = Arc::new(ScriptedBackend::default());
    let judge = judge_over(backend, 2).await;
    // Same half-passing scenario, but the failing case panics.
    let task = task_of(vec![(1, 1, 5), (-1, 4, 5)]);

    let results = judge.run_tests(&task, &echo_prepared()).await;

    assert!(results[0].passed);
    assert!(!results[1].passed);
    assert!(!results[1].errors.is_empty());
    assert_eq!(aggregate_score(&task.test_cases, &results), 50.0);
    assert_eq!(classify(&results), SubmissionStatus::Error);
}

#[tokio::test]
async fn results_stay_in_task_order_under_parallel_dispatch() {
    let backend = Arc::new(ScriptedBackend::with_delay(20));
    let judge = judge_over(backend, 4).await;
    let task = task_of(vec![(5, 5, 1), (6, 6, 1), (7, 7, 1), (8, 8, 1)]);

    let results = judge.run_tests(&task, &echo_prepared()).await;

    let expected_ids: Vec<Uuid> = task.test_cases.iter().map(|c| c.id).collect();
    let got_ids: Vec<Uuid> = results.iter().map(|r| r.test_case_id).collect();
    assert_eq!(got_ids, expected_ids);
    for (result, (arg, _, _)) in results.iter().zip([(5, 5, 1), (6, 6, 1), (7, 7, 1), (8, 8, 1)]) {
        assert_eq!(result.returned, json!(arg));
    }
}

#[tokio::test]
async fn pool_size_bounds_concurrent_executions() {
    let backend = Arc::new(ScriptedBackend::with_delay(50));
    let judge = judge_over(backend.clone(), 2).await;
    let task = task_of((0..6).map(|i| (i, i, 1)).collect());

    let results = judge.run_tests(&task, &echo_prepared()).await;

    assert_eq!(results.len(), 6);
    assert!(results.iter().all(|r| r.passed));
    let max_overlap = backend.max_overlap.load(Ordering::SeqCst);
    assert!(max_overlap <= 2, "at most pool-size executions may overlap, saw {max_overlap}");
    assert_eq!(max_overlap, 2, "backlog should saturate the pool");
}

#[tokio::test]
async fn hidden_case_flag_is_preserved_on_results() {
    let backend = Arc::new(ScriptedBackend::default());
    let judge = judge_over(backend, 1).await;
    let mut task = task_of(vec![(1, 1, 5)]);
    task.test_cases[0].is_visible = false;

    let results = judge.run_tests(&task, &echo_prepared()).await;
    assert!(!results[0].is_visible);
}

// Setup-stage tests below exercise the real host toolchain.

#[tokio::test]
async fn valid_submission_compiles_through_the_template() {
    let backend = Arc::new(ScriptedBackend::default());
    let judge = judge_over(backend, 1).await;
    let task = task_of(vec![(1, 1, 5)]);

    let prepared = judge
        .prepare(&task, "pub fn solve(a: i64) -> i64 { a * 2 - a }")
        .await
        .expect("valid submission must compile");

    assert_eq!(prepared.signature.params, vec![ParamKind::Int]);
    assert_eq!(prepared.signature.ret, Some(ParamKind::Int));
    assert!(!prepared.artifact.bytes.is_empty());
}

#[tokio::test]
async fn syntactically_invalid_code_fails_setup_without_executing() {
    let backend = Arc::new(ScriptedBackend::default());
    let judge = judge_over(backend.clone(), 1).await;
    let task = task_of(vec![(1, 1, 5)]);

    let err = judge.prepare(&task, "fn solve(").await.unwrap_err();
    match err {
        SetupError::Compile(errors) => {
            assert!(!errors.is_empty());
            assert!(errors[0].span.is_some());
        }
        other => panic!("expected compile failure, got {other}"),
    }
    assert_eq!(backend.execs.load(Ordering::SeqCst), 0, "nothing may execute");
}

#[tokio::test]
async fn type_errors_surface_as_ordered_diagnostics() {
    let backend = Arc::new(ScriptedBackend::default());
    let judge = judge_over(backend, 1).await;
    let task = task_of(vec![(1, 1, 5)]);

    let err = judge
        .prepare(&task, "pub fn solve(a: i64) -> i64 { a + true }")
        .await
        .unwrap_err();
    match err {
        SetupError::Compile(errors) => {
            assert!(!errors.is_empty());
            let span = errors[0].span.as_ref().expect("compile errors carry spans");
            assert_eq!(span.file_path, "solution.rs");
            assert!(span.start_line >= 1);
            assert!(span.start_col >= 1);
        }
        other => panic!("expected compile failure, got {other}"),
    }
}

#[tokio::test]
async fn missing_entry_point_is_a_validation_failure() {
    let backend = Arc::new(ScriptedBackend::default());
    let judge = judge_over(backend, 1).await;
    let task = task_of(vec![(1, 1, 5)]);

    let err = judge.prepare(&task, "fn other() {}").await.unwrap_err();
    assert!(matches!(err, SetupError::Validation(_)));
}

#[tokio::test]
async fn arity_mismatch_fails_fast_before_any_dispatch() {
    let backend = Arc::new(ScriptedBackend::default());
    let judge = judge_over(backend.clone(), 1).await;
    let mut task = task_of(vec![(1, 1, 5)]);
    task.test_cases[0].args = vec![json!(1), json!(2)];

    let err = judge
        .prepare(&task, "pub fn solve(a: i64) -> i64 { a }")
        .await
        .unwrap_err();
    match err {
        SetupError::Validation(message) => assert!(message.contains("arity mismatch")),
        other => panic!("expected validation failure, got {other}"),
    }
    assert_eq!(backend.execs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn intake_detaches_evaluation_and_reaches_a_terminal_state() {
    let backend = Arc::new(ScriptedBackend::default());
    let judge = judge_over(backend, 2).await;
    let state = AppState::new(Arc::new(judge));

    let task = task_of(vec![(1, 1, 5), (2, 2, 5)]);
    let task_id = task.id;
    state.insert_task(task).await;

    let outcome = intake(
        &state,
        task_id,
        Some("user-1".to_string()),
        "pub fn solve(a: i64) -> i64 { a }".to_string(),
    )
    .await;

    let submission_id = match outcome {
        crucible::judge::IntakeOutcome::Accepted { submission_id } => submission_id,
        other => panic!("expected acceptance, got {other:?}"),
    };

    // The creating call returned immediately; evaluation runs detached.
    let record = state.get_submission(submission_id).await.unwrap();
    assert!(record.submission.execute_finished_at.is_none() || record.submission.status.is_terminal());

    // Wait for the background task to finish grading.
    let mut status = record.submission.status;
    for _ in 0..200 {
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        status = state.get_submission(submission_id).await.unwrap().submission.status;
    }

    let record = state.get_submission(submission_id).await.unwrap();
    assert_eq!(record.submission.status, SubmissionStatus::Accepted);
    assert_eq!(record.submission.score, Some(100.0));
    assert!(record.submission.execute_started_at.is_some());
    assert!(record.submission.execute_finished_at.is_some());
    assert_eq!(record.results.len(), 2);
    assert!(record.submission.is_solved(&record.results));
}

#[tokio::test]
async fn cancelling_a_running_evaluation_finalizes_as_error() {
    let backend = Arc::new(ScriptedBackend::with_delay(500));
    let judge = judge_over(backend, 1).await;
    let state = AppState::new(Arc::new(judge));

    let task = task_of(vec![(1, 1, 5), (2, 2, 5)]);
    let task_id = task.id;
    state.insert_task(task).await;

    let outcome = intake(
        &state,
        task_id,
        None,
        "pub fn solve(a: i64) -> i64 { a }".to_string(),
    )
    .await;
    let submission_id = match outcome {
        crucible::judge::IntakeOutcome::Accepted { submission_id } => submission_id,
        other => panic!("expected acceptance, got {other:?}"),
    };

    assert!(state.cancel_evaluation(submission_id).await);

    let record = state.get_submission(submission_id).await.unwrap();
    assert_eq!(record.submission.status, SubmissionStatus::Error);
    assert!(record
        .setup_errors
        .iter()
        .any(|e| e.message.contains("cancelled")));

    // A terminal submission cannot be cancelled again.
    assert!(!state.cancel_evaluation(submission_id).await);
}

#[tokio::test]
async fn setup_failure_records_a_terminal_error_submission() {
    let backend = Arc::new(ScriptedBackend::default());
    let judge = judge_over(backend.clone(), 1).await;
    let state = AppState::new(Arc::new(judge));

    let task = task_of(vec![(1, 1, 5)]);
    let task_id = task.id;
    state.insert_task(task).await;

    let outcome = intake(&state, task_id, None, "fn solve(".to_string()).await;
    let submission_id = match outcome {
        crucible::judge::IntakeOutcome::SetupFailed { submission_id, message } => {
            assert!(!message.is_empty());
            submission_id
        }
        other => panic!("expected setup failure, got {other:?}"),
    };

    let record = state.get_submission(submission_id).await.unwrap();
    assert_eq!(record.submission.status, SubmissionStatus::Error);
    assert_eq!(record.submission.score, Some(0.0));
    assert!(!record.setup_errors.is_empty());
    assert_eq!(record.results.len(), 0);
    assert_eq!(backend.execs.load(Ordering::SeqCst), 0);
}
