//! HTTP server implementation using Axum.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::judge::{intake, IntakeOutcome};
use crate::model::{
    ExecutionError, Submission, SubmissionStatus, Task, TestCase, TestResult, DEFAULT_ENTRY_POINT,
    DEFAULT_TIMEOUT_MS,
};
use crate::store::AppState;

// Request/Response types
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskRequest {
    #[serde(default = "default_entry_point")]
    entry_point: String,
    #[serde(default = "default_timeout")]
    timeout_ms: u64,
    test_cases: Vec<TestCaseSpec>,
}

fn default_entry_point() -> String {
    DEFAULT_ENTRY_POINT.to_string()
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_MS
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestCaseSpec {
    args: Vec<serde_json::Value>,
    expected: serde_json::Value,
    max_points: u32,
    #[serde(default = "default_visible")]
    is_visible: bool,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

fn default_visible() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest {
    task_id: Uuid,
    #[serde(default)]
    user_id: Option<String>,
    code: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    submission_id: Uuid,
    status: SubmissionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmissionView {
    #[serde(flatten)]
    submission: Submission,
    is_solved: bool,
    results: Vec<TestResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    setup_errors: Vec<ExecutionError>,
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) {
    let app = Router::new()
        // Task registration (collaborator seam)
        .route("/tasks", post(create_task))
        .route("/tasks/:id", get(get_task))
        // Judging
        .route("/submissions", post(submit))
        .route("/submissions/:id", get(get_submission))
        .route("/submissions/:id/cancel", post(cancel_submission))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

async fn health() -> &'static str {
    "OK"
}

async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> (StatusCode, Json<Task>) {
    let task = Task {
        id: Uuid::new_v4(),
        entry_point: req.entry_point,
        timeout_ms: req.timeout_ms,
        test_cases: req
            .test_cases
            .into_iter()
            .map(|spec| TestCase {
                id: Uuid::new_v4(),
                args: spec.args,
                expected: spec.expected,
                max_points: spec.max_points,
                is_visible: spec.is_visible,
                timeout_ms: spec.timeout_ms,
            })
            .collect(),
    };
    info!(task = %task.id, cases = task.test_cases.len(), "registered task");
    state.insert_task(task.clone()).await;
    (StatusCode::CREATED, Json(task))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, StatusCode> {
    let task = state.get_task(id).await.ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(task))
}

/// Accepts a submission. Returns 202 with status `pending` immediately, or
/// 400 with the embedded setup-time error message when compilation or
/// signature validation fails before any execution is dispatched.
async fn submit(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), (StatusCode, String)> {
    match intake(&state, req.task_id, req.user_id, req.code).await {
        IntakeOutcome::Accepted { submission_id } => Ok((
            StatusCode::ACCEPTED,
            Json(SubmitResponse {
                submission_id,
                status: SubmissionStatus::Pending,
                message: None,
            }),
        )),
        IntakeOutcome::SetupFailed {
            submission_id,
            message,
        } => Ok((
            StatusCode::BAD_REQUEST,
            Json(SubmitResponse {
                submission_id,
                status: SubmissionStatus::Error,
                message: Some(message),
            }),
        )),
        IntakeOutcome::TaskNotFound => {
            Err((StatusCode::NOT_FOUND, "Task not found".to_string()))
        }
    }
}

/// Aborts a running evaluation; the submission finalizes as `error`.
/// Terminal submissions cannot be cancelled.
async fn cancel_submission(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, StatusCode> {
    state.get_submission(id).await.ok_or(StatusCode::NOT_FOUND)?;
    if state.cancel_evaluation(id).await {
        info!(submission = %id, "evaluation cancelled");
        Ok(StatusCode::OK)
    } else {
        Err(StatusCode::CONFLICT)
    }
}

/// Returns submission metadata plus its ordered results. Hidden test cases
/// keep their `isVisible` flag on each result so the collaborator in front
/// of the judge can filter what non-owners see.
async fn get_submission(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SubmissionView>, StatusCode> {
    let record = state.get_submission(id).await.ok_or(StatusCode::NOT_FOUND)?;
    let is_solved = record.submission.is_solved(&record.results);
    Ok(Json(SubmissionView {
        submission: record.submission,
        is_solved,
        results: record.results,
        setup_errors: record.setup_errors,
    }))
}
