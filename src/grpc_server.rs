//! gRPC server implementation using Tonic.

use std::net::SocketAddr;

use time::format_description::well_known::Rfc3339;
use tonic::{Request, Response, Status};
use tracing::info;
use uuid::Uuid;

use crate::judge::{intake, IntakeOutcome};
use crate::model;
use crate::store::AppState;

// Import generated protobuf types
pub mod proto {
    tonic::include_proto!("judge");
}

use proto::judge_service_server::{JudgeService, JudgeServiceServer};
use proto::{GetSubmissionRequest, GetSubmissionResponse, SubmitRequest, SubmitResponse};

/// gRPC service implementation.
pub struct JudgeServiceImpl {
    state: AppState,
}

impl JudgeServiceImpl {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

#[tonic::async_trait]
impl JudgeService for JudgeServiceImpl {
    async fn submit(
        &self,
        request: Request<SubmitRequest>,
    ) -> Result<Response<SubmitResponse>, Status> {
        let req = request.into_inner();
        info!("gRPC Submit: task={}", req.task_id);

        let task_id = Uuid::parse_str(&req.task_id)
            .map_err(|_| Status::invalid_argument("task_id is not a UUID"))?;

        match intake(&self.state, task_id, req.user_id, req.code).await {
            IntakeOutcome::Accepted { submission_id } => Ok(Response::new(SubmitResponse {
                submission_id: submission_id.to_string(),
                status: model::SubmissionStatus::Pending.as_str().to_string(),
                message: None,
            })),
            IntakeOutcome::SetupFailed {
                submission_id,
                message,
            } => Ok(Response::new(SubmitResponse {
                submission_id: submission_id.to_string(),
                status: model::SubmissionStatus::Error.as_str().to_string(),
                message: Some(message),
            })),
            IntakeOutcome::TaskNotFound => Err(Status::not_found("Task not found")),
        }
    }

    async fn get_submission(
        &self,
        request: Request<GetSubmissionRequest>,
    ) -> Result<Response<GetSubmissionResponse>, Status> {
        let req = request.into_inner();
        let id = Uuid::parse_str(&req.submission_id)
            .map_err(|_| Status::invalid_argument("submission_id is not a UUID"))?;

        let record = self
            .state
            .get_submission(id)
            .await
            .ok_or_else(|| Status::not_found("Submission not found"))?;

        let submission = &record.submission;
        Ok(Response::new(GetSubmissionResponse {
            submission_id: submission.id.to_string(),
            task_id: submission.task_id.to_string(),
            user_id: submission.user_id.clone(),
            status: submission.status.as_str().to_string(),
            score: submission.score,
            submitted_at: format_ts(&submission.submitted_at),
            execute_started_at: submission.execute_started_at.as_ref().map(format_ts),
            execute_finished_at: submission.execute_finished_at.as_ref().map(format_ts),
            is_solved: submission.is_solved(&record.results),
            results: record.results.iter().map(result_to_proto).collect(),
            setup_errors: record.setup_errors.iter().map(error_to_proto).collect(),
        }))
    }
}

fn format_ts(ts: &time::OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_default()
}

fn result_to_proto(result: &model::TestResult) -> proto::TestResult {
    proto::TestResult {
        test_case_id: result.test_case_id.to_string(),
        passed: result.passed,
        points: result.points,
        execution_time_ms: result.execution_time_ms,
        stdout: result.stdout.clone(),
        stderr: result.stderr.clone(),
        errors: result.errors.iter().map(error_to_proto).collect(),
        exit_code: result.exit_code,
        returned_json: result.returned.to_string(),
        is_visible: result.is_visible,
    }
}

fn error_to_proto(error: &model::ExecutionError) -> proto::ExecutionError {
    proto::ExecutionError {
        kind: match error.kind {
            model::ErrorKind::CompileTime => "compileTime".to_string(),
            model::ErrorKind::Runtime => "runtime".to_string(),
        },
        span: error.span.as_ref().map(|s| proto::SourceSpan {
            start_line: s.start_line,
            start_col: s.start_col,
            end_line: s.end_line,
            end_col: s.end_col,
            file_path: s.file_path.clone(),
        }),
        message: error.message.clone(),
    }
}

/// Run the gRPC server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting gRPC server on {}", addr);

    tonic::transport::Server::builder()
        .add_service(JudgeServiceServer::new(JudgeServiceImpl::new(state)))
        .serve(addr)
        .await
        .unwrap();
}
