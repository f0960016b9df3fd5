//! Shared application state: registered tasks, submissions and their
//! ordered results.
//!
//! In-memory maps behind `RwLock`s, cloned into handlers. Submission state
//! is mutated only by the single background task that owns its evaluation,
//! so no locking beyond the maps themselves is needed. Restart durability
//! is an explicit non-goal.

use std::collections::HashMap;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::judge::Judge;
use crate::model::{ExecutionError, Submission, SubmissionStatus, Task, TestResult};

/// A submission together with its ordered per-test results and any
/// setup-time diagnostics.
#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    pub submission: Submission,
    pub results: Vec<TestResult>,
    pub setup_errors: Vec<ExecutionError>,
}

impl SubmissionRecord {
    pub fn new(submission: Submission) -> Self {
        Self {
            submission,
            results: Vec::new(),
            setup_errors: Vec::new(),
        }
    }
}

pub type Tasks = Arc<RwLock<HashMap<Uuid, Task>>>;
pub type Submissions = Arc<RwLock<HashMap<Uuid, SubmissionRecord>>>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub tasks: Tasks,
    pub submissions: Submissions,
    pub judge: Arc<Judge>,
    /// Running evaluation tasks by submission id, for cancellation.
    evaluations: Arc<Mutex<HashMap<Uuid, AbortHandle>>>,
}

impl AppState {
    pub fn new(judge: Arc<Judge>) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            submissions: Arc::new(RwLock::new(HashMap::new())),
            judge,
            evaluations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn register_evaluation(&self, id: Uuid, handle: AbortHandle) {
        self.evaluations.lock().await.insert(id, handle);
    }

    pub async fn clear_evaluation(&self, id: Uuid) {
        self.evaluations.lock().await.remove(&id);
    }

    /// Aborts a running evaluation and finalizes the submission as `Error`.
    /// Returns `false` when the submission is unknown or already terminal.
    pub async fn cancel_evaluation(&self, id: Uuid) -> bool {
        match self.get_submission(id).await {
            Some(record) if !record.submission.status.is_terminal() => {}
            _ => return false,
        }
        if let Some(handle) = self.evaluations.lock().await.remove(&id) {
            handle.abort();
        }
        self.finalize_submission(
            id,
            SubmissionStatus::Error,
            0.0,
            Vec::new(),
            vec![ExecutionError::runtime("evaluation cancelled")],
        )
        .await;
        true
    }

    pub async fn insert_task(&self, task: Task) {
        self.tasks.write().await.insert(task.id, task);
    }

    pub async fn get_task(&self, id: Uuid) -> Option<Task> {
        self.tasks.read().await.get(&id).cloned()
    }

    pub async fn insert_submission(&self, record: SubmissionRecord) {
        self.submissions
            .write()
            .await
            .insert(record.submission.id, record);
    }

    pub async fn get_submission(&self, id: Uuid) -> Option<SubmissionRecord> {
        self.submissions.read().await.get(&id).cloned()
    }

    /// Applies a mutation from the owning evaluation task.
    pub async fn update_submission(&self, id: Uuid, mutate: impl FnOnce(&mut Submission)) {
        if let Some(record) = self.submissions.write().await.get_mut(&id) {
            mutate(&mut record.submission);
        }
    }

    /// Moves a submission into a terminal state with its results. A
    /// submission already terminal is never resurrected.
    pub async fn finalize_submission(
        &self,
        id: Uuid,
        status: SubmissionStatus,
        score: f64,
        results: Vec<TestResult>,
        setup_errors: Vec<ExecutionError>,
    ) {
        let mut submissions = self.submissions.write().await;
        let Some(record) = submissions.get_mut(&id) else {
            return;
        };
        if record.submission.status.is_terminal() {
            return;
        }
        record.submission.status = status;
        record.submission.score = Some(score);
        record.submission.execute_finished_at = Some(OffsetDateTime::now_utc());
        record.results = results;
        record.setup_errors.extend(setup_errors);
    }
}
