//! Error taxonomy shared across the judging pipeline.

use thiserror::Error;

use crate::model::ExecutionError;

/// Setup-time failure: the submission never reaches an execution
/// environment and is short-circuited to a terminal `Error` status.
#[derive(Error, Debug)]
pub enum SetupError {
    /// Source failed to parse or compile; carries the ordered diagnostics.
    #[error("compilation failed with {} error(s)", .0.len())]
    Compile(Vec<ExecutionError>),
    /// Entry signature cannot be matched against the task's test cases.
    #[error("signature validation failed: {0}")]
    Validation(String),
    /// Host-side fault while preparing the submission (I/O, toolchain).
    #[error("setup failed: {0}")]
    Internal(String),
}

impl SetupError {
    /// Diagnostics to record on the submission, in original order.
    pub fn into_errors(self) -> Vec<ExecutionError> {
        match self {
            SetupError::Compile(errors) => errors,
            SetupError::Validation(msg) => vec![ExecutionError::runtime(msg)],
            SetupError::Internal(msg) => vec![ExecutionError::runtime(msg)],
        }
    }
}

/// Infrastructure failure in the container pool or its backend.
#[derive(Error, Debug)]
pub enum PoolError {
    /// The pool has been disposed; no environment can be obtained at all.
    #[error("container pool is closed")]
    Closed,
    /// Environment creation, wipe or exec-transport failure.
    #[error("container backend: {0}")]
    Backend(String),
}

/// Failure inside the sandbox backend itself.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("sandbox setup: {0}")]
    Setup(String),
    #[error("sandbox exec: {0}")]
    Exec(String),
    #[error("io: {0}")]
    Io(String),
}

impl From<std::io::Error> for SandboxError {
    fn from(e: std::io::Error) -> Self {
        SandboxError::Io(e.to_string())
    }
}

impl From<SandboxError> for PoolError {
    fn from(e: SandboxError) -> Self {
        PoolError::Backend(e.to_string())
    }
}
