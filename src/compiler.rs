//! Compiles a formatted unit into an in-memory binary artifact with a host
//! `rustc` subprocess.
//!
//! Compilation is bounded host work and never executes user code; only the
//! produced artifact is sandboxed. On failure the ordered `error`-level
//! diagnostics come back with 1-based line/column spans against
//! `solution.rs`, never a partial binary. Warnings are capped and not
//! reported.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::SetupError;
use crate::formatter::UNIT_FILE_NAME;
use crate::model::{ErrorKind, ExecutionError, SourceSpan};

/// A compiled submission held in memory, ready to be placed into a leased
/// container.
#[derive(Debug, Clone)]
pub struct CompiledArtifact {
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Compiler {
    rustc_path: PathBuf,
}

impl Compiler {
    pub fn new(rustc_path: impl Into<PathBuf>) -> Self {
        Self {
            rustc_path: rustc_path.into(),
        }
    }

    /// Compiles off the async path; see [`Compiler::compile_blocking`].
    pub async fn compile(&self, unit_source: String) -> Result<CompiledArtifact, SetupError> {
        let compiler = self.clone();
        tokio::task::spawn_blocking(move || compiler.compile_blocking(&unit_source))
            .await
            .map_err(|e| SetupError::Internal(e.to_string()))?
    }

    /// Runs `rustc` over the unit in a scratch build directory: overflow
    /// checks on, single codegen unit for deterministic output, optimized,
    /// 64-bit host target, lints capped so warnings never surface.
    pub fn compile_blocking(&self, unit_source: &str) -> Result<CompiledArtifact, SetupError> {
        let build_dir = std::env::temp_dir().join(format!("crucible-build-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&build_dir)
            .map_err(|e| SetupError::Internal(format!("mkdir build dir: {e}")))?;

        let result = self.compile_in_dir(&build_dir, unit_source);
        let _ = fs::remove_dir_all(&build_dir);
        result
    }

    fn compile_in_dir(&self, build_dir: &Path, unit_source: &str) -> Result<CompiledArtifact, SetupError> {
        fs::write(build_dir.join(UNIT_FILE_NAME), unit_source)
            .map_err(|e| SetupError::Internal(format!("write unit: {e}")))?;

        let output = Command::new(&self.rustc_path)
            .current_dir(build_dir)
            .args([
                UNIT_FILE_NAME,
                "--edition",
                "2021",
                "--crate-name",
                "solution",
                "--crate-type",
                "bin",
                "-O",
                "-C",
                "overflow-checks=on",
                "-C",
                "codegen-units=1",
                "--error-format=json",
                "--cap-lints",
                "allow",
                "-o",
                "solution",
            ])
            .output()
            .map_err(|e| SetupError::Internal(format!("spawn rustc: {e}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            let errors = parse_diagnostics(&stderr);
            if errors.is_empty() {
                return Err(SetupError::Internal(format!(
                    "rustc failed without diagnostics: {}",
                    stderr.chars().take(512).collect::<String>()
                )));
            }
            info!(count = errors.len(), "compilation failed");
            return Err(SetupError::Compile(errors));
        }

        let bytes = fs::read(build_dir.join("solution"))
            .map_err(|e| SetupError::Internal(format!("read artifact: {e}")))?;
        debug!(size = bytes.len(), "compiled artifact");
        Ok(CompiledArtifact { bytes })
    }
}

#[derive(Debug, Deserialize)]
struct RustcDiagnostic {
    message: String,
    level: String,
    #[serde(default)]
    spans: Vec<RustcSpan>,
}

#[derive(Debug, Deserialize)]
struct RustcSpan {
    file_name: String,
    line_start: u32,
    line_end: u32,
    column_start: u32,
    column_end: u32,
    #[serde(default)]
    is_primary: bool,
}

/// Parses `--error-format=json` stderr (one JSON object per line), keeping
/// `error`-level diagnostics in emission order. The trailing
/// "aborting due to N previous errors" summary is dropped.
pub fn parse_diagnostics(stderr: &str) -> Vec<ExecutionError> {
    let mut errors = Vec::new();
    for line in stderr.lines() {
        let Ok(diag) = serde_json::from_str::<RustcDiagnostic>(line) else {
            continue;
        };
        if diag.level != "error" {
            continue;
        }
        if diag.spans.is_empty() && diag.message.starts_with("aborting due to") {
            continue;
        }
        let span = diag
            .spans
            .iter()
            .find(|s| s.is_primary)
            .or(diag.spans.first())
            .map(|s| SourceSpan {
                start_line: s.line_start,
                start_col: s.column_start,
                end_line: s.line_end,
                end_col: s.column_end,
                file_path: s.file_name.clone(),
            });
        errors.push(ExecutionError {
            kind: ErrorKind::CompileTime,
            span,
            message: diag.message,
        });
    }
    errors
}
