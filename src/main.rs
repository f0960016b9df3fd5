//! Crucible - sandboxed Rust code judge with HTTP API and gRPC support.
//!
//! Usage:
//!   crucible serve [--port 8080] [--grpc-port 50051] [--pool-size 4]
//!   crucible --judge --task task.json --code solution.rs   # one-shot mode

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use crucible::compiler::Compiler;
use crucible::judge::{self, Judge};
use crucible::model::{Task, TestCase, DEFAULT_ENTRY_POINT, DEFAULT_TIMEOUT_MS};
use crucible::pool::ContainerPool;
use crucible::sandbox::SandboxBackend;
use crucible::store::AppState;
use crucible::{grpc_server, http_server};

#[derive(Parser, Debug)]
#[command(name = "crucible")]
#[command(about = "Sandboxed Rust code judge with HTTP and gRPC APIs")]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Judge a local submission directly (one-shot mode)
    #[arg(long)]
    judge: bool,

    /// Task definition JSON file (one-shot mode)
    #[arg(long)]
    task: Option<PathBuf>,

    /// Submission source file (one-shot mode)
    #[arg(long)]
    code: Option<PathBuf>,

    /// rustc binary used to compile submissions
    #[arg(long, default_value = "rustc")]
    rustc: String,

    /// Directory container roots are created under
    #[arg(long, default_value = "/tmp/crucible")]
    containers_dir: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP and gRPC servers
    Serve {
        /// HTTP port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,

        /// gRPC port to listen on
        #[arg(long, default_value = "50051")]
        grpc_port: u16,

        /// Number of pre-warmed execution containers
        #[arg(long, default_value = "4")]
        pool_size: usize,
    },
}

/// Task definition accepted in one-shot mode; ids are assigned on load.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskSpec {
    #[serde(default = "default_entry_point")]
    entry_point: String,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
    test_cases: Vec<CaseSpec>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaseSpec {
    args: Vec<serde_json::Value>,
    expected: serde_json::Value,
    max_points: u32,
    #[serde(default = "default_visible")]
    is_visible: bool,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

fn default_entry_point() -> String {
    DEFAULT_ENTRY_POINT.to_string()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_visible() -> bool {
    true
}

impl TaskSpec {
    fn into_task(self) -> Task {
        Task {
            id: uuid::Uuid::new_v4(),
            entry_point: self.entry_point,
            timeout_ms: self.timeout_ms,
            test_cases: self
                .test_cases
                .into_iter()
                .map(|spec| TestCase {
                    id: uuid::Uuid::new_v4(),
                    args: spec.args,
                    expected: spec.expected,
                    max_points: spec.max_points,
                    is_visible: spec.is_visible,
                    timeout_ms: spec.timeout_ms,
                })
                .collect(),
        }
    }
}

#[tokio::main]
async fn main() {
    use std::process::exit;

    tracing_subscriber::fmt::init();

    let args = Args::parse();

    // Must be root
    if !nix::unistd::geteuid().is_root() {
        eprintln!("Error: Must run as root (need CAP_SYS_ADMIN for namespaces)");
        exit(1);
    }

    match args.command {
        Some(Commands::Serve {
            port,
            grpc_port,
            pool_size,
        }) => {
            let backend = Arc::new(SandboxBackend::new(&args.containers_dir));
            let pool = match ContainerPool::new(backend, pool_size).await {
                Ok(pool) => pool,
                Err(e) => {
                    eprintln!("Error: failed to initialize container pool: {e}");
                    exit(1);
                }
            };
            let judge = Judge::new(Arc::new(pool), Compiler::new(&args.rustc));
            let state = AppState::new(Arc::new(judge));

            tokio::join!(
                http_server::run_server(port, state.clone()),
                grpc_server::run_server(grpc_port, state.clone()),
            );
        }
        None if args.judge => {
            // One-shot mode
            let (Some(task_path), Some(code_path)) = (args.task, args.code) else {
                eprintln!("Error: one-shot mode needs --task and --code");
                exit(1);
            };
            let spec: TaskSpec = match fs::read_to_string(&task_path)
                .map_err(|e| e.to_string())
                .and_then(|text| serde_json::from_str(&text).map_err(|e| e.to_string()))
            {
                Ok(spec) => spec,
                Err(e) => {
                    eprintln!("Error: cannot load task {}: {e}", task_path.display());
                    exit(1);
                }
            };
            let code = match fs::read_to_string(&code_path) {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("Error: cannot read {}: {e}", code_path.display());
                    exit(1);
                }
            };
            let task = spec.into_task();

            let backend = Arc::new(SandboxBackend::new(&args.containers_dir));
            let pool = match ContainerPool::new(backend, 1).await {
                Ok(pool) => Arc::new(pool),
                Err(e) => {
                    eprintln!("Error: failed to initialize container: {e}");
                    exit(1);
                }
            };
            let judge_inst = Judge::new(pool.clone(), Compiler::new(&args.rustc));

            match judge_inst.prepare(&task, &code).await {
                Err(setup) => {
                    let report = serde_json::json!({
                        "status": "error",
                        "score": 0.0,
                        "errors": setup.into_errors(),
                    });
                    println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
                    pool.dispose().await;
                    exit(1);
                }
                Ok(prepared) => {
                    let results = judge_inst.run_tests(&task, &prepared).await;
                    let score = judge::aggregate_score(&task.test_cases, &results);
                    let status = judge::classify(&results);
                    let report = serde_json::json!({
                        "status": status.as_str(),
                        "score": score,
                        "results": results,
                    });
                    println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
                    pool.dispose().await;
                    exit(if status == crucible::model::SubmissionStatus::Accepted {
                        0
                    } else {
                        1
                    });
                }
            }
        }
        None => {
            eprintln!("Error: Use 'serve' subcommand or --judge flag");
            exit(1);
        }
    }
}
