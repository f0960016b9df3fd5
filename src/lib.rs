//! Crucible - sandboxed code-execution and judging pipeline.
//!
//! Takes untrusted Rust submissions, compiles them with a host toolchain,
//! instruments them against uncontrolled stack growth, runs them inside a
//! bounded pool of isolated containers and scores them against
//! task-defined test cases with partial credit.

#[cfg(not(target_os = "linux"))]
compile_error!("This program only works on Linux.");

pub mod codec;
pub mod compiler;
pub mod error;
pub mod formatter;
pub mod grpc_server;
pub mod http_server;
pub mod invoker;
pub mod judge;
pub mod model;
pub mod pool;
pub mod rewriter;
pub mod sandbox;
pub mod store;
