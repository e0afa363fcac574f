//! Sandboxed command executor.
//!
//! The `executor server` side accepts execution requests, provisions one
//! container per request, drives the command through the sidecar's gRPC
//! protocol, streams output back and tears the container down. The
//! `executor sidecar` side runs inside each container and executes exactly
//! one command.

#[cfg(not(unix))]
compile_error!("sandbox-executor only works on Unix.");

pub mod admission;
pub mod config;
pub mod error;
pub mod grpc_server;
pub mod http_server;
pub mod lifecycle;
pub mod orchestrator;
pub mod output;
pub mod proto;
pub mod runtime;
pub mod sidecar;
pub mod state;
