//! Wire contract shared by the orchestrator and the sidecar.
//!
//! Two services live in package `executor`:
//!
//! ```text
//! service Sidecar {
//!   rpc Execute(ExecutionRequest) returns (stream ExecutionEvent);
//!   rpc Cancel(CancelRequest)     returns (CancelAck);
//!   rpc Ping(PingRequest)         returns (PingResponse);
//! }
//!
//! service Executor {
//!   rpc Execute(ExecutionRequest)  returns (stream ExecutionEvent);  // job id in `x-job-id`
//!   rpc Cancel(CancelJobRequest)   returns (CancelAck);
//!   rpc GetJob(GetJobRequest)      returns (JobStatus);
//!   rpc ListJobs(ListJobsRequest)  returns (ListJobsResponse);
//!   rpc WatchJob(WatchJobRequest)  returns (stream ExecutionEvent);  // tail, then live
//! }
//! ```
//!
//! A sidecar serves exactly one `Execute` per process lifetime.

use std::collections::HashMap;

/// Response header carrying the job id of an accepted `Executor.Execute` call.
pub const JOB_ID_HEADER: &str = "x-job-id";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecutionRequest {
    #[prost(string, tag = "1")]
    pub command: String,
    #[prost(string, repeated, tag = "2")]
    pub args: Vec<String>,
    #[prost(map = "string, string", tag = "3")]
    pub env: HashMap<String, String>,
    #[prost(string, tag = "4")]
    pub working_dir: String,
    #[prost(message, repeated, tag = "5")]
    pub files: Vec<WorkspaceFile>,
    #[prost(message, optional, tag = "6")]
    pub limits: Option<ResourceLimits>,
    /// Sandbox image override; empty means the server default.
    #[prost(string, tag = "7")]
    pub image: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkspaceFile {
    /// Relative to the working directory.
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(bytes = "vec", tag = "2")]
    pub content: Vec<u8>,
    #[prost(bool, tag = "3")]
    pub executable: bool,
}

/// Zero in any field means "use the configured default".
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ResourceLimits {
    #[prost(double, tag = "1")]
    pub cpu_cores: f64,
    #[prost(uint64, tag = "2")]
    pub memory_mb: u64,
    #[prost(uint64, tag = "3")]
    pub timeout_ms: u64,
    #[prost(uint64, tag = "4")]
    pub cpu_time_secs: u64,
    #[prost(uint64, tag = "5")]
    pub max_open_files: u64,
    #[prost(uint64, tag = "6")]
    pub max_output_bytes: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecutionEvent {
    #[prost(oneof = "execution_event::Event", tags = "1, 2")]
    pub event: Option<execution_event::Event>,
}

pub mod execution_event {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Event {
        #[prost(message, tag = "1")]
        Chunk(super::OutputChunk),
        #[prost(message, tag = "2")]
        Terminal(super::Terminal),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OutputChunk {
    #[prost(enumeration = "OutputStream", tag = "1")]
    pub stream: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
    /// Position of this chunk in the sidecar's emission order, from 0.
    #[prost(uint64, tag = "3")]
    pub seq: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum OutputStream {
    Stdout = 0,
    Stderr = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Terminal {
    #[prost(enumeration = "TerminationReason", tag = "1")]
    pub reason: i32,
    #[prost(int32, optional, tag = "2")]
    pub exit_code: Option<i32>,
    #[prost(string, tag = "3")]
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TerminationReason {
    Unspecified = 0,
    Exited = 1,
    LaunchFailed = 2,
    ResourceLimitExceeded = 3,
    Cancelled = 4,
    Timeout = 5,
    ProvisioningFailed = 6,
    ProvisioningTimeout = 7,
    TransportFailed = 8,
    Internal = 9,
}

impl TerminationReason {
    /// Human-readable reason, as shown to callers.
    pub fn describe(self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Exited => "exited",
            Self::LaunchFailed => "launch failed",
            Self::ResourceLimitExceeded => "resource limit exceeded",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::ProvisioningFailed => "provisioning failed",
            Self::ProvisioningTimeout => "provisioning timeout",
            Self::TransportFailed => "transport failed",
            Self::Internal => "internal error",
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.describe())
    }
}

impl Terminal {
    pub fn exited(exit_code: i32) -> Self {
        Self {
            reason: TerminationReason::Exited as i32,
            exit_code: Some(exit_code),
            message: String::new(),
        }
    }

    pub fn failed(reason: TerminationReason, message: impl Into<String>) -> Self {
        Self {
            reason: reason as i32,
            exit_code: None,
            message: message.into(),
        }
    }

    /// Decoded reason; unknown values read as `Unspecified`.
    pub fn termination_reason(&self) -> TerminationReason {
        TerminationReason::try_from(self.reason).unwrap_or(TerminationReason::Unspecified)
    }
}

impl ExecutionEvent {
    pub fn chunk(stream: OutputStream, data: Vec<u8>, seq: u64) -> Self {
        Self {
            event: Some(execution_event::Event::Chunk(OutputChunk {
                stream: stream as i32,
                data,
                seq,
            })),
        }
    }

    pub fn terminal(terminal: Terminal) -> Self {
        Self {
            event: Some(execution_event::Event::Terminal(terminal)),
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelRequest {
    #[prost(string, tag = "1")]
    pub reason: String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct CancelAck {
    /// The execution had already produced its terminal outcome.
    #[prost(bool, tag = "1")]
    pub already_terminated: bool,
    /// This call initiated cancellation (false on repeats).
    #[prost(bool, tag = "2")]
    pub accepted: bool,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct PingRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PingResponse {
    #[prost(bool, tag = "1")]
    pub busy: bool,
    #[prost(string, tag = "2")]
    pub version: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelJobRequest {
    #[prost(string, tag = "1")]
    pub job_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetJobRequest {
    #[prost(string, tag = "1")]
    pub job_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WatchJobRequest {
    #[prost(string, tag = "1")]
    pub job_id: String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ListJobsRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListJobsResponse {
    #[prost(message, repeated, tag = "1")]
    pub jobs: Vec<JobStatus>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobStatus {
    #[prost(string, tag = "1")]
    pub job_id: String,
    /// Lifecycle state name, e.g. `executing` or `torn_down`.
    #[prost(string, tag = "2")]
    pub state: String,
    #[prost(string, tag = "3")]
    pub container_id: String,
    #[prost(message, optional, tag = "4")]
    pub terminal: Option<Terminal>,
    #[prost(uint64, tag = "5")]
    pub age_secs: u64,
    /// The container's memory cgroup killed a process.
    #[prost(bool, tag = "6")]
    pub oom_killed: bool,
    /// Most recent output, oldest first, bounded in total size.
    #[prost(message, repeated, tag = "7")]
    pub recent_output: Vec<OutputChunk>,
}

include!(concat!(env!("OUT_DIR"), "/executor.Sidecar.rs"));
include!(concat!(env!("OUT_DIR"), "/executor.Executor.rs"));
