//! HTTP server implementation using Axum.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ExecutorError;
use crate::proto::execution_event::Event;
use crate::proto::{
    CancelAck, ExecutionRequest, JobStatus, OutputChunk, OutputStream, ResourceLimits, Terminal,
    WorkspaceFile,
};
use crate::state::AppState;

// Request/Response types
#[derive(Deserialize)]
struct RunRequest {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    working_dir: String,
    #[serde(default)]
    files: Vec<FileEntry>,
    #[serde(default)]
    limits: Option<LimitsEntry>,
    #[serde(default)]
    image: String,
}

#[derive(Deserialize)]
struct FileEntry {
    path: String,
    /// Base64-encoded.
    content: String,
    #[serde(default)]
    executable: bool,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LimitsEntry {
    cpu_cores: f64,
    memory_mb: u64,
    timeout_ms: u64,
    cpu_time_secs: u64,
    max_open_files: u64,
    max_output_bytes: u64,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct TerminalInfo {
    pub reason: String,
    pub exit_code: Option<i32>,
    pub message: String,
}

impl From<&Terminal> for TerminalInfo {
    fn from(t: &Terminal) -> Self {
        Self {
            reason: t.termination_reason().describe().to_string(),
            exit_code: t.exit_code,
            message: t.message.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct RunResponse {
    pub job_id: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: Option<TerminalInfo>,
}

/// One recent output chunk, decoded lossily as UTF-8.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct ChunkInfo {
    pub stream: String,
    pub seq: u64,
    pub data: String,
}

impl From<&OutputChunk> for ChunkInfo {
    fn from(c: &OutputChunk) -> Self {
        let stream = match OutputStream::try_from(c.stream) {
            Ok(OutputStream::Stderr) => "stderr",
            _ => "stdout",
        };
        Self {
            stream: stream.to_string(),
            seq: c.seq,
            data: String::from_utf8_lossy(&c.data).into_owned(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct JobInfo {
    pub job_id: String,
    pub state: String,
    pub container_id: Option<String>,
    pub terminal: Option<TerminalInfo>,
    pub age_secs: u64,
    #[serde(default)]
    pub oom_killed: bool,
    #[serde(default)]
    pub recent_output: Vec<ChunkInfo>,
}

impl From<JobStatus> for JobInfo {
    fn from(s: JobStatus) -> Self {
        Self {
            terminal: s.terminal.as_ref().map(TerminalInfo::from),
            container_id: (!s.container_id.is_empty()).then_some(s.container_id),
            job_id: s.job_id,
            state: s.state,
            age_secs: s.age_secs,
            oom_killed: s.oom_killed,
            recent_output: s.recent_output.iter().map(ChunkInfo::from).collect(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct CancelInfo {
    pub already_terminated: bool,
    pub accepted: bool,
}

impl From<CancelAck> for CancelInfo {
    fn from(ack: CancelAck) -> Self {
        Self {
            already_terminated: ack.already_terminated,
            accepted: ack.accepted,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct HealthInfo {
    pub status: String,
    pub runtime: String,
    pub running: usize,
    pub queued: usize,
    pub capacity: usize,
}

fn error_response(err: ExecutorError) -> (StatusCode, String) {
    let code = match &err {
        ExecutorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ExecutorError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ExecutorError::JobNotFound(_) => StatusCode::NOT_FOUND,
        ExecutorError::Config(_) | ExecutorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, err.to_string())
}

impl RunRequest {
    fn into_execution(self) -> Result<ExecutionRequest, (StatusCode, String)> {
        let files = self
            .files
            .into_iter()
            .map(|f| {
                let content = BASE64.decode(f.content.as_bytes()).map_err(|e| {
                    (
                        StatusCode::BAD_REQUEST,
                        format!("file {}: invalid base64: {}", f.path, e),
                    )
                })?;
                Ok(WorkspaceFile {
                    path: f.path,
                    content,
                    executable: f.executable,
                })
            })
            .collect::<Result<Vec<_>, (StatusCode, String)>>()?;

        Ok(ExecutionRequest {
            command: self.command,
            args: self.args,
            env: self.env,
            working_dir: self.working_dir,
            files,
            limits: self.limits.map(|l| ResourceLimits {
                cpu_cores: l.cpu_cores,
                memory_mb: l.memory_mb,
                timeout_ms: l.timeout_ms,
                cpu_time_secs: l.cpu_time_secs,
                max_open_files: l.max_open_files,
                max_output_bytes: l.max_output_bytes,
            }),
            image: self.image,
        })
    }
}

/// Build the router for the given state.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Jobs
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        // One-shot run
        .route("/run", post(run_oneshot))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server on the given address until `shutdown` fires.
pub async fn run_server(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Starting HTTP server on {}", addr);
    serve(listener, state, shutdown).await
}

/// Serve on an already-bound listener.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

async fn health(State(state): State<AppState>) -> Json<HealthInfo> {
    let orchestrator = &state.orchestrator;
    Json(HealthInfo {
        status: "ok".to_string(),
        runtime: orchestrator.runtime_name().to_string(),
        running: orchestrator.running(),
        queued: orchestrator.queued(),
        capacity: orchestrator.config().max_concurrent,
    })
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobInfo>> {
    let jobs = state.orchestrator.list().await;
    Json(jobs.into_iter().map(JobInfo::from).collect())
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, (StatusCode, String)> {
    let status = state.orchestrator.status(&id).await.map_err(error_response)?;
    Ok(Json(status.into()))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelInfo>, (StatusCode, String)> {
    let ack = state.orchestrator.cancel(&id).await.map_err(error_response)?;
    info!("Cancel requested for job: {}", id);
    Ok(Json(ack.into()))
}

async fn run_oneshot(
    State(state): State<AppState>,
    Json(req): Json<RunRequest>,
) -> Result<Json<RunResponse>, (StatusCode, String)> {
    info!("POST /run - command: {} {:?}", req.command, req.args);
    let request = req.into_execution()?;
    let mut submission = state
        .orchestrator
        .submit(request)
        .await
        .map_err(error_response)?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut terminal = None;
    while let Some(event) = submission.events.recv().await {
        match event.event {
            Some(Event::Chunk(chunk)) => match OutputStream::try_from(chunk.stream) {
                Ok(OutputStream::Stderr) => stderr.extend_from_slice(&chunk.data),
                _ => stdout.extend_from_slice(&chunk.data),
            },
            Some(Event::Terminal(t)) => terminal = Some(TerminalInfo::from(&t)),
            None => {}
        }
    }

    info!(
        "POST /run - job={} result: {:?}",
        submission.job_id,
        terminal.as_ref().map(|t| (&t.reason, t.exit_code))
    );
    Ok(Json(RunResponse {
        job_id: submission.job_id,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        terminal,
    }))
}
