//! Sidecar execution agent: the gRPC service that runs inside each sandbox
//! container and executes exactly one request.

mod process;
mod workspace;

pub use process::{ExecSpec, CHUNK_SIZE};
pub use workspace::validate_request;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::config::SidecarConfig;
use crate::error::SidecarError;
use crate::proto::sidecar_server::{Sidecar, SidecarServer};
use crate::proto::{
    CancelAck, CancelRequest, ExecutionEvent, ExecutionRequest, PingRequest, PingResponse,
    Terminal, TerminationReason,
};

const EVENT_BUFFER: usize = 64;

/// One-shot execution state shared between the RPC handlers and the
/// execution task.
#[derive(Default)]
struct ExecState {
    started: AtomicBool,
    finished: AtomicBool,
    cancel: CancellationToken,
}

/// gRPC service implementation.
#[derive(Clone)]
pub struct SidecarService {
    config: SidecarConfig,
    state: Arc<ExecState>,
    shutdown: CancellationToken,
}

impl SidecarService {
    /// `shutdown` kills any running process and ends its stream without a
    /// terminal, the way a dying container would.
    pub fn new(config: SidecarConfig, shutdown: CancellationToken) -> Self {
        Self {
            config,
            state: Arc::new(ExecState::default()),
            shutdown,
        }
    }

    fn exec_spec(&self, req: ExecutionRequest) -> (ExecSpec, Vec<crate::proto::WorkspaceFile>) {
        let working_dir = if req.working_dir.is_empty() {
            PathBuf::from(&self.config.default_working_dir)
        } else {
            PathBuf::from(&req.working_dir)
        };
        let spec = ExecSpec {
            command: req.command,
            args: req.args,
            env: req.env,
            working_dir,
            limits: req.limits.unwrap_or_default(),
        };
        (spec, req.files)
    }
}

#[tonic::async_trait]
impl Sidecar for SidecarService {
    type ExecuteStream = ReceiverStream<Result<ExecutionEvent, Status>>;

    async fn execute(
        &self,
        request: Request<ExecutionRequest>,
    ) -> Result<Response<Self::ExecuteStream>, Status> {
        let req = request.into_inner();
        validate_request(&req)?;

        if self.state.started.swap(true, Ordering::SeqCst) {
            warn!("rejecting second Execute call");
            return Err(SidecarError::AlreadyExecuted.into());
        }
        info!(command = %req.command, args = ?req.args, "Execute");

        let (spec, files) = self.exec_spec(req);
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let state = Arc::clone(&self.state);
        let shutdown = self.shutdown.clone();
        let kill_grace = self.config.kill_grace;

        tokio::spawn(async move {
            let terminal = match workspace::prepare(&spec.working_dir, &files).await {
                Ok(()) => process::run(spec, &tx, &state.cancel, &shutdown, kill_grace).await,
                Err(e) => Some(Terminal::failed(
                    TerminationReason::LaunchFailed,
                    format!("workspace: {}", e),
                )),
            };
            state.finished.store(true, Ordering::SeqCst);
            match terminal {
                Some(terminal) => {
                    let _ = tx.send(Ok(ExecutionEvent::terminal(terminal))).await;
                }
                None => warn!("sidecar shutting down, stream closed without terminal"),
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn cancel(&self, request: Request<CancelRequest>) -> Result<Response<CancelAck>, Status> {
        let reason = request.into_inner().reason;
        if self.state.finished.load(Ordering::SeqCst) {
            return Ok(Response::new(CancelAck {
                already_terminated: true,
                accepted: false,
            }));
        }
        let accepted = !self.state.cancel.is_cancelled();
        self.state.cancel.cancel();
        info!(%reason, accepted, "Cancel");
        Ok(Response::new(CancelAck {
            already_terminated: false,
            accepted,
        }))
    }

    async fn ping(&self, _request: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        let busy = self.state.started.load(Ordering::SeqCst)
            && !self.state.finished.load(Ordering::SeqCst);
        Ok(Response::new(PingResponse {
            busy,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }))
    }
}

/// Serve the sidecar on an already-bound listener until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    config: SidecarConfig,
    shutdown: CancellationToken,
) -> Result<(), tonic::transport::Error> {
    let service = SidecarService::new(config, shutdown.clone());
    tonic::transport::Server::builder()
        .add_service(SidecarServer::new(service))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled_owned())
        .await
}

/// Run the sidecar gRPC server on the configured port.
pub async fn run_server(
    config: SidecarConfig,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!("Starting sidecar gRPC server on {}", addr);
    serve(listener, config, shutdown).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::execution_event::Event;
    use tokio_stream::StreamExt;

    fn service() -> SidecarService {
        let config = SidecarConfig {
            default_working_dir: std::env::temp_dir().to_string_lossy().into_owned(),
            ..Default::default()
        };
        SidecarService::new(config, CancellationToken::new())
    }

    fn echo() -> ExecutionRequest {
        ExecutionRequest {
            command: "echo".into(),
            args: vec!["hi".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn second_execute_is_rejected() {
        let svc = service();
        let mut stream = svc.execute(Request::new(echo())).await.unwrap().into_inner();
        let err = svc.execute(Request::new(echo())).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);
        while stream.next().await.is_some() {}
    }

    #[tokio::test]
    async fn missing_command_is_invalid_argument() {
        let svc = service();
        let err = svc
            .execute(Request::new(ExecutionRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        // A rejected request does not consume the sidecar.
        assert!(svc.execute(Request::new(echo())).await.is_ok());
    }

    #[tokio::test]
    async fn cancel_after_completion_reports_already_terminated() {
        let svc = service();
        let mut stream = svc.execute(Request::new(echo())).await.unwrap().into_inner();
        let mut last = None;
        while let Some(event) = stream.next().await {
            last = event.unwrap().event;
        }
        assert!(matches!(last, Some(Event::Terminal(ref t)) if t.exit_code == Some(0)));

        for _ in 0..2 {
            let ack = svc
                .cancel(Request::new(CancelRequest::default()))
                .await
                .unwrap()
                .into_inner();
            assert!(ack.already_terminated);
            assert!(!ack.accepted);
        }
    }

    #[tokio::test]
    async fn cancel_while_running_is_accepted_once() {
        let svc = service();
        let req = ExecutionRequest {
            command: "sleep".into(),
            args: vec!["30".into()],
            ..Default::default()
        };
        let mut stream = svc.execute(Request::new(req)).await.unwrap().into_inner();
        let first = svc.cancel(Request::new(CancelRequest::default())).await.unwrap().into_inner();
        let second = svc.cancel(Request::new(CancelRequest::default())).await.unwrap().into_inner();
        assert!(first.accepted);
        assert!(!second.accepted);

        let mut terminals = Vec::new();
        while let Some(event) = stream.next().await {
            if let Some(Event::Terminal(t)) = event.unwrap().event {
                terminals.push(t);
            }
        }
        assert_eq!(terminals.len(), 1);
        assert_eq!(terminals[0].termination_reason(), TerminationReason::Cancelled);
    }

    #[tokio::test]
    async fn ping_reports_busy_while_executing() {
        let svc = service();
        let idle = svc.ping(Request::new(PingRequest {})).await.unwrap().into_inner();
        assert!(!idle.busy);
        let req = ExecutionRequest {
            command: "sleep".into(),
            args: vec!["30".into()],
            ..Default::default()
        };
        let _stream = svc.execute(Request::new(req)).await.unwrap();
        let busy = svc.ping(Request::new(PingRequest {})).await.unwrap().into_inner();
        assert!(busy.busy);
        svc.cancel(Request::new(CancelRequest::default())).await.unwrap();
    }
}
