//! Caller-facing gRPC server implementation using Tonic.

use std::net::SocketAddr;
use std::pin::Pin;

use tokio::net::TcpListener;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataValue;
use tonic::{Request, Response, Status};
use tracing::info;

use crate::proto::executor_server::{Executor, ExecutorServer};
use crate::proto::{
    CancelAck, CancelJobRequest, ExecutionEvent, ExecutionRequest, GetJobRequest, JobStatus,
    ListJobsRequest, ListJobsResponse, WatchJobRequest, JOB_ID_HEADER,
};
use crate::state::AppState;

/// gRPC service implementation.
pub struct ExecutorService {
    state: AppState,
}

impl ExecutorService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

#[tonic::async_trait]
impl Executor for ExecutorService {
    type ExecuteStream = Pin<Box<dyn Stream<Item = Result<ExecutionEvent, Status>> + Send>>;

    async fn execute(
        &self,
        request: Request<ExecutionRequest>,
    ) -> Result<Response<Self::ExecuteStream>, Status> {
        let req = request.into_inner();
        info!("gRPC Execute: command={} args={:?}", req.command, req.args);

        let submission = self.state.orchestrator.submit(req).await?;
        let job_id = MetadataValue::try_from(submission.job_id.as_str())
            .map_err(|e| Status::internal(e.to_string()))?;

        // Dropping this stream (caller gone) cancels the job.
        let stream = ReceiverStream::new(submission.events).map(Ok);
        let mut response = Response::new(Box::pin(stream) as Self::ExecuteStream);
        response.metadata_mut().insert(JOB_ID_HEADER, job_id);
        Ok(response)
    }

    async fn cancel(
        &self,
        request: Request<CancelJobRequest>,
    ) -> Result<Response<CancelAck>, Status> {
        let job_id = request.into_inner().job_id;
        info!("gRPC Cancel: job={}", job_id);
        let ack = self.state.orchestrator.cancel(&job_id).await?;
        Ok(Response::new(ack))
    }

    async fn get_job(&self, request: Request<GetJobRequest>) -> Result<Response<JobStatus>, Status> {
        let job_id = request.into_inner().job_id;
        let status = self.state.orchestrator.status(&job_id).await?;
        Ok(Response::new(status))
    }

    async fn list_jobs(
        &self,
        _request: Request<ListJobsRequest>,
    ) -> Result<Response<ListJobsResponse>, Status> {
        let jobs = self.state.orchestrator.list().await;
        Ok(Response::new(ListJobsResponse { jobs }))
    }

    type WatchJobStream = ReceiverStream<Result<ExecutionEvent, Status>>;

    async fn watch_job(
        &self,
        request: Request<WatchJobRequest>,
    ) -> Result<Response<Self::WatchJobStream>, Status> {
        let job_id = request.into_inner().job_id;
        info!("gRPC WatchJob: job={}", job_id);
        let rx = self.state.orchestrator.watch(&job_id).await?;
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Run the gRPC server on the given address until `shutdown` fires.
pub async fn run_server(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    info!("Starting gRPC server on {}", addr);
    serve(listener, state, shutdown).await?;
    Ok(())
}

/// Serve on an already-bound listener.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), tonic::transport::Error> {
    let service = ExecutorService::new(state);

    tonic::transport::Server::builder()
        .add_service(ExecutorServer::new(service))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled_owned())
        .await
}
