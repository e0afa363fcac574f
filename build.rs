//! Generates the tonic client/server stubs for the sidecar and executor
//! services. Message types are declared by hand in `src/proto.rs`, so no
//! `protoc` is needed at build time.

use tonic_build::manual::{Builder, Method, Service};

const CODEC: &str = "tonic::codec::ProstCodec";

fn method(name: &str, route: &str, input: &str, output: &str, streaming: bool) -> Method {
    let builder = Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("crate::proto::{input}"))
        .output_type(format!("crate::proto::{output}"))
        .codec_path(CODEC);
    if streaming {
        builder.server_streaming().build()
    } else {
        builder.build()
    }
}

fn main() {
    let sidecar = Service::builder()
        .name("Sidecar")
        .package("executor")
        .method(method("execute", "Execute", "ExecutionRequest", "ExecutionEvent", true))
        .method(method("cancel", "Cancel", "CancelRequest", "CancelAck", false))
        .method(method("ping", "Ping", "PingRequest", "PingResponse", false))
        .build();

    let executor = Service::builder()
        .name("Executor")
        .package("executor")
        .method(method("execute", "Execute", "ExecutionRequest", "ExecutionEvent", true))
        .method(method("cancel", "Cancel", "CancelJobRequest", "CancelAck", false))
        .method(method("get_job", "GetJob", "GetJobRequest", "JobStatus", false))
        .method(method("list_jobs", "ListJobs", "ListJobsRequest", "ListJobsResponse", false))
        .method(method("watch_job", "WatchJob", "WatchJobRequest", "ExecutionEvent", true))
        .build();

    Builder::new().compile(&[sidecar, executor]);
}
