//! Executor - container-sandboxed command execution.
//!
//! Usage:
//!   executor server [--runtime docker|local]   # Orchestrator: gRPC + HTTP
//!   executor sidecar [--port 50052]             # Agent inside each sandbox container

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sandbox_executor::config::{self, ServerConfig, SidecarConfig};
use sandbox_executor::orchestrator::Orchestrator;
use sandbox_executor::runtime::{ContainerRuntime, DockerRuntime, LocalRuntime};
use sandbox_executor::state::AppState;
use sandbox_executor::{grpc_server, http_server, sidecar};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "executor")]
#[command(about = "Container-sandboxed command executor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the orchestrator (gRPC and HTTP)
    Server(ServerArgs),
    /// Start the execution agent inside a sandbox container
    Sidecar(SidecarArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RuntimeKind {
    /// Docker engine via its local socket
    Docker,
    /// In-process sidecars, no isolation (development only)
    Local,
}

#[derive(clap::Args, Debug)]
struct ServerArgs {
    /// gRPC port
    #[arg(long, env = "EXECUTOR_GRPC_PORT", default_value = "50051")]
    grpc_port: u16,

    /// HTTP port
    #[arg(long, env = "EXECUTOR_HTTP_PORT", default_value = "8080")]
    http_port: u16,

    #[arg(long, env = "EXECUTOR_RUNTIME", value_enum, default_value = "docker")]
    runtime: RuntimeKind,

    /// Maximum sandboxes alive at once
    #[arg(long, env = "EXECUTOR_MAX_CONCURRENT", default_value = "4")]
    max_concurrent: usize,

    /// Requests allowed to wait for a slot
    #[arg(long, env = "EXECUTOR_QUEUE_DEPTH", default_value = "16")]
    queue_depth: usize,

    /// Execution deadline in seconds
    #[arg(long, env = "EXECUTOR_EXECUTION_DEADLINE", default_value = "300")]
    execution_deadline: u64,

    /// Provisioning deadline in seconds
    #[arg(long, env = "EXECUTOR_PROVISIONING_DEADLINE", default_value = "30")]
    provisioning_deadline: u64,

    /// Cancellation grace period in seconds
    #[arg(long, env = "EXECUTOR_CANCEL_GRACE", default_value = "5")]
    cancel_grace: u64,

    /// Upper bound on one container teardown, in seconds
    #[arg(long, env = "EXECUTOR_TEARDOWN_TIMEOUT", default_value = "30")]
    teardown_timeout: u64,

    /// Sandbox image
    #[arg(long, env = "EXECUTOR_IMAGE", default_value = config::DEFAULT_IMAGE)]
    image: String,

    /// Port the sidecar listens on inside the container
    #[arg(long, env = "EXECUTOR_SIDECAR_PORT", default_value_t = config::DEFAULT_SIDECAR_PORT)]
    sidecar_port: u16,

    /// Docker network to attach sandboxes to
    #[arg(long, env = "EXECUTOR_NETWORK")]
    network: Option<String>,

    /// How long finished job records are kept, in seconds
    #[arg(long, env = "EXECUTOR_JOB_TTL", default_value_t = config::JOB_RECORD_TTL_SECS)]
    job_ttl: u64,
}

impl ServerArgs {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            max_concurrent: self.max_concurrent,
            queue_depth: self.queue_depth,
            execution_deadline: Duration::from_secs(self.execution_deadline),
            provisioning_deadline: Duration::from_secs(self.provisioning_deadline),
            cancel_grace: Duration::from_secs(self.cancel_grace),
            teardown_timeout: Duration::from_secs(self.teardown_timeout),
            image: self.image.clone(),
            sidecar_port: self.sidecar_port,
            network: self.network.clone(),
            job_ttl: Duration::from_secs(self.job_ttl),
            ..Default::default()
        }
    }
}

#[derive(clap::Args, Debug)]
struct SidecarArgs {
    /// Port to listen on
    #[arg(long, env = "EXECUTOR_SIDECAR_PORT", default_value_t = config::DEFAULT_SIDECAR_PORT)]
    port: u16,

    /// Seconds between SIGTERM and SIGKILL when cancelling
    #[arg(long, env = "EXECUTOR_KILL_GRACE", default_value = "3")]
    kill_grace: u64,

    /// Working directory used when a request names none
    #[arg(long, env = "EXECUTOR_WORKING_DIR", default_value = config::DEFAULT_WORKING_DIR)]
    working_dir: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Server(args) => serve(args).await,
        Commands::Sidecar(args) => run_sidecar(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn serve(args: ServerArgs) -> Result<(), BoxError> {
    let config = args.server_config();
    let teardown_limit = config.teardown_timeout;

    let runtime: Arc<dyn ContainerRuntime> = match args.runtime {
        RuntimeKind::Docker => {
            let docker = DockerRuntime::connect()?;
            docker.ping().await?;
            Arc::new(docker)
        }
        RuntimeKind::Local => {
            info!("Using in-process local runtime: commands run unisolated");
            Arc::new(LocalRuntime::new(SidecarConfig::default()))
        }
    };

    let state = AppState::new(Orchestrator::new(runtime, config)?);
    let cleanup = state.spawn_cleanup(Duration::from_secs(60));
    let shutdown = CancellationToken::new();

    // Cancel jobs first so streaming calls finish before the servers drain.
    tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            info!("Shutdown signal received");
            state.orchestrator.shutdown(teardown_limit).await;
            shutdown.cancel();
        }
    });

    let grpc_addr = SocketAddr::from(([0, 0, 0, 0], args.grpc_port));
    let http_addr = SocketAddr::from(([0, 0, 0, 0], args.http_port));
    let (grpc, http) = tokio::join!(
        async {
            let result = grpc_server::run_server(grpc_addr, state.clone(), shutdown.clone()).await;
            shutdown.cancel();
            result
        },
        async {
            let result = http_server::run_server(http_addr, state.clone(), shutdown.clone()).await;
            shutdown.cancel();
            result
        },
    );

    cleanup.abort();
    state.orchestrator.shutdown(teardown_limit).await;
    grpc?;
    http?;
    Ok(())
}

async fn run_sidecar(args: SidecarArgs) -> Result<(), BoxError> {
    let config = SidecarConfig {
        port: args.port,
        kill_grace: Duration::from_secs(args.kill_grace),
        default_working_dir: args.working_dir,
    };
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    });
    sidecar::run_server(config, shutdown).await
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            error!("failed to install SIGTERM handler: {}", e);
            let _ = ctrl_c.await;
        }
    }
}
