//! Sandbox lifecycle manager.
//!
//! One [`LifecycleManager`] owns one sandbox from slot acquisition to
//! teardown:
//!
//! ```text
//! Requested -> Provisioning -> Ready -> Executing -> {Completed | Failed | TimedOut | Cancelled} -> TornDown
//! ```
//!
//! Every path out of `Provisioning` goes through a [`TeardownGuard`]. The guard
//! is consumed by the normal exit path; if the managing task panics or is
//! aborted first, its `Drop` spawns the same teardown instead. Teardown always
//! finishes before the terminal event is handed to the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tonic::Streaming;
use tracing::{debug, error, info, warn};

use crate::admission::{SlotPermit, Ticket};
use crate::config::ServerConfig;
use crate::error::RuntimeError;
use crate::output::OutputLog;
use crate::proto::execution_event::Event;
use crate::proto::sidecar_client::SidecarClient;
use crate::proto::{
    CancelRequest, ExecutionEvent, ExecutionRequest, OutputChunk, PingRequest, Terminal,
    TerminationReason,
};
use crate::runtime::{self, ContainerHandle, ContainerRuntime, ContainerSpec};

const CALL_TIMEOUT: Duration = Duration::from_secs(1);
const PING_BACKOFF_START: Duration = Duration::from_millis(50);
const PING_BACKOFF_MAX: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Requested,
    Provisioning,
    Ready,
    Executing,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    TornDown,
}

impl SandboxState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::TornDown => "torn_down",
        }
    }

    /// Holds a slot (and possibly a container).
    pub fn is_active(self) -> bool {
        matches!(self, Self::Provisioning | Self::Ready | Self::Executing)
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot published on every state change.
#[derive(Debug, Clone)]
pub struct SandboxStatus {
    pub state: SandboxState,
    pub container_id: Option<String>,
    /// Set once the outcome is decided; never changes afterwards.
    pub terminal: Option<Terminal>,
    pub finished_at: Option<std::time::Instant>,
    /// The runtime reported that the container hit its memory limit.
    pub oom_killed: bool,
}

impl Default for SandboxStatus {
    fn default() -> Self {
        Self {
            state: SandboxState::Requested,
            container_id: None,
            terminal: None,
            finished_at: None,
            oom_killed: false,
        }
    }
}

pub type StatusSender = Arc<watch::Sender<SandboxStatus>>;

/// Record the outcome unless one is already recorded. Returns whether this
/// call recorded it.
pub fn record_outcome(
    status: &watch::Sender<SandboxStatus>,
    state: SandboxState,
    terminal: &Terminal,
) -> bool {
    status.send_if_modified(|s| {
        if s.terminal.is_some() {
            return false;
        }
        if s.state != SandboxState::TornDown {
            s.state = state;
        }
        s.terminal = Some(terminal.clone());
        s.finished_at = Some(std::time::Instant::now());
        true
    })
}

/// Upstream half of a job's event stream. Everything sent is also recorded
/// in the job's output log.
pub struct EventSink {
    tx: mpsc::Sender<ExecutionEvent>,
    log: Arc<OutputLog>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<ExecutionEvent>, log: Arc<OutputLog>) -> Self {
        Self { tx, log }
    }

    /// False once the caller has gone away.
    async fn chunk(&self, chunk: OutputChunk) -> bool {
        self.log.record(&chunk);
        self.tx
            .send(ExecutionEvent {
                event: Some(Event::Chunk(chunk)),
            })
            .await
            .is_ok()
    }

    async fn closed(&self) {
        self.tx.closed().await
    }

    /// Deliver the terminal event. Consumes the sink, so there is no way to
    /// send a second one.
    pub async fn terminal(self, terminal: Terminal) -> bool {
        self.log.finish(&terminal);
        self.tx.send(ExecutionEvent::terminal(terminal)).await.is_ok()
    }
}

type CreateTask = JoinHandle<runtime::Result<ContainerHandle>>;

struct Teardown {
    sandbox_id: String,
    runtime: Arc<dyn ContainerRuntime>,
    container: Option<ContainerHandle>,
    /// A `create` whose caller gave up before the runtime answered.
    creating: Option<CreateTask>,
    permit: SlotPermit,
    grace: Duration,
    limit: Duration,
    status: StatusSender,
}

impl Teardown {
    async fn run(self) {
        let Teardown {
            sandbox_id,
            runtime,
            container,
            creating,
            permit,
            grace,
            limit,
            status,
        } = self;

        let container = match (container, creating) {
            (Some(container), _) => Some(container),
            (None, Some(task)) => reclaim(&sandbox_id, task, limit).await,
            (None, None) => None,
        };
        if let Some(container) = &container {
            let container_id = container.id().to_string();
            status.send_if_modified(|s| {
                let known = s.container_id.as_deref() == Some(container_id.as_str());
                if !known {
                    s.container_id = Some(container_id);
                }
                !known
            });
        }

        if let Some(container) = container {
            let work = async {
                match runtime.stop(&container, grace).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        debug!(%sandbox_id, container_id = %container.id(), "container already gone")
                    }
                    Err(e) => {
                        warn!(%sandbox_id, container_id = %container.id(), error = %e, "stop failed")
                    }
                }
                match runtime.remove(&container).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        warn!(%sandbox_id, container_id = %container.id(), error = %e, "remove failed")
                    }
                }
            };
            if timeout(limit, work).await.is_err() {
                warn!(%sandbox_id, timeout = ?limit, "teardown timed out");
            }
        }

        drop(permit);
        status.send_modify(|s| s.state = SandboxState::TornDown);
        info!(%sandbox_id, "Sandbox torn down");
    }
}

/// Wait for an abandoned `create` so whatever it made is removed too.
async fn reclaim(sandbox_id: &str, task: CreateTask, limit: Duration) -> Option<ContainerHandle> {
    match timeout(limit, task).await {
        Ok(Ok(Ok(container))) => {
            info!(%sandbox_id, container_id = %container.id(), "container created after provisioning ended, removing it");
            Some(container)
        }
        Ok(Ok(Err(e))) => {
            debug!(%sandbox_id, error = %e, "abandoned create failed");
            None
        }
        Ok(Err(e)) => {
            warn!(%sandbox_id, error = %e, "create task failed");
            None
        }
        Err(_) => {
            warn!(%sandbox_id, timeout = ?limit, "create still running at teardown deadline, container may be leaked");
            None
        }
    }
}

/// Scoped owner of a sandbox's container and slot.
pub struct TeardownGuard {
    inner: Option<Teardown>,
}

impl TeardownGuard {
    /// Create the container on its own task. If this future is dropped
    /// before the runtime answers, teardown waits for the task and removes
    /// what it created.
    async fn create(
        &mut self,
        runtime: Arc<dyn ContainerRuntime>,
        spec: ContainerSpec,
    ) -> Result<&ContainerHandle, RuntimeError> {
        let teardown = self
            .inner
            .as_mut()
            .ok_or_else(|| RuntimeError::Failed("sandbox already torn down".into()))?;
        let task = teardown
            .creating
            .insert(tokio::spawn(async move { runtime.create(&spec).await }));
        let joined = task.await;
        teardown.creating = None;
        let container =
            joined.map_err(|e| RuntimeError::Failed(format!("create task failed: {}", e)))??;
        let container: &ContainerHandle = teardown.container.insert(container);
        Ok(container)
    }

    fn container(&self) -> Option<&ContainerHandle> {
        self.inner.as_ref()?.container.as_ref()
    }

    /// Run teardown and wait for it. It runs on its own task so that aborting
    /// the caller cannot leave it half done.
    async fn teardown(mut self) {
        let Some(teardown) = self.inner.take() else {
            return;
        };
        let sandbox_id = teardown.sandbox_id.clone();
        if let Err(e) = tokio::spawn(teardown.run()).await {
            error!(%sandbox_id, error = %e, "teardown task failed");
        }
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        let Some(teardown) = self.inner.take() else {
            return;
        };
        warn!(sandbox_id = %teardown.sandbox_id, "lifecycle task exited early, tearing down in background");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(teardown.run());
            }
            Err(_) => error!(
                sandbox_id = %teardown.sandbox_id,
                "no runtime available, container may be leaked"
            ),
        }
    }
}

enum Interrupt {
    Cancelled(&'static str),
    TimedOut(Duration),
}

type Outcome = (SandboxState, Terminal);

pub struct LifecycleManager {
    sandbox_id: String,
    runtime: Arc<dyn ContainerRuntime>,
    config: Arc<ServerConfig>,
    cancel: CancellationToken,
    status: StatusSender,
}

impl LifecycleManager {
    pub fn new(
        sandbox_id: String,
        runtime: Arc<dyn ContainerRuntime>,
        config: Arc<ServerConfig>,
        cancel: CancellationToken,
        status: StatusSender,
    ) -> Self {
        Self {
            sandbox_id,
            runtime,
            config,
            cancel,
            status,
        }
    }

    fn set_state(&self, state: SandboxState) {
        self.status.send_modify(|s| s.state = state);
        debug!(sandbox_id = %self.sandbox_id, state = %state, "state change");
    }

    /// Drive the sandbox to completion. Exactly one terminal event is sent to
    /// `sink` unless the caller is already gone.
    pub async fn run(self, request: ExecutionRequest, ticket: Ticket, sink: EventSink) {
        let permit = match self.wait_for_slot(ticket, &sink).await {
            Ok(permit) => permit,
            Err((state, terminal)) => {
                record_outcome(&self.status, state, &terminal);
                self.status.send_modify(|s| s.state = SandboxState::TornDown);
                sink.terminal(terminal).await;
                return;
            }
        };

        self.set_state(SandboxState::Provisioning);
        let mut guard = TeardownGuard {
            inner: Some(Teardown {
                sandbox_id: self.sandbox_id.clone(),
                runtime: Arc::clone(&self.runtime),
                container: None,
                creating: None,
                permit,
                grace: self.config.cancel_grace,
                limit: self.config.teardown_timeout,
                status: Arc::clone(&self.status),
            }),
        };

        let (state, terminal) = match self.provision(&mut guard, &request, &sink).await {
            Ok(client) => {
                self.set_state(SandboxState::Ready);
                let outcome = self.execute(client, request, &sink).await;
                self.check_memory(&guard, outcome).await
            }
            Err(outcome) => outcome,
        };

        info!(
            sandbox_id = %self.sandbox_id,
            state = %state,
            reason = %terminal.termination_reason(),
            exit_code = ?terminal.exit_code,
            "Execution finished"
        );
        record_outcome(&self.status, state, &terminal);
        guard.teardown().await;
        sink.terminal(terminal).await;
    }

    async fn wait_for_slot(&self, ticket: Ticket, sink: &EventSink) -> Result<SlotPermit, Outcome> {
        let queued = ticket.is_queued();
        if queued {
            debug!(sandbox_id = %self.sandbox_id, "waiting for a sandbox slot");
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(cancelled("cancelled while queued")),
            _ = sink.closed() => Err(cancelled("caller disconnected while queued")),
            permit = ticket.wait() => permit.ok_or_else(|| {
                (
                    SandboxState::Failed,
                    Terminal::failed(TerminationReason::Internal, "admission queue closed"),
                )
            }),
        }
    }

    fn container_spec(&self, request: &ExecutionRequest) -> ContainerSpec {
        let image = if request.image.is_empty() {
            self.config.image.clone()
        } else {
            request.image.clone()
        };
        ContainerSpec {
            name: self.sandbox_id.clone(),
            image,
            limits: request.limits.unwrap_or(self.config.default_limits),
            network: self.config.network.clone(),
            sidecar_port: self.config.sidecar_port,
            labels: HashMap::new(),
        }
    }

    async fn provision(
        &self,
        guard: &mut TeardownGuard,
        request: &ExecutionRequest,
        sink: &EventSink,
    ) -> Result<SidecarClient<Channel>, Outcome> {
        let spec = self.container_spec(request);
        let deadline = self.config.provisioning_deadline;

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(cancelled("cancelled during provisioning")),
            _ = sink.closed() => Err(cancelled("caller disconnected during provisioning")),
            result = timeout(deadline, self.bring_up(guard, spec)) => match result {
                Ok(Ok(client)) => Ok(client),
                Ok(Err(e)) => {
                    warn!(sandbox_id = %self.sandbox_id, error = %e, "provisioning failed");
                    Err((
                        SandboxState::Failed,
                        Terminal::failed(TerminationReason::ProvisioningFailed, e.to_string()),
                    ))
                }
                Err(_) => {
                    warn!(sandbox_id = %self.sandbox_id, ?deadline, "provisioning timed out");
                    Err((
                        SandboxState::Failed,
                        Terminal::failed(
                            TerminationReason::ProvisioningTimeout,
                            format!("sandbox not ready within {:?}", deadline),
                        ),
                    ))
                }
            },
        }
    }

    /// Create and start the container, then ping the sidecar until it answers.
    async fn bring_up(
        &self,
        guard: &mut TeardownGuard,
        spec: ContainerSpec,
    ) -> Result<SidecarClient<Channel>, RuntimeError> {
        let container = guard.create(Arc::clone(&self.runtime), spec).await?;
        let container_id = container.id().to_string();
        self.status
            .send_modify(|s| s.container_id = Some(container_id.clone()));

        self.runtime.start(container).await?;
        let uri = self.runtime.endpoint(container).await?;
        let endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| RuntimeError::Failed(format!("invalid sidecar endpoint {}: {}", uri, e)))?
            .connect_timeout(CALL_TIMEOUT);

        let mut backoff = PING_BACKOFF_START;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match ping_sidecar(&endpoint).await {
                Ok(client) => {
                    info!(sandbox_id = %self.sandbox_id, %container_id, %uri, attempts, "Sandbox ready");
                    return Ok(client);
                }
                Err(reason) => {
                    debug!(sandbox_id = %self.sandbox_id, attempts, %reason, "sidecar not ready");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(PING_BACKOFF_MAX);
                }
            }
        }
    }

    async fn execute(
        &self,
        mut client: SidecarClient<Channel>,
        request: ExecutionRequest,
        sink: &EventSink,
    ) -> Outcome {
        let budget = self
            .config
            .deadline_for(&request.limits.unwrap_or(self.config.default_limits));
        let deadline = Instant::now() + budget;
        self.set_state(SandboxState::Executing);

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupt::Cancelled("cancelled by caller")),
            _ = sink.closed() => Err(Interrupt::Cancelled("caller disconnected")),
            _ = sleep_until(deadline) => Err(Interrupt::TimedOut(budget)),
            response = client.execute(request) => Ok(response),
        };
        let mut stream = match opened {
            Ok(Ok(response)) => response.into_inner(),
            Ok(Err(status)) => {
                return (
                    SandboxState::Failed,
                    Terminal::failed(
                        TerminationReason::TransportFailed,
                        format!("execute rejected: {}", status.message()),
                    ),
                )
            }
            Err(why) => return self.interrupt(&mut client, None, why, sink).await,
        };

        let why = loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Interrupt::Cancelled("cancelled by caller"),
                _ = sink.closed() => break Interrupt::Cancelled("caller disconnected"),
                _ = sleep_until(deadline) => break Interrupt::TimedOut(budget),
                message = stream.message() => message,
            };
            match message {
                Ok(Some(ExecutionEvent {
                    event: Some(Event::Chunk(chunk)),
                })) => {
                    let delivered = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break Interrupt::Cancelled("cancelled by caller"),
                        _ = sleep_until(deadline) => break Interrupt::TimedOut(budget),
                        delivered = sink.chunk(chunk) => delivered,
                    };
                    if !delivered {
                        break Interrupt::Cancelled("caller disconnected");
                    }
                }
                Ok(Some(ExecutionEvent {
                    event: Some(Event::Terminal(terminal)),
                })) => return classify(terminal),
                Ok(Some(ExecutionEvent { event: None })) => {
                    warn!(sandbox_id = %self.sandbox_id, "ignoring empty event from sidecar")
                }
                Ok(None) => {
                    warn!(sandbox_id = %self.sandbox_id, "sidecar stream ended without a terminal event");
                    return (
                        SandboxState::Failed,
                        Terminal::failed(
                            TerminationReason::TransportFailed,
                            "sidecar closed the stream without a terminal event",
                        ),
                    );
                }
                Err(status) => {
                    warn!(sandbox_id = %self.sandbox_id, %status, "sidecar stream broken");
                    return (
                        SandboxState::Failed,
                        Terminal::failed(
                            TerminationReason::TransportFailed,
                            format!("stream broken: {}", status.message()),
                        ),
                    );
                }
            }
        };
        self.interrupt(&mut client, Some(&mut stream), why, sink).await
    }

    /// Ask the runtime whether the container was OOM-killed and, if so,
    /// report the run as a resource violation. Interrupted runs keep their
    /// timeout or cancel outcome.
    async fn check_memory(&self, guard: &TeardownGuard, outcome: Outcome) -> Outcome {
        let (state, terminal) = outcome;
        if !matches!(state, SandboxState::Completed | SandboxState::Failed) {
            return (state, terminal);
        }
        let Some(container) = guard.container() else {
            return (state, terminal);
        };
        match timeout(CALL_TIMEOUT, self.runtime.oom_killed(container)).await {
            Ok(Ok(true)) => {
                warn!(sandbox_id = %self.sandbox_id, container_id = %container.id(), "container was OOM-killed");
                self.status.send_modify(|s| s.oom_killed = true);
                if terminal.termination_reason() == TerminationReason::ResourceLimitExceeded {
                    return (SandboxState::Failed, terminal);
                }
                let terminal = Terminal {
                    exit_code: terminal.exit_code,
                    ..Terminal::failed(
                        TerminationReason::ResourceLimitExceeded,
                        "container ran out of memory",
                    )
                };
                (SandboxState::Failed, terminal)
            }
            Ok(Ok(false)) => (state, terminal),
            Ok(Err(e)) => {
                debug!(sandbox_id = %self.sandbox_id, error = %e, "oom query failed");
                (state, terminal)
            }
            Err(_) => {
                debug!(sandbox_id = %self.sandbox_id, "oom query timed out");
                (state, terminal)
            }
        }
    }

    /// Shared path for timeout and cancellation: ask the sidecar to stop,
    /// forward what it still sends for up to the grace period, then give up
    /// on it. The outcome is fixed before the sidecar is contacted.
    async fn interrupt(
        &self,
        client: &mut SidecarClient<Channel>,
        stream: Option<&mut Streaming<ExecutionEvent>>,
        why: Interrupt,
        sink: &EventSink,
    ) -> Outcome {
        let (state, terminal) = match why {
            Interrupt::Cancelled(reason) => cancelled(reason),
            Interrupt::TimedOut(budget) => (
                SandboxState::TimedOut,
                Terminal::failed(
                    TerminationReason::Timeout,
                    format!("deadline of {:?} exceeded", budget),
                ),
            ),
        };
        info!(sandbox_id = %self.sandbox_id, reason = %terminal.message, "Interrupting execution");

        // Cancel and drain share one grace period.
        let grace = self.config.cancel_grace;
        let deadline = Instant::now() + grace;
        let request = CancelRequest {
            reason: terminal.message.clone(),
        };
        match timeout_at(deadline, client.cancel(request)).await {
            Ok(Ok(ack)) => {
                let ack = ack.into_inner();
                debug!(
                    sandbox_id = %self.sandbox_id,
                    accepted = ack.accepted,
                    already_terminated = ack.already_terminated,
                    "cancel acknowledged"
                );
            }
            Ok(Err(status)) => warn!(sandbox_id = %self.sandbox_id, %status, "cancel rpc failed"),
            Err(_) => warn!(sandbox_id = %self.sandbox_id, "cancel rpc timed out"),
        }

        if let Some(stream) = stream {
            if timeout_at(deadline, drain(stream, sink)).await.is_err() {
                warn!(sandbox_id = %self.sandbox_id, ?grace, "sidecar unresponsive after cancel, forcing teardown");
            }
        }
        (state, terminal)
    }
}

async fn ping_sidecar(endpoint: &Endpoint) -> Result<SidecarClient<Channel>, String> {
    let channel = endpoint.connect().await.map_err(|e| e.to_string())?;
    let mut client = SidecarClient::new(channel);
    let pong = timeout(CALL_TIMEOUT, client.ping(PingRequest {}))
        .await
        .map_err(|_| "ping timed out".to_string())?
        .map_err(|status| status.to_string())?
        .into_inner();
    if pong.busy {
        return Err("sidecar is already executing".into());
    }
    Ok(client)
}

/// Forward remaining output after a cancel. The sidecar's own terminal is
/// dropped since the outcome is already decided.
async fn drain(stream: &mut Streaming<ExecutionEvent>, sink: &EventSink) {
    while let Ok(Some(event)) = stream.message().await {
        match event.event {
            Some(Event::Chunk(chunk)) => {
                sink.chunk(chunk).await;
            }
            Some(Event::Terminal(terminal)) => {
                debug!(reason = %terminal.termination_reason(), "sidecar terminal after interrupt");
                return;
            }
            None => {}
        }
    }
}

fn cancelled(reason: &str) -> Outcome {
    (
        SandboxState::Cancelled,
        Terminal::failed(TerminationReason::Cancelled, reason),
    )
}

/// Map a sidecar terminal to the sandbox's final state.
fn classify(terminal: Terminal) -> Outcome {
    match terminal.termination_reason() {
        TerminationReason::Exited => (SandboxState::Completed, terminal),
        TerminationReason::Cancelled => (SandboxState::Cancelled, terminal),
        TerminationReason::Unspecified => (
            SandboxState::Failed,
            Terminal::failed(
                TerminationReason::Internal,
                "sidecar sent a terminal event without a reason",
            ),
        ),
        _ => (SandboxState::Failed, terminal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::Admission;
    use crate::proto::sidecar_server::{Sidecar, SidecarServer};
    use crate::proto::{CancelAck, PingResponse};
    use crate::runtime::LocalRuntime;
    use tokio::net::TcpListener;
    use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
    use tonic::{Request, Response, Status};

    struct Harness {
        runtime: Arc<LocalRuntime>,
        admission: Admission,
        config: Arc<ServerConfig>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(ServerConfig {
                provisioning_deadline: Duration::from_secs(2),
                cancel_grace: Duration::from_millis(500),
                execution_deadline: Duration::from_secs(10),
                ..Default::default()
            })
        }

        fn with_config(config: ServerConfig) -> Self {
            Self {
                runtime: Arc::new(LocalRuntime::default()),
                admission: Admission::new(1, 1),
                config: Arc::new(config),
            }
        }

        fn manager(&self, cancel: CancellationToken) -> (LifecycleManager, watch::Receiver<SandboxStatus>) {
            let (status_tx, status_rx) = watch::channel(SandboxStatus::default());
            let manager = LifecycleManager::new(
                uuid::Uuid::new_v4().to_string(),
                self.runtime.clone(),
                Arc::clone(&self.config),
                cancel,
                Arc::new(status_tx),
            );
            (manager, status_rx)
        }

        async fn run(&self, request: ExecutionRequest) -> (Vec<ExecutionEvent>, SandboxStatus) {
            let (manager, status) = self.manager(CancellationToken::new());
            let (tx, mut rx) = mpsc::channel(16);
            let ticket = self.admission.admit().unwrap();
            manager.run(request, ticket, sink(tx)).await;
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                events.push(event);
            }
            let status = status.borrow().clone();
            (events, status)
        }
    }

    fn sink(tx: mpsc::Sender<ExecutionEvent>) -> EventSink {
        EventSink::new(tx, Arc::new(OutputLog::default()))
    }

    fn request(command: &str, args: &[&str]) -> ExecutionRequest {
        ExecutionRequest {
            command: command.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    fn last_terminal(events: &[ExecutionEvent]) -> Terminal {
        match events.last().and_then(|e| e.event.clone()) {
            Some(Event::Terminal(t)) => t,
            other => panic!("expected terminal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn completed_run_tears_down_and_releases_slot() {
        let h = Harness::new();
        let (events, status) = h.run(request("echo", &["hi"])).await;

        let terminal = last_terminal(&events);
        assert_eq!(terminal.termination_reason(), TerminationReason::Exited);
        assert_eq!(terminal.exit_code, Some(0));
        assert_eq!(status.state, SandboxState::TornDown);
        assert!(status.container_id.is_some());

        let stats = h.runtime.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.live, 0);
        assert_eq!(h.admission.in_use(), 0);
    }

    #[tokio::test]
    async fn nonzero_exit_is_still_completed() {
        let h = Harness::new();
        let (events, status) = h.run(request("sh", &["-c", "exit 3"])).await;
        let terminal = last_terminal(&events);
        assert_eq!(terminal.exit_code, Some(3));
        assert_eq!(status.terminal.unwrap().exit_code, Some(3));
    }

    #[tokio::test]
    async fn create_failure_is_provisioning_failed() {
        let h = Harness::new();
        h.runtime.fail_create(true);
        let (events, status) = h.run(request("echo", &["hi"])).await;

        assert_eq!(events.len(), 1);
        let terminal = last_terminal(&events);
        assert_eq!(terminal.termination_reason(), TerminationReason::ProvisioningFailed);
        assert_eq!(status.state, SandboxState::TornDown);
        assert_eq!(h.runtime.stats().created, 0);
        assert_eq!(h.admission.in_use(), 0);
    }

    #[tokio::test]
    async fn start_failure_still_removes_container() {
        let h = Harness::new();
        h.runtime.fail_start(true);
        let (events, _) = h.run(request("echo", &["hi"])).await;

        let terminal = last_terminal(&events);
        assert_eq!(terminal.termination_reason(), TerminationReason::ProvisioningFailed);
        let stats = h.runtime.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.removed, 1);
    }

    #[tokio::test]
    async fn unresponsive_sidecar_is_provisioning_timeout() {
        let h = Harness::new();
        h.runtime.unresponsive(true);
        let (events, status) = h.run(request("echo", &["hi"])).await;

        let terminal = last_terminal(&events);
        assert_eq!(terminal.termination_reason(), TerminationReason::ProvisioningTimeout);
        assert_eq!(status.state, SandboxState::TornDown);
        assert_eq!(h.runtime.stats().live, 0);
    }

    #[tokio::test]
    async fn teardown_errors_are_absorbed() {
        let h = Harness::new();
        h.runtime.fail_remove(true);
        let (events, status) = h.run(request("echo", &["hi"])).await;
        assert_eq!(last_terminal(&events).exit_code, Some(0));
        assert_eq!(status.state, SandboxState::TornDown);
        assert_eq!(h.admission.in_use(), 0);
    }

    #[tokio::test]
    async fn cancel_while_queued_never_provisions() {
        let h = Harness::new();
        let _held = h.admission.acquire().await.unwrap();
        let cancel = CancellationToken::new();
        let (manager, status) = h.manager(cancel.clone());
        let (tx, mut rx) = mpsc::channel(16);
        let ticket = h.admission.admit().unwrap();
        assert!(ticket.is_queued());

        cancel.cancel();
        manager.run(request("echo", &["hi"]), ticket, sink(tx)).await;

        let event = rx.recv().await.unwrap();
        match event.event {
            Some(Event::Terminal(t)) => {
                assert_eq!(t.termination_reason(), TerminationReason::Cancelled)
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(status.borrow().terminal.as_ref().map(|t| t.reason), Some(TerminationReason::Cancelled as i32));
        assert_eq!(h.runtime.stats().created, 0);
    }

    #[tokio::test]
    async fn aborted_manager_still_tears_down() {
        let h = Harness::new();
        let (manager, mut status) = h.manager(CancellationToken::new());
        let (tx, _rx) = mpsc::channel(16);
        let ticket = h.admission.admit().unwrap();
        let task = tokio::spawn(manager.run(request("sleep", &["30"]), ticket, sink(tx)));

        status
            .wait_for(|s| s.state == SandboxState::Executing)
            .await
            .unwrap();
        task.abort();

        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.state == SandboxState::TornDown))
            .await
            .unwrap()
            .unwrap();
        let stats = h.runtime.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.remove_calls.values().sum::<usize>(), 1);
        assert_eq!(h.admission.in_use(), 0);
    }

    #[tokio::test]
    async fn container_created_after_provisioning_timeout_is_removed() {
        let h = Harness::with_config(ServerConfig {
            provisioning_deadline: Duration::from_millis(200),
            cancel_grace: Duration::from_millis(500),
            ..Default::default()
        });
        h.runtime.create_delay(Some(Duration::from_millis(600)));
        let (events, status) = h.run(request("echo", &["hi"])).await;

        assert_eq!(
            last_terminal(&events).termination_reason(),
            TerminationReason::ProvisioningTimeout
        );
        let stats = h.runtime.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.live, 0);
        assert_eq!(status.state, SandboxState::TornDown);
        assert!(status.container_id.is_some());
        assert_eq!(h.admission.in_use(), 0);
    }

    #[tokio::test]
    async fn oom_killed_container_is_a_resource_violation() {
        let h = Harness::new();
        let (manager, mut status) = h.manager(CancellationToken::new());
        let (tx, mut rx) = mpsc::channel(16);
        let ticket = h.admission.admit().unwrap();
        let task = tokio::spawn(manager.run(request("sleep", &["30"]), ticket, sink(tx)));

        let container_id = status
            .wait_for(|s| s.state == SandboxState::Executing)
            .await
            .unwrap()
            .container_id
            .clone()
            .unwrap();
        assert!(h.runtime.oom_kill(&container_id));
        task.await.unwrap();

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        let terminal = last_terminal(&events);
        assert_eq!(terminal.termination_reason(), TerminationReason::ResourceLimitExceeded);
        let status = status.borrow().clone();
        assert!(status.oom_killed);
        assert_eq!(status.state, SandboxState::TornDown);
        assert_eq!(h.runtime.stats().live, 0);
    }

    /// Accepts `Execute` but never sends anything, and never answers `Cancel`.
    #[derive(Default)]
    struct HungSidecar {
        streams: std::sync::Mutex<Vec<mpsc::Sender<Result<ExecutionEvent, Status>>>>,
    }

    #[tonic::async_trait]
    impl Sidecar for HungSidecar {
        type ExecuteStream = ReceiverStream<Result<ExecutionEvent, Status>>;

        async fn execute(
            &self,
            _request: Request<ExecutionRequest>,
        ) -> Result<Response<Self::ExecuteStream>, Status> {
            let (tx, rx) = mpsc::channel(1);
            self.streams.lock().unwrap().push(tx);
            Ok(Response::new(ReceiverStream::new(rx)))
        }

        async fn cancel(&self, _request: Request<CancelRequest>) -> Result<Response<CancelAck>, Status> {
            std::future::pending().await
        }

        async fn ping(&self, _request: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
            Ok(Response::new(PingResponse::default()))
        }
    }

    #[tokio::test]
    async fn interrupt_is_bounded_by_one_grace_period() {
        let h = Harness::new();
        let grace = h.config.cancel_grace;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(
            tonic::transport::Server::builder()
                .add_service(SidecarServer::new(HungSidecar::default()))
                .serve_with_incoming(TcpListenerStream::new(listener)),
        );
        let mut client = SidecarClient::connect(endpoint).await.unwrap();
        let mut stream = client
            .execute(request("sleep", &["30"]))
            .await
            .unwrap()
            .into_inner();

        let (manager, _status) = h.manager(CancellationToken::new());
        let (tx, _rx) = mpsc::channel(16);
        let sink = sink(tx);
        let started = std::time::Instant::now();
        let (state, terminal) = manager
            .interrupt(
                &mut client,
                Some(&mut stream),
                Interrupt::TimedOut(Duration::from_secs(1)),
                &sink,
            )
            .await;
        let elapsed = started.elapsed();

        assert_eq!(state, SandboxState::TimedOut);
        assert_eq!(terminal.termination_reason(), TerminationReason::Timeout);
        assert!(elapsed >= grace - Duration::from_millis(50), "{:?}", elapsed);
        assert!(elapsed < grace + Duration::from_millis(300), "{:?}", elapsed);
    }

    #[test]
    fn outcome_recorded_after_teardown_keeps_torn_down_state() {
        let (tx, rx) = watch::channel(SandboxStatus::default());
        tx.send_modify(|s| s.state = SandboxState::TornDown);
        assert!(record_outcome(&tx, SandboxState::Failed, &Terminal::failed(TerminationReason::Internal, "x")));
        assert_eq!(rx.borrow().state, SandboxState::TornDown);
    }

    #[test]
    fn first_recorded_outcome_wins() {
        let (tx, rx) = watch::channel(SandboxStatus::default());
        record_outcome(&tx, SandboxState::TimedOut, &Terminal::failed(TerminationReason::Timeout, "t"));
        record_outcome(&tx, SandboxState::Completed, &Terminal::exited(0));
        let status = rx.borrow();
        assert_eq!(status.state, SandboxState::TimedOut);
        assert_eq!(status.terminal.as_ref().unwrap().termination_reason(), TerminationReason::Timeout);
    }
}
