//! Orchestrator front door: turns each accepted request into a job with its
//! own lifecycle manager, under the global concurrency budget.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::admission::Admission;
use crate::config::ServerConfig;
use crate::error::{ExecutorError, Result};
use crate::lifecycle::{record_outcome, EventSink, LifecycleManager, SandboxState, SandboxStatus, StatusSender};
use crate::output::{OutputLog, WatchReceiver};
use crate::proto::{CancelAck, ExecutionEvent, ExecutionRequest, JobStatus, Terminal, TerminationReason};
use crate::runtime::ContainerRuntime;
use crate::sidecar::validate_request;
use crate::state::{JobHandle, Jobs};

/// An accepted request: its id and the ordered event stream, which ends
/// with exactly one terminal event.
#[derive(Debug)]
pub struct Submission {
    pub job_id: String,
    pub events: mpsc::Receiver<ExecutionEvent>,
}

pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    config: Arc<ServerConfig>,
    admission: Admission,
    jobs: Jobs,
}

impl Orchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: ServerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            admission: Admission::new(config.max_concurrent, config.queue_depth),
            runtime,
            config: Arc::new(config),
            jobs: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn runtime_name(&self) -> &str {
        self.runtime.name()
    }

    pub fn running(&self) -> usize {
        self.admission.in_use()
    }

    pub fn queued(&self) -> usize {
        self.admission.queued()
    }

    /// Validate and admit `request`. Validation and capacity problems are
    /// returned here; everything later arrives as the job's terminal event.
    pub async fn submit(&self, mut request: ExecutionRequest) -> Result<Submission> {
        validate(&request)?;
        request.limits = Some(self.config.effective_limits(request.limits.as_ref()));

        let ticket = self.admission.admit().inspect_err(|e| {
            warn!(command = %request.command, error = %e, "Rejecting request");
        })?;

        let job_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(SandboxStatus::default());
        let status_tx = Arc::new(status_tx);
        let (events_tx, events_rx) = mpsc::channel(self.config.event_buffer);
        let output = Arc::new(OutputLog::default());

        self.jobs.write().await.insert(
            job_id.clone(),
            JobHandle {
                job_id: job_id.clone(),
                cancel: cancel.clone(),
                status: status_rx,
                output: Arc::clone(&output),
                created_at: Instant::now(),
            },
        );
        info!(
            %job_id,
            command = %request.command,
            queued = ticket.is_queued(),
            "Job accepted"
        );

        let manager = LifecycleManager::new(
            job_id.clone(),
            Arc::clone(&self.runtime),
            Arc::clone(&self.config),
            cancel,
            Arc::clone(&status_tx),
        );
        let task = tokio::spawn(manager.run(
            request,
            ticket,
            EventSink::new(events_tx.clone(), Arc::clone(&output)),
        ));
        tokio::spawn(supervise(
            job_id.clone(),
            task,
            status_tx,
            Delivery {
                events: events_tx,
                output,
            },
            self.config.teardown_timeout * 2,
        ));

        Ok(Submission {
            job_id,
            events: events_rx,
        })
    }

    /// Request cancellation. Repeating it, or calling it after the job has
    /// finished, is harmless and leaves the recorded outcome unchanged.
    pub async fn cancel(&self, job_id: &str) -> Result<CancelAck> {
        let jobs = self.jobs.read().await;
        let job = jobs
            .get(job_id)
            .ok_or_else(|| ExecutorError::JobNotFound(job_id.to_string()))?;

        if job.status.borrow().terminal.is_some() {
            return Ok(CancelAck {
                already_terminated: true,
                accepted: false,
            });
        }
        let accepted = !job.cancel.is_cancelled();
        job.cancel.cancel();
        info!(%job_id, accepted, "Cancel requested");
        Ok(CancelAck {
            already_terminated: false,
            accepted,
        })
    }

    pub async fn status(&self, job_id: &str) -> Result<JobStatus> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .map(JobHandle::snapshot)
            .ok_or_else(|| ExecutorError::JobNotFound(job_id.to_string()))
    }

    /// Follow a job's output from anywhere: the recent tail first, then live
    /// events up to and including the terminal.
    pub async fn watch(&self, job_id: &str) -> Result<WatchReceiver> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .map(|job| job.output.follow())
            .ok_or_else(|| ExecutorError::JobNotFound(job_id.to_string()))
    }

    /// All known jobs, oldest first.
    pub async fn list(&self) -> Vec<JobStatus> {
        let jobs = self.jobs.read().await;
        let mut handles: Vec<&JobHandle> = jobs.values().collect();
        handles.sort_by_key(|job| job.created_at);
        handles.into_iter().map(JobHandle::snapshot).collect()
    }

    /// Drop records of jobs torn down longer than the configured TTL ago.
    pub async fn sweep_expired(&self) -> usize {
        let ttl = self.config.job_ttl;
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| !job.expired(ttl));
        before - jobs.len()
    }

    /// Cancel every job and wait (up to `limit`) for all sandboxes to be torn down.
    pub async fn shutdown(&self, limit: Duration) {
        let mut pending: Vec<watch::Receiver<SandboxStatus>> = {
            let jobs = self.jobs.read().await;
            jobs.values()
                .map(|job| {
                    job.cancel.cancel();
                    job.status.clone()
                })
                .collect()
        };
        info!(jobs = pending.len(), "Shutting down, cancelling jobs");
        let wait = async {
            for status in pending.iter_mut() {
                let _ = status.wait_for(|s| s.state == SandboxState::TornDown).await;
            }
        };
        if timeout(limit, wait).await.is_err() {
            warn!("some sandboxes were not torn down before shutdown");
        }
    }
}

fn validate(request: &ExecutionRequest) -> Result<()> {
    validate_request(request).map_err(|e| ExecutorError::InvalidRequest(e.to_string()))?;
    if let Some(limits) = &request.limits {
        if !limits.cpu_cores.is_finite() || limits.cpu_cores < 0.0 {
            return Err(ExecutorError::InvalidRequest(format!(
                "invalid cpu_cores: {}",
                limits.cpu_cores
            )));
        }
    }
    Ok(())
}

/// Where a job's terminal goes: the caller's stream and the output log.
struct Delivery {
    events: mpsc::Sender<ExecutionEvent>,
    output: Arc<OutputLog>,
}

/// Deliver the terminal if the lifecycle task dies before sending one.
///
/// A task that got as far as provisioning owns a teardown guard, which tears
/// the sandbox down from its `Drop`. The terminal waits for that (up to
/// `teardown_limit`) so it is never seen while the container still exists.
async fn supervise(
    job_id: String,
    task: JoinHandle<()>,
    status: StatusSender,
    delivery: Delivery,
    teardown_limit: Duration,
) {
    let Err(e) = task.await else {
        return;
    };
    error!(%job_id, error = %e, "lifecycle task died");

    let internal = Terminal::failed(TerminationReason::Internal, "sandbox manager failed");
    record_outcome(&status, SandboxState::Failed, &internal);

    let provisioned = !matches!(
        status.borrow().state,
        SandboxState::Requested | SandboxState::TornDown
    );
    if provisioned {
        let mut torn_down = status.subscribe();
        let wait = torn_down.wait_for(|s| s.state == SandboxState::TornDown);
        if timeout(teardown_limit, wait).await.is_err() {
            warn!(%job_id, "teardown did not finish, reporting anyway");
        }
    } else {
        status.send_modify(|s| s.state = SandboxState::TornDown);
    }

    let terminal = status.borrow().terminal.clone().unwrap_or(internal);
    if delivery.output.finish(&terminal) {
        let _ = delivery.events.send(ExecutionEvent::terminal(terminal)).await;
    }
}
