//! Shared application state and job records.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::lifecycle::SandboxStatus;
use crate::orchestrator::Orchestrator;
use crate::output::OutputLog;
use crate::proto::JobStatus;

/// Front door's view of one accepted request.
pub struct JobHandle {
    pub job_id: String,
    /// Shared with the lifecycle manager; cancelling it interrupts the job.
    pub cancel: CancellationToken,
    pub status: watch::Receiver<SandboxStatus>,
    pub output: Arc<OutputLog>,
    pub created_at: Instant,
}

impl JobHandle {
    pub fn snapshot(&self) -> JobStatus {
        let status = self.status.borrow();
        JobStatus {
            job_id: self.job_id.clone(),
            state: status.state.as_str().to_string(),
            container_id: status.container_id.clone().unwrap_or_default(),
            terminal: status.terminal.clone(),
            age_secs: self.created_at.elapsed().as_secs(),
            oom_killed: status.oom_killed,
            recent_output: self.output.recent(),
        }
    }

    /// Torn down more than `ttl` ago.
    pub fn expired(&self, ttl: Duration) -> bool {
        let status = self.status.borrow();
        status.state == crate::lifecycle::SandboxState::TornDown
            && status.finished_at.is_some_and(|at| at.elapsed() > ttl)
    }
}

/// Thread-safe job registry.
pub type Jobs = Arc<RwLock<HashMap<String, JobHandle>>>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
        }
    }

    /// Periodically drop job records whose TTL has passed.
    pub fn spawn_cleanup(&self, every: Duration) -> JoinHandle<()> {
        let orchestrator = Arc::clone(&self.orchestrator);
        tokio::spawn(async move {
            let mut interval = interval(every);
            loop {
                interval.tick().await;
                let removed = orchestrator.sweep_expired().await;
                if removed > 0 {
                    info!(removed, "Cleaned up expired job records");
                }
            }
        })
    }
}
